//! Message broker seam.
//!
//! The broker is whatever sits on the other side of the outbox (RabbitMQ,
//! Redis Streams, Kafka, ...). Once `publish` returns `Ok` the broker owns the
//! message and is expected to provide its own at-least-once transport.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use crate::event::Message;
use crate::registry::MessageShape;

/// Broker publish failure.
///
/// All variants are transient from the outbox's point of view: the record is
/// retried on a later batch until its retry ceiling is reached.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error("message rejected: {0}")]
    Rejected(String),

    #[error("message encoding failed: {0}")]
    Encoding(String),
}

#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Publish one decoded message. `shape` describes its concrete type.
    async fn publish(&self, message: &dyn Message, shape: &MessageShape) -> Result<(), BrokerError>;
}

#[async_trait]
impl<B> MessageBroker for Arc<B>
where
    B: MessageBroker + ?Sized,
{
    async fn publish(&self, message: &dyn Message, shape: &MessageShape) -> Result<(), BrokerError> {
        (**self).publish(message, shape).await
    }
}

/// Broker that only writes the message to the log.
///
/// Useful for local runs without a real broker.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingBroker;

#[async_trait]
impl MessageBroker for LoggingBroker {
    async fn publish(&self, message: &dyn Message, shape: &MessageShape) -> Result<(), BrokerError> {
        let payload = message
            .to_payload()
            .map_err(|e| BrokerError::Encoding(e.to_string()))?;
        info!(
            type_tag = shape.tag(),
            type_name = shape.type_name(),
            payload = %payload,
            "published message"
        );
        Ok(())
    }
}
