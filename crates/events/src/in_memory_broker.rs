//! In-memory broker for tests/dev.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::broker::{BrokerError, MessageBroker};
use crate::event::Message;
use crate::registry::MessageShape;

/// A message the in-memory broker accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub type_tag: String,
    pub type_name: String,
    pub payload: String,
}

impl PublishedMessage {
    pub fn payload_json(&self) -> serde_json::Value {
        serde_json::from_str(&self.payload).unwrap_or(serde_json::Value::Null)
    }
}

#[derive(Debug, Default)]
struct State {
    published: Vec<PublishedMessage>,
    attempts: usize,
    fail_all: Option<BrokerError>,
    fail_tags: HashMap<String, BrokerError>,
}

/// Records every accepted message; failures can be injected globally or per tag.
#[derive(Debug, Default)]
pub struct InMemoryBroker {
    state: Mutex<State>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every publish fail with `error` until [`InMemoryBroker::recover`].
    pub fn fail_with(&self, error: BrokerError) {
        self.lock().fail_all = Some(error);
    }

    /// Make publishes of `tag` fail with `error`.
    pub fn fail_tag(&self, tag: impl Into<String>, error: BrokerError) {
        self.lock().fail_tags.insert(tag.into(), error);
    }

    /// Clear all injected failures.
    pub fn recover(&self) {
        let mut state = self.lock();
        state.fail_all = None;
        state.fail_tags.clear();
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.lock().published.clone()
    }

    /// Publish calls seen, successful or not.
    pub fn attempts(&self) -> usize {
        self.lock().attempts
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    async fn publish(&self, message: &dyn Message, shape: &MessageShape) -> Result<(), BrokerError> {
        let mut state = self.lock();
        state.attempts += 1;

        if let Some(err) = &state.fail_all {
            return Err(err.clone());
        }
        if let Some(err) = state.fail_tags.get(shape.tag()) {
            return Err(err.clone());
        }

        let payload = message
            .to_payload()
            .map_err(|e| BrokerError::Encoding(e.to_string()))?;
        state.published.push(PublishedMessage {
            type_tag: message.type_tag().to_string(),
            type_name: shape.type_name().to_string(),
            payload,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::fixtures::*;
    use crate::event::Event;

    #[tokio::test]
    async fn records_published_messages() {
        let broker = InMemoryBroker::new();
        let shape = MessageShape::of::<ProductCreatedIntegrationEvent>();

        broker.publish(&product_created(), &shape).await.unwrap();

        let published = broker.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].type_tag, "catalog.product.created");
        assert_eq!(published[0].payload_json()["price_cents"], 4_500);
    }

    #[tokio::test]
    async fn injected_failures_apply_until_recovered() {
        let broker = InMemoryBroker::new();
        let shape = MessageShape::of::<ProductCreatedIntegrationEvent>();
        broker.fail_with(BrokerError::Unavailable("connection refused".to_string()));

        let err = broker.publish(&product_created(), &shape).await.unwrap_err();
        assert_eq!(err.to_string(), "broker unavailable: connection refused");

        broker.recover();
        broker.publish(&product_created(), &shape).await.unwrap();
        assert_eq!(broker.attempts(), 2);
        assert_eq!(broker.published().len(), 1);
    }

    #[tokio::test]
    async fn tag_specific_failure_leaves_other_tags_alone() {
        let broker = InMemoryBroker::new();
        broker.fail_tag(
            ProductDeletedIntegrationEvent::TYPE_TAG,
            BrokerError::Rejected("no route".to_string()),
        );

        let deleted = ProductDeletedIntegrationEvent {
            product_id: "p-1".to_string(),
        };
        assert!(broker
            .publish(&deleted, &MessageShape::of::<ProductDeletedIntegrationEvent>())
            .await
            .is_err());
        assert!(broker
            .publish(&product_created(), &MessageShape::of::<ProductCreatedIntegrationEvent>())
            .await
            .is_ok());
    }
}
