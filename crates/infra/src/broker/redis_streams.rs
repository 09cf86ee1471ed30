//! Redis Streams broker (XADD per message).
//!
//! Every published message becomes one stream entry:
//!
//! | field | value |
//! |-------|-------|
//! | `type_tag` | registry tag, e.g. `catalog.product.created` |
//! | `type_name` | short Rust type name of the payload |
//! | `payload` | JSON body |
//!
//! Consumers read with XREADGROUP and deduplicate on their side; the outbox
//! only promises at-least-once.

use std::sync::Arc;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use tokio::sync::OnceCell;
use tracing::instrument;

use courier_events::{BrokerError, Message, MessageBroker, MessageShape};

/// Default stream key for relayed messages.
pub const DEFAULT_STREAM_KEY: &str = "courier:outbox";

#[derive(Clone)]
pub struct RedisStreamsBroker {
    client: Arc<redis::Client>,
    connection: Arc<OnceCell<MultiplexedConnection>>,
    stream_key: String,
    max_len: Option<usize>,
}

impl RedisStreamsBroker {
    /// Create a broker for `redis_url`; the connection is opened on first publish.
    pub fn new(redis_url: impl AsRef<str>, stream_key: Option<String>) -> Result<Self, BrokerError> {
        let client =
            redis::Client::open(redis_url.as_ref()).map_err(|e| BrokerError::Unavailable(e.to_string()))?;

        Ok(Self {
            client: Arc::new(client),
            connection: Arc::new(OnceCell::new()),
            stream_key: stream_key.unwrap_or_else(|| DEFAULT_STREAM_KEY.to_string()),
            max_len: None,
        })
    }

    /// Cap the stream at roughly `max_len` entries (`MAXLEN ~`).
    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = Some(max_len);
        self
    }

    pub fn stream_key(&self) -> &str {
        &self.stream_key
    }

    async fn connection(&self) -> Result<MultiplexedConnection, BrokerError> {
        let conn = self
            .connection
            .get_or_try_init(|| async {
                self.client
                    .get_multiplexed_async_connection()
                    .await
                    .map_err(|e| BrokerError::Unavailable(e.to_string()))
            })
            .await?;
        Ok(conn.clone())
    }

    fn xadd(&self, message_payload: &str, shape: &MessageShape) -> redis::Cmd {
        let mut cmd = redis::cmd("XADD");
        cmd.arg(&self.stream_key);
        if let Some(max_len) = self.max_len {
            cmd.arg("MAXLEN").arg("~").arg(max_len);
        }
        cmd.arg("*")
            .arg("type_tag")
            .arg(shape.tag())
            .arg("type_name")
            .arg(shape.type_name())
            .arg("payload")
            .arg(message_payload);
        cmd
    }
}

impl std::fmt::Debug for RedisStreamsBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStreamsBroker")
            .field("stream_key", &self.stream_key)
            .field("max_len", &self.max_len)
            .field("connected", &self.connection.initialized())
            .finish()
    }
}

#[async_trait]
impl MessageBroker for RedisStreamsBroker {
    #[instrument(skip(self, message), fields(stream_key = %self.stream_key, type_tag = shape.tag()), err)]
    async fn publish(&self, message: &dyn Message, shape: &MessageShape) -> Result<(), BrokerError> {
        let payload = message
            .to_payload()
            .map_err(|e| BrokerError::Encoding(e.to_string()))?;
        let mut conn = self.connection().await?;

        let _: String = self
            .xadd(&payload, shape)
            .query_async(&mut conn)
            .await
            .map_err(|e| {
                if e.is_io_error() || e.is_connection_dropped() || e.is_timeout() {
                    BrokerError::Unavailable(format!("XADD failed: {e}"))
                } else {
                    BrokerError::Rejected(format!("XADD failed: {e}"))
                }
            })?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
    struct PingIntegrationEvent {
        n: u32,
    }

    impl courier_events::Event for PingIntegrationEvent {
        const TYPE_TAG: &'static str = "test.ping";
    }

    #[test]
    fn rejects_malformed_url() {
        let err = RedisStreamsBroker::new("not a url", None).unwrap_err();
        assert!(matches!(err, BrokerError::Unavailable(_)));
    }

    #[test]
    fn xadd_carries_type_and_payload_fields() {
        let broker = RedisStreamsBroker::new("redis://127.0.0.1:6379", None)
            .unwrap()
            .with_max_len(1000);
        let cmd = broker.xadd(r#"{"n":1}"#, &MessageShape::of::<PingIntegrationEvent>());

        let packed = String::from_utf8_lossy(&cmd.get_packed_command()).into_owned();
        assert!(packed.contains(DEFAULT_STREAM_KEY));
        assert!(packed.contains("MAXLEN"));
        assert!(packed.contains("test.ping"));
        assert!(packed.contains("PingIntegrationEvent"));
        assert!(packed.contains(r#"{"n":1}"#));
    }
}
