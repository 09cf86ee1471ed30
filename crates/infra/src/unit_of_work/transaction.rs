//! Transaction seam used by the unit of work.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use courier_core::AggregateId;

use crate::outbox::{OutboxRecord, StoreError};

/// Latest persisted state of a tracked aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRow {
    pub aggregate_type: String,
    pub aggregate_id: AggregateId,
    pub version: u64,
    pub state: JsonValue,
}

/// One open write transaction.
///
/// Business rows and outbox rows staged here become visible together on
/// `commit` or not at all.
#[async_trait]
pub trait WriteTransaction: Send {
    async fn save_entity(&mut self, row: EntityRow) -> Result<(), StoreError>;

    async fn append(&mut self, record: OutboxRecord) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

/// Opens write transactions against the business database.
#[async_trait]
pub trait TransactionSource: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn WriteTransaction>, StoreError>;
}
