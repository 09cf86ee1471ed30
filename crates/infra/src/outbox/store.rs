use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use courier_core::OutboxId;

use super::record::OutboxRecord;

/// Outbox storage error.
///
/// These are infrastructure failures, not publish failures. A broker error
/// never surfaces as a `StoreError`; it becomes a retry on the record.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("outbox record not found: {0}")]
    NotFound(OutboxId),

    #[error("outbox record already exists: {0}")]
    Duplicate(OutboxId),

    #[error("storage error: {0}")]
    Storage(String),
}

/// Counts by lifecycle bucket, for dashboards and the relay's status log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxStats {
    /// Still eligible for publishing.
    pub pending: u64,
    pub processed: u64,
    /// Explicitly dead-lettered (unknown type, undecodable payload).
    pub dead_lettered: u64,
    /// Hit the retry ceiling; never fetched again.
    pub retry_exhausted: u64,
}

/// Durable outbox table as the publisher sees it.
///
/// Implementations must:
/// - return only eligible records that are due from `fetch_batch`, oldest
///   `occurred_at` first (ties broken by id)
/// - leave processed records untouched by every mutation
/// - report `NotFound` for ids that do not exist
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Up to `limit` records with `processed = false`, no dead-letter marker,
    /// `retry_count < max_retry_count` and no retry delay still running.
    ///
    /// Records waiting out a delay never take a batch slot, so newer records
    /// behind them are still reached.
    async fn fetch_batch(&self, limit: usize, max_retry_count: u32) -> Result<Vec<OutboxRecord>, StoreError>;

    /// Set `processed`, stamp `processed_at` and clear `error`.
    async fn mark_processed(&self, id: OutboxId) -> Result<(), StoreError>;

    /// Record `reason` and set the dead-letter marker.
    async fn mark_failed_permanent(&self, id: OutboxId, reason: &str) -> Result<(), StoreError>;

    /// Bump `retry_count` by one, record `reason` and hold the record back
    /// from `fetch_batch` for `delay`.
    async fn increment_retry(&self, id: OutboxId, reason: &str, delay: Duration) -> Result<(), StoreError>;

    async fn get(&self, id: OutboxId) -> Result<Option<OutboxRecord>, StoreError>;

    /// Dead-lettered and retry-exhausted records, oldest first.
    async fn list_dead_letters(&self, max_retry_count: u32, limit: usize) -> Result<Vec<OutboxRecord>, StoreError>;

    async fn stats(&self, max_retry_count: u32) -> Result<OutboxStats, StoreError>;
}

#[async_trait]
impl<S> OutboxStore for Arc<S>
where
    S: OutboxStore + ?Sized,
{
    async fn fetch_batch(&self, limit: usize, max_retry_count: u32) -> Result<Vec<OutboxRecord>, StoreError> {
        (**self).fetch_batch(limit, max_retry_count).await
    }

    async fn mark_processed(&self, id: OutboxId) -> Result<(), StoreError> {
        (**self).mark_processed(id).await
    }

    async fn mark_failed_permanent(&self, id: OutboxId, reason: &str) -> Result<(), StoreError> {
        (**self).mark_failed_permanent(id, reason).await
    }

    async fn increment_retry(&self, id: OutboxId, reason: &str, delay: Duration) -> Result<(), StoreError> {
        (**self).increment_retry(id, reason, delay).await
    }

    async fn get(&self, id: OutboxId) -> Result<Option<OutboxRecord>, StoreError> {
        (**self).get(id).await
    }

    async fn list_dead_letters(&self, max_retry_count: u32, limit: usize) -> Result<Vec<OutboxRecord>, StoreError> {
        (**self).list_dead_letters(max_retry_count, limit).await
    }

    async fn stats(&self, max_retry_count: u32) -> Result<OutboxStats, StoreError> {
        (**self).stats(max_retry_count).await
    }
}
