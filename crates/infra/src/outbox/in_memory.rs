//! In-memory outbox and entity tables.
//!
//! Intended for tests/dev. One `RwLock` guards both tables so a committed
//! transaction becomes visible in a single step.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use courier_core::{AggregateId, Clock, OutboxId, SystemClock};

use super::record::OutboxRecord;
use super::store::{OutboxStats, OutboxStore, StoreError};
use crate::unit_of_work::{EntityRow, TransactionSource, WriteTransaction};

#[derive(Debug, Default)]
struct Tables {
    outbox: HashMap<OutboxId, OutboxRecord>,
    entities: HashMap<(String, AggregateId), EntityRow>,
    rejected_types: HashSet<String>,
}

/// Outbox store plus a toy business table, sharing one transaction boundary.
#[derive(Clone)]
pub struct InMemoryOutboxStore {
    tables: Arc<RwLock<Tables>>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryOutboxStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Use `clock` for `processed_at` and dead-letter timestamps.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            tables: Arc::new(RwLock::new(Tables::default())),
            clock,
        }
    }

    /// Insert a record directly, outside any unit of work.
    pub fn insert(&self, record: OutboxRecord) -> Result<(), StoreError> {
        let mut tables = self.write()?;
        if tables.outbox.contains_key(&record.id) {
            return Err(StoreError::Duplicate(record.id));
        }
        tables.outbox.insert(record.id, record);
        Ok(())
    }

    /// Every record, oldest first.
    pub fn records(&self) -> Result<Vec<OutboxRecord>, StoreError> {
        let tables = self.read()?;
        let mut records: Vec<_> = tables.outbox.values().cloned().collect();
        sort_oldest_first(&mut records);
        Ok(records)
    }

    pub fn entity(&self, aggregate_type: &str, aggregate_id: AggregateId) -> Result<Option<EntityRow>, StoreError> {
        let tables = self.read()?;
        Ok(tables
            .entities
            .get(&(aggregate_type.to_string(), aggregate_id))
            .cloned())
    }

    /// Make every later `save_entity` for `aggregate_type` fail.
    ///
    /// Stands in for a constraint violation on the business table.
    pub fn reject_entity_type(&self, aggregate_type: impl Into<String>) -> Result<(), StoreError> {
        self.write()?.rejected_types.insert(aggregate_type.into());
        Ok(())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>, StoreError> {
        self.tables
            .read()
            .map_err(|_| StoreError::Storage("lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>, StoreError> {
        self.tables
            .write()
            .map_err(|_| StoreError::Storage("lock poisoned".to_string()))
    }

    fn update<F>(&self, id: OutboxId, apply: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut OutboxRecord),
    {
        let mut tables = self.write()?;
        let record = tables.outbox.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        apply(record);
        Ok(())
    }
}

fn sort_oldest_first(records: &mut [OutboxRecord]) {
    records.sort_by(|a, b| a.occurred_at.cmp(&b.occurred_at).then_with(|| a.id.cmp(&b.id)));
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn fetch_batch(&self, limit: usize, max_retry_count: u32) -> Result<Vec<OutboxRecord>, StoreError> {
        let now = self.clock.now();
        let tables = self.read()?;
        let mut eligible: Vec<_> = tables
            .outbox
            .values()
            .filter(|r| r.is_eligible(max_retry_count) && r.is_due(now))
            .cloned()
            .collect();
        sort_oldest_first(&mut eligible);
        eligible.truncate(limit);
        Ok(eligible)
    }

    async fn mark_processed(&self, id: OutboxId) -> Result<(), StoreError> {
        let at = self.clock.now();
        self.update(id, |record| {
            record.mark_processed(at);
        })
    }

    async fn mark_failed_permanent(&self, id: OutboxId, reason: &str) -> Result<(), StoreError> {
        let at = self.clock.now();
        self.update(id, |record| {
            record.mark_failed_permanent(reason, at);
        })
    }

    async fn increment_retry(&self, id: OutboxId, reason: &str, delay: chrono::Duration) -> Result<(), StoreError> {
        let next_attempt_at = self.clock.now() + delay;
        self.update(id, |record| {
            record.increment_retry(reason, next_attempt_at);
        })
    }

    async fn get(&self, id: OutboxId) -> Result<Option<OutboxRecord>, StoreError> {
        Ok(self.read()?.outbox.get(&id).cloned())
    }

    async fn list_dead_letters(&self, max_retry_count: u32, limit: usize) -> Result<Vec<OutboxRecord>, StoreError> {
        let tables = self.read()?;
        let mut dead: Vec<_> = tables
            .outbox
            .values()
            .filter(|r| r.is_dead_lettered() || r.is_retry_exhausted(max_retry_count))
            .cloned()
            .collect();
        sort_oldest_first(&mut dead);
        dead.truncate(limit);
        Ok(dead)
    }

    async fn stats(&self, max_retry_count: u32) -> Result<OutboxStats, StoreError> {
        let tables = self.read()?;
        let mut stats = OutboxStats::default();
        for record in tables.outbox.values() {
            if record.processed {
                stats.processed += 1;
            } else if record.is_dead_lettered() {
                stats.dead_lettered += 1;
            } else if record.is_retry_exhausted(max_retry_count) {
                stats.retry_exhausted += 1;
            } else {
                stats.pending += 1;
            }
        }
        Ok(stats)
    }
}

/// Rows staged until commit.
struct InMemoryTransaction {
    tables: Arc<RwLock<Tables>>,
    entities: Vec<EntityRow>,
    outbox: Vec<OutboxRecord>,
}

#[async_trait]
impl WriteTransaction for InMemoryTransaction {
    async fn save_entity(&mut self, row: EntityRow) -> Result<(), StoreError> {
        let rejected = self
            .tables
            .read()
            .map_err(|_| StoreError::Storage("lock poisoned".to_string()))?
            .rejected_types
            .contains(&row.aggregate_type);
        if rejected {
            return Err(StoreError::Storage(format!(
                "write rejected for {} {}",
                row.aggregate_type, row.aggregate_id
            )));
        }
        self.entities.push(row);
        Ok(())
    }

    async fn append(&mut self, record: OutboxRecord) -> Result<(), StoreError> {
        self.outbox.push(record);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let this = *self;
        let mut tables = this
            .tables
            .write()
            .map_err(|_| StoreError::Storage("lock poisoned".to_string()))?;

        let mut staged = HashSet::new();
        for record in &this.outbox {
            if tables.outbox.contains_key(&record.id) || !staged.insert(record.id) {
                return Err(StoreError::Duplicate(record.id));
            }
        }

        for row in this.entities {
            tables
                .entities
                .insert((row.aggregate_type.clone(), row.aggregate_id), row);
        }
        for record in this.outbox {
            tables.outbox.insert(record.id, record);
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

#[async_trait]
impl TransactionSource for InMemoryOutboxStore {
    async fn begin(&self) -> Result<Box<dyn WriteTransaction>, StoreError> {
        Ok(Box::new(InMemoryTransaction {
            tables: Arc::clone(&self.tables),
            entities: Vec::new(),
            outbox: Vec::new(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};
    use courier_core::{FixedClock, ManualClock};
    use serde_json::json;

    use super::*;

    fn at(seconds: i64) -> chrono::DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).single().unwrap() + Duration::seconds(seconds)
    }

    fn record(seconds: i64) -> OutboxRecord {
        OutboxRecord::new("catalog.product.created", "{}", at(seconds))
    }

    #[tokio::test]
    async fn fetch_returns_eligible_oldest_first_up_to_limit() {
        let store = InMemoryOutboxStore::new();
        let newest = record(30);
        let oldest = record(10);
        let middle = record(20);
        let mut done = record(0);
        done.mark_processed(at(1));
        let mut exhausted = record(5);
        exhausted.retry_count = 3;

        for r in [newest.clone(), oldest.clone(), middle.clone(), done, exhausted] {
            store.insert(r).unwrap();
        }

        let batch = store.fetch_batch(2, 3).await.unwrap();
        let ids: Vec<_> = batch.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![oldest.id, middle.id]);

        let all = store.fetch_batch(100, 3).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[2].id, newest.id);
    }

    #[tokio::test]
    async fn mutations_on_missing_records_report_not_found() {
        let store = InMemoryOutboxStore::new();
        let missing = OutboxId::new();

        assert!(matches!(store.mark_processed(missing).await, Err(StoreError::NotFound(id)) if id == missing));
        assert!(matches!(store.increment_retry(missing, "x", Duration::seconds(1)).await, Err(StoreError::NotFound(_))));
        assert!(matches!(
            store.mark_failed_permanent(missing, "x").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn processed_records_ignore_later_mutations() {
        let clock = Arc::new(FixedClock(at(100)));
        let store = InMemoryOutboxStore::with_clock(clock);
        let r = record(0);
        let id = r.id;
        store.insert(r).unwrap();

        store.mark_processed(id).await.unwrap();
        store.increment_retry(id, "late", Duration::seconds(1)).await.unwrap();
        store.mark_failed_permanent(id, "late").await.unwrap();

        let stored = store.get(id).await.unwrap().unwrap();
        assert!(stored.processed);
        assert_eq!(stored.processed_at, Some(at(100)));
        assert_eq!(stored.retry_count, 0);
        assert!(stored.error.is_none());
        assert!(!stored.is_dead_lettered());
    }

    #[tokio::test]
    async fn retried_record_gives_up_its_batch_slot_until_due() {
        let clock = Arc::new(ManualClock::new(at(0)));
        let store = InMemoryOutboxStore::with_clock(clock.clone());
        let failing = record(1);
        let healthy = record(2);
        store.insert(failing.clone()).unwrap();
        store.insert(healthy.clone()).unwrap();

        store
            .increment_retry(failing.id, "broker unavailable", Duration::seconds(60))
            .await
            .unwrap();

        let stored = store.get(failing.id).await.unwrap().unwrap();
        assert_eq!(stored.next_attempt_at, Some(at(60)));

        let batch = store.fetch_batch(1, 10).await.unwrap();
        assert_eq!(batch[0].id, healthy.id);
        assert_eq!(store.stats(10).await.unwrap().pending, 2);

        clock.advance(Duration::seconds(60));
        let batch = store.fetch_batch(1, 10).await.unwrap();
        assert_eq!(batch[0].id, failing.id);
    }

    #[tokio::test]
    async fn transaction_applies_nothing_until_commit() {
        let store = InMemoryOutboxStore::new();
        let aggregate_id = AggregateId::new();
        let mut tx = store.begin().await.unwrap();
        tx.save_entity(EntityRow {
            aggregate_type: "product".to_string(),
            aggregate_id,
            version: 1,
            state: json!({"name": "Desk"}),
        })
        .await
        .unwrap();
        tx.append(record(0)).await.unwrap();

        assert!(store.records().unwrap().is_empty());
        assert!(store.entity("product", aggregate_id).unwrap().is_none());

        tx.commit().await.unwrap();

        assert_eq!(store.records().unwrap().len(), 1);
        assert_eq!(store.entity("product", aggregate_id).unwrap().unwrap().version, 1);
    }

    #[tokio::test]
    async fn rollback_discards_staged_rows() {
        let store = InMemoryOutboxStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.append(record(0)).await.unwrap();
        tx.rollback().await.unwrap();

        assert!(store.records().unwrap().is_empty());
    }

    #[tokio::test]
    async fn duplicate_id_fails_the_whole_commit() {
        let store = InMemoryOutboxStore::new();
        let existing = record(0);
        store.insert(existing.clone()).unwrap();

        let mut tx = store.begin().await.unwrap();
        tx.append(record(1)).await.unwrap();
        tx.append(existing.clone()).await.unwrap();

        let err = tx.commit().await.unwrap_err();
        assert!(matches!(err, StoreError::Duplicate(id) if id == existing.id));
        assert_eq!(store.records().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn rejected_entity_type_fails_save() {
        let store = InMemoryOutboxStore::new();
        store.reject_entity_type("order").unwrap();
        let mut tx = store.begin().await.unwrap();

        let err = tx
            .save_entity(EntityRow {
                aggregate_type: "order".to_string(),
                aggregate_id: AggregateId::new(),
                version: 1,
                state: json!({}),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Storage(_)));
    }

    #[tokio::test]
    async fn stats_and_dead_letters_split_by_bucket() {
        let store = InMemoryOutboxStore::new();
        let pending = record(0);
        let mut processed = record(1);
        processed.mark_processed(at(2));
        let mut dead = record(2);
        dead.mark_failed_permanent("type not found", at(3));
        let mut exhausted = record(3);
        exhausted.retry_count = 5;

        for r in [pending, processed, dead.clone(), exhausted.clone()] {
            store.insert(r).unwrap();
        }

        let stats = store.stats(5).await.unwrap();
        assert_eq!(
            stats,
            OutboxStats {
                pending: 1,
                processed: 1,
                dead_lettered: 1,
                retry_exhausted: 1,
            }
        );

        let ids: Vec<_> = store
            .list_dead_letters(5, 10)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec![dead.id, exhausted.id]);
    }
}
