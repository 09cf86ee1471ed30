//! Postgres-backed outbox store.
//!
//! ## Error Mapping
//!
//! | SQLx error | Postgres code | StoreError |
//! |------------|---------------|------------|
//! | Database (unique violation) on insert | `23505` | `Duplicate` |
//! | Database (other) | any | `Storage` |
//! | PoolClosed, Io, Tls, ... | n/a | `Storage` |
//!
//! Updates are guarded with `processed = FALSE`, so a processed row is never
//! touched again. When such an update matches nothing, an existence check
//! decides between "already terminal" (`Ok`) and `NotFound`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::instrument;

use courier_core::{Clock, OutboxId, SystemClock};

use super::record::OutboxRecord;
use super::schema;
use super::store::{OutboxStats, OutboxStore, StoreError};
use crate::unit_of_work::{EntityRow, TransactionSource, WriteTransaction};

const SELECT_COLUMNS: &str = r"
    SELECT id, type_tag, payload, occurred_at, processed, processed_at,
           error, retry_count, dead_lettered_at, next_attempt_at
    FROM outbox_messages";

/// Outbox store over a shared connection pool.
///
/// Also the [`TransactionSource`] for units of work: business rows go to the
/// `entities` table and outbox rows to `outbox_messages` inside one Postgres
/// transaction.
#[derive(Clone)]
pub struct PostgresOutboxStore {
    pool: Arc<PgPool>,
    clock: Arc<dyn Clock>,
}

impl PostgresOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self::with_clock(pool, Arc::new(SystemClock))
    }

    pub fn with_clock(pool: PgPool, clock: Arc<dyn Clock>) -> Self {
        Self {
            pool: Arc::new(pool),
            clock,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the outbox and entity tables if missing.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        schema::ensure_schema(&self.pool).await
    }

    async fn exists(&self, id: OutboxId) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT EXISTS (SELECT 1 FROM outbox_messages WHERE id = $1) AS found")
            .bind(id.as_uuid())
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("exists", e))?;
        row.try_get("found")
            .map_err(|e| map_sqlx_error("exists", e))
    }

    /// `rows_affected == 0` means either missing or already terminal.
    async fn settle_update(&self, id: OutboxId, rows_affected: u64) -> Result<(), StoreError> {
        if rows_affected > 0 || self.exists(id).await? {
            Ok(())
        } else {
            Err(StoreError::NotFound(id))
        }
    }

    async fn fetch_records(
        &self,
        operation: &str,
        query: sqlx::query::Query<'_, Postgres, PgArguments>,
    ) -> Result<Vec<OutboxRecord>, StoreError> {
        let rows = query
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;

        rows.iter()
            .map(|row| {
                OutboxRow::from_row(row)
                    .map(OutboxRecord::from)
                    .map_err(|e| StoreError::Storage(format!("failed to deserialize outbox row: {e}")))
            })
            .collect()
    }
}

#[async_trait]
impl OutboxStore for PostgresOutboxStore {
    #[instrument(skip(self), err)]
    async fn fetch_batch(&self, limit: usize, max_retry_count: u32) -> Result<Vec<OutboxRecord>, StoreError> {
        let sql = format!(
            "{SELECT_COLUMNS}
            WHERE processed = FALSE AND dead_lettered_at IS NULL AND retry_count < $1
              AND (next_attempt_at IS NULL OR next_attempt_at <= $3)
            ORDER BY occurred_at ASC, id ASC
            LIMIT $2"
        );
        let query = sqlx::query(&sql)
            .bind(retry_ceiling(max_retry_count))
            .bind(limit as i64)
            .bind(self.clock.now());
        self.fetch_records("fetch_batch", query).await
    }

    #[instrument(skip(self), fields(outbox_id = %id), err)]
    async fn mark_processed(&self, id: OutboxId) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_messages
            SET processed = TRUE, processed_at = $2, error = NULL, next_attempt_at = NULL
            WHERE id = $1 AND processed = FALSE
            "#,
        )
        .bind(id.as_uuid())
        .bind(self.clock.now())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_processed", e))?;

        self.settle_update(id, result.rows_affected()).await
    }

    #[instrument(skip(self), fields(outbox_id = %id), err)]
    async fn mark_failed_permanent(&self, id: OutboxId, reason: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_messages
            SET error = $2, dead_lettered_at = $3
            WHERE id = $1 AND processed = FALSE AND dead_lettered_at IS NULL
            "#,
        )
        .bind(id.as_uuid())
        .bind(reason)
        .bind(self.clock.now())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_failed_permanent", e))?;

        self.settle_update(id, result.rows_affected()).await
    }

    #[instrument(skip(self), fields(outbox_id = %id), err)]
    async fn increment_retry(&self, id: OutboxId, reason: &str, delay: Duration) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_messages
            SET retry_count = retry_count + 1, error = $2, next_attempt_at = $3
            WHERE id = $1 AND processed = FALSE
            "#,
        )
        .bind(id.as_uuid())
        .bind(reason)
        .bind(self.clock.now() + delay)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("increment_retry", e))?;

        self.settle_update(id, result.rows_affected()).await
    }

    #[instrument(skip(self), fields(outbox_id = %id), err)]
    async fn get(&self, id: OutboxId) -> Result<Option<OutboxRecord>, StoreError> {
        let sql = format!("{SELECT_COLUMNS} WHERE id = $1");
        let query = sqlx::query(&sql).bind(id.as_uuid());
        Ok(self.fetch_records("get", query).await?.into_iter().next())
    }

    #[instrument(skip(self), err)]
    async fn list_dead_letters(&self, max_retry_count: u32, limit: usize) -> Result<Vec<OutboxRecord>, StoreError> {
        let sql = format!(
            "{SELECT_COLUMNS}
            WHERE processed = FALSE AND (dead_lettered_at IS NOT NULL OR retry_count >= $1)
            ORDER BY occurred_at ASC, id ASC
            LIMIT $2"
        );
        let query = sqlx::query(&sql)
            .bind(retry_ceiling(max_retry_count))
            .bind(limit as i64);
        self.fetch_records("list_dead_letters", query).await
    }

    #[instrument(skip(self), err)]
    async fn stats(&self, max_retry_count: u32) -> Result<OutboxStats, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE processed = FALSE AND dead_lettered_at IS NULL AND retry_count < $1) AS pending,
                COUNT(*) FILTER (WHERE processed = TRUE) AS processed,
                COUNT(*) FILTER (WHERE processed = FALSE AND dead_lettered_at IS NOT NULL) AS dead_lettered,
                COUNT(*) FILTER (WHERE processed = FALSE AND dead_lettered_at IS NULL AND retry_count >= $1) AS retry_exhausted
            FROM outbox_messages
            "#,
        )
        .bind(retry_ceiling(max_retry_count))
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("stats", e))?;

        let count = |column: &str| -> Result<u64, StoreError> {
            let value: i64 = row
                .try_get(column)
                .map_err(|e| map_sqlx_error("stats", e))?;
            Ok(value.max(0) as u64)
        };

        Ok(OutboxStats {
            pending: count("pending")?,
            processed: count("processed")?,
            dead_lettered: count("dead_lettered")?,
            retry_exhausted: count("retry_exhausted")?,
        })
    }
}

#[async_trait]
impl TransactionSource for PostgresOutboxStore {
    async fn begin(&self) -> Result<Box<dyn WriteTransaction>, StoreError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        Ok(Box::new(PostgresTransaction { tx }))
    }
}

struct PostgresTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl WriteTransaction for PostgresTransaction {
    async fn save_entity(&mut self, row: EntityRow) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO entities (aggregate_type, aggregate_id, version, state)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (aggregate_type, aggregate_id)
            DO UPDATE SET version = EXCLUDED.version, state = EXCLUDED.state, updated_at = NOW()
            "#,
        )
        .bind(&row.aggregate_type)
        .bind(row.aggregate_id.as_uuid())
        .bind(row.version as i64)
        .bind(&row.state)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("save_entity", e))?;
        Ok(())
    }

    async fn append(&mut self, record: OutboxRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO outbox_messages (
                id, type_tag, payload, occurred_at, processed,
                processed_at, error, retry_count, dead_lettered_at, next_attempt_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(record.id.as_uuid())
        .bind(&record.type_tag)
        .bind(&record.payload)
        .bind(record.occurred_at)
        .bind(record.processed)
        .bind(record.processed_at)
        .bind(&record.error)
        .bind(retry_ceiling(record.retry_count))
        .bind(record.dead_lettered_at)
        .bind(record.next_attempt_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::Duplicate(record.id)
            } else {
                map_sqlx_error("append_outbox", e)
            }
        })?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let this = *self;
        this.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        let this = *self;
        this.tx
            .rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback", e))
    }
}

/// Retry counts are stored as `INTEGER`.
fn retry_ceiling(count: u32) -> i32 {
    i32::try_from(count).unwrap_or(i32::MAX)
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(|c| c.to_string()).unwrap_or_default();
            StoreError::Storage(format!(
                "database error in {operation} ({code}): {}",
                db_err.message()
            ))
        }
        sqlx::Error::PoolClosed => StoreError::Storage(format!("connection pool closed during {operation}")),
        other => StoreError::Storage(format!("{operation} failed: {other}")),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

// SQLx row types

#[derive(Debug)]
struct OutboxRow {
    id: uuid::Uuid,
    type_tag: String,
    payload: String,
    occurred_at: DateTime<Utc>,
    processed: bool,
    processed_at: Option<DateTime<Utc>>,
    error: Option<String>,
    retry_count: i32,
    dead_lettered_at: Option<DateTime<Utc>>,
    next_attempt_at: Option<DateTime<Utc>>,
}

impl<'r> FromRow<'r, PgRow> for OutboxRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(OutboxRow {
            id: row.try_get("id")?,
            type_tag: row.try_get("type_tag")?,
            payload: row.try_get("payload")?,
            occurred_at: row.try_get("occurred_at")?,
            processed: row.try_get("processed")?,
            processed_at: row.try_get("processed_at")?,
            error: row.try_get("error")?,
            retry_count: row.try_get("retry_count")?,
            dead_lettered_at: row.try_get("dead_lettered_at")?,
            next_attempt_at: row.try_get("next_attempt_at")?,
        })
    }
}

impl From<OutboxRow> for OutboxRecord {
    fn from(row: OutboxRow) -> Self {
        OutboxRecord {
            id: OutboxId::from_uuid(row.id),
            type_tag: row.type_tag,
            payload: row.payload,
            occurred_at: row.occurred_at,
            processed: row.processed,
            processed_at: row.processed_at,
            error: row.error,
            retry_count: u32::try_from(row.retry_count).unwrap_or(0),
            dead_lettered_at: row.dead_lettered_at,
            next_attempt_at: row.next_attempt_at,
        }
    }
}
