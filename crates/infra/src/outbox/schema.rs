//! Outbox database schema.

use sqlx::PgPool;

use super::store::StoreError;

/// SQL to create the outbox table.
pub const CREATE_OUTBOX_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS outbox_messages (
    id               UUID PRIMARY KEY,
    type_tag         VARCHAR(255) NOT NULL,
    payload          TEXT NOT NULL,
    occurred_at      TIMESTAMPTZ NOT NULL,
    processed        BOOLEAN NOT NULL DEFAULT FALSE,
    processed_at     TIMESTAMPTZ NULL,
    error            TEXT NULL,
    retry_count      INTEGER NOT NULL DEFAULT 0 CHECK (retry_count >= 0),
    dead_lettered_at TIMESTAMPTZ NULL,
    next_attempt_at  TIMESTAMPTZ NULL
)";

/// Brings tables created before retry delays were stored up to date.
pub const ADD_NEXT_ATTEMPT_COLUMN: &str = r"
ALTER TABLE outbox_messages ADD COLUMN IF NOT EXISTS next_attempt_at TIMESTAMPTZ NULL";

/// Partial index backing the publisher's fetch query.
pub const CREATE_OUTBOX_PENDING_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_outbox_messages_pending
    ON outbox_messages (occurred_at, id)
    WHERE processed = FALSE AND dead_lettered_at IS NULL";

/// SQL to create the generic business-row table written by the unit of work.
pub const CREATE_ENTITIES_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS entities (
    aggregate_type VARCHAR(255) NOT NULL,
    aggregate_id   UUID NOT NULL,
    version        BIGINT NOT NULL,
    state          JSONB NOT NULL,
    updated_at     TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    PRIMARY KEY (aggregate_type, aggregate_id)
)";

/// Every statement, in the order they must run.
pub const ALL_STATEMENTS: [&str; 4] = [
    CREATE_OUTBOX_TABLE,
    ADD_NEXT_ATTEMPT_COLUMN,
    CREATE_OUTBOX_PENDING_INDEX,
    CREATE_ENTITIES_TABLE,
];

/// Create the tables and indexes if they do not exist yet.
pub async fn ensure_schema(pool: &PgPool) -> Result<(), StoreError> {
    for statement in ALL_STATEMENTS {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| StoreError::Storage(format!("schema setup failed: {e}")))?;
    }
    Ok(())
}
