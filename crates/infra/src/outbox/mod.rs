//! Transactional outbox: durable records, their storage and the publisher
//! that relays them to the broker.

pub mod circuit_breaker;
pub mod idempotency;
pub mod in_memory;
pub mod postgres;
pub mod publisher;
pub mod record;
pub mod schema;
pub mod store;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerState};
pub use idempotency::IdempotencyCache;
pub use in_memory::InMemoryOutboxStore;
pub use postgres::PostgresOutboxStore;
pub use publisher::{
    BatchReport, OutboxPublisher, PublisherError, PublisherHandle, PublisherStats, RecordOutcome, TickOutcome,
    TYPE_NOT_FOUND,
};
pub use record::OutboxRecord;
pub use store::{OutboxStats, OutboxStore, StoreError};
