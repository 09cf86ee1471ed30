//! Infrastructure layer: outbox storage, the unit of work, the publisher and
//! broker adapters.

pub mod broker;
pub mod config;
pub mod outbox;
pub mod unit_of_work;

pub use config::{ConfigError, OutboxSettings};
pub use outbox::{
    CircuitBreaker, InMemoryOutboxStore, OutboxPublisher, OutboxRecord, OutboxStats, OutboxStore, PostgresOutboxStore,
    PublisherHandle, StoreError,
};
pub use unit_of_work::{TrackedAggregate, UnitOfWork, UnitOfWorkError};
