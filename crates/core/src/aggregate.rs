//! Aggregate root trait.

use crate::id::AggregateId;

/// Aggregate root marker + minimal interface.
///
/// Aggregates are the unit a transaction writes: one business row per aggregate,
/// plus whatever domain events the aggregate raised while it was mutated.
pub trait AggregateRoot {
    /// Stable name of the aggregate kind (e.g. "order", "product").
    ///
    /// Used as the row discriminator by the persistence layer.
    fn aggregate_type(&self) -> &'static str;

    /// Returns the aggregate identifier.
    fn id(&self) -> AggregateId;

    /// Monotonically increasing version of the aggregate's state.
    fn version(&self) -> u64;
}
