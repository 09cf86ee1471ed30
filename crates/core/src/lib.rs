//! `courier-core`: identifiers, clocks and the domain error model shared by
//! every courier crate.
//!
//! This crate contains **pure** building blocks (no IO, no async).

pub mod aggregate;
pub mod clock;
pub mod error;
pub mod id;

pub use aggregate::AggregateRoot;
pub use clock::{Clock, FixedClock, ManualClock, SystemClock};
pub use error::DomainError;
pub use id::{AggregateId, OutboxId};
