//! Concrete broker adapters.
//!
//! The in-memory and logging brokers live in `courier-events`; adapters here
//! need network clients.

#[cfg(feature = "redis")]
pub mod redis_streams;

#[cfg(feature = "redis")]
pub use redis_streams::RedisStreamsBroker;
