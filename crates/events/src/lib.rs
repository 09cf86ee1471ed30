//! `courier-events`: event contracts, the type registry and the broker seam.
//!
//! Nothing in here touches storage. The infra crate glues these pieces to a
//! transactional outbox.

pub mod broker;
pub mod bus;
pub mod domain;
pub mod envelope;
pub mod event;
pub mod in_memory_broker;
pub mod in_memory_bus;
pub mod registry;

pub use broker::{BrokerError, LoggingBroker, MessageBroker};
pub use bus::{EventBus, Subscription};
pub use domain::{DomainEvents, HasDomainEvents};
pub use envelope::CommittedEvent;
pub use event::{Event, Message};
pub use in_memory_broker::{InMemoryBroker, PublishedMessage};
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
pub use registry::{MessageShape, RegistryError, TypeRegistry};
