//! In-memory domain events attached to aggregates.

use std::sync::Arc;

use crate::event::{Event, Message};

/// Buffer of domain events raised by one aggregate.
///
/// Events accumulate while the aggregate is mutated and are drained by the unit
/// of work at commit time. The buffer is only cleared after the enclosing
/// transaction has committed; a failed commit leaves it as it was.
#[derive(Debug, Clone, Default)]
pub struct DomainEvents {
    events: Vec<Arc<dyn Message>>,
}

impl DomainEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise<E: Event>(&mut self, event: E) {
        self.events.push(Arc::new(event));
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Message>> {
        self.events.iter()
    }

    /// Cheap copy of the current events (shared, not re-serialized).
    pub fn snapshot(&self) -> Vec<Arc<dyn Message>> {
        self.events.clone()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }
}

/// Anything that raises domain events.
pub trait HasDomainEvents {
    fn domain_events(&self) -> &DomainEvents;

    fn domain_events_mut(&mut self) -> &mut DomainEvents;

    fn raise<E: Event>(&mut self, event: E)
    where
        Self: Sized,
    {
        self.domain_events_mut().raise(event);
    }
}
