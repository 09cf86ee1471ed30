//! Process-local memory of successful publishes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, Utc};

use courier_core::{Clock, OutboxId};

/// Ids whose broker publish succeeded within the last `ttl`.
///
/// Covers the gap between "broker accepted" and "processed flag written": if
/// the flag write fails, the next fetch sees the record again and the
/// publisher marks it processed without a second publish. Lost on restart.
pub struct IdempotencyCache {
    ttl: Duration,
    clock: Arc<dyn Clock>,
    seen: Mutex<HashMap<OutboxId, DateTime<Utc>>>,
}

impl IdempotencyCache {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            ttl,
            clock,
            seen: Mutex::new(HashMap::new()),
        }
    }

    pub fn remember(&self, id: OutboxId) {
        let now = self.clock.now();
        self.lock().insert(id, now);
    }

    /// Expired entries are dropped on lookup.
    pub fn contains(&self, id: OutboxId) -> bool {
        let now = self.clock.now();
        let mut seen = self.lock();
        let fresh = match seen.get(&id) {
            Some(at) => now - *at < self.ttl,
            None => return false,
        };
        if !fresh {
            seen.remove(&id);
        }
        fresh
    }

    /// Drop every expired entry; returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut seen = self.lock();
        let before = seen.len();
        seen.retain(|_, at| now - *at < self.ttl);
        before - seen.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<OutboxId, DateTime<Utc>>> {
        self.seen.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
