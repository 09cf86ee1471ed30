//! Consecutive-failure circuit breaker around the publishing batch.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{info, warn};

use courier_core::Clock;

use crate::config::OutboxSettings;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CircuitBreakerState {
    pub consecutive_failures: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub is_open: bool,
}

/// Opens after `threshold` consecutive batch failures and closes again once
/// `reset_timeout` has passed since the last failure.
///
/// Reset is lazy: it happens inside [`CircuitBreaker::is_open`], so a breaker
/// nobody asks about stays open.
pub struct CircuitBreaker {
    threshold: u32,
    reset_timeout: Duration,
    clock: Arc<dyn Clock>,
    state: Mutex<CircuitBreakerState>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, reset_timeout: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            threshold,
            reset_timeout,
            clock,
            state: Mutex::new(CircuitBreakerState::default()),
        }
    }

    pub fn from_settings(settings: &OutboxSettings, clock: Arc<dyn Clock>) -> Self {
        Self::new(
            settings.circuit_breaker_failure_threshold,
            settings.circuit_breaker_reset_timeout(),
            clock,
        )
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Whether batches must be skipped right now.
    ///
    /// An open breaker is closed here, and the failure count cleared, once
    /// strictly more than the reset timeout has passed since it tripped.
    pub fn is_open(&self) -> bool {
        let mut state = self.lock();
        if !state.is_open {
            return false;
        }

        let cooled_down = state
            .last_failure_time
            .is_none_or(|last| self.clock.now() - last > self.reset_timeout);
        if cooled_down {
            *state = CircuitBreakerState::default();
            info!("circuit breaker reset");
            return false;
        }
        true
    }

    pub fn record_success(&self) {
        self.lock().consecutive_failures = 0;
    }

    /// Count a failed batch; returns the new consecutive-failure count.
    pub fn record_failure(&self) -> u32 {
        let mut state = self.lock();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        state.last_failure_time = Some(self.clock.now());
        state.consecutive_failures
    }

    /// Open the breaker; the cool-down starts now.
    pub fn trip(&self) {
        let now = self.clock.now();
        let mut state = self.lock();
        if !state.is_open {
            warn!(
                consecutive_failures = state.consecutive_failures,
                reset_timeout_seconds = self.reset_timeout.num_seconds(),
                "circuit breaker opened"
            );
        }
        state.is_open = true;
        state.last_failure_time = Some(now);
    }

    pub fn state(&self) -> CircuitBreakerState {
        *self.lock()
    }

    fn lock(&self) -> MutexGuard<'_, CircuitBreakerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl core::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("threshold", &self.threshold)
            .field("reset_timeout", &self.reset_timeout)
            .field("state", &self.state())
            .finish()
    }
}
