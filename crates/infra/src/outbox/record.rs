//! The durable outbox record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use courier_core::OutboxId;
use courier_events::Message;

/// One event waiting to be (or already) relayed to the broker.
///
/// Lifecycle:
///
/// ```text
/// created ──publish ok──▶ processed            (terminal)
///    │
///    ├──publish err──▶ retry_count += 1, wait out the delay ──▶ ... ──▶ retry_count == ceiling (never fetched again)
///    │
///    └──unknown type / bad payload──▶ dead-lettered   (terminal)
/// ```
///
/// Once `processed` is set nothing about the record changes any more.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxRecord {
    pub id: OutboxId,
    pub type_tag: String,
    /// Serialized message body (JSON text).
    pub payload: String,
    /// Fetch ordering key.
    pub occurred_at: DateTime<Utc>,
    pub processed: bool,
    pub processed_at: Option<DateTime<Utc>>,
    /// Last failure reason; cleared on success.
    pub error: Option<String>,
    pub retry_count: u32,
    /// Set once when the record failed in a way retrying cannot fix.
    pub dead_lettered_at: Option<DateTime<Utc>>,
    /// Not fetched before this instant. Set by a transient failure.
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl OutboxRecord {
    pub fn new(type_tag: impl Into<String>, payload: impl Into<String>, occurred_at: DateTime<Utc>) -> Self {
        Self {
            id: OutboxId::new(),
            type_tag: type_tag.into(),
            payload: payload.into(),
            occurred_at,
            processed: false,
            processed_at: None,
            error: None,
            retry_count: 0,
            dead_lettered_at: None,
            next_attempt_at: None,
        }
    }

    /// Serialize `message` into a fresh record.
    pub fn from_message(message: &dyn Message, occurred_at: DateTime<Utc>) -> Result<Self, serde_json::Error> {
        Ok(Self::new(message.type_tag(), message.to_payload()?, occurred_at))
    }

    pub fn is_dead_lettered(&self) -> bool {
        self.dead_lettered_at.is_some()
    }

    /// Unprocessed, not dead-lettered, and still under the retry ceiling.
    pub fn is_eligible(&self, max_retry_count: u32) -> bool {
        !self.processed && !self.is_dead_lettered() && self.retry_count < max_retry_count
    }

    /// Past its retry delay, or never delayed.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at.is_none_or(|at| at <= now)
    }

    /// Ran out of retries without ever being explicitly dead-lettered.
    pub fn is_retry_exhausted(&self, max_retry_count: u32) -> bool {
        !self.processed && !self.is_dead_lettered() && self.retry_count >= max_retry_count
    }

    /// Returns `false` when the record was already processed.
    pub fn mark_processed(&mut self, at: DateTime<Utc>) -> bool {
        if self.processed {
            return false;
        }
        self.processed = true;
        self.processed_at = Some(at);
        self.error = None;
        self.next_attempt_at = None;
        true
    }

    /// Returns `false` when the record was already processed or dead-lettered.
    pub fn mark_failed_permanent(&mut self, reason: impl Into<String>, at: DateTime<Utc>) -> bool {
        if self.processed || self.is_dead_lettered() {
            return false;
        }
        self.error = Some(reason.into());
        self.dead_lettered_at = Some(at);
        true
    }

    /// Returns `false` when the record was already processed.
    pub fn increment_retry(&mut self, reason: impl Into<String>, next_attempt_at: DateTime<Utc>) -> bool {
        if self.processed {
            return false;
        }
        self.retry_count = self.retry_count.saturating_add(1);
        self.error = Some(reason.into());
        self.next_attempt_at = Some(next_attempt_at);
        true
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn record() -> OutboxRecord {
        OutboxRecord::new("catalog.product.created", r#"{"product_id":"p-1"}"#, Utc::now())
    }

    #[test]
    fn new_record_is_pending() {
        let record = record();
        assert!(!record.processed);
        assert_eq!(record.retry_count, 0);
        assert!(record.processed_at.is_none());
        assert!(record.error.is_none());
        assert!(record.is_eligible(10));
    }

    #[test]
    fn processed_is_terminal() {
        let mut record = record();
        let at = Utc::now();
        record.increment_retry("broker down", at);

        assert!(record.mark_processed(at));
        assert!(record.error.is_none());
        assert!(record.next_attempt_at.is_none());

        let snapshot = record.clone();
        assert!(!record.mark_processed(at + Duration::seconds(5)));
        assert!(!record.increment_retry("late failure", at));
        assert!(!record.mark_failed_permanent("late failure", at));
        assert_eq!(record, snapshot);
        assert!(!record.is_eligible(10));
    }

    #[test]
    fn retry_ceiling_excludes_record() {
        let mut record = record();
        for _ in 0..3 {
            record.increment_retry("timeout", Utc::now());
        }

        assert_eq!(record.retry_count, 3);
        assert!(!record.is_eligible(3));
        assert!(record.is_retry_exhausted(3));
        assert!(record.is_eligible(4));
    }

    #[test]
    fn dead_letter_is_set_once_and_excludes_regardless_of_retries() {
        let mut record = record();
        let at = Utc::now();

        assert!(record.mark_failed_permanent("type not found", at));
        assert!(!record.mark_failed_permanent("again", at + Duration::seconds(1)));

        assert_eq!(record.dead_lettered_at, Some(at));
        assert_eq!(record.error.as_deref(), Some("type not found"));
        assert_eq!(record.retry_count, 0);
        assert!(!record.is_eligible(100));
        assert!(!record.is_retry_exhausted(100));
    }

    #[test]
    fn transient_failure_delays_the_next_attempt() {
        let mut record = record();
        let now = Utc::now();
        assert!(record.is_due(now));

        record.increment_retry("timeout", now + Duration::seconds(60));

        assert!(record.is_eligible(10));
        assert!(!record.is_due(now));
        assert!(!record.is_due(now + Duration::seconds(59)));
        assert!(record.is_due(now + Duration::seconds(60)));
    }
}
