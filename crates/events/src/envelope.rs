use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use courier_core::OutboxId;

/// Notification that an event became durable.
///
/// Sent on the in-process bus after a unit of work commits, one per captured
/// event. It carries the id of the outbox record written for the event so
/// local handlers can correlate with what the publisher relays later.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommittedEvent {
    outbox_id: OutboxId,
    type_tag: String,
    payload: String,
    occurred_at: DateTime<Utc>,
}

impl CommittedEvent {
    pub fn new(
        outbox_id: OutboxId,
        type_tag: impl Into<String>,
        payload: impl Into<String>,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            outbox_id,
            type_tag: type_tag.into(),
            payload: payload.into(),
            occurred_at,
        }
    }

    pub fn outbox_id(&self) -> OutboxId {
        self.outbox_id
    }

    pub fn type_tag(&self) -> &str {
        &self.type_tag
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }
}
