//! Transactional unit of work.
//!
//! Business rows and the outbox records for every event they raised are
//! written in one transaction. Events leave the aggregates only after that
//! transaction has committed, so a failed commit can simply be retried.

pub mod transaction;

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, error, warn};

use courier_core::{AggregateRoot, Clock, SystemClock};
use courier_events::{CommittedEvent, Event, EventBus, HasDomainEvents, Message};

use crate::outbox::{OutboxRecord, StoreError};

pub use transaction::{EntityRow, TransactionSource, WriteTransaction};

/// An aggregate the unit of work can persist.
///
/// Blanket-implemented for every serializable aggregate that carries domain
/// events. Keep the event buffer out of the serialized state with
/// `#[serde(skip)]`.
pub trait TrackedAggregate: AggregateRoot + HasDomainEvents + Send {
    fn snapshot(&self) -> serde_json::Result<JsonValue>;
}

impl<T> TrackedAggregate for T
where
    T: AggregateRoot + HasDomainEvents + Serialize + Send,
{
    fn snapshot(&self) -> serde_json::Result<JsonValue> {
        serde_json::to_value(self)
    }
}

#[derive(Debug, Error)]
pub enum UnitOfWorkError {
    #[error("failed to serialize {aggregate_type} state: {source}")]
    Snapshot {
        aggregate_type: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to serialize event {type_tag}: {source}")]
    Serialization {
        type_tag: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("write failed: {0}")]
    Store(#[source] StoreError),

    #[error("commit failed: {0}")]
    Commit(#[source] StoreError),
}

type Notify<'a> = Box<dyn Fn(CommittedEvent) + Send + Sync + 'a>;

/// One logical transaction scope.
///
/// ```ignore
/// let mut uow = UnitOfWork::new(store.clone());
/// uow.track(&mut product);
/// uow.add_integration_event(ProductCreatedIntegrationEvent { .. });
/// if !uow.commit().await {
///     // nothing was written; product still holds its events
/// }
/// ```
pub struct UnitOfWork<'a> {
    source: Arc<dyn TransactionSource>,
    clock: Arc<dyn Clock>,
    tx: Option<Box<dyn WriteTransaction>>,
    tracked: Vec<&'a mut dyn TrackedAggregate>,
    integration_events: Vec<Arc<dyn Message>>,
    notify: Option<Notify<'a>>,
}

impl<'a> UnitOfWork<'a> {
    pub fn new(source: Arc<dyn TransactionSource>) -> Self {
        Self::with_clock(source, Arc::new(SystemClock))
    }

    /// `occurred_at` of every captured event comes from `clock`.
    pub fn with_clock(source: Arc<dyn TransactionSource>, clock: Arc<dyn Clock>) -> Self {
        Self {
            source,
            clock,
            tx: None,
            tracked: Vec::new(),
            integration_events: Vec::new(),
            notify: None,
        }
    }

    /// Announce every committed event on `bus`. Bus failures are logged only.
    pub fn with_notifications<B>(mut self, bus: B) -> Self
    where
        B: EventBus<CommittedEvent> + 'a,
    {
        self.notify = Some(Box::new(move |event: CommittedEvent| {
            let outbox_id = event.outbox_id();
            if let Err(err) = bus.publish(event) {
                warn!(outbox_id = %outbox_id, error = ?err, "commit notification dropped");
            }
        }));
        self
    }

    /// Open a transaction unless one is already open.
    pub async fn begin(&mut self) -> Result<(), UnitOfWorkError> {
        if self.tx.is_none() {
            let tx = self.source.begin().await.map_err(UnitOfWorkError::Store)?;
            self.tx = Some(tx);
        }
        Ok(())
    }

    pub fn track(&mut self, aggregate: &'a mut dyn TrackedAggregate) {
        self.tracked.push(aggregate);
    }

    /// Queue an event for the outbox that no aggregate raised.
    pub fn add_integration_event<E: Event>(&mut self, event: E) {
        self.integration_events.push(Arc::new(event));
    }

    pub fn is_active(&self) -> bool {
        self.tx.is_some()
    }

    pub fn tracked_count(&self) -> usize {
        self.tracked.len()
    }

    /// Events the next commit would write.
    pub fn pending_event_count(&self) -> usize {
        let raised: usize = self.tracked.iter().map(|a| a.domain_events().len()).sum();
        raised + self.integration_events.len()
    }

    /// Commit, reporting only success or failure. Failures are logged.
    pub async fn commit(&mut self) -> bool {
        match self.try_commit().await {
            Ok(_) => true,
            Err(e) => {
                error!(error = %e, "unit of work commit failed; rolled back");
                false
            }
        }
    }

    /// Commit and return one notification per written outbox record.
    ///
    /// On error the transaction is rolled back and all tracking, including
    /// every aggregate's events, is left as it was.
    pub async fn try_commit(&mut self) -> Result<Vec<CommittedEvent>, UnitOfWorkError> {
        let outcome = match self.stage() {
            Ok((rows, records)) => self.write(rows, records).await,
            Err(e) => Err(e),
        };

        let committed = match outcome {
            Ok(committed) => committed,
            Err(e) => {
                self.abort().await;
                return Err(e);
            }
        };

        for aggregate in self.tracked.iter_mut() {
            aggregate.domain_events_mut().clear();
        }
        self.tracked.clear();
        self.integration_events.clear();

        debug!(events = committed.len(), "unit of work committed");
        if let Some(notify) = &self.notify {
            for event in &committed {
                notify(event.clone());
            }
        }
        Ok(committed)
    }

    /// Forget tracked aggregates and queued integration events, then discard
    /// the open transaction. Returns `false` when no transaction was open; the
    /// tracking state is cleared either way.
    ///
    /// Events already raised on aggregates stay where they are.
    pub async fn rollback(&mut self) -> bool {
        self.tracked.clear();
        self.integration_events.clear();

        let Some(tx) = self.tx.take() else {
            return false;
        };
        if let Err(e) = tx.rollback().await {
            warn!(error = %e, "rollback failed");
        }
        true
    }

    /// Serialize everything up front; no I/O.
    fn stage(&self) -> Result<(Vec<EntityRow>, Vec<OutboxRecord>), UnitOfWorkError> {
        let now = self.clock.now();
        let mut rows = Vec::with_capacity(self.tracked.len());
        let mut records = Vec::new();

        for aggregate in &self.tracked {
            let state = aggregate.snapshot().map_err(|source| UnitOfWorkError::Snapshot {
                aggregate_type: aggregate.aggregate_type(),
                source,
            })?;
            rows.push(EntityRow {
                aggregate_type: aggregate.aggregate_type().to_string(),
                aggregate_id: aggregate.id(),
                version: aggregate.version(),
                state,
            });

            for message in aggregate.domain_events().iter() {
                records.push(to_record(message.as_ref(), now)?);
            }
        }

        for message in &self.integration_events {
            records.push(to_record(message.as_ref(), now)?);
        }

        Ok((rows, records))
    }

    async fn write(
        &mut self,
        rows: Vec<EntityRow>,
        records: Vec<OutboxRecord>,
    ) -> Result<Vec<CommittedEvent>, UnitOfWorkError> {
        self.begin().await?;
        let mut tx = self
            .tx
            .take()
            .ok_or_else(|| UnitOfWorkError::Store(StoreError::Storage("no open transaction".to_string())))?;

        let committed: Vec<_> = records
            .iter()
            .map(|r| CommittedEvent::new(r.id, r.type_tag.as_str(), r.payload.as_str(), r.occurred_at))
            .collect();

        let staged = stage_rows(tx.as_mut(), rows, records).await;
        if let Err(e) = staged {
            self.tx = Some(tx);
            return Err(e);
        }

        tx.commit().await.map_err(UnitOfWorkError::Commit)?;
        Ok(committed)
    }

    async fn abort(&mut self) {
        if let Some(tx) = self.tx.take() {
            if let Err(e) = tx.rollback().await {
                warn!(error = %e, "rollback after failed commit also failed");
            }
        }
    }
}

async fn stage_rows(
    tx: &mut dyn WriteTransaction,
    rows: Vec<EntityRow>,
    records: Vec<OutboxRecord>,
) -> Result<(), UnitOfWorkError> {
    for row in rows {
        tx.save_entity(row).await.map_err(UnitOfWorkError::Store)?;
    }
    for record in records {
        tx.append(record).await.map_err(UnitOfWorkError::Store)?;
    }
    Ok(())
}

fn to_record(message: &dyn Message, now: chrono::DateTime<chrono::Utc>) -> Result<OutboxRecord, UnitOfWorkError> {
    OutboxRecord::from_message(message, now).map_err(|source| UnitOfWorkError::Serialization {
        type_tag: message.type_tag().to_string(),
        source,
    })
}
