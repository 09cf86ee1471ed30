//! Background relay from the outbox table to the message broker.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use courier_core::{Clock, SystemClock};
use courier_events::{MessageBroker, TypeRegistry};

use super::circuit_breaker::CircuitBreaker;
use super::idempotency::IdempotencyCache;
use super::record::OutboxRecord;
use super::store::{OutboxStore, StoreError};
use crate::config::{ConfigError, OutboxSettings};

/// Failure reason stored on records whose type tag is not registered.
pub const TYPE_NOT_FOUND: &str = "type not found";

/// Batch-level failure. Counts towards the circuit breaker.
#[derive(Debug, Error)]
pub enum PublisherError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("outbox worker failed: {0}")]
    Worker(String),
}

/// What happened to one record in a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Published,
    /// Already published within the idempotency window; only marked processed.
    AlreadyPublished,
    Retrying,
    DeadLettered,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub fetched: usize,
    pub published: usize,
    pub already_published: usize,
    pub retried: usize,
    pub dead_lettered: usize,
}

impl BatchReport {
    fn count(&mut self, outcome: RecordOutcome) {
        match outcome {
            RecordOutcome::Published => self.published += 1,
            RecordOutcome::AlreadyPublished => self.already_published += 1,
            RecordOutcome::Retrying => self.retried += 1,
            RecordOutcome::DeadLettered => self.dead_lettered += 1,
        }
    }
}

/// Result of one poll tick.
#[derive(Debug)]
pub enum TickOutcome {
    /// Breaker open; nothing fetched.
    CircuitOpen,
    /// Nothing eligible.
    Idle,
    Processed(BatchReport),
    Failed(PublisherError),
}

/// Running totals since the publisher was built.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PublisherStats {
    pub batches: u64,
    pub published: u64,
    pub already_published: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub failed_batches: u64,
    pub circuit_open_skips: u64,
}

/// Handle to a publisher running on the tokio runtime.
#[derive(Debug)]
pub struct PublisherHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
    stats: Arc<Mutex<PublisherStats>>,
}

impl PublisherHandle {
    /// Stop polling, let the in-flight batch finish, then return.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.join.await {
            error!(error = %e, "outbox publisher task ended abnormally");
        }
    }

    pub fn stats(&self) -> PublisherStats {
        lock_stats(&self.stats).clone()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

/// Polls the outbox and relays eligible records to the broker.
///
/// Each tick fetches one batch and fans it out to at most
/// `max_degree_of_parallelism` concurrent workers. Per-record outcomes:
///
/// - unknown type tag, undecodable payload: dead-lettered, never retried
/// - broker error: `retry_count += 1`, retried once `retry_delay_seconds` has passed
/// - success: marked processed
///
/// Only batch-level failures (fetch errors, storage errors while recording an
/// outcome, worker panics) count towards the circuit breaker.
pub struct OutboxPublisher<S, B> {
    store: Arc<S>,
    registry: Arc<TypeRegistry>,
    broker: Arc<B>,
    settings: OutboxSettings,
    breaker: CircuitBreaker,
    idempotency: Option<Arc<IdempotencyCache>>,
    stats: Arc<Mutex<PublisherStats>>,
}

impl<S, B> OutboxPublisher<S, B>
where
    S: OutboxStore + 'static,
    B: MessageBroker + 'static,
{
    pub fn new(store: S, registry: Arc<TypeRegistry>, broker: B, settings: OutboxSettings) -> Result<Self, ConfigError> {
        Self::with_clock(store, registry, broker, settings, Arc::new(SystemClock))
    }

    /// Build with an explicit clock for the breaker and the idempotency window.
    pub fn with_clock(
        store: S,
        registry: Arc<TypeRegistry>,
        broker: B,
        settings: OutboxSettings,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        settings.validate()?;

        let idempotency = settings
            .enable_idempotency
            .then(|| Arc::new(IdempotencyCache::new(settings.idempotency_window(), Arc::clone(&clock))));

        Ok(Self {
            store: Arc::new(store),
            registry,
            broker: Arc::new(broker),
            breaker: CircuitBreaker::from_settings(&settings, clock),
            idempotency,
            settings,
            stats: Arc::new(Mutex::new(PublisherStats::default())),
        })
    }

    pub fn settings(&self) -> &OutboxSettings {
        &self.settings
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn stats(&self) -> PublisherStats {
        lock_stats(&self.stats).clone()
    }

    /// One poll tick: breaker check, one batch, breaker bookkeeping.
    pub async fn tick(&self) -> TickOutcome {
        if self.settings.enable_circuit_breaker && self.breaker.is_open() {
            warn!("circuit breaker is open; skipping outbox batch");
            lock_stats(&self.stats).circuit_open_skips += 1;
            return TickOutcome::CircuitOpen;
        }

        let (report, failure) = self.run_batch().await;
        self.record_stats(&report, failure.is_some());

        match failure {
            None => {
                self.breaker.record_success();
                if report.fetched == 0 {
                    TickOutcome::Idle
                } else {
                    TickOutcome::Processed(report)
                }
            }
            Some(err) => {
                error!(error = %err, "error processing outbox batch");
                let failures = self.breaker.record_failure();
                if self.settings.enable_circuit_breaker && failures >= self.breaker.threshold() {
                    self.breaker.trip();
                }
                TickOutcome::Failed(err)
            }
        }
    }

    /// Fetch and process one batch without touching the circuit breaker.
    pub async fn process_batch(&self) -> Result<BatchReport, PublisherError> {
        match self.run_batch().await {
            (report, None) => Ok(report),
            (_, Some(err)) => Err(err),
        }
    }

    /// Poll until `shutdown` flips to `true` (or its sender is dropped).
    ///
    /// Shutdown is only observed between ticks, so a batch that has started
    /// always runs to completion.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            poll_interval_seconds = self.settings.poll_interval_seconds,
            batch_size = self.settings.batch_size,
            max_degree_of_parallelism = self.settings.max_degree_of_parallelism,
            circuit_breaker = self.settings.enable_circuit_breaker,
            "outbox publisher started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            if let TickOutcome::Processed(report) = self.tick().await {
                debug!(
                    fetched = report.fetched,
                    published = report.published,
                    retried = report.retried,
                    dead_lettered = report.dead_lettered,
                    "outbox batch processed"
                );
            }

            tokio::select! {
                _ = tokio::time::sleep(self.settings.poll_interval()) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("outbox publisher stopped");
    }

    /// Run on the current tokio runtime.
    pub fn spawn(self) -> PublisherHandle {
        let (shutdown, receiver) = watch::channel(false);
        let stats = Arc::clone(&self.stats);
        let join = tokio::spawn(self.run(receiver));
        PublisherHandle { shutdown, join, stats }
    }

    async fn run_batch(&self) -> (BatchReport, Option<PublisherError>) {
        let mut report = BatchReport::default();

        if let Some(cache) = &self.idempotency {
            cache.purge_expired();
        }

        let batch = match self
            .store
            .fetch_batch(self.settings.batch_size, self.settings.max_retry_count)
            .await
        {
            Ok(batch) => batch,
            Err(e) => return (report, Some(e.into())),
        };
        report.fetched = batch.len();
        if batch.is_empty() {
            return (report, None);
        }

        let permits = Arc::new(Semaphore::new(self.settings.max_degree_of_parallelism));
        let mut workers = JoinSet::new();
        let mut failure = None;

        for record in batch {
            let permit = match Arc::clone(&permits).acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    failure = Some(PublisherError::Worker(e.to_string()));
                    break;
                }
            };
            let worker = self.worker();
            workers.spawn(async move {
                let _permit = permit;
                worker.handle(record).await
            });
        }

        while let Some(joined) = workers.join_next().await {
            let err = match joined {
                Ok(Ok(outcome)) => {
                    report.count(outcome);
                    continue;
                }
                Ok(Err(e)) => PublisherError::Store(e),
                Err(e) => PublisherError::Worker(e.to_string()),
            };
            error!(error = %err, "outbox worker failed");
            if failure.is_none() {
                failure = Some(err);
            }
        }

        (report, failure)
    }

    fn worker(&self) -> RecordWorker<S, B> {
        RecordWorker {
            store: Arc::clone(&self.store),
            registry: Arc::clone(&self.registry),
            broker: Arc::clone(&self.broker),
            idempotency: self.idempotency.clone(),
            max_retry_count: self.settings.max_retry_count,
            retry_delay: self.settings.retry_delay(),
        }
    }

    fn record_stats(&self, report: &BatchReport, failed: bool) {
        let mut stats = lock_stats(&self.stats);
        stats.batches += 1;
        stats.published += report.published as u64;
        stats.already_published += report.already_published as u64;
        stats.retried += report.retried as u64;
        stats.dead_lettered += report.dead_lettered as u64;
        if failed {
            stats.failed_batches += 1;
        }
    }
}

fn lock_stats(stats: &Mutex<PublisherStats>) -> MutexGuard<'_, PublisherStats> {
    stats.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Everything one spawned task needs to settle one record.
struct RecordWorker<S, B> {
    store: Arc<S>,
    registry: Arc<TypeRegistry>,
    broker: Arc<B>,
    idempotency: Option<Arc<IdempotencyCache>>,
    max_retry_count: u32,
    retry_delay: chrono::Duration,
}

impl<S, B> RecordWorker<S, B>
where
    S: OutboxStore,
    B: MessageBroker,
{
    async fn handle(self, record: OutboxRecord) -> Result<RecordOutcome, StoreError> {
        let id = record.id;

        if self.idempotency.as_ref().is_some_and(|cache| cache.contains(id)) {
            debug!(outbox_id = %id, "outbox message already published; marking processed");
            self.store.mark_processed(id).await?;
            return Ok(RecordOutcome::AlreadyPublished);
        }

        let Some(shape) = self.registry.resolve(&record.type_tag) else {
            warn!(outbox_id = %id, type_tag = %record.type_tag, "outbox message type not found");
            self.store.mark_failed_permanent(id, TYPE_NOT_FOUND).await?;
            return Ok(RecordOutcome::DeadLettered);
        };

        let message = match shape.decode(&record.payload) {
            Ok(message) => message,
            Err(e) => {
                let reason = format!("deserialization failed: {e}");
                warn!(outbox_id = %id, type_tag = %record.type_tag, error = %e, "outbox payload could not be decoded");
                self.store.mark_failed_permanent(id, &reason).await?;
                return Ok(RecordOutcome::DeadLettered);
            }
        };

        match self.broker.publish(&*message, &shape).await {
            Ok(()) => {
                if let Some(cache) = &self.idempotency {
                    cache.remember(id);
                }
                self.store.mark_processed(id).await?;
                debug!(outbox_id = %id, type_tag = %record.type_tag, "outbox message published");
                Ok(RecordOutcome::Published)
            }
            Err(e) => {
                let attempt = record.retry_count.saturating_add(1);
                warn!(
                    outbox_id = %id,
                    type_tag = %record.type_tag,
                    attempt,
                    max_retry_count = self.max_retry_count,
                    error = %e,
                    "outbox publish failed"
                );
                self.store.increment_retry(id, &e.to_string(), self.retry_delay).await?;
                if attempt >= self.max_retry_count {
                    error!(outbox_id = %id, type_tag = %record.type_tag, "outbox message reached its retry ceiling");
                }
                Ok(RecordOutcome::Retrying)
            }
        }
    }
}
