use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;

use courier_events::{LoggingBroker, MessageBroker};
use courier_infra::broker::RedisStreamsBroker;
use courier_infra::{OutboxPublisher, OutboxSettings, OutboxStore, PostgresOutboxStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    courier_observability::init();

    let settings = OutboxSettings::from_env().context("invalid outbox settings")?;
    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;

    let pool = PgPoolOptions::new()
        .max_connections(settings.max_degree_of_parallelism as u32 + 2)
        .connect(&database_url)
        .await
        .context("failed to connect to Postgres")?;
    let store = PostgresOutboxStore::new(pool);
    store.ensure_schema().await.context("failed to prepare outbox schema")?;

    let registry = Arc::new(courier_relay::build_registry());
    tracing::info!(types = ?registry.tags(), "type registry built");

    let broker: Arc<dyn MessageBroker> = match std::env::var("REDIS_URL") {
        Ok(url) => {
            let broker = RedisStreamsBroker::new(&url, std::env::var("OUTBOX_STREAM_KEY").ok())
                .context("invalid REDIS_URL")?;
            tracing::info!(stream_key = broker.stream_key(), "publishing to Redis Streams");
            Arc::new(broker)
        }
        Err(_) => {
            tracing::warn!("REDIS_URL not set; messages will only be logged");
            Arc::new(LoggingBroker)
        }
    };

    let stats = store
        .stats(settings.max_retry_count)
        .await
        .context("failed to read outbox stats")?;
    tracing::info!(
        pending = stats.pending,
        dead_lettered = stats.dead_lettered,
        retry_exhausted = stats.retry_exhausted,
        "outbox state at startup"
    );

    let handle = OutboxPublisher::new(store, registry, broker, settings)
        .context("invalid outbox settings")?
        .spawn();

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    tracing::info!(stats = ?handle.stats(), "shutting down; draining in-flight batch");
    handle.shutdown().await;

    Ok(())
}
