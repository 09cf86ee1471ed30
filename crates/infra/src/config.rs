//! Outbox publisher configuration.
//!
//! Every knob has a default; [`OutboxSettings::validate`] enforces the allowed
//! ranges and runs before a publisher is built.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Prefix of the environment variables read by [`OutboxSettings::from_env`].
pub const ENV_PREFIX: &str = "OUTBOX_";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{field} must be between {min} and {max} (got {value})")]
    OutOfRange {
        field: &'static str,
        value: u64,
        min: u64,
        max: u64,
    },

    #[error("{key}: cannot parse {value:?}")]
    Unparsable { key: String, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxSettings {
    pub poll_interval_seconds: u64,
    pub batch_size: usize,
    pub max_degree_of_parallelism: usize,
    /// Records whose `retry_count` reaches this value are never fetched again.
    pub max_retry_count: u32,
    /// How long a record sits out after a transient failure before it is fetched again.
    pub retry_delay_seconds: u64,
    pub enable_circuit_breaker: bool,
    pub circuit_breaker_failure_threshold: u32,
    pub circuit_breaker_reset_timeout_seconds: u64,
    pub enable_idempotency: bool,
    pub idempotency_cache_hours: u64,
}

impl Default for OutboxSettings {
    fn default() -> Self {
        Self {
            poll_interval_seconds: 5,
            batch_size: 50,
            max_degree_of_parallelism: 4,
            max_retry_count: 10,
            retry_delay_seconds: 60,
            enable_circuit_breaker: true,
            circuit_breaker_failure_threshold: 5,
            circuit_breaker_reset_timeout_seconds: 60,
            enable_idempotency: true,
            idempotency_cache_hours: 24,
        }
    }
}

impl OutboxSettings {
    /// Load settings from `OUTBOX_*` environment variables, falling back to
    /// defaults for anything unset, then validate.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`OutboxSettings::from_env`] with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Self::default();
        let env = EnvReader {
            lookup: &lookup,
        };

        env.read("POLL_INTERVAL_SECONDS", &mut settings.poll_interval_seconds)?;
        env.read("BATCH_SIZE", &mut settings.batch_size)?;
        env.read("MAX_DEGREE_OF_PARALLELISM", &mut settings.max_degree_of_parallelism)?;
        env.read("MAX_RETRY_COUNT", &mut settings.max_retry_count)?;
        env.read("RETRY_DELAY_SECONDS", &mut settings.retry_delay_seconds)?;
        env.read("ENABLE_CIRCUIT_BREAKER", &mut settings.enable_circuit_breaker)?;
        env.read(
            "CIRCUIT_BREAKER_FAILURE_THRESHOLD",
            &mut settings.circuit_breaker_failure_threshold,
        )?;
        env.read(
            "CIRCUIT_BREAKER_RESET_TIMEOUT_SECONDS",
            &mut settings.circuit_breaker_reset_timeout_seconds,
        )?;
        env.read("ENABLE_IDEMPOTENCY", &mut settings.enable_idempotency)?;
        env.read("IDEMPOTENCY_CACHE_HOURS", &mut settings.idempotency_cache_hours)?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range("poll_interval_seconds", self.poll_interval_seconds, 1, 300)?;
        check_range("batch_size", self.batch_size as u64, 1, 1000)?;
        check_range(
            "max_degree_of_parallelism",
            self.max_degree_of_parallelism as u64,
            1,
            32,
        )?;
        check_range("max_retry_count", u64::from(self.max_retry_count), 1, 100)?;
        check_range("retry_delay_seconds", self.retry_delay_seconds, 1, 3600)?;
        check_range(
            "circuit_breaker_failure_threshold",
            u64::from(self.circuit_breaker_failure_threshold),
            1,
            100,
        )?;
        check_range(
            "circuit_breaker_reset_timeout_seconds",
            self.circuit_breaker_reset_timeout_seconds,
            10,
            3600,
        )?;
        check_range("idempotency_cache_hours", self.idempotency_cache_hours, 1, 720)?;
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }

    pub fn retry_delay(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.retry_delay_seconds as i64)
    }

    pub fn circuit_breaker_reset_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.circuit_breaker_reset_timeout_seconds as i64)
    }

    pub fn idempotency_window(&self) -> chrono::Duration {
        chrono::Duration::hours(self.idempotency_cache_hours as i64)
    }
}

fn check_range(field: &'static str, value: u64, min: u64, max: u64) -> Result<(), ConfigError> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            field,
            value,
            min,
            max,
        })
    }
}

struct EnvReader<'a, F> {
    lookup: &'a F,
}

impl<F> EnvReader<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn read<T: std::str::FromStr>(&self, name: &str, target: &mut T) -> Result<(), ConfigError> {
        let key = format!("{ENV_PREFIX}{name}");
        let Some(raw) = (self.lookup)(&key) else {
            return Ok(());
        };
        *target = raw.trim().parse().map_err(|_| ConfigError::Unparsable {
            key: key.clone(),
            value: raw.clone(),
        })?;
        Ok(())
    }
}
