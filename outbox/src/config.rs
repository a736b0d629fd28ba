//! Engine configuration.
//!
//! Loaded from `OUTBOX_*` environment variables with defaults suitable for
//! local development; embedders can also build the struct directly.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{OutboxError, OutboxResult};
use crate::retry::RetryPolicy;

/// Main engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxConfig {
    /// Scheduler tick period in milliseconds
    pub poll_interval_ms: u64,
    /// Max keys dispatched per tick per instance
    pub batch_size: i64,
    /// Halt a key for the rest of the tick on the first non-completed record
    pub stop_on_first_failure: bool,
    /// Prune records on success instead of retaining them as COMPLETED
    pub delete_completed_records: bool,
    /// Heartbeat timer period in seconds
    pub heartbeat_interval_secs: u64,
    /// Peers with an older heartbeat are evicted by any live instance
    pub stale_instance_timeout_secs: i64,
    /// How long `shutdown()` waits for outstanding workers
    pub graceful_shutdown_timeout_secs: u64,
    /// Concurrency ceiling for key workers; -1 means unbounded
    pub executor_concurrency_limit: i64,
    /// Number of partitions keys hash into; must match across the cluster
    pub total_partitions: i32,
    /// Identity of this instance in the cluster
    pub instance: InstanceConfig,
    /// Default retry policy, used by handlers without their own
    pub retry: RetryConfig,
}

/// Identity of this instance in the `outbox_instance` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub hostname: String,
    pub port: u16,
}

/// Default retry policy settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter_ms: u64,
    pub max_retries: i32,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            batch_size: 100,
            stop_on_first_failure: true,
            delete_completed_records: false,
            heartbeat_interval_secs: 5,
            stale_instance_timeout_secs: 30,
            graceful_shutdown_timeout_secs: 30,
            executor_concurrency_limit: -1,
            total_partitions: 64,
            instance: InstanceConfig {
                hostname: "localhost".to_string(),
                port: 0,
            },
            retry: RetryConfig {
                initial_backoff_ms: 100,
                max_backoff_ms: 10_000,
                backoff_multiplier: 2.0,
                jitter_ms: 0,
                max_retries: 3,
            },
        }
    }
}

impl OutboxConfig {
    /// Load configuration from environment variables, falling back to the
    /// defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            poll_interval_ms: env_parse("OUTBOX_POLL_INTERVAL_MS", defaults.poll_interval_ms),
            batch_size: env_parse("OUTBOX_BATCH_SIZE", defaults.batch_size),
            stop_on_first_failure: env_parse(
                "OUTBOX_STOP_ON_FIRST_FAILURE",
                defaults.stop_on_first_failure,
            ),
            delete_completed_records: env_parse(
                "OUTBOX_DELETE_COMPLETED_RECORDS",
                defaults.delete_completed_records,
            ),
            heartbeat_interval_secs: env_parse(
                "OUTBOX_HEARTBEAT_INTERVAL_SECS",
                defaults.heartbeat_interval_secs,
            ),
            stale_instance_timeout_secs: env_parse(
                "OUTBOX_STALE_INSTANCE_TIMEOUT_SECS",
                defaults.stale_instance_timeout_secs,
            ),
            graceful_shutdown_timeout_secs: env_parse(
                "OUTBOX_GRACEFUL_SHUTDOWN_TIMEOUT_SECS",
                defaults.graceful_shutdown_timeout_secs,
            ),
            executor_concurrency_limit: env_parse(
                "OUTBOX_EXECUTOR_CONCURRENCY_LIMIT",
                defaults.executor_concurrency_limit,
            ),
            total_partitions: env_parse("OUTBOX_TOTAL_PARTITIONS", defaults.total_partitions),
            instance: InstanceConfig {
                hostname: std::env::var("OUTBOX_INSTANCE_HOSTNAME")
                    .or_else(|_| std::env::var("HOSTNAME"))
                    .unwrap_or(defaults.instance.hostname),
                port: env_parse("OUTBOX_INSTANCE_PORT", defaults.instance.port),
            },
            retry: RetryConfig {
                initial_backoff_ms: env_parse(
                    "OUTBOX_RETRY_INITIAL_BACKOFF_MS",
                    defaults.retry.initial_backoff_ms,
                ),
                max_backoff_ms: env_parse(
                    "OUTBOX_RETRY_MAX_BACKOFF_MS",
                    defaults.retry.max_backoff_ms,
                ),
                backoff_multiplier: env_parse(
                    "OUTBOX_RETRY_BACKOFF_MULTIPLIER",
                    defaults.retry.backoff_multiplier,
                ),
                jitter_ms: env_parse("OUTBOX_RETRY_JITTER_MS", defaults.retry.jitter_ms),
                max_retries: env_parse("OUTBOX_RETRY_MAX_RETRIES", defaults.retry.max_retries),
            },
        }
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> OutboxResult<()> {
        if self.poll_interval_ms == 0 {
            return Err(OutboxError::Configuration(
                "poll_interval_ms must be positive".to_string(),
            ));
        }
        if self.batch_size <= 0 {
            return Err(OutboxError::Configuration(format!(
                "batch_size must be positive, got {}",
                self.batch_size
            )));
        }
        if self.heartbeat_interval_secs == 0 {
            return Err(OutboxError::Configuration(
                "heartbeat_interval_secs must be positive".to_string(),
            ));
        }
        if self.stale_instance_timeout_secs <= 0 {
            return Err(OutboxError::Configuration(format!(
                "stale_instance_timeout_secs must be positive, got {}",
                self.stale_instance_timeout_secs
            )));
        }
        if self.total_partitions <= 0 {
            return Err(OutboxError::Configuration(format!(
                "total_partitions must be positive, got {}",
                self.total_partitions
            )));
        }
        if self.executor_concurrency_limit == 0 || self.executor_concurrency_limit < -1 {
            return Err(OutboxError::Configuration(format!(
                "executor_concurrency_limit must be positive or -1 (unbounded), got {}",
                self.executor_concurrency_limit
            )));
        }
        self.default_retry_policy().validate()
    }

    /// The engine-wide default retry policy built from the retry section.
    pub fn default_retry_policy(&self) -> RetryPolicy {
        let policy = RetryPolicy::exponential(
            Duration::from_millis(self.retry.initial_backoff_ms),
            self.retry.backoff_multiplier,
            Duration::from_millis(self.retry.max_backoff_ms),
            self.retry.max_retries,
        );
        if self.retry.jitter_ms > 0 {
            policy.with_jitter(Duration::from_millis(self.retry.jitter_ms))
        } else {
            policy
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn graceful_shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.graceful_shutdown_timeout_secs)
    }
}

fn env_parse<T: std::str::FromStr>(var: &str, default: T) -> T {
    std::env::var(var)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}
