//! Process-wide configuration.
//!
//! Per-batch [`BatchOptions`](crate::batch::BatchOptions) override the executor
//! defaults here. Queue policies apply to the execution job as a whole, not to
//! individual operations.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, VolleyError};
use crate::queue::Lane;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VolleyConfig {
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub queue: QueueConfig,
}

impl VolleyConfig {
    /// Defaults overridden by `BATCH_*` environment variables.
    ///
    /// - `BATCH_CHUNK_SIZE`, `BATCH_CONCURRENCY`: executor defaults
    /// - `BATCH_MAX_OPERATION_RETRIES`: automatic retries per operation
    /// - `BATCH_RETRY_ATTEMPTS`, `BATCH_RETRY_DELAY_MS`: queue job attempts and
    ///   base backoff (default lane policy only)
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(chunk_size) = parse_var(&lookup, "BATCH_CHUNK_SIZE")? {
            config.executor.default_chunk_size = chunk_size;
        }
        if let Some(concurrency) = parse_var(&lookup, "BATCH_CONCURRENCY")? {
            config.executor.default_concurrency = concurrency;
        }
        if let Some(retries) = parse_var(&lookup, "BATCH_MAX_OPERATION_RETRIES")? {
            config.executor.max_operation_retries = retries;
        }
        if let Some(attempts) = parse_var(&lookup, "BATCH_RETRY_ATTEMPTS")? {
            config.queue.default_policy.attempts = attempts;
        }
        if let Some(delay_ms) = parse_var(&lookup, "BATCH_RETRY_DELAY_MS")? {
            config.queue.default_policy.backoff.delay_ms = delay_ms;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.executor.default_chunk_size == 0 {
            return Err(VolleyError::InvalidArgument(
                "default_chunk_size must be at least 1".to_string(),
            ));
        }
        if self.executor.default_concurrency == 0 {
            return Err(VolleyError::InvalidArgument(
                "default_concurrency must be at least 1".to_string(),
            ));
        }
        if self.queue.default_policy.attempts == 0 || self.queue.scheduled_policy.attempts == 0 {
            return Err(VolleyError::InvalidArgument(
                "queue attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw.trim().parse().map(Some).map_err(|_| {
            VolleyError::InvalidArgument(format!("{} has an invalid value: '{}'", key, raw))
        }),
    }
}

/// Configuration for the chunked executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Chunk size when the batch does not set one
    pub default_chunk_size: usize,

    /// Concurrency when the batch does not set one
    pub default_concurrency: usize,

    /// Attempts an operation gets for retriable failures, when the batch does not
    /// set `retry_attempts`
    pub max_operation_retries: u32,

    /// Base backoff between automatic retries in milliseconds
    pub retry_backoff_ms: u64,

    /// Factor by which the backoff is increased with each retry
    pub backoff_factor: u64,

    /// Maximum backoff time in milliseconds
    pub max_backoff_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default_chunk_size: 100,
            default_concurrency: 5,
            max_operation_retries: 5,
            retry_backoff_ms: 100,
            backoff_factor: 2,
            max_backoff_ms: 10_000,
        }
    }
}

impl ExecutorConfig {
    /// Backoff before automatic retry number `retry_count` (0-based):
    /// `retry_backoff_ms * backoff_factor ^ retry_count`, capped at `max_backoff_ms`.
    pub fn retry_backoff(&self, retry_count: u32) -> Duration {
        let exponential = self
            .retry_backoff_ms
            .saturating_mul(self.backoff_factor.saturating_pow(retry_count));
        Duration::from_millis(exponential.min(self.max_backoff_ms))
    }
}

/// How the delay between job attempts grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    /// `delay_ms * 2 ^ (attempt - 1)`
    Exponential,
    /// `delay_ms` every time
    Fixed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backoff {
    pub kind: BackoffKind,
    pub delay_ms: u64,
}

impl Backoff {
    /// Delay before re-running a job that has failed `attempts_made` times.
    pub fn delay(&self, attempts_made: u32) -> Duration {
        let ms = match self.kind {
            BackoffKind::Fixed => self.delay_ms,
            BackoffKind::Exponential => self
                .delay_ms
                .saturating_mul(2u64.saturating_pow(attempts_made.saturating_sub(1))),
        };
        Duration::from_millis(ms)
    }
}

/// Attempts/backoff for execution jobs on one lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanePolicy {
    /// Total runs of a job before it is marked failed
    pub attempts: u32,
    pub backoff: Backoff,
}

/// Configuration for the execution queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Policy for the split and payment lanes
    pub default_policy: LanePolicy,

    /// Policy for the scheduled-task lane
    pub scheduled_policy: LanePolicy,

    /// Drop finished jobs instead of retaining them for inspection
    pub remove_on_complete: bool,

    /// Drop failed jobs instead of retaining them for inspection
    pub remove_on_fail: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_policy: LanePolicy {
                attempts: 5,
                backoff: Backoff {
                    kind: BackoffKind::Exponential,
                    delay_ms: 2000,
                },
            },
            scheduled_policy: LanePolicy {
                attempts: 3,
                backoff: Backoff {
                    kind: BackoffKind::Fixed,
                    delay_ms: 5000,
                },
            },
            remove_on_complete: false,
            remove_on_fail: false,
        }
    }
}

impl QueueConfig {
    pub fn policy_for(&self, lane: Lane) -> LanePolicy {
        match lane {
            Lane::Splits | Lane::Payments => self.default_policy,
            Lane::Scheduled => self.scheduled_policy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = VolleyConfig::default();
        assert_eq!(config.executor.default_chunk_size, 100);
        assert_eq!(config.executor.default_concurrency, 5);
        assert_eq!(config.queue.policy_for(Lane::Payments).attempts, 5);
        assert_eq!(config.queue.policy_for(Lane::Scheduled).attempts, 3);
        assert!(!config.queue.remove_on_complete);
        assert!(!config.queue.remove_on_fail);
    }

    #[test]
    fn test_env_overrides() {
        let config = VolleyConfig::from_lookup(lookup(&[
            ("BATCH_CHUNK_SIZE", "250"),
            ("BATCH_CONCURRENCY", "8"),
            ("BATCH_RETRY_ATTEMPTS", "2"),
            ("BATCH_RETRY_DELAY_MS", "750"),
            ("BATCH_MAX_OPERATION_RETRIES", "1"),
        ]))
        .unwrap();

        assert_eq!(config.executor.default_chunk_size, 250);
        assert_eq!(config.executor.default_concurrency, 8);
        assert_eq!(config.executor.max_operation_retries, 1);
        assert_eq!(config.queue.default_policy.attempts, 2);
        assert_eq!(config.queue.default_policy.backoff.delay_ms, 750);
        // Scheduled lane keeps its own policy
        assert_eq!(config.queue.scheduled_policy.backoff.delay_ms, 5000);
    }

    #[test]
    fn test_env_rejects_garbage() {
        let err = VolleyConfig::from_lookup(lookup(&[("BATCH_CONCURRENCY", "lots")])).unwrap_err();
        assert!(err.to_string().contains("BATCH_CONCURRENCY"));

        assert!(VolleyConfig::from_lookup(lookup(&[("BATCH_CHUNK_SIZE", "0")])).is_err());
    }

    #[test]
    fn test_retry_backoff_is_capped() {
        let config = ExecutorConfig::default();
        assert_eq!(config.retry_backoff(0), Duration::from_millis(100));
        assert_eq!(config.retry_backoff(3), Duration::from_millis(800));
        assert_eq!(config.retry_backoff(20), Duration::from_millis(10_000));
    }

    #[test]
    fn test_queue_backoff() {
        let exponential = Backoff {
            kind: BackoffKind::Exponential,
            delay_ms: 2000,
        };
        assert_eq!(exponential.delay(1), Duration::from_millis(2000));
        assert_eq!(exponential.delay(3), Duration::from_millis(8000));

        let fixed = Backoff {
            kind: BackoffKind::Fixed,
            delay_ms: 5000,
        };
        assert_eq!(fixed.delay(4), Duration::from_millis(5000));
    }
}
