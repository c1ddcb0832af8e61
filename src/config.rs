//! Scheduler configuration.

use std::time::Duration;

/// Configuration for a [`Monque`](crate::Monque) scheduler instance.
///
/// All fields have production defaults; override the ones you need:
///
/// ```ignore
/// let config = MonqueConfig::default()
///     .with_collection_name("billing_jobs")
///     .with_max_retries(5)
///     .with_poll_interval(Duration::from_millis(500));
/// ```
#[derive(Debug, Clone)]
pub struct MonqueConfig {
    /// Name of the MongoDB collection holding job documents.
    pub collection_name: String,
    /// Backup polling period for the dispatch loop. Change-stream wake-ups
    /// shorten latency; this interval is the correctness floor.
    pub poll_interval: Duration,
    /// Attempts before a job is permanently failed.
    pub max_retries: u32,
    /// Base interval `B` in the `2^n * B` retry backoff.
    pub base_retry_interval: Duration,
    /// Optional cap on the computed backoff delay.
    pub max_backoff_delay: Option<Duration>,
    /// How long `stop()` waits for in-flight handlers before reporting a
    /// shutdown timeout.
    pub shutdown_timeout: Duration,
    /// Per-worker concurrency when `register` does not specify one.
    pub default_concurrency: usize,
    /// A `processing` job whose `lockedAt` is older than this is considered
    /// abandoned and eligible for stale recovery.
    pub lock_timeout: Duration,
    /// Period of the heartbeat pump.
    pub heartbeat_interval: Duration,
    /// Run the stale-job sweep during `initialize()`.
    pub recover_stale_jobs: bool,
    /// Stable identifier for this scheduler instance. Generated when unset.
    pub scheduler_instance_id: Option<String>,
}

impl Default for MonqueConfig {
    fn default() -> Self {
        Self {
            collection_name: "monque_jobs".to_string(),
            poll_interval: Duration::from_millis(1000),
            max_retries: 10,
            base_retry_interval: Duration::from_millis(1000),
            max_backoff_delay: None,
            shutdown_timeout: Duration::from_secs(30),
            default_concurrency: 5,
            lock_timeout: Duration::from_millis(1_800_000),
            heartbeat_interval: Duration::from_secs(30),
            recover_stale_jobs: true,
            scheduler_instance_id: None,
        }
    }
}

impl MonqueConfig {
    pub fn with_collection_name(mut self, name: impl Into<String>) -> Self {
        self.collection_name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_base_retry_interval(mut self, interval: Duration) -> Self {
        self.base_retry_interval = interval;
        self
    }

    pub fn with_max_backoff_delay(mut self, cap: Duration) -> Self {
        self.max_backoff_delay = Some(cap);
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_default_concurrency(mut self, concurrency: usize) -> Self {
        self.default_concurrency = concurrency;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_recover_stale_jobs(mut self, recover: bool) -> Self {
        self.recover_stale_jobs = recover;
        self
    }

    pub fn with_instance_id(mut self, id: impl Into<String>) -> Self {
        self.scheduler_instance_id = Some(id.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = MonqueConfig::default();
        assert_eq!(config.collection_name, "monque_jobs");
        assert_eq!(config.poll_interval, Duration::from_millis(1000));
        assert_eq!(config.max_retries, 10);
        assert_eq!(config.base_retry_interval, Duration::from_millis(1000));
        assert!(config.max_backoff_delay.is_none());
        assert_eq!(config.shutdown_timeout, Duration::from_secs(30));
        assert_eq!(config.default_concurrency, 5);
        assert_eq!(config.lock_timeout, Duration::from_millis(1_800_000));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert!(config.recover_stale_jobs);
        assert!(config.scheduler_instance_id.is_none());
    }

    #[test]
    fn builders_override_fields() {
        let config = MonqueConfig::default()
            .with_collection_name("other_jobs")
            .with_max_retries(3)
            .with_max_backoff_delay(Duration::from_secs(60))
            .with_instance_id("node-a");
        assert_eq!(config.collection_name, "other_jobs");
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.max_backoff_delay, Some(Duration::from_secs(60)));
        assert_eq!(config.scheduler_instance_id.as_deref(), Some("node-a"));
    }
}
