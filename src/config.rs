use std::env;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::utils::constants::{
    DEFAULT_CLEANUP_INTERVAL, DEFAULT_CONCURRENCY, DEFAULT_ERROR_BACKOFF, DEFAULT_HANDLER_TIMEOUT,
    DEFAULT_LOCK_TTL, DEFAULT_POLL_TIMEOUT, DEFAULT_QUEUE_NAME, DEFAULT_SCHEDULER_LOCK_TTL,
    DEFAULT_STALE_THRESHOLD, JOB_LOCK_PREFIX, SCHEDULER_LOCK_PREFIX,
};

pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

/// Where the queue lives in Redis.
#[derive(Clone, Debug)]
pub struct QueueConfig {
    pub redis_url: String,
    pub name: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            redis_url: DEFAULT_REDIS_URL.to_string(),
            name: DEFAULT_QUEUE_NAME.to_string(),
        }
    }
}

impl QueueConfig {
    pub fn new(redis_url: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            redis_url: redis_url.into(),
            name: name.into(),
        }
    }
}

/// Worker pool tuning.
#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub concurrency: usize,
    /// How long one dequeue call blocks waiting for work.
    pub poll_timeout: Duration,
    pub cleanup_interval: Duration,
    /// Processing jobs older than this are reclaimed through `fail`.
    pub stale_threshold: Duration,
    pub lock_prefix: String,
    pub lock_ttl: Duration,
    pub handler_timeout: Duration,
    /// Pause after a store error before polling again.
    pub error_backoff: Duration,
    /// Dead-letter jobs with no registered handler on first sight instead of retrying.
    pub dead_letter_unroutable: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            stale_threshold: DEFAULT_STALE_THRESHOLD,
            lock_prefix: JOB_LOCK_PREFIX.to_string(),
            lock_ttl: DEFAULT_LOCK_TTL,
            handler_timeout: DEFAULT_HANDLER_TIMEOUT,
            error_backoff: DEFAULT_ERROR_BACKOFF,
            dead_letter_unroutable: false,
        }
    }
}

impl WorkerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    pub fn with_stale_threshold(mut self, threshold: Duration) -> Self {
        self.stale_threshold = threshold;
        self
    }

    pub fn with_lock_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.lock_prefix = prefix.into();
        self
    }

    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    pub fn with_error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }

    pub fn with_dead_letter_unroutable(mut self, enabled: bool) -> Self {
        self.dead_letter_unroutable = enabled;
        self
    }
}

#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    pub lock_prefix: String,
    pub lock_ttl: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            lock_prefix: SCHEDULER_LOCK_PREFIX.to_string(),
            lock_ttl: DEFAULT_SCHEDULER_LOCK_TTL,
        }
    }
}

impl SchedulerConfig {
    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }
}

/// Everything a `pantry` process needs, usually loaded with [`PantryConfig::from_env`].
#[derive(Clone, Debug, Default)]
pub struct PantryConfig {
    pub queue: QueueConfig,
    pub worker: WorkerConfig,
    pub scheduler: SchedulerConfig,
}

impl PantryConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = env::var("REDIS_URL") {
            config.queue.redis_url = url;
        }
        if let Ok(name) = env::var("PANTRY_QUEUE") {
            config.queue.name = name;
        }
        if let Some(concurrency) = env_parse::<usize>("PANTRY_CONCURRENCY") {
            config.worker.concurrency = concurrency;
        }
        if let Some(secs) = env_parse::<u64>("PANTRY_POLL_TIMEOUT_SECS") {
            config.worker.poll_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("PANTRY_STALE_THRESHOLD_SECS") {
            config.worker.stale_threshold = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("PANTRY_CLEANUP_INTERVAL_SECS") {
            config.worker.cleanup_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("PANTRY_HANDLER_TIMEOUT_SECS") {
            config.worker.handler_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("PANTRY_LOCK_TTL_SECS") {
            config.worker.lock_ttl = Duration::from_secs(secs);
        }

        config
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring {}={:?}: not a valid value", key, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_defaults() {
        let config = WorkerConfig::default();
        assert_eq!(config.concurrency, 5);
        assert_eq!(config.poll_timeout, Duration::from_secs(5));
        assert_eq!(config.cleanup_interval, Duration::from_secs(300));
        assert_eq!(config.stale_threshold, Duration::from_secs(1800));
        assert_eq!(config.lock_ttl, Duration::from_secs(1800));
        assert_eq!(config.handler_timeout, Duration::from_secs(1800));
        assert!(!config.dead_letter_unroutable);
    }

    #[test]
    fn test_scheduler_defaults() {
        let config = SchedulerConfig::default();
        assert_eq!(config.lock_prefix, "scheduler_lock:");
        assert_eq!(config.lock_ttl, Duration::from_secs(300));
    }

    #[test]
    fn test_builder_setters() {
        let config = WorkerConfig::new()
            .with_concurrency(2)
            .with_poll_timeout(Duration::from_millis(50))
            .with_dead_letter_unroutable(true);
        assert_eq!(config.concurrency, 2);
        assert_eq!(config.poll_timeout, Duration::from_millis(50));
        assert!(config.dead_letter_unroutable);
    }
}
