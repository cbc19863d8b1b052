//! Configuration for the sync engine.

use opsync_protocol::{DeviceId, SchemaVersion};
use std::time::Duration;

/// Configuration for the engine and its reconciler.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// This installation's device ID.
    pub device_id: DeviceId,
    /// Schema version of the local database.
    pub schema_version: SchemaVersion,
    /// Maximum number of entries per pull batch.
    pub pull_batch_size: u32,
    /// Maximum number of entries per push batch.
    pub push_batch_size: u32,
    /// Chunking limits for emitted op-log entries.
    pub chunker: ChunkerConfig,
    /// Retry behavior for transient failures.
    pub retry: RetryConfig,
    /// Per round-trip timeout for Query/Command exchanges.
    pub timeout: Duration,
    /// Capacity of the command replay-detection cache.
    pub dedup_capacity: usize,
}

impl EngineConfig {
    /// Creates a configuration with defaults for the given device and schema.
    pub fn new(device_id: DeviceId, schema_version: SchemaVersion) -> Self {
        Self {
            device_id,
            schema_version,
            pull_batch_size: 100,
            push_batch_size: 100,
            chunker: ChunkerConfig::default(),
            retry: RetryConfig::default(),
            timeout: Duration::from_secs(30),
            dedup_capacity: 1024,
        }
    }

    /// Sets the pull batch size.
    #[must_use]
    pub fn with_pull_batch_size(mut self, size: u32) -> Self {
        self.pull_batch_size = size;
        self
    }

    /// Sets the push batch size.
    #[must_use]
    pub fn with_push_batch_size(mut self, size: u32) -> Self {
        self.push_batch_size = size;
        self
    }

    /// Sets the chunker limits.
    #[must_use]
    pub fn with_chunker(mut self, chunker: ChunkerConfig) -> Self {
        self.chunker = chunker;
        self
    }

    /// Sets the retry configuration.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the round-trip timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Limits for grouping op-log entries into transport chunks.
#[derive(Debug, Clone, Copy)]
pub struct ChunkerConfig {
    /// Maximum number of entries per chunk.
    pub max_entries: usize,
    /// Maximum total payload bytes per chunk.
    pub max_bytes: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            max_entries: 64,
            max_bytes: 256 * 1024,
        }
    }
}

impl ChunkerConfig {
    /// Creates a chunker configuration with the given limits.
    #[must_use]
    pub const fn new(max_entries: usize, max_bytes: usize) -> Self {
        Self {
            max_entries,
            max_bytes,
        }
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the first).
    pub max_attempts: u32,
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a retry configuration with the given attempt budget.
    #[must_use]
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration with no retries.
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    #[must_use]
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    #[must_use]
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Calculates the delay before a given attempt (0-indexed).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base = self.initial_delay.as_secs_f64()
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        let capped = base.min(self.max_delay.as_secs_f64());

        if self.add_jitter {
            // Up to 25% jitter
            let jitter = capped * 0.25 * rand::random::<f64>();
            Duration::from_secs_f64(capped + jitter)
        } else {
            Duration::from_secs_f64(capped)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}
