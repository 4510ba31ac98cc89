use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for one worker loop in the pool.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Unique identifier for this worker; recorded as the lease owner.
    pub worker_id: String,
    /// Jobs claimed per lease call.
    pub batch_size: usize,
    /// First idle sleep when the store has no ready work, in milliseconds.
    pub poll_interval_ms: u64,
    /// Ceiling for the doubling idle sleep, in milliseconds.
    pub max_poll_interval_ms: u64,
}

impl WorkerConfig {
    /// Create a new worker configuration with the given worker ID.
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Self::default()
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Set the polling interval.
    pub fn with_poll_interval(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    pub fn with_max_poll_interval(mut self, ms: u64) -> Self {
        self.max_poll_interval_ms = ms;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Idle sleep to use after `current` came back empty again.
    pub fn next_idle_backoff(&self, current: Duration) -> Duration {
        let ceiling = Duration::from_millis(self.max_poll_interval_ms.max(self.poll_interval_ms).max(1));
        (current * 2).min(ceiling)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: "default-worker".to_string(),
            batch_size: 5,
            poll_interval_ms: 100,
            max_poll_interval_ms: 2000,
        }
    }
}
