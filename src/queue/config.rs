use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for an [`InferenceQueue`](super::InferenceQueue).
///
/// ```rust
/// # use mimir::queue::QueueConfig;
/// let config = QueueConfig::new()
///     .max_concurrent(4)
///     .max_queue_size(100);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Number of workers, i.e. inferences running at once. Default: 2.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Pending items held before submissions are rejected. Default: 50.
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    /// How long an idle worker waits for work before re-checking whether
    /// the queue is still running. Default: 1s.
    #[serde(
        rename = "poll_interval_ms",
        default = "default_poll_interval",
        with = "crate::config::duration_millis"
    )]
    pub poll_interval: Duration,
}

fn default_max_concurrent() -> usize {
    2
}

fn default_max_queue_size() -> usize {
    50
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            max_queue_size: default_max_queue_size(),
            poll_interval: default_poll_interval(),
        }
    }
}

impl QueueConfig {
    /// Create a new config with sensible defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of workers.
    pub fn max_concurrent(mut self, n: usize) -> Self {
        self.max_concurrent = n;
        self
    }

    /// Set the number of pending items accepted before rejecting.
    pub fn max_queue_size(mut self, n: usize) -> Self {
        self.max_queue_size = n;
        self
    }

    /// Set the idle poll interval.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}
