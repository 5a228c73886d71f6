//! Retry configuration, delay calculation, and the backend decorator.
//!
//! [`RetryingBackend`] wraps an [`InferenceBackend`] and retries transient
//! failures (as classified by [`MimirError::is_transient()`](crate::MimirError::is_transient)) with capped
//! exponential backoff. It runs inside a queue worker, so retries hold the
//! worker's concurrency slot for their whole duration. Streams are retried
//! only while being opened; once text has been delivered a failure is final.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::traits::{InferenceBackend, TextStream};
use crate::types::GenerationRequest;
use crate::Result;

/// Configuration for retry behaviour on transient errors.
///
/// ```rust
/// # use mimir::providers::RetryConfig;
/// # use std::time::Duration;
/// let config = RetryConfig::new()
///     .max_attempts(5)
///     .initial_delay(Duration::from_millis(200));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the initial request).
    /// 1 = no retry. Default: 3.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base delay before the first retry. Default: 500ms.
    #[serde(
        rename = "initial_delay_ms",
        default = "default_initial_delay",
        with = "crate::config::duration_millis"
    )]
    pub initial_delay: Duration,
    /// Maximum delay between retries (caps exponential growth). Default: 30s.
    #[serde(
        rename = "max_delay_ms",
        default = "default_max_delay",
        with = "crate::config::duration_millis"
    )]
    pub max_delay: Duration,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
        }
    }
}

impl RetryConfig {
    /// Create a new config with sensible defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a config that disables retries (single attempt).
    pub fn disabled() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Set maximum attempts (including the initial request).
    pub fn max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n;
        self
    }

    /// Set the base delay before the first retry.
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set the maximum delay between retries.
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Delay before retry number `attempt` (0-indexed):
    /// `initial_delay * 2^attempt`, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self
            .initial_delay
            .saturating_mul(2u32.saturating_pow(attempt));
        delay.min(self.max_delay)
    }

    /// Like [`delay_for_attempt()`](Self::delay_for_attempt), but an upstream
    /// `retry_after` hint takes precedence (still capped at `max_delay`).
    pub fn effective_delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        retry_after
            .map(|hint| hint.min(self.max_delay))
            .unwrap_or_else(|| self.delay_for_attempt(attempt))
    }
}

/// Execute an async operation with retry logic.
///
/// Permanent errors are returned immediately; transient ones are retried up
/// to `config.max_attempts` times in total.
pub(crate) async fn with_retry<F, Fut, T>(config: &RetryConfig, backend: &str, f: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = config.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) if e.is_transient() && attempt + 1 < attempts => {
                let delay = config.effective_delay(attempt, e.retry_after());
                warn!(
                    backend,
                    attempt = attempt + 1,
                    max_attempts = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "retrying after transient error"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Decorator that wraps an [`InferenceBackend`] with retry logic.
pub struct RetryingBackend {
    inner: Arc<dyn InferenceBackend>,
    config: RetryConfig,
}

impl RetryingBackend {
    /// Wrap a backend with retry logic.
    pub fn new(inner: Arc<dyn InferenceBackend>, config: RetryConfig) -> Self {
        Self { inner, config }
    }
}

#[async_trait]
impl InferenceBackend for RetryingBackend {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String> {
        with_retry(&self.config, self.inner.name(), || self.inner.generate(request)).await
    }

    async fn generate_stream(&self, request: &GenerationRequest) -> Result<TextStream> {
        with_retry(&self.config, self.inner.name(), || {
            self.inner.generate_stream(request)
        })
        .await
    }

    // Health checks report the current state; retrying would mask it.
    async fn health_check(&self) -> Result<()> {
        self.inner.health_check().await
    }
}
