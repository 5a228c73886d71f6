//! Per-client token buckets.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::telemetry;
use crate::{MimirError, Result};

/// Buckets idle for longer than this many windows are dropped by
/// [`RateLimiter::cleanup()`].
const STALE_WINDOWS: u32 = 10;

/// Configuration for a [`RateLimiter`].
///
/// ```rust
/// # use mimir::limiter::LimiterConfig;
/// # use std::time::Duration;
/// let config = LimiterConfig::new()
///     .max_tokens(20)
///     .refill_rate(1.0)
///     .window(Duration::from_secs(30));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Bucket capacity, i.e. the largest burst a client can send. Default: 10.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Tokens added per second. Zero means buckets never refill. Default: 1.0.
    #[serde(default = "default_refill_rate")]
    pub refill_rate: f64,
    /// Reference window; buckets idle for ten windows are swept. Default: 60s.
    #[serde(
        rename = "window_seconds",
        default = "default_window",
        with = "crate::config::duration_secs"
    )]
    pub window: Duration,
}

fn default_max_tokens() -> u32 {
    10
}

fn default_refill_rate() -> f64 {
    1.0
}

fn default_window() -> Duration {
    Duration::from_secs(60)
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            refill_rate: default_refill_rate(),
            window: default_window(),
        }
    }
}

impl LimiterConfig {
    /// Create a new config with sensible defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Chat endpoints: burst of 10, one request every 2 seconds.
    pub fn chat() -> Self {
        Self::new().max_tokens(10).refill_rate(0.5)
    }

    /// Document uploads: burst of 5, one upload every 10 seconds.
    pub fn upload() -> Self {
        Self::new().max_tokens(5).refill_rate(0.1)
    }

    /// Everything else: burst of 30, two requests per second.
    pub fn general() -> Self {
        Self::new().max_tokens(30).refill_rate(2.0)
    }

    /// Set the bucket capacity.
    pub fn max_tokens(mut self, n: u32) -> Self {
        self.max_tokens = n;
        self
    }

    /// Set the refill rate in tokens per second.
    pub fn refill_rate(mut self, rate: f64) -> Self {
        self.refill_rate = rate;
        self
    }

    /// Set the reference window used for stale-bucket sweeps.
    pub fn window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }
}

/// Snapshot of a limiter's state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LimiterStats {
    pub name: String,
    pub active_clients: usize,
    pub max_tokens: u32,
    pub refill_rate_per_second: f64,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn full(max_tokens: f64, now: Instant) -> Self {
        Self {
            tokens: max_tokens,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant, max_tokens: f64, refill_rate: f64) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * refill_rate).min(max_tokens);
        self.last_refill = now;
    }

    fn wait_for(&self, cost: f64, max_tokens: f64, refill_rate: f64) -> Option<Duration> {
        let needed = cost - self.tokens;
        if needed <= 0.0 {
            return Some(Duration::ZERO);
        }
        if refill_rate <= 0.0 || cost > max_tokens {
            return None;
        }
        Duration::try_from_secs_f64(needed / refill_rate).ok()
    }
}

/// Token-bucket rate limiter keyed by client.
///
/// Each client gets a bucket holding up to `max_tokens` that refills
/// continuously at `refill_rate` tokens per second. Refill is lazy: it is
/// computed from elapsed time whenever the bucket is touched. Refill and
/// debit happen in one critical section, so two concurrent checks can never
/// both spend the same token.
pub struct RateLimiter {
    name: String,
    max_tokens: f64,
    refill_rate: f64,
    config: LimiterConfig,
    buckets: Mutex<HashMap<String, TokenBucket>>,
}

impl RateLimiter {
    /// Create a limiter. `name` labels logs, metrics and stats.
    pub fn new(name: impl Into<String>, config: &LimiterConfig) -> Self {
        Self {
            name: name.into(),
            max_tokens: f64::from(config.max_tokens),
            refill_rate: config.refill_rate.max(0.0),
            config: config.clone(),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Purpose label given at construction.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Try to spend `cost` tokens from `client_key`'s bucket.
    ///
    /// Returns `true` and debits the bucket if enough tokens are available
    /// after refill; otherwise returns `false` and leaves the bucket as is.
    pub fn check(&self, client_key: &str, cost: u32) -> bool {
        let cost = f64::from(cost);
        let mut buckets = self.lock();
        let bucket = self.refilled(&mut buckets, client_key);

        let allowed = bucket.tokens >= cost;
        if allowed {
            bucket.tokens -= cost;
        }
        drop(buckets);

        self.record(allowed);
        allowed
    }

    /// Like [`check()`](Self::check), but returns a
    /// [`MimirError::RateLimited`] carrying the advisory wait on rejection.
    pub fn acquire(&self, client_key: &str, cost: u32) -> Result<()> {
        let cost = f64::from(cost);
        let mut buckets = self.lock();
        let bucket = self.refilled(&mut buckets, client_key);

        if bucket.tokens >= cost {
            bucket.tokens -= cost;
            drop(buckets);
            self.record(true);
            return Ok(());
        }

        let retry_after = bucket.wait_for(cost, self.max_tokens, self.refill_rate);
        drop(buckets);

        self.record(false);
        warn!(limiter = %self.name, client = client_key, ?retry_after, "rate limit exceeded");
        Err(MimirError::RateLimited { retry_after })
    }

    /// How long until `cost` tokens would be available, assuming no other
    /// consumption in the meantime.
    ///
    /// Advisory only: nothing is reserved, so a concurrent request may take
    /// the refilled token first. Returns `None` when the request can never
    /// succeed (no refill, or `cost` above the bucket capacity).
    pub fn retry_after(&self, client_key: &str, cost: u32) -> Option<Duration> {
        let mut buckets = self.lock();
        let bucket = self.refilled(&mut buckets, client_key);
        bucket.wait_for(f64::from(cost), self.max_tokens, self.refill_rate)
    }

    /// Whole tokens currently available to `client_key`.
    pub fn remaining(&self, client_key: &str) -> u64 {
        let mut buckets = self.lock();
        let bucket = self.refilled(&mut buckets, client_key);
        bucket.tokens.floor() as u64
    }

    /// Drop buckets untouched for longer than ten windows.
    ///
    /// Bounds memory for a changing client population. Returns the number
    /// of buckets removed.
    pub fn cleanup(&self) -> usize {
        let stale_after = self.config.window.saturating_mul(STALE_WINDOWS);
        let now = Instant::now();
        let mut buckets = self.lock();
        let before = buckets.len();
        buckets.retain(|_, bucket| now.saturating_duration_since(bucket.last_refill) <= stale_after);
        let removed = before - buckets.len();

        if removed > 0 {
            debug!(limiter = %self.name, removed, "stale buckets swept");
        }
        removed
    }

    /// Snapshot of the limiter's configuration and client count.
    pub fn stats(&self) -> LimiterStats {
        LimiterStats {
            name: self.name.clone(),
            active_clients: self.lock().len(),
            max_tokens: self.config.max_tokens,
            refill_rate_per_second: self.refill_rate,
        }
    }

    fn refilled<'a>(
        &self,
        buckets: &'a mut HashMap<String, TokenBucket>,
        client_key: &str,
    ) -> &'a mut TokenBucket {
        let now = Instant::now();
        let bucket = buckets
            .entry(client_key.to_owned())
            .or_insert_with(|| TokenBucket::full(self.max_tokens, now));
        bucket.refill(now, self.max_tokens, self.refill_rate);
        bucket
    }

    fn record(&self, allowed: bool) {
        let name = if allowed {
            telemetry::RATE_LIMIT_ALLOWED_TOTAL
        } else {
            telemetry::RATE_LIMIT_REJECTED_TOTAL
        };
        metrics::counter!(name, "limiter" => self.name.clone()).increment(1);
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, TokenBucket>> {
        self.buckets.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
