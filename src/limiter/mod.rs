//! Per-client admission control.
//!
//! [`RateLimiter`] is a token bucket per client key. The
//! [`Gateway`](crate::Gateway) holds one instance per endpoint class
//! (chat, upload, general), each with its own [`LimiterConfig`].
//!
//! On rejection the HTTP layer answers 429 with a `Retry-After` derived from
//! [`RateLimiter::retry_after()`] or from the error returned by
//! [`RateLimiter::acquire()`]. The wait is advisory: no tokens are reserved.

mod bucket;
mod identity;

pub use bucket::{LimiterConfig, LimiterStats, RateLimiter};
pub use identity::{ClientIdentity, UNKNOWN_CLIENT};
