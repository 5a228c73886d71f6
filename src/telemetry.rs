//! Telemetry metric name constants.
//!
//! Centralised metric names for mimir's admission and caching layers.
//! Consumers install their own `metrics` recorder (e.g. prometheus,
//! statsd); without a recorder installed, all metric calls are no-ops.
//!
//! # Metric naming conventions
//!
//! All metrics are prefixed with `mimir_`. Counters end in `_total`,
//! histograms use meaningful units (e.g. `_seconds`).
//!
//! # Common labels
//!
//! - `cache`: cache purpose (e.g. "search", "response")
//! - `limiter`: limiter purpose (e.g. "chat", "upload", "general")
//! - `status`: outcome: "ok" or "error"

/// Total cache hits.
///
/// Labels: `cache`.
pub const CACHE_HITS_TOTAL: &str = "mimir_cache_hits_total";

/// Total cache misses, including lookups that found an expired entry.
///
/// Labels: `cache`.
pub const CACHE_MISSES_TOTAL: &str = "mimir_cache_misses_total";

/// Total entries evicted to make room for an insert.
///
/// Labels: `cache`.
pub const CACHE_EVICTIONS_TOTAL: &str = "mimir_cache_evictions_total";

/// Total admission checks that were allowed.
///
/// Labels: `limiter`.
pub const RATE_LIMIT_ALLOWED_TOTAL: &str = "mimir_rate_limit_allowed_total";

/// Total admission checks that were rejected.
///
/// Labels: `limiter`.
pub const RATE_LIMIT_REJECTED_TOTAL: &str = "mimir_rate_limit_rejected_total";

/// Total tasks accepted into the inference queue.
pub const QUEUE_SUBMITTED_TOTAL: &str = "mimir_queue_submitted_total";

/// Total tasks rejected because the inference queue was full.
pub const QUEUE_REJECTED_TOTAL: &str = "mimir_queue_rejected_total";

/// Total tasks executed by a worker.
///
/// Labels: `status` ("ok" | "error").
pub const QUEUE_COMPLETED_TOTAL: &str = "mimir_queue_completed_total";

/// Time a task spent waiting in the queue before a worker picked it up.
pub const QUEUE_WAIT_SECONDS: &str = "mimir_queue_wait_seconds";

/// Time a worker spent executing a task.
pub const QUEUE_RUN_SECONDS: &str = "mimir_queue_run_seconds";

/// Number of tasks currently waiting in the queue.
pub const QUEUE_DEPTH: &str = "mimir_queue_depth";
