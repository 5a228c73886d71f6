//! Mimir error types

use std::time::Duration;

/// Mimir error types
#[derive(Debug, thiserror::Error)]
pub enum MimirError {
    // Admission rejections
    #[error("inference queue full (max: {max})")]
    QueueFull { max: usize },

    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    // Queue lifecycle
    #[error("task cancelled before completion")]
    Cancelled,

    #[error("inference queue is not running")]
    NotRunning,

    #[error("task panicked: {0}")]
    TaskPanicked(String),

    // Backend/network errors
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("model not found: {0}")]
    ModelNotFound(String),

    #[error("empty response from model")]
    EmptyResponse,

    #[error("backend error: {0}")]
    Backend(String),

    #[error("retrieval error: {0}")]
    Retrieval(String),

    // Data errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    // Configuration errors
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl MimirError {
    /// Whether this is an admission rejection (queue full or rate limited).
    ///
    /// Rejections are expected under load and should be surfaced to end
    /// users as "try again shortly", never as a server fault.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::QueueFull { .. } | Self::RateLimited { .. })
    }

    /// Whether an upstream call that failed with this error is worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::RateLimited { .. } | Self::Http(_) => true,
            Self::Api { status, .. } => *status >= 500 || *status == 408,
            _ => false,
        }
    }

    /// Suggested wait before retrying, if the error carries one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            Self::QueueFull { .. } => Some(QUEUE_FULL_RETRY_AFTER),
            _ => None,
        }
    }

    /// `Retry-After` header value in whole seconds, rounded up.
    ///
    /// A rate limit that can never be satisfied (no refill) reports
    /// [`MAX_RETRY_AFTER_SECS`] rather than an unbounded wait.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after: None } => Some(MAX_RETRY_AFTER_SECS),
            _ => self
                .retry_after()
                .map(|d| d.as_secs_f64().ceil().min(MAX_RETRY_AFTER_SECS as f64) as u64),
        }
    }
}

/// Advisory wait handed back with a [`MimirError::QueueFull`] rejection.
pub const QUEUE_FULL_RETRY_AFTER: Duration = Duration::from_secs(5);

/// Cap applied to `Retry-After` values.
pub const MAX_RETRY_AFTER_SECS: u64 = 3600;

/// Result type alias for Mimir operations
pub type Result<T> = std::result::Result<T, MimirError>;
