//! Structured upstream errors
//!
//! Adapters turn provider failures into one of these variants; nothing
//! downstream inspects provider error text.

use std::time::Duration;

/// Errors from upstream calls.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// The credential's quota is used up; it should leave the pool.
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Short-term rate limit; `retry_after` is the provider's hint, if any.
    #[error("rate limited: {message}")]
    RateLimited {
        retry_after: Option<Duration>,
        message: String,
    },

    /// Connectivity failures, timeouts, and 5xx responses.
    #[error("upstream transient failure: {0}")]
    Transient(String),

    /// Non-retryable API errors.
    #[error("upstream returned {status}: {message}")]
    Permanent { status: u16, message: String },

    /// Response could not be decoded or exceeded the size cap.
    #[error("invalid upstream response: {0}")]
    InvalidResponse(String),
}

impl Error {
    /// Whether the call may be retried on the same credential.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_))
    }

    /// Label for logging and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::QuotaExceeded(_) => "quota_exceeded",
            Error::RateLimited { .. } => "rate_limited",
            Error::Transient(_) => "transient",
            Error::Permanent { .. } => "permanent",
            Error::InvalidResponse(_) => "invalid_response",
        }
    }
}

/// Result alias for upstream calls.
pub type Result<T> = std::result::Result<T, Error>;
