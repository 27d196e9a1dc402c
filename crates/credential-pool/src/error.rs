//! Error types for pool operations

use std::time::Duration;

/// Errors from pool and dispatch operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No eligible slot could be locked before the acquire timeout.
    #[error("no credential available within {0:?}")]
    AcquireTimeout(Duration),

    /// The slot's quota is gone; it has been removed from the pool.
    #[error("credential {label} quota exhausted: {message}")]
    QuotaExhausted { label: String, message: String },

    /// The slot is cooling down; the caller should retry with another slot.
    #[error("credential {label} rate limited, cooling down for {cooldown:?}")]
    RateLimited { label: String, cooldown: Duration },

    /// Every slot has been permanently removed.
    #[error("pool exhausted: {0}")]
    PoolExhausted(String),

    #[error("credential not found: {0}")]
    NotFound(String),

    /// The lease's lock expired and may now belong to another holder.
    #[error("lock on credential {0} was lost")]
    LockLost(String),

    #[error("coordination service error: {0}")]
    Coordinator(String),

    #[error(transparent)]
    Upstream(#[from] upstream::Error),
}

impl Error {
    /// Metric/log label for the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::AcquireTimeout(_) => "acquire_timeout",
            Error::QuotaExhausted { .. } => "quota_exhausted",
            Error::RateLimited { .. } => "rate_limited",
            Error::PoolExhausted(_) => "pool_exhausted",
            Error::NotFound(_) => "not_found",
            Error::LockLost(_) => "lock_lost",
            Error::Coordinator(_) => "coordinator",
            Error::Upstream(e) => e.kind(),
        }
    }
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
