//! Error types for batch orchestration

/// Errors from orchestration steps.
///
/// Poll loops log and retry everything except `is_fatal()` errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Pool(#[from] credential_pool::Error),

    #[error(transparent)]
    Upstream(#[from] upstream::Error),

    #[error(transparent)]
    Store(#[from] batch_store::Error),

    #[error(transparent)]
    Writer(#[from] batch_writer::Error),

    /// Upload gave up; the credential was put in a cooldown.
    #[error("upload of {file} failed after {attempts} attempt(s): {source}")]
    UploadFailed {
        file: String,
        attempts: u32,
        #[source]
        source: upstream::Error,
    },

    #[error("batch {0} is not in a terminal state")]
    NotTerminal(String),

    #[error("batch handler failed: {0}")]
    Handler(String),

    #[error("io error: {0}")]
    Io(String),
}

impl Error {
    /// Whether the whole pool is gone and no loop can make progress.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Pool(credential_pool::Error::PoolExhausted(_)))
    }
}

/// Result alias for orchestration.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_pool_exhaustion_is_fatal() {
        assert!(Error::Pool(credential_pool::Error::PoolExhausted("{}".into())).is_fatal());
        assert!(!Error::Pool(credential_pool::Error::NotFound("a".into())).is_fatal());
        assert!(!Error::Upstream(upstream::Error::Transient("reset".into())).is_fatal());
    }

    #[test]
    fn upload_failure_names_file_and_attempts() {
        let err = Error::UploadFailed {
            file: "batch_1_001.jsonl".into(),
            attempts: 3,
            source: upstream::Error::Transient("connection reset".into()),
        };
        let msg = err.to_string();
        assert!(msg.contains("batch_1_001.jsonl"), "{msg}");
        assert!(msg.contains("3 attempt"), "{msg}");
    }
}
