//! Service-specific error types

use thiserror::Error;

/// Station errors for work intake and artifact handling.
#[derive(Error, Debug)]
pub enum Error {
    #[error("malformed work item at {file}:{line}: {message}")]
    MalformedWorkItem {
        file: String,
        line: usize,
        message: String,
    },

    #[error("malformed artifact line in {file}: {message}")]
    MalformedArtifact { file: String, message: String },

    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Store(#[from] batch_store::Error),

    #[error(transparent)]
    Writer(#[from] batch_writer::Error),

    #[error(transparent)]
    Pool(#[from] credential_pool::Error),
}

impl Error {
    pub fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        Error::Io {
            path: path.display().to_string(),
            source,
        }
    }

    /// Whether the credential pool is gone.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Pool(credential_pool::Error::PoolExhausted(_)))
    }
}

impl From<Error> for batch_orchestrator::Error {
    fn from(err: Error) -> Self {
        batch_orchestrator::Error::Handler(err.to_string())
    }
}

/// Result alias using service Error
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages_are_descriptive() {
        let err = Error::MalformedWorkItem {
            file: "inbox/a.jsonl".into(),
            line: 3,
            message: "missing field `text`".into(),
        };
        assert_eq!(
            err.to_string(),
            "malformed work item at inbox/a.jsonl:3: missing field `text`"
        );

        let err = Error::io(
            std::path::Path::new("finished/x.jsonl"),
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert!(err.to_string().contains("finished/x.jsonl"), "{err}");
    }

    #[test]
    fn converts_into_handler_error() {
        let err: batch_orchestrator::Error = Error::MalformedArtifact {
            file: "b_output.jsonl".into(),
            message: "expected value".into(),
        }
        .into();
        assert!(matches!(err, batch_orchestrator::Error::Handler(m) if m.contains("b_output.jsonl")));
    }
}
