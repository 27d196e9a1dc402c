//! Error types for batch file writing

/// Errors from the batch writer.
///
/// Hitting the file-count ceiling is not an error; see `AppendOutcome`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    /// A work unit that cannot fit in an empty file. Callers must split
    /// such units before appending.
    #[error(
        "work unit {unit_id} exceeds per-file limits ({lines} lines, {tokens} tokens, {bytes} bytes)"
    )]
    UnitTooLarge {
        unit_id: String,
        lines: usize,
        tokens: u64,
        bytes: u64,
    },

    #[error("work unit {0} has no lines")]
    EmptyUnit(String),

    #[error("invalid limits: {0}")]
    InvalidLimits(String),
}

/// Result alias for writer operations.
pub type Result<T> = std::result::Result<T, Error>;
