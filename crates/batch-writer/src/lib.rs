//! Bin-packing writer for batch input files
//!
//! Work units (a caller's task plus all of its serialized upstream calls)
//! stream in from concurrent producers and are packed into a bounded
//! sequence of JSONL files. Every file stays within its line, token, and
//! byte ceilings, and a unit's lines always land in one file.
//!
//! Reaching the optional file-count ceiling is reported as
//! `AppendOutcome::CapacityReached`, a normal stop signal rather than an
//! error, so producers can end iteration cleanly.

pub mod error;
pub mod file;
pub mod line;
pub mod run;
pub mod writer;

pub use error::{Error, Result};
pub use file::{BatchFile, FileLimits, SealedFile};
pub use line::{BatchLine, WorkUnit};
pub use run::{Orphan, Rejected, Run};
pub use writer::{AppendOutcome, BatchFileWriter};
