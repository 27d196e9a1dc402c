//! Batch lifecycle orchestration
//!
//! Drives sealed batch files through the upstream's asynchronous batch API
//! under pooled credentials: upload with retries, periodic polling, and
//! exactly-once dispatch of terminal outcomes to a caller-supplied
//! `BatchHandler`. `generate_run` turns stored pending lines into the sealed
//! files the loops upload.

pub mod error;
pub mod generate;
pub mod handler;
pub mod orchestrator;
pub mod poll;
pub mod source;

#[cfg(test)]
mod testing;

pub use error::{Error, Result};
pub use generate::generate_run;
pub use handler::{Artifacts, BatchHandler};
pub use orchestrator::{
    CycleOutcome, FILE_NAME_METADATA, Orchestrator, OrchestratorSettings, TerminalOutcome,
};
pub use poll::spawn_poll_loops;
pub use source::{FileSource, QueueSource};
