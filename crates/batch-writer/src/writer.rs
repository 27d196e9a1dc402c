//! Constraint-based bin-packing of work units into batch files
//!
//! Producers funnel work units into one writer concurrently; a single mutex
//! serializes appends. Before each unit the writer checks whether the open
//! file could take it under all three per-file limits. If not, that file is
//! sealed and a fresh one opened, unless the file-count ceiling is reached,
//! in which case the writer closes and reports `CapacityReached` once.
//!
//! A failed write or seal also closes the writer. The file it was working
//! on is deleted, so no file on disk ever holds part of a unit.

use std::path::{Path, PathBuf};

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::file::{BatchFile, FileLimits, SealedFile};
use crate::line::WorkUnit;

/// Why an append did or did not write the unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// The unit was written to the file with this 1-based index.
    Written { file_index: usize },
    /// The file-count ceiling was hit. The unit was not written and the last
    /// file is sealed. Reported exactly once per writer.
    CapacityReached,
    /// The writer stopped earlier; the unit was not written.
    Closed,
}

struct State {
    current: Option<BatchFile>,
    sealed: Vec<SealedFile>,
    closed: bool,
}

pub struct BatchFileWriter {
    dir: PathBuf,
    stamp: u64,
    limits: FileLimits,
    state: Mutex<State>,
}

impl BatchFileWriter {
    /// Files are named `batch_{stamp}_{index:03}.jsonl` inside `dir`.
    pub fn new(dir: impl Into<PathBuf>, stamp: u64, limits: FileLimits) -> Result<Self> {
        limits.validate()?;
        Ok(Self {
            dir: dir.into(),
            stamp,
            limits,
            state: Mutex::new(State {
                current: None,
                sealed: Vec::new(),
                closed: false,
            }),
        })
    }

    pub fn limits(&self) -> &FileLimits {
        &self.limits
    }

    pub fn file_name(stamp: u64, index: usize) -> String {
        format!("batch_{stamp}_{index:03}.jsonl")
    }

    /// Pack one work unit.
    ///
    /// A unit larger than an empty file's limits is rejected with
    /// `Error::UnitTooLarge`; splitting it is the caller's job.
    pub async fn append(&self, unit: &WorkUnit) -> Result<AppendOutcome> {
        if unit.is_empty() {
            return Err(Error::EmptyUnit(unit.id.clone()));
        }
        if !self.limits.admits(unit) {
            return Err(Error::UnitTooLarge {
                unit_id: unit.id.clone(),
                lines: unit.len(),
                tokens: unit.tokens(),
                bytes: unit.bytes(),
            });
        }

        let mut state = self.state.lock().await;
        if state.closed {
            return Ok(AppendOutcome::Closed);
        }

        let needs_new_file = state
            .current
            .as_ref()
            .is_none_or(|file| !file.fits(unit, &self.limits));
        if needs_new_file {
            if let Some(full) = state.current.take() {
                let path = full.path().to_path_buf();
                match full.seal().await {
                    Ok(sealed) => state.sealed.push(sealed),
                    Err(e) => return Err(abandon(&mut state, &path, e).await),
                }
            }
            let next_index = state.sealed.len() + 1;
            if self.limits.max_files.is_some_and(|max| next_index > max) {
                state.closed = true;
                info!(files = state.sealed.len(), unit = %unit.id, "file capacity reached");
                return Ok(AppendOutcome::CapacityReached);
            }
            tokio::fs::create_dir_all(&self.dir)
                .await
                .map_err(|e| Error::Io(format!("creating {}: {e}", self.dir.display())))?;
            let file =
                BatchFile::create(&self.dir, Self::file_name(self.stamp, next_index), next_index)
                    .await?;
            debug!(index = next_index, "opened batch file");
            state.current = Some(file);
        }

        let Some(file) = state.current.as_mut() else {
            return Ok(AppendOutcome::Closed);
        };
        let file_index = file.index();
        if let Err(e) = file.write_unit(unit).await {
            let path = file.path().to_path_buf();
            state.current = None;
            return Err(abandon(&mut state, &path, e).await);
        }
        Ok(AppendOutcome::Written { file_index })
    }

    /// Seal the open file and stop accepting units. Returns every sealed file.
    /// An open file with no lines is removed instead of sealed.
    pub async fn finish(&self) -> Result<Vec<SealedFile>> {
        let mut state = self.state.lock().await;
        state.closed = true;
        if let Some(file) = state.current.take() {
            if file.is_empty() {
                file.discard().await?;
            } else {
                let path = file.path().to_path_buf();
                match file.seal().await {
                    Ok(sealed) => state.sealed.push(sealed),
                    Err(e) => return Err(abandon(&mut state, &path, e).await),
                }
            }
        }
        Ok(state.sealed.clone())
    }

    /// Files sealed so far.
    pub async fn sealed(&self) -> Vec<SealedFile> {
        self.state.lock().await.sealed.clone()
    }
}

/// Close the writer after a failed write or seal and delete the file.
async fn abandon(state: &mut State, path: &Path, error: Error) -> Error {
    state.closed = true;
    state.current = None;
    warn!(file = %path.display(), error = %error, "batch file abandoned, writer closed");
    if let Err(e) = tokio::fs::remove_file(path).await {
        warn!(file = %path.display(), error = %e, "could not remove abandoned batch file");
    }
    error
}
