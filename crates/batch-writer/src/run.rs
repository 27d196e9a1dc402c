//! One invocation of batch file generation

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::warn;

use crate::error::{Error, Result};
use crate::file::SealedFile;

/// A work unit whose declared lines could not all be found.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Orphan {
    pub unit_id: String,
    pub missing: usize,
}

/// A work unit the writer refused, e.g. one too large for any file.
/// Its lines stay pending.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rejected {
    pub unit_id: String,
    pub reason: String,
}

/// Files, orphans, and rejected units produced by one generation pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Run {
    /// Stamp the run started at; also part of every file name
    pub timestamp: u64,
    pub files: Vec<SealedFile>,
    pub orphans: Vec<Orphan>,
    pub rejected: Vec<Rejected>,
    /// Whether generation stopped on the file-count ceiling
    pub capacity_reached: bool,
}

impl Run {
    pub fn new(timestamp: u64) -> Self {
        Self {
            timestamp,
            ..Self::default()
        }
    }

    pub fn total_lines(&self) -> usize {
        self.files.iter().map(|f| f.line_count).sum()
    }

    /// Write `orphans_{timestamp}.log` into `dir`, one `unit_id<TAB>missing`
    /// per line. Returns the path, or `None` when there were no orphans.
    pub async fn write_orphan_log(&self, dir: &Path) -> Result<Option<PathBuf>> {
        if self.orphans.is_empty() {
            return Ok(None);
        }
        let path = dir.join(format!("orphans_{}.log", self.timestamp));
        let mut contents = String::new();
        for orphan in &self.orphans {
            contents.push_str(&format!("{}\t{}\n", orphan.unit_id, orphan.missing));
        }
        tokio::fs::write(&path, contents)
            .await
            .map_err(|e| Error::Io(format!("writing {}: {e}", path.display())))?;
        warn!(
            path = %path.display(),
            orphans = self.orphans.len(),
            "work units with missing lines"
        );
        Ok(Some(path))
    }

    /// Write `rejected_{timestamp}.log` into `dir`, one `unit_id<TAB>reason`
    /// per line. Returns the path, or `None` when nothing was rejected.
    pub async fn write_rejected_log(&self, dir: &Path) -> Result<Option<PathBuf>> {
        if self.rejected.is_empty() {
            return Ok(None);
        }
        let path = dir.join(format!("rejected_{}.log", self.timestamp));
        let contents: String = self
            .rejected
            .iter()
            .map(|r| format!("{}\t{}\n", r.unit_id, r.reason))
            .collect();
        tokio::fs::write(&path, contents)
            .await
            .map_err(|e| Error::Io(format!("writing {}: {e}", path.display())))?;
        warn!(
            path = %path.display(),
            rejected = self.rejected.len(),
            "work units rejected by the writer"
        );
        Ok(Some(path))
    }
}
