//! Open and sealed batch files

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tracing::info;

use crate::error::{Error, Result};
use crate::line::WorkUnit;

/// Per-file ceilings plus an optional ceiling on the number of files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileLimits {
    pub max_lines: usize,
    pub max_tokens: u64,
    pub max_bytes: u64,
    pub max_files: Option<usize>,
}

impl Default for FileLimits {
    fn default() -> Self {
        Self {
            max_lines: 50_000,
            max_tokens: 2_000_000,
            max_bytes: 200 * 1024 * 1024,
            max_files: None,
        }
    }
}

impl FileLimits {
    pub fn validate(&self) -> Result<()> {
        if self.max_lines == 0 || self.max_tokens == 0 || self.max_bytes == 0 {
            return Err(Error::InvalidLimits(
                "per-file limits must be non-zero".into(),
            ));
        }
        if self.max_files == Some(0) {
            return Err(Error::InvalidLimits("max_files must be at least 1".into()));
        }
        Ok(())
    }

    /// Whether `unit` fits in an empty file.
    pub fn admits(&self, unit: &WorkUnit) -> bool {
        unit.len() <= self.max_lines
            && unit.tokens() <= self.max_tokens
            && unit.bytes() <= self.max_bytes
    }
}

/// A file still accepting work units.
pub struct BatchFile {
    name: String,
    path: PathBuf,
    index: usize,
    out: tokio::fs::File,
    line_count: usize,
    token_sum: u64,
    byte_size: u64,
    units: HashSet<String>,
    correlation_ids: Vec<String>,
    seen_ids: HashSet<String>,
}

impl BatchFile {
    /// Create the file. Fails if a file with that name already exists.
    pub async fn create(dir: &Path, name: String, index: usize) -> Result<Self> {
        let path = dir.join(&name);
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(|e| Error::Io(format!("creating {}: {e}", path.display())))?;
        Ok(Self::from_file(file, name, path, index))
    }

    fn from_file(out: tokio::fs::File, name: String, path: PathBuf, index: usize) -> Self {
        Self {
            name,
            path,
            index,
            out,
            line_count: 0,
            token_sum: 0,
            byte_size: 0,
            units: HashSet::new(),
            correlation_ids: Vec::new(),
            seen_ids: HashSet::new(),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_empty(&self) -> bool {
        self.line_count == 0
    }

    /// Whether adding `unit` keeps every per-file aggregate within `limits`.
    pub fn fits(&self, unit: &WorkUnit, limits: &FileLimits) -> bool {
        self.line_count + unit.len() <= limits.max_lines
            && self.token_sum + unit.tokens() <= limits.max_tokens
            && self.byte_size + unit.bytes() <= limits.max_bytes
    }

    /// Write every line of `unit` in one write.
    ///
    /// Aggregates only change once the whole unit is on disk. After an
    /// error the file may hold part of the unit and must be abandoned.
    pub async fn write_unit(&mut self, unit: &WorkUnit) -> Result<()> {
        let mut buf = Vec::with_capacity(unit.bytes() as usize);
        for line in &unit.lines {
            buf.extend_from_slice(line.body.as_bytes());
            buf.push(b'\n');
        }
        self.out
            .write_all(&buf)
            .await
            .map_err(|e| Error::Io(format!("writing {}: {e}", self.name)))?;
        self.out
            .flush()
            .await
            .map_err(|e| Error::Io(format!("writing {}: {e}", self.name)))?;

        for line in &unit.lines {
            self.line_count += 1;
            self.token_sum += line.tokens;
            self.byte_size += line.size();
            if self.seen_ids.insert(line.correlation_id.clone()) {
                self.correlation_ids.push(line.correlation_id.clone());
            }
        }
        self.units.insert(unit.id.clone());
        Ok(())
    }

    /// Flush and freeze the file's aggregates.
    pub async fn seal(mut self) -> Result<SealedFile> {
        self.out
            .flush()
            .await
            .map_err(|e| Error::Io(format!("flushing {}: {e}", self.name)))?;
        self.out
            .sync_all()
            .await
            .map_err(|e| Error::Io(format!("syncing {}: {e}", self.name)))?;

        let sealed = SealedFile {
            name: self.name,
            path: self.path,
            index: self.index,
            unique_units: self.units.len(),
            unique_lines: self.correlation_ids.len(),
            line_count: self.line_count,
            token_sum: self.token_sum,
            byte_size: self.byte_size,
            correlation_ids: self.correlation_ids,
        };
        info!(
            file = %sealed.name,
            index = sealed.index,
            units = sealed.unique_units,
            lines = sealed.line_count,
            tokens = sealed.token_sum,
            bytes = sealed.byte_size,
            "batch file sealed"
        );
        metrics::counter!("writer_files_sealed_total").increment(1);
        Ok(sealed)
    }

    /// Drop an empty file without sealing it.
    pub async fn discard(self) -> Result<()> {
        drop(self.out);
        tokio::fs::remove_file(&self.path)
            .await
            .map_err(|e| Error::Io(format!("removing {}: {e}", self.path.display())))
    }
}

/// An immutable, fully written batch file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SealedFile {
    pub name: String,
    pub path: PathBuf,
    /// 1-based position within its run
    pub index: usize,
    pub unique_units: usize,
    pub unique_lines: usize,
    pub line_count: usize,
    pub token_sum: u64,
    pub byte_size: u64,
    /// Distinct correlation ids, in write order
    #[serde(skip)]
    pub correlation_ids: Vec<String>,
}

impl SealedFile {
    pub async fn read(&self) -> Result<Vec<u8>> {
        tokio::fs::read(&self.path)
            .await
            .map_err(|e| Error::Io(format!("reading {}: {e}", self.path.display())))
    }
}
