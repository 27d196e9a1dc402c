//! Local batch store
//!
//! Keeps all records in memory behind a tokio Mutex and, when opened with a
//! path, mirrors the whole state to a JSON file after every mutation. Writes
//! use temp-file + rename so a crash mid-write never leaves a torn file.
//! A mutation is applied to a copy of the state and only becomes visible
//! once that copy is on disk, so a failed write leaves memory unchanged.
//!
//! Suitable for one station process; deployments sharing a store across
//! processes implement `BatchStore` over a database instead.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use common::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::records::{BatchRecord, LineRecord, MatchReport, ResponseRecord, UnitLines};
use crate::BatchStore;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct State {
    #[serde(default)]
    batches: BTreeMap<String, BatchRecord>,
    /// unit id → declared correlation ids
    #[serde(default)]
    units: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    lines: BTreeMap<String, LineRecord>,
    /// credential label → outstanding batch id
    #[serde(default)]
    outstanding: BTreeMap<String, String>,
}

pub struct LocalStore {
    path: Option<PathBuf>,
    state: Mutex<State>,
}

impl LocalStore {
    /// Store with no backing file.
    pub fn memory() -> Self {
        Self {
            path: None,
            state: Mutex::new(State::default()),
        }
    }

    /// Load state from `path`, creating an empty file on cold start.
    pub async fn load(path: PathBuf) -> Result<Self> {
        let state = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Io(format!("reading store file: {e}")))?;
            let state: State = serde_json::from_str(&contents)
                .map_err(|e| Error::Parse(format!("parsing store file: {e}")))?;
            info!(
                path = %path.display(),
                batches = state.batches.len(),
                lines = state.lines.len(),
                "loaded batch store"
            );
            state
        } else {
            info!(path = %path.display(), "store file not found, starting empty");
            let state = State::default();
            write_atomic(&path, &state).await?;
            state
        };

        Ok(Self {
            path: Some(path),
            state: Mutex::new(state),
        })
    }

    /// Apply `change` under the lock. With a backing file the change runs
    /// on a copy that replaces the live state only after it was written.
    async fn commit<T>(&self, change: impl FnOnce(&mut State) -> Result<T>) -> Result<T> {
        let mut state = self.state.lock().await;
        let Some(path) = &self.path else {
            return change(&mut state);
        };
        let mut next = state.clone();
        let out = change(&mut next)?;
        write_atomic(path, &next).await?;
        *state = next;
        Ok(out)
    }
}

impl BatchStore for LocalStore {
    fn enqueue_unit<'a>(
        &'a self,
        unit_id: &'a str,
        declared: Vec<String>,
        lines: Vec<LineRecord>,
    ) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            self.commit(|state| {
                if state.units.contains_key(unit_id) {
                    warn!(unit_id, "unit already enqueued, ignoring");
                    return Ok(false);
                }
                if let Some(line) = lines.iter().find(|l| state.lines.contains_key(&l.correlation_id)) {
                    warn!(unit_id, correlation_id = %line.correlation_id, "correlation id already stored, ignoring unit");
                    return Ok(false);
                }
                for line in lines {
                    state.lines.insert(line.correlation_id.clone(), line);
                }
                state.units.insert(unit_id.to_string(), declared);
                debug!(unit_id, "enqueued work unit");
                Ok(true)
            })
            .await
        })
    }

    fn pending_units(&self) -> BoxFuture<'_, Result<Vec<String>>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(state
                .units
                .iter()
                .filter(|(_, ids)| {
                    ids.iter()
                        .any(|id| state.lines.get(id).is_none_or(LineRecord::is_pending))
                })
                .map(|(unit_id, _)| unit_id.clone())
                .collect())
        })
    }

    fn lines_for_unit<'a>(&'a self, unit_id: &'a str) -> BoxFuture<'a, Result<UnitLines>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            let declared = state
                .units
                .get(unit_id)
                .ok_or_else(|| Error::NotFound(format!("unit {unit_id}")))?;
            let mut unit = UnitLines {
                unit_id: unit_id.to_string(),
                ..UnitLines::default()
            };
            for id in declared {
                match state.lines.get(id) {
                    Some(line) if line.is_pending() => unit.lines.push(line.clone()),
                    Some(_) => {}
                    None => unit.missing += 1,
                }
            }
            Ok(unit)
        })
    }

    fn pair_lines<'a>(
        &'a self,
        batch_id: &'a str,
        correlation_ids: &'a [String],
    ) -> BoxFuture<'a, Result<usize>> {
        Box::pin(async move {
            let paired = self
                .commit(|state| {
                    let mut paired = 0;
                    for id in correlation_ids {
                        if let Some(line) = state.lines.get_mut(id) {
                            line.batch_id = Some(batch_id.to_string());
                            paired += 1;
                        }
                    }
                    Ok(paired)
                })
                .await?;
            debug!(batch_id, paired, "paired lines with batch");
            Ok(paired)
        })
    }

    fn record_responses(
        &self,
        responses: Vec<ResponseRecord>,
    ) -> BoxFuture<'_, Result<MatchReport>> {
        Box::pin(async move {
            self.commit(|state| {
                let mut report = MatchReport::default();
                for response in responses {
                    match state.lines.get_mut(&response.correlation_id) {
                        Some(line)
                            if line.batch_id.as_deref() == Some(response.batch_id.as_str()) =>
                        {
                            line.response = Some(response);
                            report.matched += 1;
                        }
                        _ => report.unmatched.push(response.correlation_id),
                    }
                }
                Ok(report)
            })
            .await
        })
    }

    fn reset_lines_for_batch<'a>(
        &'a self,
        batch_id: &'a str,
        unanswered_only: bool,
    ) -> BoxFuture<'a, Result<usize>> {
        Box::pin(async move {
            let reset = self
                .commit(|state| {
                    let mut reset = 0;
                    for line in state.lines.values_mut() {
                        if line.batch_id.as_deref() != Some(batch_id) {
                            continue;
                        }
                        if unanswered_only && line.response.is_some() {
                            continue;
                        }
                        line.batch_id = None;
                        line.response = None;
                        reset += 1;
                    }
                    Ok(reset)
                })
                .await?;
            debug!(batch_id, reset, unanswered_only, "reset lines for batch");
            Ok(reset)
        })
    }

    fn lines_for_batch<'a>(
        &'a self,
        batch_id: &'a str,
    ) -> BoxFuture<'a, Result<Vec<LineRecord>>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(state
                .lines
                .values()
                .filter(|l| l.batch_id.as_deref() == Some(batch_id))
                .cloned()
                .collect())
        })
    }

    fn line<'a>(&'a self, correlation_id: &'a str) -> BoxFuture<'a, Result<Option<LineRecord>>> {
        Box::pin(async move { Ok(self.state.lock().await.lines.get(correlation_id).cloned()) })
    }

    fn get_batch<'a>(&'a self, batch_id: &'a str) -> BoxFuture<'a, Result<Option<BatchRecord>>> {
        Box::pin(async move { Ok(self.state.lock().await.batches.get(batch_id).cloned()) })
    }

    fn find_batch_by_file_name<'a>(
        &'a self,
        file_name: &'a str,
    ) -> BoxFuture<'a, Result<Option<BatchRecord>>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(state
                .batches
                .values()
                .filter(|b| b.input_file_name.as_deref() == Some(file_name))
                .max_by_key(|b| b.created_at)
                .cloned())
        })
    }

    fn upsert_batch(&self, mut record: BatchRecord) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.commit(|state| {
                if let Some(existing) = state.batches.get(&record.batch_id) {
                    record.processing_completed_at = record
                        .processing_completed_at
                        .or(existing.processing_completed_at);
                    if record.input_file_name.is_none() {
                        record.input_file_name = existing.input_file_name.clone();
                    }
                }
                state.batches.insert(record.batch_id.clone(), record);
                Ok(())
            })
            .await
        })
    }

    fn mark_processing_complete<'a>(
        &'a self,
        batch_id: &'a str,
        at: u64,
    ) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            self.commit(|state| {
                let record = state
                    .batches
                    .get_mut(batch_id)
                    .ok_or_else(|| Error::NotFound(format!("batch {batch_id}")))?;
                if record.processing_completed_at.is_some() {
                    return Ok(false);
                }
                record.processing_completed_at = Some(at);
                Ok(true)
            })
            .await
        })
    }

    fn set_outstanding<'a>(
        &'a self,
        label: &'a str,
        batch_id: &'a str,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.commit(|state| {
                state
                    .outstanding
                    .insert(label.to_string(), batch_id.to_string());
                Ok(())
            })
            .await
        })
    }

    fn outstanding<'a>(&'a self, label: &'a str) -> BoxFuture<'a, Result<Option<String>>> {
        Box::pin(async move { Ok(self.state.lock().await.outstanding.get(label).cloned()) })
    }

    fn clear_outstanding<'a>(
        &'a self,
        label: &'a str,
        batch_id: &'a str,
    ) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            self.commit(|state| {
                if state.outstanding.get(label).map(String::as_str) != Some(batch_id) {
                    return Ok(false);
                }
                state.outstanding.remove(label);
                Ok(true)
            })
            .await
        })
    }
}

/// Write the store state to a file atomically.
///
/// Writes a temporary file in the same directory, then renames it over the
/// target. Permissions are 0600 since line bodies carry caller payloads.
async fn write_atomic(path: &Path, state: &State) -> Result<()> {
    let json = serde_json::to_string_pretty(state)
        .map_err(|e| Error::Parse(format!("serializing store: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("store path has no parent directory".into()))?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "store".into());
    let tmp_path = dir.join(format!(".{file_name}.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp store file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting store file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp store file: {e}")))?;

    debug!(path = %path.display(), "persisted batch store");
    Ok(())
}
