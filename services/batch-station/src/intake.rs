//! Work intake from an inbox directory
//!
//! Each `*.jsonl` file in the inbox holds one work item per line:
//! `{"unit_id": "...", "text": "..."}`. An item's text is chunked by
//! estimated tokens, and every chunk becomes one upstream call with the
//! correlation id `{unit_id}:{chunk}`.
//!
//! In batch mode the calls are stored as pending lines of a work unit. In
//! direct mode they go through the dispatcher right away and the answers
//! are written to `{unit_id}.direct.jsonl` in the results directory.
//! Processed files are renamed to `.done`, unreadable ones to `.rejected`.
//! A unit id that is already stored is skipped; its lines are never
//! overwritten.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use batch_store::{BatchStore, LineRecord};
use batch_writer::BatchLine;
use credential_pool::Dispatcher;
use serde::Deserialize;
use tracing::{debug, error, info, warn};
use upstream::{CompletionRequest, chunk_by_tokens, chunk_with_overlap};

use crate::config::{IntakeConfig, IntakeMode};
use crate::error::{Error, Result};
use crate::metrics;

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct WorkItem {
    pub unit_id: String,
    pub text: String,
}

/// Read every work item in `path`. Blank lines are skipped.
pub async fn read_work_file(path: &Path) -> Result<Vec<WorkItem>> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| Error::io(path, e))?;
    contents
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| {
            serde_json::from_str(line).map_err(|e| Error::MalformedWorkItem {
                file: path.display().to_string(),
                line: index + 1,
                message: e.to_string(),
            })
        })
        .collect()
}

pub struct Intake {
    config: IntakeConfig,
    store: Arc<dyn BatchStore>,
    dispatcher: Arc<Dispatcher>,
    results_dir: PathBuf,
}

impl Intake {
    pub fn new(
        config: IntakeConfig,
        store: Arc<dyn BatchStore>,
        dispatcher: Arc<Dispatcher>,
        results_dir: PathBuf,
    ) -> Self {
        Self {
            config,
            store,
            dispatcher,
            results_dir,
        }
    }

    /// The calls for one work item, keyed by correlation id.
    pub fn requests_for(&self, item: &WorkItem) -> Vec<(String, CompletionRequest)> {
        let chunks = if self.config.overlap_ratio > 0.0 {
            chunk_with_overlap(
                &item.text,
                self.config.max_chunk_tokens,
                self.config.overlap_ratio,
            )
        } else {
            chunk_by_tokens(&item.text, self.config.max_chunk_tokens)
        };
        chunks
            .into_iter()
            .filter(|chunk| !chunk.trim().is_empty())
            .enumerate()
            .map(|(index, payload)| {
                let request = CompletionRequest {
                    model: self.config.model.clone(),
                    instructions: self.config.instructions.clone(),
                    payload,
                    max_response_tokens: self.config.max_response_tokens,
                    temperature: self.config.temperature,
                };
                (format!("{}:{index}", item.unit_id), request)
            })
            .collect()
    }

    /// Process every work file currently in the inbox. Returns the number
    /// of work items taken in.
    ///
    /// Only pool exhaustion is returned as an error; problems with a single
    /// file are logged and the file is set aside.
    pub async fn scan_once(&self) -> Result<usize> {
        let files = match self.inbox_files().await {
            Ok(files) => files,
            Err(e) => {
                warn!(error = %e, "could not list inbox");
                return Ok(0);
            }
        };

        let mut taken = 0;
        for path in files {
            match self.process_file(&path).await {
                Ok(items) => {
                    taken += items;
                    set_aside(&path, "done").await;
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    error!(file = %path.display(), error = %e, "work file rejected");
                    set_aside(&path, "rejected").await;
                }
            }
        }
        Ok(taken)
    }

    async fn inbox_files(&self) -> Result<Vec<PathBuf>> {
        let dir = &self.config.inbox_dir;
        let mut entries = tokio::fs::read_dir(dir)
            .await
            .map_err(|e| Error::io(dir, e))?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| Error::io(dir, e))? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "jsonl") {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    async fn process_file(&self, path: &Path) -> Result<usize> {
        let items = read_work_file(path).await?;
        let mut taken = 0;
        for item in &items {
            match self.config.mode {
                IntakeMode::Batch => {
                    if self.enqueue(item).await? {
                        taken += 1;
                    }
                }
                IntakeMode::Direct => {
                    self.dispatch(item).await?;
                    taken += 1;
                }
            }
        }
        info!(file = %path.display(), items = items.len(), taken, "work file taken in");
        Ok(taken)
    }

    /// Store an item's calls as pending lines of one work unit. Returns
    /// false when the unit was already stored.
    pub async fn enqueue(&self, item: &WorkItem) -> Result<bool> {
        let requests = self.requests_for(item);
        let mut declared = Vec::with_capacity(requests.len());
        let mut records = Vec::with_capacity(requests.len());
        for (correlation_id, request) in &requests {
            let line = BatchLine::chat(correlation_id.as_str(), request)?;
            declared.push(correlation_id.clone());
            records.push(LineRecord::new(
                line.correlation_id,
                item.unit_id.as_str(),
                line.tokens,
                line.body,
            ));
        }
        if !self
            .store
            .enqueue_unit(&item.unit_id, declared, records)
            .await?
        {
            warn!(unit = %item.unit_id, "duplicate unit id skipped");
            return Ok(false);
        }
        metrics::record_intake_unit("batch");
        debug!(unit = %item.unit_id, lines = requests.len(), "unit enqueued");
        Ok(true)
    }

    /// Run an item's calls now and write the answers to the results dir.
    ///
    /// A failed call is written as an error entry; pool exhaustion stops
    /// the item.
    pub async fn dispatch(&self, item: &WorkItem) -> Result<()> {
        let mut out = String::new();
        for (correlation_id, request) in self.requests_for(item) {
            let entry = match self.dispatcher.dispatch(&request).await {
                Ok(completion) => serde_json::json!({
                    "custom_id": correlation_id,
                    "content": completion.content,
                    "usage": completion.usage,
                }),
                Err(e @ credential_pool::Error::PoolExhausted(_)) => return Err(e.into()),
                Err(e) => {
                    warn!(correlation_id = %correlation_id, kind = e.kind(), error = %e, "direct call failed");
                    serde_json::json!({
                        "custom_id": correlation_id,
                        "error": e.to_string(),
                    })
                }
            };
            out.push_str(&entry.to_string());
            out.push('\n');
        }

        tokio::fs::create_dir_all(&self.results_dir)
            .await
            .map_err(|e| Error::io(&self.results_dir, e))?;
        let path = self
            .results_dir
            .join(format!("{}.direct.jsonl", file_stem(&item.unit_id)));
        tokio::fs::write(&path, out)
            .await
            .map_err(|e| Error::io(&path, e))?;
        metrics::record_intake_unit("direct");
        Ok(())
    }
}

/// Unit ids as safe file name stems.
fn file_stem(unit_id: &str) -> String {
    unit_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

async fn set_aside(path: &Path, suffix: &str) {
    let target = path.with_extension(format!("jsonl.{suffix}"));
    if let Err(e) = tokio::fs::rename(path, &target).await {
        error!(file = %path.display(), error = %e, "could not move work file out of the inbox");
    }
}
