//! Terminal batch handling for the station
//!
//! Completed batches have their output and error artifacts parsed into
//! response records and stored against the lines of that batch. Lines that
//! got no response go back to pending so the next generation run packs them
//! again. Failed batches cool their credential down and return every line;
//! expired and cancelled ones return only the unanswered lines.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use batch_orchestrator::{Artifacts, BatchHandler};
use batch_store::{BatchRecord, BatchStore, LineOutcome, ResponseRecord};
use common::BoxFuture;
use credential_pool::{Lease, Pool};
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};
use upstream::Upstream;

use crate::error::{Error, Result};
use crate::metrics;

/// One line of an output or error artifact.
#[derive(Debug, Deserialize)]
struct ArtifactLine {
    custom_id: String,
    #[serde(default)]
    response: Option<ArtifactResponse>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ArtifactResponse {
    status_code: u16,
    #[serde(default)]
    body: Value,
}

impl ArtifactLine {
    fn outcome(self) -> LineOutcome {
        if let Some(error) = self.error {
            return LineOutcome::Error(error);
        }
        match self.response {
            Some(response) if response.status_code == 200 => LineOutcome::Result(response.body),
            Some(response) => LineOutcome::Error(serde_json::json!({
                "status_code": response.status_code,
                "body": response.body,
            })),
            None => LineOutcome::Error(Value::String("no response".into())),
        }
    }
}

/// Parse an artifact file into response records for `batch_id`.
pub async fn parse_artifact(path: &Path, batch_id: &str) -> Result<Vec<ResponseRecord>> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| Error::io(path, e))?;
    contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let parsed: ArtifactLine =
                serde_json::from_str(line).map_err(|e| Error::MalformedArtifact {
                    file: path.display().to_string(),
                    message: e.to_string(),
                })?;
            Ok(ResponseRecord {
                correlation_id: parsed.custom_id.clone(),
                batch_id: batch_id.to_string(),
                outcome: parsed.outcome(),
            })
        })
        .collect()
}

pub struct StationHandler {
    store: Arc<dyn BatchStore>,
    upstream: Arc<dyn Upstream>,
    pool: Arc<Pool>,
    finished_dir: PathBuf,
    failure_cooldown: Duration,
}

impl StationHandler {
    pub fn new(
        store: Arc<dyn BatchStore>,
        upstream: Arc<dyn Upstream>,
        pool: Arc<Pool>,
        finished_dir: PathBuf,
        failure_cooldown: Duration,
    ) -> Self {
        Self {
            store,
            upstream,
            pool,
            finished_dir,
            failure_cooldown,
        }
    }

    async fn completed(
        &self,
        lease: &Lease,
        batch: &BatchRecord,
        artifacts: &Artifacts,
    ) -> batch_orchestrator::Result<()> {
        let mut responses = Vec::new();
        if let Some(path) = &artifacts.output {
            responses.extend(parse_artifact(path, &batch.batch_id).await?);
        }
        if let Some(path) = &artifacts.errors {
            responses.extend(parse_artifact(path, &batch.batch_id).await?);
        }
        let errors = responses
            .iter()
            .filter(|r| matches!(r.outcome, LineOutcome::Error(_)))
            .count();
        metrics::record_responses("result", responses.len() - errors);
        metrics::record_responses("error", errors);

        let report = self.store.record_responses(responses).await?;
        for correlation_id in &report.unmatched {
            warn!(
                batch_id = %batch.batch_id,
                correlation_id = %correlation_id,
                "response has no line in this batch"
            );
        }
        metrics::record_correlation_mismatch(report.unmatched.len());

        let reset = self
            .store
            .reset_lines_for_batch(&batch.batch_id, true)
            .await?;
        metrics::record_lines_reset("unanswered", reset);

        for path in [&artifacts.output, &artifacts.errors].into_iter().flatten() {
            self.finish_artifact(path).await?;
        }
        if let Err(e) = self
            .upstream
            .delete_file(lease.secret(), &batch.input_file_id)
            .await
        {
            warn!(
                batch_id = %batch.batch_id,
                file_id = %batch.input_file_id,
                error = %e,
                "could not delete remote input file"
            );
        }

        info!(
            label = lease.label(),
            batch_id = %batch.batch_id,
            matched = report.matched,
            unmatched = report.unmatched.len(),
            reset,
            "batch results stored"
        );
        Ok(())
    }

    async fn finish_artifact(&self, path: &Path) -> Result<()> {
        tokio::fs::create_dir_all(&self.finished_dir)
            .await
            .map_err(|e| Error::io(&self.finished_dir, e))?;
        let Some(name) = path.file_name() else {
            return Ok(());
        };
        let target = self.finished_dir.join(name);
        tokio::fs::rename(path, &target)
            .await
            .map_err(|e| Error::io(path, e))
    }

    async fn reset(
        &self,
        batch: &BatchRecord,
        unanswered_only: bool,
        reason: &'static str,
    ) -> batch_orchestrator::Result<()> {
        let reset = self
            .store
            .reset_lines_for_batch(&batch.batch_id, unanswered_only)
            .await?;
        metrics::record_lines_reset(reason, reset);
        info!(batch_id = %batch.batch_id, reason, reset, "batch lines returned to pending");
        Ok(())
    }
}

impl BatchHandler for StationHandler {
    fn on_completed<'a>(
        &'a self,
        lease: &'a Lease,
        _at: u64,
        batch: &'a BatchRecord,
        artifacts: &'a Artifacts,
    ) -> BoxFuture<'a, batch_orchestrator::Result<()>> {
        Box::pin(self.completed(lease, batch, artifacts))
    }

    fn on_failed<'a>(
        &'a self,
        lease: &'a Lease,
        _at: u64,
        batch: &'a BatchRecord,
    ) -> BoxFuture<'a, batch_orchestrator::Result<()>> {
        Box::pin(async move {
            let cooldown = self
                .pool
                .set_cooldown(lease.slot(), self.failure_cooldown)
                .await?;
            warn!(
                label = lease.label(),
                batch_id = %batch.batch_id,
                cooldown_secs = cooldown.as_secs(),
                "batch failed, credential cooling down"
            );
            self.reset(batch, false, "failed").await
        })
    }

    fn on_expired<'a>(
        &'a self,
        _lease: &'a Lease,
        _at: u64,
        batch: &'a BatchRecord,
    ) -> BoxFuture<'a, batch_orchestrator::Result<()>> {
        Box::pin(self.reset(batch, true, "expired"))
    }

    fn on_cancelled<'a>(
        &'a self,
        _lease: &'a Lease,
        _at: u64,
        batch: &'a BatchRecord,
    ) -> BoxFuture<'a, batch_orchestrator::Result<()>> {
        Box::pin(self.reset(batch, true, "cancelled"))
    }
}
