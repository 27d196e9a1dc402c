//! Batch lifecycle: upload, poll, terminal dispatch
//!
//! Each credential has at most one outstanding batch, tracked by the store's
//! outstanding marker. A cycle for one credential either advances that batch
//! (poll, and on a terminal status dispatch it to the handler) or, when
//! nothing is outstanding, uploads the next sealed file.
//!
//! The credential's lock is held only for one cycle, never for the lifetime
//! of the remote batch, so the synchronous dispatch path can keep using the
//! credential while a batch is in flight.
//!
//! Terminal dispatch is idempotent: the store's processing marker is checked
//! before any callback runs and set after it succeeds, so a duplicate poll
//! (or a restart) never fires a callback twice.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use batch_store::{BatchRecord, BatchStore};
use batch_writer::SealedFile;
use credential_pool::{Lease, Pool};
use tracing::{debug, error, info, warn};
use upstream::{BatchStatus, RemoteBatch, Upstream};

use crate::error::{Error, Result};
use crate::handler::{Artifacts, BatchHandler};
use crate::source::FileSource;

/// Metadata key carrying the input file name on remote batches.
pub const FILE_NAME_METADATA: &str = "file_name";

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Upload attempts on transient failures
    pub upload_attempts: u32,
    /// Delay before the second attempt; doubles after each
    pub upload_backoff: Duration,
    /// Cooldown after upload retries ran out
    pub transient_cooldown: Duration,
    /// Cooldown after a non-retryable upload or creation error
    pub failure_cooldown: Duration,
    /// How long a cycle waits for its credential's lock
    pub lock_timeout: Duration,
    pub poll_interval: Duration,
    /// Where output and error artifacts are downloaded
    pub download_dir: PathBuf,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            upload_attempts: 3,
            upload_backoff: Duration::from_secs(5),
            transient_cooldown: Duration::from_secs(10 * 60),
            failure_cooldown: Duration::from_secs(5 * 60),
            lock_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(60),
            download_dir: PathBuf::from("downloads"),
        }
    }
}

/// Result of dispatching a terminal batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalOutcome {
    Dispatched(BatchStatus),
    /// The processing marker was already set; no callback fired
    AlreadyProcessed,
}

/// What one credential cycle did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Nothing outstanding and no file to upload
    Idle,
    /// The credential's lock was not available in time
    Busy,
    Submitted { batch_id: String },
    InProgress { batch_id: String, status: BatchStatus },
    Terminal { batch_id: String, outcome: TerminalOutcome },
}

pub struct Orchestrator {
    pool: Arc<Pool>,
    upstream: Arc<dyn Upstream>,
    store: Arc<dyn BatchStore>,
    handler: Arc<dyn BatchHandler>,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn new(
        pool: Arc<Pool>,
        upstream: Arc<dyn Upstream>,
        store: Arc<dyn BatchStore>,
        handler: Arc<dyn BatchHandler>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            pool,
            upstream,
            store,
            handler,
            settings,
        }
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    /// Upload a sealed file and create its remote batch.
    ///
    /// A file already uploaded under its name returns the existing record.
    /// Transient upload failures are retried with doubling backoff; when
    /// attempts run out, or on any other upload or creation error, the
    /// credential cools down and the error is returned so the caller can
    /// resubmit the file later. Quota errors exhaust the credential.
    pub async fn upload(&self, lease: &Lease, file: &SealedFile) -> Result<BatchRecord> {
        if let Some(existing) = self.store.find_batch_by_file_name(&file.name).await? {
            info!(
                file = %file.name,
                batch_id = %existing.batch_id,
                "file already uploaded, reusing batch"
            );
            return Ok(existing);
        }

        let contents = file.read().await?;
        let input_file_id = match self.upload_with_retries(lease, file, contents).await {
            Ok(id) => id,
            Err(e) => {
                metrics::counter!("orchestrator_uploads_total", "outcome" => "failed")
                    .increment(1);
                return Err(e);
            }
        };

        let mut metadata = BTreeMap::new();
        metadata.insert(FILE_NAME_METADATA.to_string(), file.name.clone());
        lease.extend().await?;
        let remote = match self
            .upstream
            .create_batch(lease.secret(), &input_file_id, &metadata)
            .await
        {
            Ok(remote) => remote,
            Err(e) => {
                metrics::counter!("orchestrator_uploads_total", "outcome" => "failed")
                    .increment(1);
                self.penalize(lease, &e).await?;
                return Err(e.into());
            }
        };

        let record = BatchRecord::from_remote(lease.label(), Some(file.name.clone()), &remote);
        self.store.upsert_batch(record.clone()).await?;
        let paired = self
            .store
            .pair_lines(&record.batch_id, &file.correlation_ids)
            .await?;
        self.store
            .set_outstanding(lease.label(), &record.batch_id)
            .await?;

        metrics::counter!("orchestrator_uploads_total", "outcome" => "created").increment(1);
        info!(
            label = lease.label(),
            batch_id = %record.batch_id,
            file = %file.name,
            lines = file.line_count,
            paired,
            "remote batch created"
        );
        Ok(record)
    }

    async fn upload_with_retries(
        &self,
        lease: &Lease,
        file: &SealedFile,
        contents: Vec<u8>,
    ) -> Result<String> {
        let attempts = self.settings.upload_attempts.max(1);
        let mut delay = self.settings.upload_backoff;
        let mut attempt = 0;

        loop {
            attempt += 1;
            lease.extend().await?;
            match self
                .upstream
                .upload_file(lease.secret(), &file.name, contents.clone())
                .await
            {
                Ok(id) => return Ok(id),
                Err(e) if e.is_transient() && attempt < attempts => {
                    warn!(
                        label = lease.label(),
                        file = %file.name,
                        attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "upload failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                }
                Err(e) => {
                    error!(label = lease.label(), file = %file.name, attempt, error = %e, "upload failed");
                    self.penalize(lease, &e).await?;
                    return Err(Error::UploadFailed {
                        file: file.name.clone(),
                        attempts: attempt,
                        source: e,
                    });
                }
            }
        }
    }

    /// Apply the credential consequence of a failed upload-side call.
    async fn penalize(&self, lease: &Lease, err: &upstream::Error) -> Result<()> {
        match err {
            upstream::Error::QuotaExceeded(message) => {
                self.pool.mark_exhausted(lease.slot(), message).await?;
            }
            upstream::Error::RateLimited { retry_after, .. } => {
                let cooldown = retry_after.unwrap_or(self.settings.failure_cooldown);
                self.pool.set_cooldown(lease.slot(), cooldown).await?;
            }
            e if e.is_transient() => {
                self.pool
                    .set_cooldown(lease.slot(), self.settings.transient_cooldown)
                    .await?;
            }
            _ => {
                self.pool
                    .set_cooldown(lease.slot(), self.settings.failure_cooldown)
                    .await?;
            }
        }
        Ok(())
    }

    /// The credential's outstanding batch, adopting one from the upstream
    /// when there is no local marker.
    ///
    /// A remote batch without a local record gets one inserted on demand.
    /// Batches that are already processed are not adopted.
    pub async fn outstanding(&self, lease: &Lease) -> Result<Option<String>> {
        if let Some(batch_id) = self.store.outstanding(lease.label()).await? {
            return Ok(Some(batch_id));
        }

        let Some(remote) = self.upstream.latest_batch(lease.secret()).await? else {
            return Ok(None);
        };
        let record = match self.store.get_batch(&remote.id).await? {
            Some(record) if record.is_processed() => return Ok(None),
            Some(mut record) => {
                record.apply(&remote);
                record
            }
            None => self.record_from_remote(lease, &remote),
        };
        self.store.upsert_batch(record).await?;
        self.store.set_outstanding(lease.label(), &remote.id).await?;
        info!(
            label = lease.label(),
            batch_id = %remote.id,
            status = remote.status.label(),
            "adopted remote batch"
        );
        Ok(Some(remote.id))
    }

    fn record_from_remote(&self, lease: &Lease, remote: &RemoteBatch) -> BatchRecord {
        let file_name = remote
            .metadata
            .as_ref()
            .and_then(|m| m.get(FILE_NAME_METADATA))
            .cloned();
        warn!(
            label = lease.label(),
            batch_id = %remote.id,
            "remote batch has no local record, inserting one"
        );
        BatchRecord::from_remote(lease.label(), file_name, remote)
    }

    /// Refresh a batch from the upstream and dispatch it if terminal.
    pub async fn poll(&self, lease: &Lease, batch_id: &str) -> Result<CycleOutcome> {
        lease.extend().await?;
        let remote = self.upstream.retrieve_batch(lease.secret(), batch_id).await?;
        let record = match self.store.get_batch(batch_id).await? {
            Some(mut record) => {
                if record.status != remote.status {
                    info!(
                        label = lease.label(),
                        batch_id,
                        from = record.status.label(),
                        to = remote.status.label(),
                        "batch status changed"
                    );
                }
                record.apply(&remote);
                record
            }
            None => self.record_from_remote(lease, &remote),
        };
        self.store.upsert_batch(record.clone()).await?;

        if !record.status.is_terminal() {
            debug!(label = lease.label(), batch_id, status = record.status.label(), "batch in progress");
            return Ok(CycleOutcome::InProgress {
                batch_id: batch_id.to_string(),
                status: record.status,
            });
        }
        let outcome = self.handle_terminal(lease, &record).await?;
        Ok(CycleOutcome::Terminal {
            batch_id: batch_id.to_string(),
            outcome,
        })
    }

    /// Dispatch a terminal batch to exactly one handler callback.
    ///
    /// Skips (and frees the credential's outstanding marker) when the batch
    /// was processed before. Otherwise downloads artifacts for completed
    /// batches, runs the callback, then sets the processing marker.
    pub async fn handle_terminal(
        &self,
        lease: &Lease,
        batch: &BatchRecord,
    ) -> Result<TerminalOutcome> {
        let batch_id = batch.batch_id.as_str();
        if !batch.status.is_terminal() {
            return Err(Error::NotTerminal(batch_id.to_string()));
        }

        let processed = match self.store.get_batch(batch_id).await? {
            Some(stored) => stored.is_processed(),
            None => {
                self.store.upsert_batch(batch.clone()).await?;
                false
            }
        };
        if processed {
            self.store.clear_outstanding(lease.label(), batch_id).await?;
            info!(label = lease.label(), batch_id, "batch already processed, skipping");
            return Ok(TerminalOutcome::AlreadyProcessed);
        }

        let at = common::unix_secs();
        lease.extend().await?;
        match batch.status {
            BatchStatus::Completed => {
                let artifacts = self.download_artifacts(lease, batch).await?;
                lease.extend().await?;
                self.handler
                    .on_completed(lease, at, batch, &artifacts)
                    .await?;
            }
            BatchStatus::Failed => self.handler.on_failed(lease, at, batch).await?,
            BatchStatus::Expired => self.handler.on_expired(lease, at, batch).await?,
            BatchStatus::Cancelled => self.handler.on_cancelled(lease, at, batch).await?,
            _ => return Err(Error::NotTerminal(batch_id.to_string())),
        }

        self.store.mark_processing_complete(batch_id, at).await?;
        self.store.clear_outstanding(lease.label(), batch_id).await?;
        metrics::counter!("orchestrator_terminal_total", "status" => batch.status.label())
            .increment(1);
        info!(
            label = lease.label(),
            batch_id,
            status = batch.status.label(),
            "terminal batch dispatched"
        );
        Ok(TerminalOutcome::Dispatched(batch.status))
    }

    async fn download_artifacts(&self, lease: &Lease, batch: &BatchRecord) -> Result<Artifacts> {
        let mut artifacts = Artifacts::default();
        if batch.output_file_id.is_none() && batch.error_file_id.is_none() {
            return Ok(artifacts);
        }
        tokio::fs::create_dir_all(&self.settings.download_dir)
            .await
            .map_err(|e| Error::Io(format!("creating download dir: {e}")))?;

        if let Some(file_id) = &batch.output_file_id {
            let path = self
                .settings
                .download_dir
                .join(format!("{}_output.jsonl", batch.batch_id));
            self.download(lease, file_id, &path).await?;
            artifacts.output = Some(path);
        }
        if let Some(file_id) = &batch.error_file_id {
            let path = self
                .settings
                .download_dir
                .join(format!("{}_errors.jsonl", batch.batch_id));
            self.download(lease, file_id, &path).await?;
            artifacts.errors = Some(path);
        }
        Ok(artifacts)
    }

    async fn download(&self, lease: &Lease, file_id: &str, path: &std::path::Path) -> Result<()> {
        lease.extend().await?;
        let bytes = self.upstream.download_file(lease.secret(), file_id).await?;
        tokio::fs::write(path, &bytes)
            .await
            .map_err(|e| Error::Io(format!("writing {}: {e}", path.display())))?;
        debug!(file_id, path = %path.display(), bytes = bytes.len(), "artifact downloaded");
        Ok(())
    }

    /// Request cancellation of a batch. The status then moves through
    /// `cancelling` to `cancelled` and is dispatched by a later poll.
    pub async fn cancel(&self, lease: &Lease, batch_id: &str) -> Result<BatchRecord> {
        let remote = self.upstream.cancel_batch(lease.secret(), batch_id).await?;
        let record = match self.store.get_batch(batch_id).await? {
            Some(mut record) => {
                record.apply(&remote);
                record
            }
            None => self.record_from_remote(lease, &remote),
        };
        self.store.upsert_batch(record.clone()).await?;
        info!(label = lease.label(), batch_id, status = remote.status.label(), "batch cancellation requested");
        Ok(record)
    }

    /// One cycle for one credential.
    ///
    /// Holds the credential's lock for the duration of the cycle, extending
    /// it before each upstream call so the TTL only has to cover one call
    /// plus one upload backoff. A lost lock ends the cycle with
    /// `LockLost`. Advances
    /// the outstanding batch if there is one, otherwise uploads the next
    /// file from `source`; a file whose upload fails goes back to the source.
    pub async fn run_cycle(&self, label: &str, source: &dyn FileSource) -> Result<CycleOutcome> {
        let lease = match self
            .pool
            .acquire_label(label, 0, self.settings.lock_timeout)
            .await
        {
            Ok(lease) => lease,
            Err(credential_pool::Error::AcquireTimeout(_)) => return Ok(CycleOutcome::Busy),
            Err(e) => return Err(e.into()),
        };

        let result = self.cycle(&lease, source).await;
        if let Err(e) = lease.release().await {
            warn!(label, error = %e, "failed to release credential after cycle");
        }
        result
    }

    async fn cycle(&self, lease: &Lease, source: &dyn FileSource) -> Result<CycleOutcome> {
        if let Some(batch_id) = self.outstanding(lease).await? {
            return self.poll(lease, &batch_id).await;
        }

        let Some(file) = source.next_file(lease.label()).await else {
            return Ok(CycleOutcome::Idle);
        };
        match self.upload(lease, &file).await {
            Ok(record) => {
                source.file_uploaded(&file).await;
                Ok(CycleOutcome::Submitted {
                    batch_id: record.batch_id,
                })
            }
            Err(e) => {
                source.return_file(file).await;
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::QueueSource;
    use crate::testing::{harness, harness_with, remote_batch};
    use credential_pool::Eligibility;

    #[tokio::test]
    async fn upload_creates_batch_and_pairs_lines() {
        let h = harness(&["k1"]);
        let file = h.sealed_file(1).await;
        let lease = h.lease("k1").await;

        let record = h.orchestrator.upload(&lease, &file).await.unwrap();

        assert_eq!(record.label, "k1");
        assert_eq!(record.input_file_name.as_deref(), Some(file.name.as_str()));
        assert_eq!(
            h.store.outstanding("k1").await.unwrap().as_deref(),
            Some(record.batch_id.as_str())
        );
        let line = h.store.line("c1-0").await.unwrap().unwrap();
        assert_eq!(line.batch_id.as_deref(), Some(record.batch_id.as_str()));

        let remote = h
            .upstream
            .retrieve_batch("sk-k1", &record.batch_id)
            .await
            .unwrap();
        assert_eq!(
            remote.metadata.unwrap().get(FILE_NAME_METADATA),
            Some(&file.name)
        );
        lease.release().await.unwrap();
    }

    #[tokio::test]
    async fn reupload_of_same_file_reuses_batch() {
        let h = harness(&["k1"]);
        let file = h.sealed_file(1).await;
        let lease = h.lease("k1").await;

        let first = h.orchestrator.upload(&lease, &file).await.unwrap();
        let second = h.orchestrator.upload(&lease, &file).await.unwrap();

        assert_eq!(first.batch_id, second.batch_id);
        assert_eq!(h.upstream.upload_attempts(), 1);
        lease.release().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn transient_upload_failures_are_retried() {
        let h = harness(&["k1"]);
        let file = h.sealed_file(1).await;
        h.upstream.fail_uploads(vec![
            upstream::Error::Transient("connection reset".into()),
            upstream::Error::Transient("502".into()),
        ]);
        let lease = h.lease("k1").await;

        let record = h.orchestrator.upload(&lease, &file).await.unwrap();

        assert_eq!(h.upstream.upload_attempts(), 3);
        assert!(record.batch_id.starts_with("batch-"));
        lease.release().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn retries_outlasting_the_lock_ttl_keep_the_lock() {
        // Backoffs of 5s and 10s run past a 12s TTL unless it is extended
        let h = harness_with(
            &["k1"],
            credential_pool::PoolSettings {
                lock_ttl: Duration::from_secs(12),
                ..credential_pool::PoolSettings::default()
            },
        );
        let file = h.sealed_file(1).await;
        h.upstream.fail_uploads(vec![
            upstream::Error::Transient("connection reset".into()),
            upstream::Error::Transient("502".into()),
        ]);
        let lease = h.lease("k1").await;
        let started = tokio::time::Instant::now();

        h.orchestrator.upload(&lease, &file).await.unwrap();

        assert!(started.elapsed() > Duration::from_secs(12));
        let err = h
            .orchestrator
            .pool()
            .acquire_label("k1", 0, Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, credential_pool::Error::AcquireTimeout(_)), "{err:?}");
        assert!(lease.release().await.unwrap(), "lease no longer owned its lock");
    }

    #[tokio::test(start_paused = true)]
    async fn lost_lock_stops_the_upload() {
        let h = harness(&["k1"]);
        let file = h.sealed_file(1).await;
        let lease = h.lease("k1").await;
        let lock = lease.slot().keys().lock.clone();
        h.orchestrator.pool().coordinator().delete(&lock).await.unwrap();

        let err = h.orchestrator.upload(&lease, &file).await.unwrap_err();

        assert!(
            matches!(err, Error::Pool(credential_pool::Error::LockLost(_))),
            "{err}"
        );
        assert_eq!(h.upstream.upload_attempts(), 0);
        assert!(h.store.outstanding("k1").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_cool_the_credential_down() {
        let h = harness(&["k1"]);
        let file = h.sealed_file(1).await;
        h.upstream.fail_uploads(
            (0..3)
                .map(|_| upstream::Error::Transient("timeout".into()))
                .collect(),
        );
        let lease = h.lease("k1").await;

        let err = h.orchestrator.upload(&lease, &file).await.unwrap_err();

        assert!(matches!(err, Error::UploadFailed { attempts: 3, .. }), "{err}");
        let slot = Arc::clone(lease.slot());
        lease.release().await.unwrap();
        let coordinator = h.orchestrator.pool().coordinator();
        assert!(matches!(
            slot.eligibility(coordinator.as_ref(), 0).await.unwrap(),
            Eligibility::CoolingDown(_)
        ));
        assert!(h.store.outstanding("k1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn quota_on_last_credential_is_fatal() {
        let h = harness(&["k1"]);
        let file = h.sealed_file(1).await;
        h.upstream
            .fail_uploads(vec![upstream::Error::QuotaExceeded("insufficient_quota".into())]);
        let lease = h.lease("k1").await;

        let err = h.orchestrator.upload(&lease, &file).await.unwrap_err();

        assert!(err.is_fatal(), "{err}");
        assert!(h.orchestrator.pool().is_exhausted().await);
        lease.release().await.unwrap();
    }

    #[tokio::test]
    async fn terminal_batch_is_dispatched_once() {
        let h = harness(&["k1"]);
        let file = h.sealed_file(1).await;
        let lease = h.lease("k1").await;
        let record = h.orchestrator.upload(&lease, &file).await.unwrap();
        h.upstream.transition(&record.batch_id, BatchStatus::Completed);

        let outcome = h.orchestrator.poll(&lease, &record.batch_id).await.unwrap();
        assert_eq!(
            outcome,
            CycleOutcome::Terminal {
                batch_id: record.batch_id.clone(),
                outcome: TerminalOutcome::Dispatched(BatchStatus::Completed),
            }
        );

        let stored = h.store.get_batch(&record.batch_id).await.unwrap().unwrap();
        assert!(stored.is_processed());
        let again = h.orchestrator.handle_terminal(&lease, &stored).await.unwrap();
        assert_eq!(again, TerminalOutcome::AlreadyProcessed);

        assert_eq!(
            h.handler.calls(),
            vec![("completed".to_string(), record.batch_id.clone())]
        );
        let artifacts = h.handler.calls.lock().unwrap()[0].2.clone();
        let output = artifacts.output.unwrap();
        assert!(output.ends_with(format!("{}_output.jsonl", record.batch_id)));
        assert!(output.exists());
        assert!(artifacts.errors.is_none());
        assert!(h.store.outstanding("k1").await.unwrap().is_none());
        lease.release().await.unwrap();
    }

    #[tokio::test]
    async fn handler_error_leaves_batch_for_next_poll() {
        let h = harness(&["k1"]);
        let file = h.sealed_file(1).await;
        let lease = h.lease("k1").await;
        let record = h.orchestrator.upload(&lease, &file).await.unwrap();
        h.upstream.transition(&record.batch_id, BatchStatus::Failed);
        *h.handler.fail_next.lock().unwrap() = true;

        let err = h.orchestrator.poll(&lease, &record.batch_id).await.unwrap_err();
        assert!(matches!(err, Error::Handler(_)));
        let stored = h.store.get_batch(&record.batch_id).await.unwrap().unwrap();
        assert!(!stored.is_processed());
        assert!(h.store.outstanding("k1").await.unwrap().is_some());

        h.orchestrator.poll(&lease, &record.batch_id).await.unwrap();
        assert_eq!(
            h.handler.calls(),
            vec![("failed".to_string(), record.batch_id.clone())]
        );
        lease.release().await.unwrap();
    }

    #[tokio::test]
    async fn non_terminal_batch_is_rejected() {
        let h = harness(&["k1"]);
        let lease = h.lease("k1").await;
        let record = BatchRecord::from_remote("k1", None, &remote_batch("b", BatchStatus::InProgress));

        let err = h.orchestrator.handle_terminal(&lease, &record).await.unwrap_err();
        assert!(matches!(err, Error::NotTerminal(id) if id == "b"));
        lease.release().await.unwrap();
    }

    #[tokio::test]
    async fn unknown_remote_batch_is_adopted() {
        let h = harness(&["k1"]);
        let mut remote = remote_batch("batch-remote", BatchStatus::InProgress);
        remote.metadata = Some(BTreeMap::from([(
            FILE_NAME_METADATA.to_string(),
            "batch_5_001.jsonl".to_string(),
        )]));
        h.upstream.insert(remote);
        let lease = h.lease("k1").await;

        let adopted = h.orchestrator.outstanding(&lease).await.unwrap();

        assert_eq!(adopted.as_deref(), Some("batch-remote"));
        let record = h.store.get_batch("batch-remote").await.unwrap().unwrap();
        assert_eq!(record.label, "k1");
        assert_eq!(record.input_file_name.as_deref(), Some("batch_5_001.jsonl"));
        lease.release().await.unwrap();
    }

    #[tokio::test]
    async fn processed_remote_batch_is_not_adopted() {
        let h = harness(&["k1"]);
        let remote = remote_batch("batch-old", BatchStatus::Completed);
        h.upstream.insert(remote.clone());
        h.store
            .upsert_batch(BatchRecord::from_remote("k1", None, &remote))
            .await
            .unwrap();
        h.store.mark_processing_complete("batch-old", 5).await.unwrap();
        let lease = h.lease("k1").await;

        assert!(h.orchestrator.outstanding(&lease).await.unwrap().is_none());
        lease.release().await.unwrap();
    }

    #[tokio::test]
    async fn cancelled_batch_takes_the_failed_path() {
        let h = harness(&["k1"]);
        let file = h.sealed_file(1).await;
        let lease = h.lease("k1").await;
        let record = h.orchestrator.upload(&lease, &file).await.unwrap();

        let cancelling = h.orchestrator.cancel(&lease, &record.batch_id).await.unwrap();
        assert_eq!(cancelling.status, BatchStatus::Cancelling);
        h.upstream.transition(&record.batch_id, BatchStatus::Cancelled);

        h.orchestrator.poll(&lease, &record.batch_id).await.unwrap();
        assert_eq!(
            h.handler.calls(),
            vec![("failed".to_string(), record.batch_id.clone())]
        );
        lease.release().await.unwrap();
    }

    #[tokio::test]
    async fn cycles_walk_a_file_through_its_lifecycle() {
        let h = harness(&["k1"]);
        let source = QueueSource::new();
        source.push([h.sealed_file(1).await]).await;

        let CycleOutcome::Submitted { batch_id } =
            h.orchestrator.run_cycle("k1", &source).await.unwrap()
        else {
            panic!("expected a submission");
        };
        assert!(source.is_idle().await);

        let outcome = h.orchestrator.run_cycle("k1", &source).await.unwrap();
        assert_eq!(
            outcome,
            CycleOutcome::InProgress {
                batch_id: batch_id.clone(),
                status: BatchStatus::Validating,
            }
        );

        h.upstream.transition(&batch_id, BatchStatus::Expired);
        let outcome = h.orchestrator.run_cycle("k1", &source).await.unwrap();
        assert!(matches!(
            outcome,
            CycleOutcome::Terminal {
                outcome: TerminalOutcome::Dispatched(BatchStatus::Expired),
                ..
            }
        ));

        assert_eq!(
            h.orchestrator.run_cycle("k1", &source).await.unwrap(),
            CycleOutcome::Idle
        );
        assert_eq!(h.handler.calls(), vec![("expired".to_string(), batch_id)]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_upload_returns_file_to_source() {
        let h = harness(&["k1"]);
        let source = QueueSource::new();
        source.push([h.sealed_file(1).await]).await;
        h.upstream.fail_uploads(vec![upstream::Error::Permanent {
            status: 400,
            message: "bad jsonl".into(),
        }]);

        let err = h.orchestrator.run_cycle("k1", &source).await.unwrap_err();

        assert!(matches!(err, Error::UploadFailed { attempts: 1, .. }), "{err}");
        assert_eq!(source.len().await, 1);
        assert!(!source.is_idle().await);
        // The credential is cooling down, so the next cycle does not get it
        assert_eq!(
            h.orchestrator.run_cycle("k1", &source).await.unwrap(),
            CycleOutcome::Busy
        );
    }

    #[tokio::test(start_paused = true)]
    async fn busy_credential_skips_the_cycle() {
        let h = harness(&["k1"]);
        let source = QueueSource::new();
        let held = h.lease("k1").await;

        assert_eq!(
            h.orchestrator.run_cycle("k1", &source).await.unwrap(),
            CycleOutcome::Busy
        );
        held.release().await.unwrap();
    }
}
