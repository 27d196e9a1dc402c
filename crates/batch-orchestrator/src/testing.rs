//! In-memory fakes shared by the orchestration tests

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use batch_store::{BatchRecord, BatchStore, LineRecord, LocalStore};
use batch_writer::{BatchFileWriter, BatchLine, FileLimits, SealedFile, WorkUnit};
use common::BoxFuture;
use credential_pool::{CredentialSlot, Lease, MemoryCoordinator, Pool, PoolSettings};
use upstream::{BatchStatus, Completion, CompletionRequest, RemoteBatch, Upstream};

use crate::error::{Error, Result};
use crate::handler::{Artifacts, BatchHandler};
use crate::orchestrator::{Orchestrator, OrchestratorSettings};

#[derive(Default)]
struct Remote {
    upload_failures: VecDeque<upstream::Error>,
    uploads: Vec<String>,
    files: HashMap<String, Vec<u8>>,
    batches: HashMap<String, RemoteBatch>,
    latest: Option<String>,
    next_id: usize,
}

/// In-memory batch API.
#[derive(Default)]
pub(crate) struct FakeBatches {
    remote: Mutex<Remote>,
}

impl FakeBatches {
    pub(crate) fn fail_uploads(&self, errors: Vec<upstream::Error>) {
        self.remote.lock().unwrap().upload_failures.extend(errors);
    }

    pub(crate) fn upload_attempts(&self) -> usize {
        self.remote.lock().unwrap().uploads.len()
    }

    pub(crate) fn insert(&self, batch: RemoteBatch) {
        let mut remote = self.remote.lock().unwrap();
        remote.latest = Some(batch.id.clone());
        remote.batches.insert(batch.id.clone(), batch);
    }

    /// Move a batch to `status`; completion attaches an output file.
    pub(crate) fn transition(&self, batch_id: &str, status: BatchStatus) {
        let mut remote = self.remote.lock().unwrap();
        let output = (status == BatchStatus::Completed).then(|| {
            let id = format!("{batch_id}-out");
            remote
                .files
                .insert(id.clone(), b"{\"custom_id\":\"c1\"}\n".to_vec());
            id
        });
        let batch = remote.batches.get_mut(batch_id).unwrap();
        batch.status = status;
        batch.output_file_id = output;
    }
}

pub(crate) fn remote_batch(id: &str, status: BatchStatus) -> RemoteBatch {
    RemoteBatch {
        id: id.to_string(),
        status,
        input_file_id: format!("{id}-in"),
        output_file_id: None,
        error_file_id: None,
        created_at: 1_700_000_000,
        in_progress_at: None,
        expires_at: None,
        completed_at: None,
        failed_at: None,
        expired_at: None,
        cancelled_at: None,
        request_counts: None,
        metadata: None,
    }
}

impl Upstream for FakeBatches {
    fn id(&self) -> &str {
        "fake"
    }

    fn complete<'a>(
        &'a self,
        _: &'a str,
        _: &'a CompletionRequest,
    ) -> BoxFuture<'a, upstream::Result<Completion>> {
        Box::pin(async { unimplemented!() })
    }

    fn upload_file<'a>(
        &'a self,
        _secret: &'a str,
        file_name: &'a str,
        contents: Vec<u8>,
    ) -> BoxFuture<'a, upstream::Result<String>> {
        Box::pin(async move {
            let mut remote = self.remote.lock().unwrap();
            remote.uploads.push(file_name.to_string());
            if let Some(err) = remote.upload_failures.pop_front() {
                return Err(err);
            }
            remote.next_id += 1;
            let id = format!("file-{}", remote.next_id);
            remote.files.insert(id.clone(), contents);
            Ok(id)
        })
    }

    fn create_batch<'a>(
        &'a self,
        _secret: &'a str,
        input_file_id: &'a str,
        metadata: &'a BTreeMap<String, String>,
    ) -> BoxFuture<'a, upstream::Result<RemoteBatch>> {
        Box::pin(async move {
            let id = {
                let mut remote = self.remote.lock().unwrap();
                remote.next_id += 1;
                format!("batch-{}", remote.next_id)
            };
            let mut batch = remote_batch(&id, BatchStatus::Validating);
            batch.input_file_id = input_file_id.to_string();
            batch.metadata = Some(metadata.clone());
            self.insert(batch.clone());
            Ok(batch)
        })
    }

    fn retrieve_batch<'a>(
        &'a self,
        _secret: &'a str,
        batch_id: &'a str,
    ) -> BoxFuture<'a, upstream::Result<RemoteBatch>> {
        Box::pin(async move {
            self.remote
                .lock()
                .unwrap()
                .batches
                .get(batch_id)
                .cloned()
                .ok_or_else(|| upstream::Error::Permanent {
                    status: 404,
                    message: "no such batch".into(),
                })
        })
    }

    fn latest_batch<'a>(
        &'a self,
        _secret: &'a str,
    ) -> BoxFuture<'a, upstream::Result<Option<RemoteBatch>>> {
        Box::pin(async move {
            let remote = self.remote.lock().unwrap();
            Ok(remote
                .latest
                .as_ref()
                .and_then(|id| remote.batches.get(id).cloned()))
        })
    }

    fn cancel_batch<'a>(
        &'a self,
        _secret: &'a str,
        batch_id: &'a str,
    ) -> BoxFuture<'a, upstream::Result<RemoteBatch>> {
        Box::pin(async move {
            let mut remote = self.remote.lock().unwrap();
            let batch = remote.batches.get_mut(batch_id).unwrap();
            batch.status = BatchStatus::Cancelling;
            Ok(batch.clone())
        })
    }

    fn download_file<'a>(
        &'a self,
        _secret: &'a str,
        file_id: &'a str,
    ) -> BoxFuture<'a, upstream::Result<Vec<u8>>> {
        Box::pin(async move {
            Ok(self
                .remote
                .lock()
                .unwrap()
                .files
                .get(file_id)
                .cloned()
                .unwrap_or_default())
        })
    }

    fn delete_file<'a>(&'a self, _: &'a str, _: &'a str) -> BoxFuture<'a, upstream::Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

/// Handler that records every callback.
#[derive(Default)]
pub(crate) struct Recording {
    pub(crate) calls: Mutex<Vec<(String, String, Artifacts)>>,
    pub(crate) fail_next: Mutex<bool>,
}

impl Recording {
    pub(crate) fn calls(&self) -> Vec<(String, String)> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(kind, id, _)| (kind.clone(), id.clone()))
            .collect()
    }

    fn record(&self, kind: &str, batch: &BatchRecord, artifacts: Artifacts) -> Result<()> {
        let mut fail = self.fail_next.lock().unwrap();
        if *fail {
            *fail = false;
            return Err(Error::Handler("disk full".into()));
        }
        self.calls
            .lock()
            .unwrap()
            .push((kind.to_string(), batch.batch_id.clone(), artifacts));
        Ok(())
    }
}

impl BatchHandler for Recording {
    fn on_completed<'a>(
        &'a self,
        _lease: &'a Lease,
        _at: u64,
        batch: &'a BatchRecord,
        artifacts: &'a Artifacts,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move { self.record("completed", batch, artifacts.clone()) })
    }

    fn on_failed<'a>(
        &'a self,
        _lease: &'a Lease,
        _at: u64,
        batch: &'a BatchRecord,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move { self.record("failed", batch, Artifacts::default()) })
    }

    fn on_expired<'a>(
        &'a self,
        _lease: &'a Lease,
        _at: u64,
        batch: &'a BatchRecord,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move { self.record("expired", batch, Artifacts::default()) })
    }
}

pub(crate) struct Harness {
    pub(crate) orchestrator: Orchestrator,
    pub(crate) upstream: Arc<FakeBatches>,
    pub(crate) store: Arc<LocalStore>,
    pub(crate) handler: Arc<Recording>,
    pub(crate) dir: tempfile::TempDir,
}

pub(crate) fn harness(labels: &[&str]) -> Harness {
    harness_with(labels, PoolSettings::default())
}

pub(crate) fn harness_with(labels: &[&str], pool_settings: PoolSettings) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let slots = labels
        .iter()
        .map(|label| {
            CredentialSlot::new(
                &pool_settings.key_prefix,
                *label,
                common::Secret::new(format!("sk-{label}")),
                1_000_000,
            )
        })
        .collect();
    let pool = Arc::new(Pool::new(
        slots,
        Arc::new(MemoryCoordinator::new()),
        pool_settings,
    ));
    let upstream = Arc::new(FakeBatches::default());
    let store = Arc::new(LocalStore::memory());
    let handler = Arc::new(Recording::default());
    let settings = OrchestratorSettings {
        lock_timeout: Duration::from_secs(1),
        download_dir: dir.path().join("downloads"),
        ..OrchestratorSettings::default()
    };
    let orchestrator = Orchestrator::new(
        pool,
        Arc::clone(&upstream) as Arc<dyn Upstream>,
        Arc::clone(&store) as Arc<dyn BatchStore>,
        Arc::clone(&handler) as Arc<dyn BatchHandler>,
        settings,
    );
    Harness {
        orchestrator,
        upstream,
        store,
        handler,
        dir,
    }
}

impl Harness {
    /// Enqueue one unit and pack it into a sealed file.
    pub(crate) async fn sealed_file(&self, stamp: u64) -> SealedFile {
        let ids = vec![format!("c{stamp}-0"), format!("c{stamp}-1")];
        let records = ids
            .iter()
            .map(|id| LineRecord::new(id.clone(), format!("u{stamp}"), 10, "{}"))
            .collect();
        self.store
            .enqueue_unit(&format!("u{stamp}"), ids.clone(), records)
            .await
            .unwrap();

        let writer =
            BatchFileWriter::new(self.dir.path().join("out"), stamp, FileLimits::default())
                .unwrap();
        let lines = ids
            .into_iter()
            .map(|id| BatchLine::new(id, 10, "{}".to_string()))
            .collect();
        writer
            .append(&WorkUnit::new(format!("u{stamp}"), lines))
            .await
            .unwrap();
        writer.finish().await.unwrap().remove(0)
    }

    pub(crate) async fn lease(&self, label: &str) -> Lease {
        self.orchestrator
            .pool()
            .acquire_label(label, 0, Duration::from_secs(1))
            .await
            .unwrap()
    }
}

