//! Caller callbacks for terminal batch outcomes

use std::path::PathBuf;

use batch_store::BatchRecord;
use common::BoxFuture;
use credential_pool::Lease;

use crate::error::Result;

/// Downloaded artifacts of a completed batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Artifacts {
    pub output: Option<PathBuf>,
    pub errors: Option<PathBuf>,
}

/// Receives exactly one callback per terminal batch.
///
/// Callbacks run while the orchestrator holds the batch's credential, so
/// they may use `lease` for follow-up calls (deleting remote files) or to
/// cool the credential down. `at` is the unix-seconds dispatch time. An
/// error leaves the batch unprocessed; the next poll dispatches it again.
pub trait BatchHandler: Send + Sync {
    /// Artifact relocation and remote cleanup are the handler's job.
    fn on_completed<'a>(
        &'a self,
        lease: &'a Lease,
        at: u64,
        batch: &'a BatchRecord,
        artifacts: &'a Artifacts,
    ) -> BoxFuture<'a, Result<()>>;

    fn on_failed<'a>(
        &'a self,
        lease: &'a Lease,
        at: u64,
        batch: &'a BatchRecord,
    ) -> BoxFuture<'a, Result<()>>;

    /// Notification only; reconciling unanswered lines is the handler's job.
    fn on_expired<'a>(
        &'a self,
        lease: &'a Lease,
        at: u64,
        batch: &'a BatchRecord,
    ) -> BoxFuture<'a, Result<()>>;

    /// Defaults to the failed path: no artifacts are expected.
    fn on_cancelled<'a>(
        &'a self,
        lease: &'a Lease,
        at: u64,
        batch: &'a BatchRecord,
    ) -> BoxFuture<'a, Result<()>> {
        self.on_failed(lease, at, batch)
    }
}
