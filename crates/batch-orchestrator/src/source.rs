//! Where sealed files wait for a credential

use std::collections::{HashMap, VecDeque};

use batch_writer::SealedFile;
use common::BoxFuture;
use tokio::sync::Mutex;

/// Supplies sealed files to per-credential loops.
pub trait FileSource: Send + Sync {
    /// Next file for `label` to upload, if any.
    fn next_file<'a>(&'a self, label: &'a str) -> BoxFuture<'a, Option<SealedFile>>;

    /// Hand back a file whose upload was aborted so another cycle retries it.
    fn return_file(&self, file: SealedFile) -> BoxFuture<'_, ()>;

    /// The file's batch was created and its lines paired.
    fn file_uploaded<'a>(&'a self, file: &'a SealedFile) -> BoxFuture<'a, ()>;
}

/// FIFO of sealed files shared by every credential.
///
/// Lines of a queued or checked-out file are not yet paired with a batch,
/// so generating again before the queue is idle would pack them twice.
/// A credential with a batch token limit only takes files within it.
#[derive(Default)]
pub struct QueueSource {
    state: Mutex<Queue>,
    token_limits: HashMap<String, u64>,
}

#[derive(Default)]
struct Queue {
    files: VecDeque<SealedFile>,
    checked_out: usize,
}

impl QueueSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only hand `label` files whose token sum is at most `limit`.
    pub fn with_token_limit(mut self, label: impl Into<String>, limit: u64) -> Self {
        self.token_limits.insert(label.into(), limit);
        self
    }

    pub async fn push(&self, files: impl IntoIterator<Item = SealedFile>) {
        self.state.lock().await.files.extend(files);
    }

    /// Files waiting for a credential.
    pub async fn len(&self) -> usize {
        self.state.lock().await.files.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// No file is queued and none is being uploaded.
    pub async fn is_idle(&self) -> bool {
        let state = self.state.lock().await;
        state.files.is_empty() && state.checked_out == 0
    }
}

impl FileSource for QueueSource {
    fn next_file<'a>(&'a self, label: &'a str) -> BoxFuture<'a, Option<SealedFile>> {
        Box::pin(async move {
            let limit = self.token_limits.get(label).copied().unwrap_or(u64::MAX);
            let mut state = self.state.lock().await;
            let position = state.files.iter().position(|f| f.token_sum <= limit)?;
            let file = state.files.remove(position)?;
            state.checked_out += 1;
            Some(file)
        })
    }

    fn return_file(&self, file: SealedFile) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            state.checked_out = state.checked_out.saturating_sub(1);
            state.files.push_front(file);
        })
    }

    fn file_uploaded<'a>(&'a self, _file: &'a SealedFile) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            state.checked_out = state.checked_out.saturating_sub(1);
        })
    }
}
