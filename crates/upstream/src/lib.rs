//! Upstream API abstraction
//!
//! Defines the `Upstream` trait that decouples credential pooling and batch
//! orchestration from the provider's wire format. The core never parses
//! provider error text: adapters convert every failure into a structured
//! `Error` (quota exhausted, rate limited with an optional retry-after,
//! transient, permanent) via `classify`.
//!
//! The HTTP adapter in `http` speaks an OpenAI-compatible API; tests use
//! scripted in-memory implementations of the same trait.

pub mod classify;
pub mod error;
pub mod estimate;
pub mod http;
pub mod types;

pub use classify::{classify_status, parse_retry_after};
pub use error::{Error, Result};
pub use estimate::{chunk_by_tokens, chunk_with_overlap, estimate_tokens};
pub use http::HttpUpstream;
pub use types::{
    BatchStatus, Completion, CompletionRequest, RemoteBatch, RequestCounts, Usage,
};

use std::collections::BTreeMap;

use common::BoxFuture;

/// The quota-constrained upstream API.
///
/// Every call carries the secret of the credential it runs under; the
/// implementation holds no per-credential state. Returns boxed futures so the
/// trait stays dyn-compatible (`Arc<dyn Upstream>`).
pub trait Upstream: Send + Sync {
    /// Identifier for logging (e.g. "openai", "scripted").
    fn id(&self) -> &str;

    /// Issue one synchronous completion call.
    fn complete<'a>(
        &'a self,
        secret: &'a str,
        request: &'a CompletionRequest,
    ) -> BoxFuture<'a, Result<Completion>>;

    /// Upload a batch input file; returns the remote file id.
    fn upload_file<'a>(
        &'a self,
        secret: &'a str,
        file_name: &'a str,
        contents: Vec<u8>,
    ) -> BoxFuture<'a, Result<String>>;

    /// Create a remote batch from an uploaded input file.
    fn create_batch<'a>(
        &'a self,
        secret: &'a str,
        input_file_id: &'a str,
        metadata: &'a BTreeMap<String, String>,
    ) -> BoxFuture<'a, Result<RemoteBatch>>;

    /// Fetch the current state of a remote batch.
    fn retrieve_batch<'a>(
        &'a self,
        secret: &'a str,
        batch_id: &'a str,
    ) -> BoxFuture<'a, Result<RemoteBatch>>;

    /// Most recently created batch for this credential, if any.
    fn latest_batch<'a>(&'a self, secret: &'a str) -> BoxFuture<'a, Result<Option<RemoteBatch>>>;

    /// Request cancellation of a non-terminal batch.
    fn cancel_batch<'a>(
        &'a self,
        secret: &'a str,
        batch_id: &'a str,
    ) -> BoxFuture<'a, Result<RemoteBatch>>;

    /// Download the contents of a remote file (output or error artifact).
    fn download_file<'a>(
        &'a self,
        secret: &'a str,
        file_id: &'a str,
    ) -> BoxFuture<'a, Result<Vec<u8>>>;

    /// Delete a remote file.
    fn delete_file<'a>(&'a self, secret: &'a str, file_id: &'a str) -> BoxFuture<'a, Result<()>>;
}
