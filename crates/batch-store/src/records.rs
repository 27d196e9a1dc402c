//! Persisted records
//!
//! Batch records mirror the remote batch plus the local processing marker.
//! Line records follow one correlation id from enqueue, through pairing with
//! a batch, to its response.

use serde::{Deserialize, Serialize};
use upstream::{BatchStatus, RemoteBatch, RequestCounts};

/// Local view of a remote batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRecord {
    pub batch_id: String,
    /// Credential the batch was created under
    pub label: String,
    pub input_file_id: String,
    /// Name of the sealed file that was uploaded, when known
    #[serde(default)]
    pub input_file_name: Option<String>,
    pub status: BatchStatus,
    pub created_at: u64,
    #[serde(default)]
    pub in_progress_at: Option<u64>,
    #[serde(default)]
    pub expires_at: Option<u64>,
    #[serde(default)]
    pub completed_at: Option<u64>,
    #[serde(default)]
    pub failed_at: Option<u64>,
    #[serde(default)]
    pub expired_at: Option<u64>,
    #[serde(default)]
    pub cancelled_at: Option<u64>,
    #[serde(default)]
    pub request_counts: Option<RequestCounts>,
    #[serde(default)]
    pub output_file_id: Option<String>,
    #[serde(default)]
    pub error_file_id: Option<String>,
    /// Set once terminal handling finished; guards duplicate dispatch.
    /// Independent of the remote status.
    #[serde(default)]
    pub processing_completed_at: Option<u64>,
}

impl BatchRecord {
    pub fn from_remote(
        label: impl Into<String>,
        input_file_name: Option<String>,
        remote: &RemoteBatch,
    ) -> Self {
        let mut record = Self {
            batch_id: remote.id.clone(),
            label: label.into(),
            input_file_id: remote.input_file_id.clone(),
            input_file_name,
            status: remote.status,
            created_at: remote.created_at,
            in_progress_at: None,
            expires_at: None,
            completed_at: None,
            failed_at: None,
            expired_at: None,
            cancelled_at: None,
            request_counts: None,
            output_file_id: None,
            error_file_id: None,
            processing_completed_at: None,
        };
        record.apply(remote);
        record
    }

    /// Copy remote status, timestamps, counts, and artifact ids. Fields the
    /// remote omits keep their previous values.
    pub fn apply(&mut self, remote: &RemoteBatch) {
        self.status = remote.status;
        self.in_progress_at = remote.in_progress_at.or(self.in_progress_at);
        self.expires_at = remote.expires_at.or(self.expires_at);
        self.completed_at = remote.completed_at.or(self.completed_at);
        self.failed_at = remote.failed_at.or(self.failed_at);
        self.expired_at = remote.expired_at.or(self.expired_at);
        self.cancelled_at = remote.cancelled_at.or(self.cancelled_at);
        self.request_counts = remote.request_counts.or(self.request_counts);
        if remote.output_file_id.is_some() {
            self.output_file_id = remote.output_file_id.clone();
        }
        if remote.error_file_id.is_some() {
            self.error_file_id = remote.error_file_id.clone();
        }
    }

    pub fn is_processed(&self) -> bool {
        self.processing_completed_at.is_some()
    }
}

/// What the upstream returned for one line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum LineOutcome {
    Result(serde_json::Value),
    Error(serde_json::Value),
}

/// Result or error for one correlation id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseRecord {
    pub correlation_id: String,
    pub batch_id: String,
    pub outcome: LineOutcome,
}

/// One serialized upstream call awaiting (or holding) its response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineRecord {
    pub correlation_id: String,
    pub unit_id: String,
    pub tokens: u64,
    pub body: String,
    /// Batch the line was sent in; `None` while unpaired
    #[serde(default)]
    pub batch_id: Option<String>,
    #[serde(default)]
    pub response: Option<ResponseRecord>,
}

impl LineRecord {
    pub fn new(
        correlation_id: impl Into<String>,
        unit_id: impl Into<String>,
        tokens: u64,
        body: impl Into<String>,
    ) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            unit_id: unit_id.into(),
            tokens,
            body: body.into(),
            batch_id: None,
            response: None,
        }
    }

    /// Neither sent in a batch nor answered.
    pub fn is_pending(&self) -> bool {
        self.batch_id.is_none() && self.response.is_none()
    }
}

/// Pending lines of one work unit plus the count of declared ids with no
/// line record at all.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UnitLines {
    pub unit_id: String,
    pub lines: Vec<LineRecord>,
    pub missing: usize,
}

/// Outcome of storing a set of responses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchReport {
    pub matched: usize,
    /// Correlation ids with no line paired to the response's batch
    pub unmatched: Vec<String>,
}
