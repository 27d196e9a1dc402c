//! Durable store boundary for batch processing
//!
//! The orchestrator and the run generator need a small set of operations
//! from a durable store: batch records with an idempotency marker, per-line
//! correlation records, and a per-credential "outstanding batch" marker.
//! `BatchStore` names those operations; `LocalStore` implements them over
//! in-memory state that is optionally mirrored to a JSON file.

pub mod error;
pub mod local;
pub mod records;

pub use error::{Error, Result};
pub use local::LocalStore;
pub use records::{
    BatchRecord, LineOutcome, LineRecord, MatchReport, ResponseRecord, UnitLines,
};

use common::BoxFuture;

/// Operations the batch pipeline needs from its durable store.
///
/// Returns boxed futures so the trait stays dyn-compatible (`Arc<dyn BatchStore>`).
pub trait BatchStore: Send + Sync {
    /// Declare a work unit's correlation ids and store the lines that exist.
    /// Declared ids without a line show up later as orphans.
    ///
    /// Returns false and changes nothing when the unit id or any of the
    /// correlation ids is already stored.
    fn enqueue_unit<'a>(
        &'a self,
        unit_id: &'a str,
        declared: Vec<String>,
        lines: Vec<LineRecord>,
    ) -> BoxFuture<'a, Result<bool>>;

    /// Units with pending lines or missing line records, in id order.
    fn pending_units(&self) -> BoxFuture<'_, Result<Vec<String>>>;

    /// Pending lines of a unit and how many declared ids have no record.
    fn lines_for_unit<'a>(&'a self, unit_id: &'a str) -> BoxFuture<'a, Result<UnitLines>>;

    /// Attach lines to a batch. Returns how many lines were paired.
    fn pair_lines<'a>(
        &'a self,
        batch_id: &'a str,
        correlation_ids: &'a [String],
    ) -> BoxFuture<'a, Result<usize>>;

    /// Store responses against lines paired with the same batch.
    fn record_responses(
        &self,
        responses: Vec<ResponseRecord>,
    ) -> BoxFuture<'_, Result<MatchReport>>;

    /// Unpair a batch's lines so they are generated again. With
    /// `unanswered_only`, lines that already have a response stay put.
    fn reset_lines_for_batch<'a>(
        &'a self,
        batch_id: &'a str,
        unanswered_only: bool,
    ) -> BoxFuture<'a, Result<usize>>;

    fn lines_for_batch<'a>(&'a self, batch_id: &'a str)
    -> BoxFuture<'a, Result<Vec<LineRecord>>>;

    fn line<'a>(&'a self, correlation_id: &'a str) -> BoxFuture<'a, Result<Option<LineRecord>>>;

    fn get_batch<'a>(&'a self, batch_id: &'a str) -> BoxFuture<'a, Result<Option<BatchRecord>>>;

    /// Most recent batch created from the named input file.
    fn find_batch_by_file_name<'a>(
        &'a self,
        file_name: &'a str,
    ) -> BoxFuture<'a, Result<Option<BatchRecord>>>;

    /// Insert or replace a batch record. An existing processing marker is
    /// never cleared by an upsert.
    fn upsert_batch(&self, record: BatchRecord) -> BoxFuture<'_, Result<()>>;

    /// Set the processing marker. Returns `false` if it was already set.
    fn mark_processing_complete<'a>(
        &'a self,
        batch_id: &'a str,
        at: u64,
    ) -> BoxFuture<'a, Result<bool>>;

    fn set_outstanding<'a>(&'a self, label: &'a str, batch_id: &'a str)
    -> BoxFuture<'a, Result<()>>;

    fn outstanding<'a>(&'a self, label: &'a str) -> BoxFuture<'a, Result<Option<String>>>;

    /// Clear the marker only if it still names `batch_id`.
    fn clear_outstanding<'a>(
        &'a self,
        label: &'a str,
        batch_id: &'a str,
    ) -> BoxFuture<'a, Result<bool>>;
}
