//! Batch file generation from stored pending lines
//!
//! Reads every unit with pending lines, packs complete units into sealed
//! files through one shared `BatchFileWriter`, and stops as soon as the
//! writer reports the file-count ceiling. Units with declared lines missing
//! from the store are orphans: they are left out and listed in the run's
//! orphan log. Units the writer refuses (too large for any file) are
//! skipped the same way and listed in the rejected log; neither stops the
//! run.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use batch_store::BatchStore;
use batch_writer::{
    AppendOutcome, BatchFileWriter, BatchLine, FileLimits, Orphan, Rejected, Run, WorkUnit,
};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

enum Packed {
    Written,
    Skipped,
    Orphan(Orphan),
    Rejected(Rejected),
    Stopped,
}

/// Generate one run of batch files into `dir`, stamped with `stamp`.
///
/// At most `concurrency` units are read and appended at once. Store and
/// file errors fail the run: the files written so far are removed and
/// their lines stay pending for the next run.
pub async fn generate_run(
    store: Arc<dyn BatchStore>,
    dir: &Path,
    limits: FileLimits,
    stamp: u64,
    concurrency: usize,
) -> Result<Run> {
    let writer = Arc::new(BatchFileWriter::new(dir, stamp, limits)?);
    let units = store.pending_units().await?;
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let stop = Arc::new(AtomicBool::new(false));
    let mut tasks = JoinSet::new();

    for unit_id in units {
        if stop.load(Ordering::Acquire) {
            break;
        }
        let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
            break;
        };
        let store = Arc::clone(&store);
        let writer = Arc::clone(&writer);
        let stop = Arc::clone(&stop);
        tasks.spawn(async move {
            let _permit = permit;
            if stop.load(Ordering::Acquire) {
                return Ok(Packed::Stopped);
            }
            let packed = pack_unit(store.as_ref(), &writer, &unit_id).await;
            if matches!(packed, Ok(Packed::Stopped) | Err(_)) {
                stop.store(true, Ordering::Release);
            }
            packed
        });
    }

    let mut run = Run::new(stamp);
    let mut written = 0usize;
    let mut first_error = None;
    while let Some(joined) = tasks.join_next().await {
        let packed = joined.map_err(|e| Error::Io(format!("generation task failed: {e}")));
        match packed.and_then(|p| p) {
            Ok(Packed::Written) => written += 1,
            Ok(Packed::Skipped) => {}
            Ok(Packed::Orphan(orphan)) => run.orphans.push(orphan),
            Ok(Packed::Rejected(rejected)) => run.rejected.push(rejected),
            Ok(Packed::Stopped) => run.capacity_reached = true,
            Err(e) => {
                first_error.get_or_insert(e);
            }
        }
    }

    let files = writer.finish().await?;
    if let Some(e) = first_error {
        for file in &files {
            if let Err(remove) = tokio::fs::remove_file(&file.path).await {
                warn!(file = %file.name, error = %remove, "could not remove file of failed run");
            }
        }
        return Err(e);
    }

    run.files = files;
    run.orphans.sort_by(|a, b| a.unit_id.cmp(&b.unit_id));
    run.rejected.sort_by(|a, b| a.unit_id.cmp(&b.unit_id));
    run.write_orphan_log(dir).await?;
    run.write_rejected_log(dir).await?;
    info!(
        stamp,
        units = written,
        files = run.files.len(),
        lines = run.total_lines(),
        orphans = run.orphans.len(),
        rejected = run.rejected.len(),
        capacity_reached = run.capacity_reached,
        "generation run finished"
    );
    Ok(run)
}

async fn pack_unit(store: &dyn BatchStore, writer: &BatchFileWriter, unit_id: &str) -> Result<Packed> {
    let unit = store.lines_for_unit(unit_id).await?;
    if unit.missing > 0 {
        warn!(unit = unit_id, missing = unit.missing, "unit has missing lines, leaving it out");
        return Ok(Packed::Orphan(Orphan {
            unit_id: unit_id.to_string(),
            missing: unit.missing,
        }));
    }
    if unit.lines.is_empty() {
        return Ok(Packed::Skipped);
    }

    let lines = unit
        .lines
        .into_iter()
        .map(|line| BatchLine::new(line.correlation_id, line.tokens, line.body))
        .collect();
    let work = WorkUnit::new(unit_id, lines);
    match writer.append(&work).await {
        Ok(AppendOutcome::Written { file_index }) => {
            debug!(unit = unit_id, file_index, "unit packed");
            Ok(Packed::Written)
        }
        Ok(AppendOutcome::CapacityReached | AppendOutcome::Closed) => Ok(Packed::Stopped),
        Err(e @ (batch_writer::Error::UnitTooLarge { .. } | batch_writer::Error::EmptyUnit(_))) => {
            warn!(unit = unit_id, error = %e, "writer refused unit, leaving it pending");
            Ok(Packed::Rejected(Rejected {
                unit_id: unit_id.to_string(),
                reason: e.to_string(),
            }))
        }
        Err(e) => Err(e.into()),
    }
}
