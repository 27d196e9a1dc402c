//! Per-credential background loops
//!
//! One loop per credential label, each running `Orchestrator::run_cycle` on a
//! fixed interval. Loops are independent: a slow or failing credential never
//! delays another.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::orchestrator::{CycleOutcome, Orchestrator};
use crate::source::FileSource;

/// Spawn one cycle loop per label into a `JoinSet`.
///
/// A loop ends with `Ok(())` once its credential leaves the pool, and with
/// the error when the whole pool is exhausted. Every other error is logged
/// and the loop carries on at its next tick.
pub fn spawn_poll_loops(
    orchestrator: Arc<Orchestrator>,
    labels: Vec<String>,
    source: Arc<dyn FileSource>,
) -> JoinSet<Result<()>> {
    let interval = orchestrator.settings().poll_interval;
    let mut set = JoinSet::new();
    for label in labels {
        let orchestrator = Arc::clone(&orchestrator);
        let source = Arc::clone(&source);
        set.spawn(async move { poll_loop(&orchestrator, &label, source.as_ref(), interval).await });
    }
    set
}

async fn poll_loop(
    orchestrator: &Orchestrator,
    label: &str,
    source: &dyn FileSource,
    interval: Duration,
) -> Result<()> {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    info!(label, interval_secs = interval.as_secs(), "batch loop started");

    loop {
        ticker.tick().await;
        match orchestrator.run_cycle(label, source).await {
            Ok(CycleOutcome::Idle) => debug!(label, "nothing to do"),
            Ok(CycleOutcome::Busy) => debug!(label, "credential busy, skipping cycle"),
            Ok(outcome) => debug!(label, ?outcome, "cycle finished"),
            Err(Error::Pool(credential_pool::Error::NotFound(_))) => {
                warn!(label, "credential left the pool, stopping its loop");
                return Ok(());
            }
            Err(e) if e.is_fatal() => {
                error!(label, error = %e, "credential pool exhausted, stopping");
                return Err(e);
            }
            Err(e) => warn!(label, error = %e, "batch cycle failed, will retry next tick"),
        }
    }
}
