//! Background exhaustion sync
//!
//! Another process may exhaust a slot this process still lists. `acquire`
//! notices lazily when it inspects the slot; this task retires such slots
//! proactively so `health()` and `is_exhausted()` stay accurate between
//! acquisitions.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::pool::Pool;

/// Spawn a task that retires slots exhausted elsewhere every `interval`.
///
/// Logs loudly once the pool is empty; stopping the process is the owner's
/// decision. Returns the task's `JoinHandle`.
pub fn spawn_sync_task(pool: Arc<Pool>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick fires immediately; markers were checked at startup
        ticker.tick().await;

        loop {
            ticker.tick().await;
            sync_cycle(&pool).await;
        }
    })
}

async fn sync_cycle(pool: &Pool) {
    match pool.sync_exhausted().await {
        Ok(0) => error!("credential pool exhausted by another process"),
        Ok(remaining) => debug!(remaining, "exhaustion sync complete"),
        Err(e) => warn!(error = %e, "exhaustion sync failed, will retry next cycle"),
    }
}
