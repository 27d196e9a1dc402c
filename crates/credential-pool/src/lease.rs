//! Scoped credential borrow
//!
//! A `Lease` is the only way to hold a slot's lock. It is released exactly
//! once: explicitly through `release().await`, or on drop when the borrower
//! panicked or its future was cancelled. The drop path first records any
//! in-flight usage (the upstream may bill a call whose response never
//! arrived) and then issues the compare-and-delete from a spawned task.
//!
//! Holders doing several calls in a row call `extend` between them so the
//! lock TTL only has to cover one call, not the whole sequence.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::coordinator::Coordinator;
use crate::error::{Error, Result};
use crate::slot::CredentialSlot;

/// Exclusive borrow of one credential slot.
pub struct Lease {
    slot: Arc<CredentialSlot>,
    token: String,
    coordinator: Arc<dyn Coordinator>,
    window: Duration,
    lock_ttl: Duration,
    in_flight: Option<u64>,
    released: bool,
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("label", &self.slot.label())
            .field("in_flight", &self.in_flight)
            .field("released", &self.released)
            .finish()
    }
}

impl Lease {
    pub(crate) fn new(
        slot: Arc<CredentialSlot>,
        token: String,
        coordinator: Arc<dyn Coordinator>,
        window: Duration,
        lock_ttl: Duration,
    ) -> Self {
        Self {
            slot,
            token,
            coordinator,
            window,
            lock_ttl,
            in_flight: None,
            released: false,
        }
    }

    pub fn label(&self) -> &str {
        self.slot.label()
    }

    pub fn secret(&self) -> &str {
        self.slot.secret()
    }

    pub fn slot(&self) -> &Arc<CredentialSlot> {
        &self.slot
    }

    /// Lock token proving ownership of the slot's lock.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Mark `tokens` as sent upstream but not yet accounted for. Recorded
    /// on drop if the lease is never settled.
    pub fn set_in_flight(&mut self, tokens: u64) {
        self.in_flight = Some(tokens);
    }

    /// Forget in-flight usage, e.g. after the upstream refused the call.
    pub fn clear_in_flight(&mut self) {
        self.in_flight = None;
    }

    /// Append a usage entry to the slot's ledger and settle in-flight usage.
    pub async fn record_usage(&mut self, tokens: u64) -> Result<()> {
        self.in_flight = None;
        self.coordinator
            .ledger_push(&self.slot.keys().usage, tokens, self.window)
            .await
    }

    /// Restart the lock's TTL. Fails with `LockLost` if the lock already
    /// expired, since another holder may have taken the slot since.
    pub async fn extend(&self) -> Result<()> {
        let refreshed = self
            .coordinator
            .compare_and_expire(&self.slot.keys().lock, &self.token, self.lock_ttl)
            .await?;
        if !refreshed {
            warn!(label = self.slot.label(), "lock expired while held");
            return Err(Error::LockLost(self.slot.label().to_string()));
        }
        debug!(label = self.slot.label(), "lock extended");
        Ok(())
    }

    /// Release the lock. Returns `false` if the lock had already expired and
    /// been taken by someone else, in which case nothing is deleted.
    ///
    /// The delete is attempted even when recording in-flight usage fails;
    /// the usage error is returned afterwards.
    pub async fn release(mut self) -> Result<bool> {
        self.released = true;
        let recorded = match self.in_flight.take() {
            Some(tokens) => {
                self.coordinator
                    .ledger_push(&self.slot.keys().usage, tokens, self.window)
                    .await
            }
            None => Ok(()),
        };
        let deleted = self
            .coordinator
            .compare_and_delete(&self.slot.keys().lock, &self.token)
            .await;
        if let Err(e) = &recorded {
            warn!(label = self.slot.label(), error = %e, "failed to record in-flight usage on release");
        }
        let deleted = deleted?;
        recorded?;
        if deleted {
            debug!(label = self.slot.label(), "credential released");
        } else {
            warn!(
                label = self.slot.label(),
                "lock expired before release; another holder may own it"
            );
        }
        Ok(deleted)
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(
                label = self.slot.label(),
                "lease dropped outside a runtime; lock will expire by TTL"
            );
            return;
        };

        let coordinator = Arc::clone(&self.coordinator);
        let slot = Arc::clone(&self.slot);
        let token = std::mem::take(&mut self.token);
        let in_flight = self.in_flight.take();
        let window = self.window;
        handle.spawn(async move {
            if let Some(tokens) = in_flight {
                if let Err(e) = coordinator
                    .ledger_push(&slot.keys().usage, tokens, window)
                    .await
                {
                    warn!(label = slot.label(), error = %e, "failed to record in-flight usage on drop");
                }
            }
            match coordinator.compare_and_delete(&slot.keys().lock, &token).await {
                Ok(_) => debug!(label = slot.label(), "credential released on drop"),
                Err(e) => {
                    warn!(label = slot.label(), error = %e, "failed to release lock on drop")
                }
            }
        });
    }
}
