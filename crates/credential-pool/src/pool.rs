//! Pool membership and fair slot selection
//!
//! The pool holds the set of slots this process may draw from. Selection
//! re-shuffles the candidates on every sweep so concurrent acquirers spread
//! across slots instead of piling onto the first eligible one. Eligibility
//! and locking go through the coordinator, so the pool is safe to share
//! across processes; the local slot list only decides which labels this
//! process considers.
//!
//! Slot lifecycle:
//! 1. Configured at startup, or added later via `add_slot`
//! 2. `acquire` locks an eligible slot and hands out a `Lease`
//! 3. A rate limit puts the slot in a cooldown (capped, never shortened)
//! 4. A quota error marks it exhausted: the marker is shared, the slot retires
//! 5. `reinstate` clears the marker and returns a retired slot to selection
//!
//! When the last slot retires the pool is exhausted. That is surfaced as
//! `Error::PoolExhausted` from `mark_exhausted` and every later `acquire`;
//! deciding whether that stops the process is left to the caller.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::coordinator::Coordinator;
use crate::error::{Error, Result};
use crate::lease::Lease;
use crate::slot::{CredentialSlot, Eligibility};

/// Tunables shared by every slot in the pool.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Prefix for every coordinator key
    pub key_prefix: String,
    /// Rolling window the token budget applies to
    pub window: Duration,
    /// Lock expiry; must exceed the longest in-flight call
    pub lock_ttl: Duration,
    /// Sleep between sweeps when nothing is eligible
    pub backoff: Duration,
    /// Cooldown applied to a rate limit without a retry-after hint
    pub default_cooldown: Duration,
    /// Upper bound for any single cooldown
    pub max_cooldown: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            key_prefix: "credential-pool".into(),
            window: Duration::from_secs(60),
            lock_ttl: Duration::from_secs(180),
            backoff: Duration::from_millis(250),
            default_cooldown: Duration::from_secs(5),
            max_cooldown: Duration::from_secs(30 * 60),
        }
    }
}

/// Shared pool of interchangeable credentials.
pub struct Pool {
    slots: RwLock<Vec<Arc<CredentialSlot>>>,
    retired: RwLock<HashMap<String, Arc<CredentialSlot>>>,
    coordinator: Arc<dyn Coordinator>,
    settings: PoolSettings,
}

impl Pool {
    pub fn new(
        slots: Vec<CredentialSlot>,
        coordinator: Arc<dyn Coordinator>,
        settings: PoolSettings,
    ) -> Self {
        info!(slots = slots.len(), prefix = %settings.key_prefix, "pool initialized");
        Self {
            slots: RwLock::new(slots.into_iter().map(Arc::new).collect()),
            retired: RwLock::new(HashMap::new()),
            coordinator,
            settings,
        }
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    pub fn coordinator(&self) -> &Arc<dyn Coordinator> {
        &self.coordinator
    }

    /// Build a slot using this pool's key prefix.
    pub fn slot(&self, label: impl Into<String>, secret: String, token_budget: u64) -> CredentialSlot {
        CredentialSlot::new(
            &self.settings.key_prefix,
            label,
            common::Secret::new(secret),
            token_budget,
        )
    }

    /// Borrow any slot that can take `tokens` more within its window.
    ///
    /// Sweeps a shuffled copy of the slot list, locking the first eligible
    /// candidate. Lock contention moves on to the next candidate; a sweep
    /// with no success sleeps `backoff` and tries again. Fails with
    /// `AcquireTimeout` once `timeout` has elapsed, or immediately with
    /// `PoolExhausted` if no slots remain. Dropping the future while waiting
    /// has no side effects.
    pub async fn acquire(&self, tokens: u64, timeout: Duration) -> Result<Lease> {
        let started = Instant::now();
        let deadline = started + timeout;

        loop {
            let mut candidates = self.slots.read().await.clone();
            if candidates.is_empty() {
                metrics::counter!("pool_acquire_total", "outcome" => "pool_exhausted").increment(1);
                return Err(Error::PoolExhausted(self.exhausted_message().await));
            }
            candidates.shuffle(&mut rand::rng());

            for slot in candidates {
                if let Some(lease) = self.try_lock(&slot, tokens).await? {
                    metrics::counter!("pool_acquire_total", "outcome" => "acquired").increment(1);
                    metrics::histogram!("pool_acquire_wait_seconds")
                        .record(started.elapsed().as_secs_f64());
                    return Ok(lease);
                }
            }

            let now = Instant::now();
            if now >= deadline {
                metrics::counter!("pool_acquire_total", "outcome" => "timeout").increment(1);
                warn!(tokens, timeout_ms = timeout.as_millis() as u64, "no credential available");
                return Err(Error::AcquireTimeout(timeout));
            }
            tokio::time::sleep(self.settings.backoff.min(deadline - now)).await;
        }
    }

    /// Borrow one specific slot, waiting up to `timeout` for it to qualify.
    pub async fn acquire_label(
        &self,
        label: &str,
        tokens: u64,
        timeout: Duration,
    ) -> Result<Lease> {
        let deadline = Instant::now() + timeout;

        loop {
            let slot = self
                .find(label)
                .await
                .ok_or_else(|| Error::NotFound(label.to_string()))?;
            if let Some(lease) = self.try_lock(&slot, tokens).await? {
                metrics::counter!("pool_acquire_total", "outcome" => "acquired").increment(1);
                return Ok(lease);
            }

            let now = Instant::now();
            if now >= deadline {
                metrics::counter!("pool_acquire_total", "outcome" => "timeout").increment(1);
                return Err(Error::AcquireTimeout(timeout));
            }
            tokio::time::sleep(self.settings.backoff.min(deadline - now)).await;
        }
    }

    /// Check one slot and lock it if eligible.
    async fn try_lock(&self, slot: &Arc<CredentialSlot>, tokens: u64) -> Result<Option<Lease>> {
        match slot.eligibility(self.coordinator.as_ref(), tokens).await? {
            Eligibility::Eligible => {}
            Eligibility::Exhausted(reason) => {
                // Another process exhausted it; stop considering it here too
                self.retire(slot.label(), &reason).await;
                return Ok(None);
            }
            other => {
                debug!(label = slot.label(), state = other.label(), "slot not eligible");
                return Ok(None);
            }
        }

        let token = uuid::Uuid::new_v4().to_string();
        let locked = self
            .coordinator
            .set_if_absent(&slot.keys().lock, &token, self.settings.lock_ttl)
            .await?;
        if !locked {
            debug!(label = slot.label(), "lock contention, trying next slot");
            return Ok(None);
        }

        // Usage read before the lock may be stale; the lock holder's view is not
        let used = slot.usage(self.coordinator.as_ref()).await?;
        if used.saturating_add(tokens) > slot.token_budget() {
            self.coordinator
                .compare_and_delete(&slot.keys().lock, &token)
                .await?;
            debug!(label = slot.label(), used, tokens, "budget used up while locking");
            return Ok(None);
        }

        debug!(label = slot.label(), tokens, "credential acquired");
        Ok(Some(Lease::new(
            Arc::clone(slot),
            token,
            Arc::clone(&self.coordinator),
            self.settings.window,
            self.settings.lock_ttl,
        )))
    }

    /// Release a lease. Equivalent to `lease.release()`.
    pub async fn release(&self, lease: Lease) -> Result<bool> {
        lease.release().await
    }

    /// Append a usage entry that expires after the window.
    pub async fn record_usage(&self, slot: &CredentialSlot, tokens: u64) -> Result<()> {
        self.coordinator
            .ledger_push(&slot.keys().usage, tokens, self.settings.window)
            .await
    }

    /// Black out a slot for `duration`, independent of its lock.
    ///
    /// The duration is capped at `max_cooldown`, and a longer cooldown that
    /// is already running is left alone. Returns the cooldown in effect.
    pub async fn set_cooldown(&self, slot: &CredentialSlot, duration: Duration) -> Result<Duration> {
        let requested = duration.min(self.settings.max_cooldown);
        if let Some(existing) = self.coordinator.ttl(&slot.keys().cooldown).await? {
            if existing >= requested {
                debug!(
                    label = slot.label(),
                    existing_secs = existing.as_secs(),
                    "longer cooldown already active"
                );
                return Ok(existing);
            }
        }

        self.coordinator
            .set(&slot.keys().cooldown, "1", Some(requested))
            .await?;
        metrics::counter!("pool_cooldowns_total").increment(1);
        info!(
            label = slot.label(),
            cooldown_ms = requested.as_millis() as u64,
            "credential entering cooldown"
        );
        Ok(requested)
    }

    /// Permanently remove a slot after its quota ran out.
    ///
    /// Writes the shared exhaustion marker so other processes skip it, then
    /// retires the slot locally. Returns `PoolExhausted` if this removed the
    /// last slot.
    pub async fn mark_exhausted(&self, slot: &CredentialSlot, reason: &str) -> Result<()> {
        self.coordinator
            .set(&slot.keys().exhausted, reason, None)
            .await?;
        metrics::counter!("pool_exhausted_total").increment(1);
        let remaining = self.retire(slot.label(), reason).await;
        if remaining == 0 {
            error!("every credential in the pool is exhausted");
            return Err(Error::PoolExhausted(self.exhausted_message().await));
        }
        Ok(())
    }

    /// Move a slot from the selection set to the retired set. Returns the
    /// number of slots left.
    async fn retire(&self, label: &str, reason: &str) -> usize {
        let mut slots = self.slots.write().await;
        if let Some(pos) = slots.iter().position(|s| s.label() == label) {
            let slot = slots.remove(pos);
            self.retired.write().await.insert(label.to_string(), slot);
            warn!(label, reason, remaining = slots.len(), "credential exhausted, removed from pool");
        }
        slots.len()
    }

    /// Retire every local slot whose exhaustion marker another process set.
    /// Returns the number of slots left.
    pub async fn sync_exhausted(&self) -> Result<usize> {
        let snapshot = self.slots.read().await.clone();
        for slot in snapshot {
            if let Some(reason) = self.coordinator.get(&slot.keys().exhausted).await? {
                self.retire(slot.label(), &reason).await;
            }
        }
        Ok(self.slots.read().await.len())
    }

    /// Return a retired slot to selection, clearing its exhaustion marker
    /// and any cooldown.
    pub async fn reinstate(&self, label: &str) -> Result<()> {
        let slot = self
            .retired
            .write()
            .await
            .remove(label)
            .ok_or_else(|| Error::NotFound(label.to_string()))?;
        self.coordinator.delete(&slot.keys().exhausted).await?;
        self.coordinator.delete(&slot.keys().cooldown).await?;
        self.slots.write().await.push(slot);
        info!(label, "credential reinstated");
        Ok(())
    }

    /// Add a slot. Returns `false` if the label is already known.
    pub async fn add_slot(&self, slot: CredentialSlot) -> bool {
        let mut slots = self.slots.write().await;
        let label = slot.label().to_string();
        if slots.iter().any(|s| s.label() == label) || self.retired.read().await.contains_key(&label)
        {
            return false;
        }
        slots.push(Arc::new(slot));
        info!(label, "credential added to pool");
        true
    }

    /// Drop a slot from the pool entirely, active or retired.
    pub async fn remove_slot(&self, label: &str) -> bool {
        let mut slots = self.slots.write().await;
        let before = slots.len();
        slots.retain(|s| s.label() != label);
        let removed = slots.len() != before || self.retired.write().await.remove(label).is_some();
        if removed {
            info!(label, "credential removed from pool");
        }
        removed
    }

    /// Labels currently eligible for selection, in configuration order.
    pub async fn labels(&self) -> Vec<String> {
        self.slots
            .read()
            .await
            .iter()
            .map(|s| s.label().to_string())
            .collect()
    }

    pub async fn is_exhausted(&self) -> bool {
        self.slots.read().await.is_empty()
    }

    /// Look up an active slot by label.
    pub async fn find(&self, label: &str) -> Option<Arc<CredentialSlot>> {
        self.slots
            .read()
            .await
            .iter()
            .find(|s| s.label() == label)
            .cloned()
    }

    /// Pool health summary.
    ///
    /// Per-slot state and usage plus an overall status: every slot
    /// available → healthy, some → degraded, none → unhealthy.
    pub async fn health(&self) -> serde_json::Value {
        let slots = self.slots.read().await.clone();
        let retired = self.retired.read().await;

        let mut entries = Vec::new();
        let mut available = 0usize;
        let mut cooling = 0usize;
        let mut locked = 0usize;

        for slot in &slots {
            let usage = slot.usage(self.coordinator.as_ref()).await.unwrap_or(0);
            let mut entry = serde_json::json!({
                "label": slot.label(),
                "usage": usage,
                "budget": slot.token_budget(),
            });
            match slot.eligibility(self.coordinator.as_ref(), 0).await {
                Ok(Eligibility::CoolingDown(remaining)) => {
                    cooling += 1;
                    entry["status"] = "cooling_down".into();
                    entry["cooldown_remaining_secs"] = remaining.as_secs().into();
                }
                Ok(Eligibility::Locked) => {
                    locked += 1;
                    entry["status"] = "locked".into();
                }
                Ok(state) => {
                    if matches!(state, Eligibility::Eligible | Eligibility::OverBudget { .. }) {
                        available += 1;
                    }
                    entry["status"] = state.label().into();
                }
                Err(e) => {
                    entry["status"] = "unknown".into();
                    entry["error"] = e.to_string().into();
                }
            }
            entries.push(entry);
        }
        for label in retired.keys() {
            entries.push(serde_json::json!({"label": label, "status": "exhausted"}));
        }

        let total = slots.len();
        let status = if total > 0 && available == total {
            "healthy"
        } else if available > 0 || locked > 0 {
            "degraded"
        } else {
            "unhealthy"
        };

        serde_json::json!({
            "status": status,
            "slots_total": total + retired.len(),
            "slots_available": available,
            "slots_locked": locked,
            "slots_cooling_down": cooling,
            "slots_exhausted": retired.len(),
            "slots": entries,
        })
    }

    async fn exhausted_message(&self) -> String {
        let retired = self.retired.read().await;
        let mut labels: Vec<&String> = retired.keys().collect();
        labels.sort();
        serde_json::json!({
            "error": {
                "type": "pool_exhausted",
                "message": "All credentials exhausted",
                "pool": {
                    "slots_exhausted": retired.len(),
                    "labels": labels,
                }
            }
        })
        .to_string()
    }
}
