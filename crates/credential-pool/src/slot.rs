//! One credential's quota allotment
//!
//! A slot is immutable in process memory: label, secret, and budget. All of
//! its mutable state (lock, usage ledger, cooldown, exhaustion marker) lives
//! in the coordinator under the keys in `SlotKeys`, so every process that
//! shares the coordinator sees the same picture.

use std::time::Duration;

use common::Secret;

use crate::coordinator::Coordinator;
use crate::error::Result;

/// Coordinator keys for one slot: `{prefix}:{label}:{lock|usage|cooldown|exhausted}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotKeys {
    pub lock: String,
    pub usage: String,
    pub cooldown: String,
    pub exhausted: String,
}

impl SlotKeys {
    pub fn new(prefix: &str, label: &str) -> Self {
        Self {
            lock: format!("{prefix}:{label}:lock"),
            usage: format!("{prefix}:{label}:usage"),
            cooldown: format!("{prefix}:{label}:cooldown"),
            exhausted: format!("{prefix}:{label}:exhausted"),
        }
    }
}

/// Why a slot can or cannot take a request right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Eligibility {
    Eligible,
    /// Removed for good by some process; carries the recorded reason
    Exhausted(String),
    CoolingDown(Duration),
    Locked,
    OverBudget { used: u64, budget: u64 },
}

impl Eligibility {
    pub fn label(&self) -> &'static str {
        match self {
            Eligibility::Eligible => "available",
            Eligibility::Exhausted(_) => "exhausted",
            Eligibility::CoolingDown(_) => "cooling_down",
            Eligibility::Locked => "locked",
            Eligibility::OverBudget { .. } => "over_budget",
        }
    }
}

/// A credential with a per-window token budget.
#[derive(Debug)]
pub struct CredentialSlot {
    label: String,
    secret: Secret<String>,
    token_budget: u64,
    keys: SlotKeys,
}

impl CredentialSlot {
    pub fn new(
        key_prefix: &str,
        label: impl Into<String>,
        secret: Secret<String>,
        token_budget: u64,
    ) -> Self {
        let label = label.into();
        let keys = SlotKeys::new(key_prefix, &label);
        Self {
            label,
            secret,
            token_budget,
            keys,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn secret(&self) -> &str {
        self.secret.expose()
    }

    pub fn token_budget(&self) -> u64 {
        self.token_budget
    }

    pub fn keys(&self) -> &SlotKeys {
        &self.keys
    }

    /// Tokens used within the current window. Stale entries are purged.
    pub async fn usage(&self, coordinator: &dyn Coordinator) -> Result<u64> {
        coordinator.ledger_sum(&self.keys.usage).await
    }

    /// Check whether the slot could take `tokens` more right now.
    ///
    /// Checks are ordered cheapest-to-decide first: exhaustion, cooldown,
    /// lock, then projected usage against the budget.
    pub async fn eligibility(
        &self,
        coordinator: &dyn Coordinator,
        tokens: u64,
    ) -> Result<Eligibility> {
        if let Some(reason) = coordinator.get(&self.keys.exhausted).await? {
            return Ok(Eligibility::Exhausted(reason));
        }
        if let Some(remaining) = coordinator.ttl(&self.keys.cooldown).await? {
            return Ok(Eligibility::CoolingDown(remaining));
        }
        if coordinator.get(&self.keys.lock).await?.is_some() {
            return Ok(Eligibility::Locked);
        }
        let used = self.usage(coordinator).await?;
        if used.saturating_add(tokens) > self.token_budget {
            return Ok(Eligibility::OverBudget {
                used,
                budget: self.token_budget,
            });
        }
        Ok(Eligibility::Eligible)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::MemoryCoordinator;

    fn slot(budget: u64) -> CredentialSlot {
        CredentialSlot::new("pool", "alpha", Secret::new("sk-alpha".to_string()), budget)
    }

    #[test]
    fn keys_follow_prefix_and_label() {
        let keys = SlotKeys::new("batch", "acct-1");
        assert_eq!(keys.lock, "batch:acct-1:lock");
        assert_eq!(keys.usage, "batch:acct-1:usage");
        assert_eq!(keys.cooldown, "batch:acct-1:cooldown");
        assert_eq!(keys.exhausted, "batch:acct-1:exhausted");
    }

    #[test]
    fn debug_does_not_leak_secret() {
        let rendered = format!("{:?}", slot(10));
        assert!(!rendered.contains("sk-alpha"), "{rendered}");
    }

    #[tokio::test]
    async fn fresh_slot_is_eligible() {
        let c = MemoryCoordinator::new();
        assert_eq!(
            slot(1000).eligibility(&c, 1000).await.unwrap(),
            Eligibility::Eligible
        );
    }

    #[tokio::test]
    async fn projected_usage_over_budget() {
        let c = MemoryCoordinator::new();
        let s = slot(1000);
        c.ledger_push(&s.keys().usage, 700, Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(s.eligibility(&c, 300).await.unwrap(), Eligibility::Eligible);
        assert_eq!(
            s.eligibility(&c, 301).await.unwrap(),
            Eligibility::OverBudget {
                used: 700,
                budget: 1000
            }
        );
    }

    #[tokio::test]
    async fn exhaustion_wins_over_other_states() {
        let c = MemoryCoordinator::new();
        let s = slot(1000);
        c.set(&s.keys().cooldown, "1", Some(Duration::from_secs(5)))
            .await
            .unwrap();
        c.set(&s.keys().exhausted, "quota gone", None).await.unwrap();

        assert_eq!(
            s.eligibility(&c, 1).await.unwrap(),
            Eligibility::Exhausted("quota gone".into())
        );
    }

    #[tokio::test]
    async fn locked_slot_is_not_eligible() {
        let c = MemoryCoordinator::new();
        let s = slot(1000);
        c.set_if_absent(&s.keys().lock, "token", Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(s.eligibility(&c, 1).await.unwrap(), Eligibility::Locked);
    }
}
