//! Distributed coordination primitives
//!
//! The pool is shared by independent worker processes, so every piece of
//! mutable slot state (lock, usage ledger, cooldown, exhaustion marker) lives
//! behind the `Coordinator` trait rather than in process memory. A
//! production deployment backs it with a shared key-value service offering
//! atomic set-if-absent-with-expiry and compare-and-delete; `MemoryCoordinator`
//! provides the same semantics inside one process for single-node use and
//! tests.
//!
//! Expiry is measured with `tokio::time::Instant` so paused-clock tests can
//! advance through windows and cooldowns deterministically.

use std::collections::HashMap;
use std::time::Duration;

use common::BoxFuture;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::Result;

/// Atomic primitives the pool needs from a shared coordination service.
pub trait Coordinator: Send + Sync {
    /// Set `key` to `value` with a TTL only if it is absent. Returns whether
    /// the value was set.
    fn set_if_absent<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<bool>>;

    /// Delete `key` only if it currently holds `expected`. Returns whether a
    /// delete happened.
    fn compare_and_delete<'a>(
        &'a self,
        key: &'a str,
        expected: &'a str,
    ) -> BoxFuture<'a, Result<bool>>;

    /// Reset the TTL of `key` only if it currently holds `expected`.
    /// Returns whether the key was refreshed.
    fn compare_and_expire<'a>(
        &'a self,
        key: &'a str,
        expected: &'a str,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<bool>>;

    /// Unconditionally set `key`, with an optional TTL.
    fn set<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
        ttl: Option<Duration>,
    ) -> BoxFuture<'a, Result<()>>;

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<String>>>;

    /// Remaining time to live. `None` if the key is absent or never expires.
    fn ttl<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Duration>>>;

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<()>>;

    /// Append a usage entry that expires after `ttl`.
    fn ledger_push<'a>(
        &'a self,
        key: &'a str,
        tokens: u64,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<()>>;

    /// Sum of live ledger entries. Expired entries are purged.
    fn ledger_sum<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<u64>>;
}

enum Value {
    Text(String),
    Ledger(Vec<(Instant, u64)>),
}

struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// In-process coordinator with the same atomicity as the shared service:
/// every operation runs under one mutex.
#[derive(Default)]
pub struct MemoryCoordinator {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    fn text_of(entry: Option<&Entry>, now: Instant) -> Option<&str> {
        match &entry.filter(|e| e.live(now))?.value {
            Value::Text(text) => Some(text.as_str()),
            Value::Ledger(_) => None,
        }
    }
}

impl Coordinator for MemoryCoordinator {
    fn set_if_absent<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            let now = Instant::now();
            let mut entries = self.entries.lock().await;
            if entries.get(key).is_some_and(|e| e.live(now)) {
                return Ok(false);
            }
            entries.insert(
                key.to_string(),
                Entry {
                    value: Value::Text(value.to_string()),
                    expires_at: Some(now + ttl),
                },
            );
            Ok(true)
        })
    }

    fn compare_and_delete<'a>(
        &'a self,
        key: &'a str,
        expected: &'a str,
    ) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            let now = Instant::now();
            let mut entries = self.entries.lock().await;
            if Self::text_of(entries.get(key), now) == Some(expected) {
                entries.remove(key);
                return Ok(true);
            }
            Ok(false)
        })
    }

    fn compare_and_expire<'a>(
        &'a self,
        key: &'a str,
        expected: &'a str,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            let now = Instant::now();
            let mut entries = self.entries.lock().await;
            if Self::text_of(entries.get(key), now) != Some(expected) {
                return Ok(false);
            }
            if let Some(entry) = entries.get_mut(key) {
                entry.expires_at = Some(now + ttl);
            }
            Ok(true)
        })
    }

    fn set<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
        ttl: Option<Duration>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let expires_at = ttl.map(|ttl| Instant::now() + ttl);
            self.entries.lock().await.insert(
                key.to_string(),
                Entry {
                    value: Value::Text(value.to_string()),
                    expires_at,
                },
            );
            Ok(())
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<String>>> {
        Box::pin(async move {
            let entries = self.entries.lock().await;
            Ok(Self::text_of(entries.get(key), Instant::now()).map(str::to_string))
        })
    }

    fn ttl<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Duration>>> {
        Box::pin(async move {
            let now = Instant::now();
            let entries = self.entries.lock().await;
            Ok(entries
                .get(key)
                .filter(|e| e.live(now))
                .and_then(|e| e.expires_at)
                .map(|at| at - now))
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.entries.lock().await.remove(key);
            Ok(())
        })
    }

    fn ledger_push<'a>(
        &'a self,
        key: &'a str,
        tokens: u64,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let expires = Instant::now() + ttl;
            let mut entries = self.entries.lock().await;
            let entry = entries.entry(key.to_string()).or_insert(Entry {
                value: Value::Ledger(Vec::new()),
                expires_at: None,
            });
            if let Value::Ledger(ledger) = &mut entry.value {
                ledger.push((expires, tokens));
            } else {
                entry.value = Value::Ledger(vec![(expires, tokens)]);
            }
            Ok(())
        })
    }

    fn ledger_sum<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<u64>> {
        Box::pin(async move {
            let now = Instant::now();
            let mut entries = self.entries.lock().await;
            let Some(Entry {
                value: Value::Ledger(ledger),
                ..
            }) = entries.get_mut(key)
            else {
                return Ok(0);
            };
            ledger.retain(|(expires, _)| *expires > now);
            Ok(ledger.iter().map(|(_, tokens)| tokens).sum())
        })
    }
}
