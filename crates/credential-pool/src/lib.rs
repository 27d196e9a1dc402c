//! Shared credential pool for a quota-constrained upstream
//!
//! Many concurrent callers, possibly in separate processes, draw from one
//! logical set of credentials. Each credential (`CredentialSlot`) has a token
//! budget over a rolling window; the pool admits a request only where the
//! projected usage fits, the slot is not cooling down, and its distributed
//! lock can be taken.
//!
//! Credential lifecycle:
//! 1. `Pool::acquire` shuffles the slots and locks an eligible one → `Lease`
//! 2. The borrower records usage (server-reported, or the estimate)
//! 3. Rate limits put the slot in a capped cooldown
//! 4. Quota errors mark it exhausted and remove it for every process
//! 5. The lease is released exactly once, explicitly or on drop
//!
//! All shared state goes through the `Coordinator` trait.

pub mod coordinator;
pub mod dispatch;
pub mod error;
pub mod lease;
pub mod pool;
pub mod slot;
pub mod sync;

pub use coordinator::{Coordinator, MemoryCoordinator};
pub use dispatch::{DispatchSettings, Dispatcher};
pub use error::{Error, Result};
pub use lease::Lease;
pub use pool::{Pool, PoolSettings};
pub use slot::{CredentialSlot, Eligibility, SlotKeys};
pub use sync::spawn_sync_task;
