//! Shared types for the batch dispatch workspace
//!
//! Holds the pieces every crate reaches for: the configuration error type,
//! the redacting `Secret` wrapper for credential material, the boxed future
//! alias used by the dyn-compatible service traits, and wall-clock helpers.

mod error;
mod secret;
mod time;

pub use error::{Error, Result};
pub use secret::Secret;
pub use time::{unix_millis, unix_secs};

use std::future::Future;
use std::pin::Pin;

/// Boxed, sendable future returned by the dyn-compatible traits
/// (`Upstream`, `Coordinator`, `BatchStore`, `BatchHandler`).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
