//! Synchronous dispatch path
//!
//! Borrow a credential, make one upstream call, account for its usage, and
//! give the credential back. Failures are classified against the pool:
//!
//! - quota exceeded → slot marked exhausted, `Error::QuotaExhausted`
//! - rate limited → cooldown (provider hint or the pool default), `Error::RateLimited`
//! - anything else → propagated as `Error::Upstream`
//!
//! No internal retries: a rate-limited caller simply acquires again and the
//! pool hands it a different slot.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};
use upstream::{Completion, CompletionRequest, Upstream, estimate_tokens};

use crate::error::{Error, Result};
use crate::lease::Lease;
use crate::pool::Pool;

/// Timeouts for the dispatch path.
#[derive(Debug, Clone, Copy)]
pub struct DispatchSettings {
    pub acquire_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            acquire_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(120),
        }
    }
}

pub struct Dispatcher {
    pool: Arc<Pool>,
    upstream: Arc<dyn Upstream>,
    settings: DispatchSettings,
}

impl Dispatcher {
    pub fn new(pool: Arc<Pool>, upstream: Arc<dyn Upstream>, settings: DispatchSettings) -> Self {
        Self {
            pool,
            upstream,
            settings,
        }
    }

    /// Tokens to reserve for a request: prompt estimate plus the response cap.
    pub fn estimate(request: &CompletionRequest) -> u64 {
        estimate_tokens(&request.instructions)
            + estimate_tokens(&request.payload)
            + u64::from(request.max_response_tokens)
    }

    /// Run one completion under a borrowed credential.
    ///
    /// If this future is dropped after the call went out, the lease records
    /// the estimate on its way out, since the provider may bill the call.
    pub async fn dispatch(&self, request: &CompletionRequest) -> Result<Completion> {
        let estimate = Self::estimate(request);
        let mut lease = self
            .pool
            .acquire(estimate, self.settings.acquire_timeout)
            .await?;

        let result = self.call(&mut lease, request, estimate).await;
        if let Err(e) = lease.release().await {
            warn!(error = %e, "failed to release credential after dispatch");
        }

        let outcome = match &result {
            Ok(_) => "success",
            Err(e) => e.kind(),
        };
        metrics::counter!("dispatch_total", "outcome" => outcome).increment(1);
        result
    }

    async fn call(
        &self,
        lease: &mut Lease,
        request: &CompletionRequest,
        estimate: u64,
    ) -> Result<Completion> {
        lease.set_in_flight(estimate);
        let response = tokio::time::timeout(
            self.settings.request_timeout,
            self.upstream.complete(lease.secret(), request),
        )
        .await;

        match response {
            Ok(Ok(completion)) => {
                let used = completion
                    .usage
                    .map(|u| u.total_tokens)
                    .unwrap_or(estimate);
                lease.record_usage(used).await?;
                metrics::counter!("dispatch_tokens_total").increment(used);
                debug!(label = lease.label(), used, estimate, "dispatch succeeded");
                Ok(completion)
            }
            Ok(Err(e)) => self.classify(lease, e, estimate).await,
            Err(_) => {
                lease.record_usage(estimate).await?;
                warn!(
                    label = lease.label(),
                    timeout_secs = self.settings.request_timeout.as_secs(),
                    "upstream call timed out"
                );
                Err(Error::Upstream(upstream::Error::Transient(format!(
                    "request timed out after {:?}",
                    self.settings.request_timeout
                ))))
            }
        }
    }

    async fn classify(
        &self,
        lease: &mut Lease,
        err: upstream::Error,
        estimate: u64,
    ) -> Result<Completion> {
        match err {
            upstream::Error::QuotaExceeded(message) => {
                lease.clear_in_flight();
                self.pool.mark_exhausted(lease.slot(), &message).await?;
                Err(Error::QuotaExhausted {
                    label: lease.label().to_string(),
                    message,
                })
            }
            upstream::Error::RateLimited { retry_after, message } => {
                lease.clear_in_flight();
                let requested = retry_after.unwrap_or(self.pool.settings().default_cooldown);
                let cooldown = self.pool.set_cooldown(lease.slot(), requested).await?;
                info!(label = lease.label(), message = %message, "rate limited");
                Err(Error::RateLimited {
                    label: lease.label().to_string(),
                    cooldown,
                })
            }
            upstream::Error::Transient(message) => {
                // The request may have reached the provider
                lease.record_usage(estimate).await?;
                Err(Error::Upstream(upstream::Error::Transient(message)))
            }
            other => {
                lease.clear_in_flight();
                Err(Error::Upstream(other))
            }
        }
    }
}
