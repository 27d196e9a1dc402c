//! Prometheus metrics exposition
//!
//! The library crates emit through the `metrics` facade; this module installs
//! the Prometheus exporter and records the station's own series:
//!
//! - `station_correlation_mismatch_total` (counter)
//! - `station_responses_total` (counter): label `kind` (`result`, `error`)
//! - `station_lines_reset_total` (counter): label `reason`
//! - `station_intake_units_total` (counter): label `mode`

use std::net::SocketAddr;

use anyhow::Context;
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder};

/// Buckets for `pool_acquire_wait_seconds`, from an immediate grant up to a
/// full acquire timeout.
const ACQUIRE_WAIT_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

fn builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new().set_buckets_for_metric(
        Matcher::Full("pool_acquire_wait_seconds".to_string()),
        ACQUIRE_WAIT_BUCKETS,
    )
}

/// Install the Prometheus recorder and serve `/metrics` on `listen_addr`.
///
/// Must run inside the tokio runtime; the exporter's listener is spawned
/// onto it.
pub fn install_exporter(listen_addr: SocketAddr) -> anyhow::Result<()> {
    builder()
        .context("failed to set histogram buckets")?
        .with_http_listener(listen_addr)
        .install()
        .with_context(|| format!("failed to install Prometheus exporter on {listen_addr}"))
}

/// Record responses whose correlation id had no line in their batch.
pub fn record_correlation_mismatch(count: usize) {
    metrics::counter!("station_correlation_mismatch_total").increment(count as u64);
}

pub fn record_responses(kind: &'static str, count: usize) {
    metrics::counter!("station_responses_total", "kind" => kind).increment(count as u64);
}

pub fn record_lines_reset(reason: &'static str, count: usize) {
    metrics::counter!("station_lines_reset_total", "reason" => reason).increment(count as u64);
}

pub fn record_intake_unit(mode: &'static str) {
    metrics::counter!("station_intake_units_total", "mode" => mode).increment(1);
}
