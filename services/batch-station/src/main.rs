//! Batch Station
//!
//! Single-binary service that:
//! 1. Takes work items from an inbox directory and splits them into calls
//! 2. Packs pending calls into bounded batch files
//! 3. Runs one upload/poll loop per pooled credential
//! 4. Stores batch results and returns unanswered calls to pending
//!
//! Direct mode skips batching and sends each call through the dispatcher.
//! The process exits non-zero once every credential is exhausted.

mod config;
mod error;
mod intake;
mod metrics;
mod station;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use batch_orchestrator::{
    BatchHandler, FileSource, Orchestrator, QueueSource, generate_run, spawn_poll_loops,
};
use batch_store::{BatchStore, LocalStore};
use credential_pool::{Coordinator, CredentialSlot, Dispatcher, MemoryCoordinator, Pool};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use upstream::{HttpUpstream, Upstream};

use crate::config::{Config, IntakeMode};
use crate::intake::Intake;
use crate::station::StationHandler;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting batch-station");

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let mut config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        credentials = config.credentials.len(),
        base_url = %config.upstream.base_url,
        mode = ?config.intake.mode,
        "configuration loaded"
    );

    // Install the exporter before any metrics are emitted
    metrics::install_exporter(config.metrics.listen_addr)?;
    info!(addr = %config.metrics.listen_addr, "metrics exporter listening");

    let pool_settings = config.pool_settings();
    let mut slots = Vec::with_capacity(config.credentials.len());
    let mut source = QueueSource::new();
    for credential in &mut config.credentials {
        let secret = credential
            .secret
            .take()
            .with_context(|| format!("credential {} has no secret", credential.label))?;
        let budget = credential.token_budget.unwrap_or(config.pool.token_budget);
        slots.push(CredentialSlot::new(
            &pool_settings.key_prefix,
            credential.label.as_str(),
            secret,
            budget,
        ));
        if let Some(limit) = credential.batch_token_limit {
            source = source.with_token_limit(credential.label.as_str(), limit);
        }
    }
    let labels: Vec<String> = config.credentials.iter().map(|c| c.label.clone()).collect();

    let coordinator: Arc<dyn Coordinator> = Arc::new(MemoryCoordinator::new());
    let pool = Arc::new(Pool::new(slots, coordinator, pool_settings));

    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
        .context("failed to build HTTP client")?;
    let upstream: Arc<dyn Upstream> = Arc::new(HttpUpstream::new(
        client,
        config.upstream.base_url.clone(),
        Duration::from_secs(config.upstream.request_timeout_secs),
        config.upstream.max_response_bytes,
    ));

    let store_path = config.orchestrator.store_path.clone();
    if let Some(parent) = store_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let store: Arc<dyn BatchStore> = Arc::new(
        LocalStore::load(store_path.clone())
            .await
            .with_context(|| format!("failed to open store {}", store_path.display()))?,
    );

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&pool),
        Arc::clone(&upstream),
        config.dispatch_settings(),
    ));
    let handler: Arc<dyn BatchHandler> = Arc::new(StationHandler::new(
        Arc::clone(&store),
        Arc::clone(&upstream),
        Arc::clone(&pool),
        config.orchestrator.finished_dir.clone(),
        Duration::from_secs(config.orchestrator.batch_failure_cooldown_secs),
    ));
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&pool),
        Arc::clone(&upstream),
        Arc::clone(&store),
        handler,
        config.orchestrator_settings(),
    ));
    let source = Arc::new(source);

    let sync = credential_pool::spawn_sync_task(
        Arc::clone(&pool),
        Duration::from_secs(config.pool.sync_interval_secs),
    );

    let intake = Intake::new(
        config.intake.clone(),
        Arc::clone(&store),
        dispatcher,
        config.orchestrator.finished_dir.clone(),
    );
    let mut intake_task = tokio::spawn(intake_loop(
        intake,
        Duration::from_secs(config.intake.interval_secs),
    ));

    let batch_mode = config.intake.mode == IntakeMode::Batch;
    let mut generate_task = tokio::spawn(generate_loop(
        Arc::clone(&store),
        Arc::clone(&source),
        GenerateOptions {
            enabled: batch_mode,
            dir: config.writer.output_dir.clone(),
            limits: config.file_limits(),
            concurrency: config.writer.concurrency,
            interval: Duration::from_secs(config.orchestrator.generate_interval_secs),
        },
    ));

    let mut loops = spawn_poll_loops(
        Arc::clone(&orchestrator),
        labels,
        Arc::clone(&source) as Arc<dyn FileSource>,
    );
    info!(loops = loops.len(), "station running");

    let outcome = tokio::select! {
        _ = shutdown_signal() => Ok(()),
        result = &mut intake_task => flatten("intake", result),
        result = &mut generate_task => flatten("generation", result),
        result = wait_for_loops(&mut loops) => result,
    };

    sync.abort();
    intake_task.abort();
    generate_task.abort();
    loops.abort_all();

    match &outcome {
        Ok(()) => info!("shutdown complete"),
        Err(e) => {
            let health = pool.health().await;
            error!(error = %e, %health, "station stopping");
        }
    }
    outcome
}

/// Take in inbox files until the pool is exhausted.
async fn intake_loop(intake: Intake, interval: Duration) -> Result<()> {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        match intake.scan_once().await {
            Ok(0) => {}
            Ok(items) => info!(items, "work items taken in"),
            Err(e) => return Err(e).context("intake stopped"),
        }
    }
}

struct GenerateOptions {
    enabled: bool,
    dir: std::path::PathBuf,
    limits: batch_writer::FileLimits,
    concurrency: usize,
    interval: Duration,
}

/// Pack pending lines into new files whenever the previous files are all
/// uploaded.
async fn generate_loop(
    store: Arc<dyn BatchStore>,
    source: Arc<QueueSource>,
    options: GenerateOptions,
) -> Result<()> {
    if !options.enabled {
        return std::future::pending().await;
    }
    let mut ticker = tokio::time::interval(options.interval);
    loop {
        ticker.tick().await;
        if !source.is_idle().await {
            continue;
        }
        let stamp = common::unix_millis();
        match generate_run(
            Arc::clone(&store),
            &options.dir,
            options.limits,
            stamp,
            options.concurrency,
        )
        .await
        {
            Ok(run) if run.files.is_empty() => {}
            Ok(run) => {
                info!(
                    stamp,
                    files = run.files.len(),
                    lines = run.total_lines(),
                    "new batch files queued"
                );
                source.push(run.files).await;
            }
            Err(e) => warn!(error = %e, "generation run failed, will retry next tick"),
        }
    }
}

/// Resolve when the first loop ends with an error, or when every loop ended.
async fn wait_for_loops(loops: &mut tokio::task::JoinSet<batch_orchestrator::Result<()>>) -> Result<()> {
    while let Some(joined) = loops.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e).context("credential loop stopped"),
            Err(e) => return Err(e).context("credential loop panicked"),
        }
    }
    anyhow::bail!("no credential loops left")
}

fn flatten(task: &str, result: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    match result {
        Ok(inner) => inner,
        Err(e) => Err(e).with_context(|| format!("{task} task panicked")),
    }
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
