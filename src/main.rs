//! Shared stream session monitor
//!
//! One upstream fetch per stream, shared by every viewer watching it, with
//! admission ceilings per provider, health monitoring, and automatic retry.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use shared_stream_monitor::config::Config;
use shared_stream_monitor::registry::{MemoryRegistryStore, SessionRegistry};
use shared_stream_monitor::services::{
    AdmissionController, AdmissionLimits, FailureHandler, FfmpegLauncher, HealthMonitor,
    MetricsAggregator, ProcessProbe, ProcessTable, RetryCoordinator, SessionManager, TaskScheduler,
};
use shared_stream_monitor::web::{AppState, WebServer};

#[derive(Parser)]
#[command(name = "shared-stream-monitor")]
#[command(about = "Shared stream session monitor with admission control and health checking")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Override the configured listen host
    #[arg(long)]
    host: Option<String>,

    /// Override the configured listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("shared_stream_monitor={}", cli.log_level)));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = Config::load_from_file(&cli.config)
        .with_context(|| format!("failed to load config from {}", cli.config))?;
    if let Some(host) = cli.host {
        config.web.host = host;
    }
    if let Some(port) = cli.port {
        config.web.port = port;
    }

    info!(
        "Starting {} v{}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );

    let profiles = config
        .resolved_profiles()
        .context("transcode profile validation failed")?;
    if profiles.is_empty() {
        warn!("no transcode profiles configured, every attach will be rejected");
    }

    tokio::fs::create_dir_all(&config.relay.segment_root)
        .await
        .with_context(|| {
            format!(
                "failed to create segment root {}",
                config.relay.segment_root.display()
            )
        })?;

    let registry = Arc::new(SessionRegistry::new(Arc::new(MemoryRegistryStore::new())));
    let processes = Arc::new(ProcessTable::new());
    let scheduler = TaskScheduler::new();
    let limits = AdmissionLimits::from_config(&config.limits);

    let metrics = Arc::new(MetricsAggregator::new(
        registry.clone(),
        limits.clone(),
        &config.metrics,
    ));
    let launcher = Arc::new(FfmpegLauncher::new(
        config.relay.ffmpeg_command.clone(),
        config.relay.segment_root.clone(),
    ));
    let coordinator = RetryCoordinator::new(
        registry.clone(),
        processes.clone(),
        launcher.clone(),
        profiles.clone(),
        scheduler.clone(),
        metrics.clone(),
        &config.relay,
        &config.streaming,
    );
    let failures: Arc<dyn FailureHandler> = Arc::new(coordinator);
    let monitor = Arc::new(HealthMonitor::new(
        registry.clone(),
        processes.clone(),
        Arc::new(ProcessProbe::new(processes.clone())),
        metrics.clone(),
        failures,
        scheduler.clone(),
        &config.streaming,
    ));
    let admission = Arc::new(AdmissionController::new(
        registry.clone(),
        limits,
        config.streaming.monitor_tries,
        config.limits.retry_after,
    ));
    let manager = Arc::new(SessionManager::new(
        registry,
        admission,
        processes,
        launcher,
        profiles,
        monitor,
        scheduler.clone(),
        &config.streaming,
    ));

    let state = AppState {
        manager: manager.clone(),
        metrics,
    };

    let shutdown = CancellationToken::new();
    let server = WebServer::new(
        config.web.host.clone(),
        config.web.port,
        config.web.request_timeout,
    );
    let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();
    let server_shutdown = shutdown.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server
            .serve_with_signal(state, ready_tx, server_shutdown)
            .await
        {
            error!("web server failed: {e}");
        }
    });

    match ready_rx.await {
        Ok(addr) => info!("ready, serving on {addr}"),
        Err(_) => {
            anyhow::bail!("web server failed to start");
        }
    }

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, stopping");

    shutdown.cancel();
    manager.shutdown().await;
    let _ = server_handle.await;

    info!("shutdown complete");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for ctrl-c: {e}");
        }
    };

    #[cfg(unix)]
    {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(e) => {
                    error!("failed to listen for SIGTERM: {e}");
                    ctrl_c.await;
                    return;
                }
            };
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    ctrl_c.await;
}
