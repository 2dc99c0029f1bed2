use anyhow::Context;
use hostdeck::config::Config;
use hostdeck::db::Database;
use hostdeck::docker::DockerEngine;
use hostdeck::engine::ContainerEngine;
use hostdeck::platform::Platform;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("hostdeck=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("hostdeck.toml"));

    let config = Config::load_or_default(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    let bind_addr: SocketAddr = config
        .server
        .bind
        .parse()
        .with_context(|| format!("invalid bind address '{}'", config.server.bind))?;

    for dir in [config.services_dir(), config.uploads_dir()] {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }

    let db = Arc::new(Database::open(config.database_path()).context("failed to open database")?);
    let interrupted = db.fail_interrupted_builds()?;
    if interrupted > 0 {
        warn!(interrupted, "Marked deployments interrupted by the last shutdown as failed");
    }

    let engine: Arc<dyn ContainerEngine> = Arc::new(
        DockerEngine::connect(&config.engine)
            .await
            .context("failed to configure Docker client")?,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let platform = Platform::assemble(config, db, engine, shutdown_rx.clone())?;

    if platform.lifecycle.refresh_engine_status().await {
        match platform.lifecycle.reconcile_on_startup().await {
            Ok(recovered) => info!(recovered, "Services recovered"),
            Err(e) => warn!(error = %e, "Startup reconciliation failed"),
        }
    } else {
        warn!("Docker is not reachable; starting in degraded mode");
    }

    // Spawn metrics sampler
    let sampler = platform.sampler(shutdown_rx.clone());
    let sampler_handle = tokio::spawn(sampler.run());

    // Spawn the listener
    let server = platform.server(shutdown_rx.clone());
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run(bind_addr).await {
            error!(error = %e, "Server error");
        }
    });

    wait_for_signal().await;

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    info!("Stopping managed containers...");
    let shutdown_timeout = Duration::from_secs(platform.config.server.shutdown_timeout_secs);
    if tokio::time::timeout(shutdown_timeout, platform.lifecycle.stop_all_managed())
        .await
        .is_err()
    {
        warn!("Timed out stopping containers");
    }

    let Platform { worker, .. } = platform;
    let _ = tokio::time::timeout(shutdown_timeout, async {
        let _ = worker.await;
        let _ = sampler_handle.await;
        let _ = server_handle.await;
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received SIGINT (Ctrl+C), shutting down..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C, shutting down...");
    }
}

fn print_startup_banner(config: &Config) {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        bind = %config.server.bind,
        data_dir = %config.data_dir.display(),
        "Starting hostdeck"
    );
    info!(
        base_domain = ?config.proxy.base_domain,
        port_base = config.ports.base,
        metrics_interval_secs = config.metrics.interval_secs,
        "Platform settings"
    );
    info!(
        cpu = config.limits.cpu,
        memory = config.limits.memory,
        retained_images = config.pipeline.retained_images,
        "Default limits"
    );
}
