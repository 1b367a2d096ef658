//! Video generation worker binary.

use std::sync::Arc;

use anyhow::{anyhow, Context};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use vgen_media::check_ffmpeg;
use vgen_providers::ProvidersConfig;
use vgen_queue::RedisQueueStore;
use vgen_worker::{metrics, Orchestrator, WorkerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider (required for TLS/HTTPS)
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install rustls crypto provider"))?;

    // Load environment variables
    dotenvy::dotenv().ok();

    // Colored output for dev, JSON for production
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let env_filter = EnvFilter::from_default_env()
        .add_directive("vgen=info".parse()?)
        .add_directive("reqwest=warn".parse()?);

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_ansi(true)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .with(env_filter)
            .init();
    }

    info!("Starting vgen-worker");

    if let Ok(addr) = std::env::var("METRICS_ADDR") {
        let addr = addr.parse().context("METRICS_ADDR must be host:port")?;
        metrics::init_metrics(addr)?;
        info!("Metrics listening on {}", addr);
    }

    match check_ffmpeg() {
        Ok(path) => info!("Using ffmpeg at {}", path.display()),
        Err(e) => warn!("Renders will fail until ffmpeg is installed: {}", e),
    }

    let config = WorkerConfig::from_env();
    info!("Worker config: {:?}", config);

    let providers_config = ProvidersConfig::from_env().context("provider configuration")?;
    let providers = providers_config.build().context("building providers")?;
    let selector = Arc::new(providers_config.selector());
    let store = RedisQueueStore::from_env().context("connecting queue")?;

    let orchestrator = Orchestrator::builder(config)
        .providers(providers)
        .selector(selector)
        .queue(Arc::new(store))
        .build();

    let initial = orchestrator.refresh_providers().await;
    info!(
        available = initial.iter().filter(|d| d.available).count(),
        total = initial.len(),
        "Initial provider probe finished"
    );

    let processor = orchestrator
        .processor()
        .cloned()
        .ok_or_else(|| anyhow!("queue processor missing"))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let processor_handle = tokio::spawn(async move { processor.run(shutdown_rx).await });

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");
    shutdown_tx.send(true).ok();

    processor_handle.await?;
    orchestrator.shutdown().await;

    info!("Worker shutdown complete");
    Ok(())
}
