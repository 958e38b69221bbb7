//! kubesolv controller
//!
//! Runs the reconciliation engine against an in-memory resource store and
//! the mock execution substrate, optionally preloaded from a seed manifest.

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use kubesolv_controller::{
    config::{self, Config},
    Controller, InMemoryStore, MockSubstrate, ResourceStore,
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::parse();
    let settings = config.settings()?;

    // Initialize tracing (prefer RUST_LOG, fallback to KUBESOLV_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting kubesolv controller");
    info!(
        workers = settings.workers,
        job_max_retries = settings.reconciler.max_job_retries,
        gc_interval_secs = settings.gc_interval.as_secs(),
        "Configuration loaded"
    );

    let store = Arc::new(InMemoryStore::new());
    if let Some(path) = &config.seed {
        let resources = match config::read_seed(path) {
            Ok(resources) => resources,
            Err(e) => {
                error!(error = %e, "Failed to load seed manifest");
                return Err(e.into());
            }
        };
        let count = resources.len();
        for resource in resources {
            let target = resource.object_ref();
            if let Err(e) = store.create(resource).await {
                warn!(target = %target, error = %e, "Skipping seed resource");
            }
        }
        info!(path = %path.display(), resources = count, "Seed manifest loaded");
    }

    let substrate = Arc::new(MockSubstrate::new());
    let controller = Controller::new(store, substrate, settings.clone());

    // Create shutdown channel for graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let controller_handle = tokio::spawn(async move { controller.run(shutdown_rx).await });

    // Wait for shutdown signal (Ctrl+C)
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received shutdown signal"),
        Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
    }

    // Signal shutdown to all workers
    let _ = shutdown_tx.send(true);

    // The controller applies the grace period itself; allow a little slack.
    let deadline = settings.shutdown_grace + std::time::Duration::from_secs(1);
    match tokio::time::timeout(deadline, controller_handle).await {
        Ok(Ok(())) => info!("Controller shutdown complete"),
        Ok(Err(e)) => error!(error = %e, "Controller task panicked"),
        Err(_) => warn!("Controller did not shut down in time"),
    }

    Ok(())
}
