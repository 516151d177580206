//! devfarm provider
//!
//! Tracks the devices attached to this host through the adb server, runs one
//! worker process per usable device and pushes device status to the farm.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use devfarm_provider::config::Config;
use devfarm_provider::process::CommandSpawner;
use devfarm_provider::provider::Provider;
use devfarm_provider::router::DeviceRouter;
use devfarm_provider::signals::ShutdownSignals;
use devfarm_provider::status::ZmqPublisher;
use devfarm_provider::supervisor::Supervisor;
use devfarm_provider::tracker::AdbTracker;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.as_str().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        name = %config.name,
        endpoints = ?config.push_endpoints,
        worker = %config.worker.program.display(),
        "Starting devfarm provider"
    );

    let mut signals = ShutdownSignals::install().context("failed to install signal handlers")?;

    let publisher = ZmqPublisher::connect(&config.push_endpoints)
        .context("failed to set up status socket")?;

    let tracker = AdbTracker::connect(&config.adb_host, config.adb_port)
        .await
        .context("failed to start device tracking")?;

    let spawner = Arc::new(CommandSpawner::new(config.worker.clone(), config.name.clone()));
    let supervisor = Supervisor::new(spawner, config.crash, config.termination);
    let router = DeviceRouter::new(
        config.name.clone(),
        Arc::new(config.filter.clone()),
        Arc::new(publisher),
    );

    let mut provider = Provider::new(router, supervisor, tracker);
    provider
        .run(async {
            let signal = signals.recv().await;
            info!(%signal, "Received shutdown signal");
        })
        .await;

    info!("Provider shutdown complete");
    Ok(())
}
