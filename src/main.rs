//! # Ingestor Main Entry Point
//!
//! Runs the job dispatcher against the configured database until Ctrl-C.

use anyhow::Context;
use ingestor::{
    JobManager,
    adapters::{AdapterRegistry, register_example_adapter},
    config::ConfigLoader,
    db::{init_pool, run_migrations},
    fetch::FetchClient,
    telemetry::init_tracing,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration from layered env files and variables
    let config = ConfigLoader::new().load()?;
    init_tracing(&config)?;

    info!(profile = %config.profile, "Loaded configuration");
    if let Ok(redacted_json) = config.redacted_json() {
        info!(config = %redacted_json, "Effective configuration");
    }

    let db = init_pool(&config).await?;
    run_migrations(&db).await?;

    let fetch = FetchClient::from_config(&config.fetch).context("failed to build HTTP client")?;
    let mut adapters = AdapterRegistry::new();
    register_example_adapter(&mut adapters);
    for metadata in adapters.list_metadata() {
        info!(source = %metadata.name, "Registered adapter");
    }

    let manager = JobManager::new(db, adapters, fetch.clone(), &config.jobs, &config.upsert);

    let shutdown = CancellationToken::new();
    let dispatcher = {
        let manager = manager.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { manager.run_dispatcher(shutdown).await })
    };

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown requested; draining running jobs");
    shutdown.cancel();

    if let Err(err) = dispatcher.await {
        error!(error = %err, "Dispatcher task ended abnormally");
    }
    fetch.limiters().shutdown();
    info!("Ingestor stopped");
    Ok(())
}
