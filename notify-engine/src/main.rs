use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use notify_engine::config::EngineConfig;
use notify_engine::database;
use notify_engine::logging::init_logging;
use notify_engine::notification::{ChannelRegistry, InMemoryRecipientDirectory, NotificationEngine};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = EngineConfig::from_env()?;

    let (logging, _log_guard) = init_logging(config.log_dir.as_deref())?;
    let shutdown = CancellationToken::new();
    logging.start_retention_cleanup(shutdown.clone());

    let pool = database::init_pool(&config.database_url).await?;
    database::run_migrations(&pool).await?;

    let registry = ChannelRegistry::from_config(&config.channels)?;
    if registry.channels().is_empty() {
        tracing::warn!("No channel providers configured; every event will be rejected");
    }

    // Embedders supply their own directory; the binary starts empty.
    let directory = Arc::new(InMemoryRecipientDirectory::new());
    let engine = Arc::new(NotificationEngine::with_pool(
        pool.clone(),
        registry,
        directory,
        &config,
    ));

    let scheduler = Arc::new(engine.scheduler(shutdown.clone()));
    let scheduler_handle = scheduler.start();

    tracing::info!(database_url = %config.database_url, "notify-engine started");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");

    shutdown.cancel();
    if let Err(e) = scheduler_handle.await {
        tracing::warn!(error = %e, "Scheduler task ended abnormally");
    }
    engine.shutdown().await;
    pool.close().await;

    tracing::info!("notify-engine stopped");
    Ok(())
}
