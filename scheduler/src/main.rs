// Scheduler binary entry point
// Periodically runs a full sync of every active repository binding

use common::bootstrap;
use common::scheduler::{SchedulerConfig, SyncScheduler};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = bootstrap::load_settings()?;
    bootstrap::init_observability(&settings)?;

    info!(
        poll_interval_seconds = settings.sync.poll_interval_seconds,
        github_api = %settings.github.api_url,
        "Starting script sync scheduler"
    );

    let store = bootstrap::init_store(&settings).await?;
    let engine = bootstrap::init_sync_engine(&settings, store.clone())?;

    let scheduler = Arc::new(SyncScheduler::new(
        SchedulerConfig {
            poll_interval_seconds: settings.sync.poll_interval_seconds,
        },
        store,
        engine,
    ));

    // Graceful shutdown on SIGTERM/SIGINT
    let scheduler_for_shutdown = scheduler.clone();
    tokio::spawn(async move {
        bootstrap::shutdown_signal().await;
        info!("Initiating graceful shutdown");
        scheduler_for_shutdown.stop();
    });

    scheduler.start().await;

    info!("Scheduler stopped");
    Ok(())
}
