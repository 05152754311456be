// Worker binary entry point
// Runs pending script executions under the configured admission ceiling

use anyhow::Result;
use common::bootstrap;
use common::worker::{ExecutionWorker, WorkerConfig};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let settings = bootstrap::load_settings()?;
    bootstrap::init_observability(&settings)?;

    info!(
        concurrency = settings.execution.concurrency,
        runtime = %settings.execution.runtime_executable,
        "Starting script execution worker"
    );

    let store = bootstrap::init_store(&settings).await?;
    let engine = bootstrap::init_execution_engine(&settings, store.clone()).await;

    let worker = Arc::new(ExecutionWorker::new(
        WorkerConfig::from_settings(&settings),
        store,
        engine,
    ));

    let worker_for_shutdown = worker.clone();
    tokio::spawn(async move {
        bootstrap::shutdown_signal().await;
        info!("Shutdown signal received, initiating graceful shutdown");
        worker_for_shutdown.shutdown();
    });

    info!("Worker is running. Press Ctrl+C to shutdown gracefully");
    worker.start().await;

    info!("Worker shutdown complete");
    Ok(())
}
