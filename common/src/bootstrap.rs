// Bootstrap utilities for binary initialization
// Shared by the api, worker and scheduler entry points

use crate::config::Settings;
use crate::db::DbPool;
use crate::executor::{ExecutionEngine, ExecutionOptions, PwshRuntime};
use crate::github::GitHubClient;
use crate::progress::{NatsProgressSink, NoopProgressSink, ProgressSink};
use crate::rate_limit::RateLimiter;
use crate::store::PostgresStore;
use crate::sync::{SyncEngine, SyncOptions};
use crate::telemetry;
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{info, warn};

/// Load and validate configuration
pub fn load_settings() -> Result<Settings> {
    let settings = Settings::load().context("Failed to load configuration")?;
    settings.validate().context("Invalid configuration")?;
    Ok(settings)
}

/// Install JSON logging and, when a port is configured, the Prometheus exporter
pub fn init_observability(settings: &Settings) -> Result<()> {
    telemetry::init_logging(&settings.observability.log_level)?;
    if let Some(port) = settings.observability.metrics_port {
        telemetry::init_metrics(port)?;
    }
    Ok(())
}

/// Initialize database pool
///
/// # Errors
/// Returns error if database pool initialization fails
#[tracing::instrument(skip(settings))]
pub async fn init_database_pool(settings: &Settings) -> Result<DbPool> {
    info!("Initializing database pool");

    let db_pool = DbPool::new(&settings.database)
        .await
        .context("Failed to initialize database pool")?;

    info!("Database pool initialized");

    if settings.database.run_migrations {
        sqlx::migrate!("../migrations")
            .run(db_pool.pool())
            .await
            .context("Failed to apply database migrations")?;
        info!("Database migrations applied");
    }

    Ok(db_pool)
}

/// Build the Postgres-backed store over a fresh pool
#[tracing::instrument(skip(settings))]
pub async fn init_store(settings: &Settings) -> Result<Arc<PostgresStore>> {
    let pool = init_database_pool(settings).await?;
    Ok(Arc::new(PostgresStore::new(pool)))
}

/// Build the repository host client with its own rate limiter
pub fn init_github_client(settings: &Settings) -> Result<Arc<GitHubClient>> {
    let limiter = Arc::new(RateLimiter::new(settings.github.rate_limit_safety_margin));
    let client = GitHubClient::new(&settings.github, limiter)
        .context("Failed to initialize GitHub client")?;
    if settings.github.token.is_none() {
        warn!("No GitHub token configured, unauthenticated quota applies");
    }
    info!(api_url = %settings.github.api_url, "GitHub client initialized");
    Ok(Arc::new(client))
}

/// Wire a sync engine over the store and the host client
pub fn init_sync_engine(settings: &Settings, store: Arc<PostgresStore>) -> Result<Arc<SyncEngine>> {
    let client = init_github_client(settings)?;
    Ok(Arc::new(SyncEngine::new(
        store,
        client,
        SyncOptions::from_settings(settings),
    )))
}

/// NATS sink when a URL is configured and reachable, otherwise a no-op sink
#[tracing::instrument(skip(settings))]
pub async fn init_progress_sink(settings: &Settings) -> Arc<dyn ProgressSink> {
    match settings.nats.url.as_deref() {
        Some(url) => match NatsProgressSink::connect(url).await {
            Ok(sink) => Arc::new(sink),
            Err(e) => {
                warn!(error = %e, "Progress events disabled, NATS unavailable");
                Arc::new(NoopProgressSink)
            }
        },
        None => {
            info!("No NATS URL configured, progress events disabled");
            Arc::new(NoopProgressSink)
        }
    }
}

/// Wire an execution engine backed by `pwsh`
pub async fn init_execution_engine(
    settings: &Settings,
    store: Arc<PostgresStore>,
) -> ExecutionEngine {
    let sink = init_progress_sink(settings).await;
    let runtime = Arc::new(PwshRuntime::new(&settings.execution.runtime_executable));
    let options = ExecutionOptions::from_settings(settings);
    info!(
        concurrency = options.concurrency,
        host_name = %options.host_name,
        "Execution engine initialized"
    );
    ExecutionEngine::new(store, runtime, sink, options)
}

/// Resolves on Ctrl+C or, on unix, SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
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
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C signal"),
        _ = terminate => info!("Received SIGTERM signal"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_github_client_builds_from_default_settings() {
        let settings = Settings::default();
        assert!(init_github_client(&settings).is_ok());
    }

    #[tokio::test]
    async fn test_progress_sink_falls_back_to_noop_without_url() {
        let settings = Settings::default();
        let sink = init_progress_sink(&settings).await;
        let event = crate::progress::ProgressEvent::status(
            uuid::Uuid::new_v4(),
            crate::models::ExecutionStatus::Running,
        );
        assert!(sink.publish(&event).await.is_ok());
    }
}
