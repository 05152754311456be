// Periodic full synchronization of every active repository binding

use crate::errors::SyncError;
use crate::models::SyncOutcome;
use crate::store::CatalogStore;
use crate::sync::SyncEngine;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

/// Configuration for the sync scheduler
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often every active binding is fully synced (in seconds)
    pub poll_interval_seconds: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: 300,
        }
    }
}

/// Totals for one polling round
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RoundSummary {
    pub synced: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// SyncScheduler drives [`SyncEngine::full_sync`] on a fixed interval
pub struct SyncScheduler {
    config: SchedulerConfig,
    store: Arc<dyn CatalogStore>,
    engine: Arc<SyncEngine>,
    shutdown_tx: tokio::sync::broadcast::Sender<()>,
}

impl SyncScheduler {
    pub fn new(config: SchedulerConfig, store: Arc<dyn CatalogStore>, engine: Arc<SyncEngine>) -> Self {
        let (shutdown_tx, _shutdown_rx) = tokio::sync::broadcast::channel(1);
        Self {
            config,
            store,
            engine,
            shutdown_tx,
        }
    }

    pub fn shutdown_receiver(&self) -> tokio::sync::broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Run polling rounds until [`SyncScheduler::stop`] is called
    #[instrument(skip(self))]
    pub async fn start(&self) {
        info!(
            poll_interval_seconds = self.config.poll_interval_seconds,
            "Starting sync scheduler"
        );

        let mut poll_interval = interval(Duration::from_secs(self.config.poll_interval_seconds.max(1)));
        poll_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut shutdown_rx = self.shutdown_receiver();

        loop {
            tokio::select! {
                _ = poll_interval.tick() => {
                    match self.sync_all().await {
                        Ok(summary) => {
                            if summary.synced + summary.failed > 0 {
                                info!(
                                    synced = summary.synced,
                                    skipped = summary.skipped,
                                    failed = summary.failed,
                                    "Sync round finished"
                                );
                            } else {
                                debug!("No bindings synced this round");
                            }
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to load repository bindings");
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping sync scheduler");
                    break;
                }
            }
        }

        info!("Sync scheduler stopped");
    }

    /// Signal the polling loop to exit after the current round
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// One round: a full sync per active binding, one at a time
    #[instrument(skip(self))]
    pub async fn sync_all(&self) -> Result<RoundSummary, SyncError> {
        let bindings = self.store.list_active_bindings().await?;
        debug!(binding_count = bindings.len(), "Found active bindings");

        let mut summary = RoundSummary::default();
        for binding in bindings {
            match self.engine.full_sync(binding.id).await {
                Ok(record) if record.outcome == SyncOutcome::Failure => {
                    warn!(
                        binding = %binding.full_name(),
                        error = ?record.error,
                        "Scheduled sync failed"
                    );
                    summary.failed += 1;
                }
                Ok(_) => summary.synced += 1,
                Err(SyncError::AlreadyRunning(_)) => {
                    debug!(binding = %binding.full_name(), "Sync already running, skipped");
                    summary.skipped += 1;
                }
                Err(e) => {
                    error!(binding = %binding.full_name(), error = %e, "Scheduled sync aborted");
                    summary.failed += 1;
                }
            }
        }

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheduler_config_default() {
        let config = SchedulerConfig::default();
        assert_eq!(config.poll_interval_seconds, 300);
    }

    #[test]
    fn test_round_summary_starts_empty() {
        assert_eq!(
            RoundSummary::default(),
            RoundSummary {
                synced: 0,
                skipped: 0,
                failed: 0
            }
        );
    }
}
