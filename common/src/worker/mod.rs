// Worker module: picks up pending execution records and runs them

use crate::config::Settings;
use crate::errors::ExecutionError;
use crate::executor::ExecutionEngine;
use crate::models::ExecutionStatus;
use crate::store::ExecutionStore;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

/// Polling settings for the execution worker
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub poll_interval_seconds: u64,
    /// Maximum pending records fetched per poll
    pub batch_size: i64,
    /// How long shutdown waits for in-flight executions
    pub shutdown_grace_seconds: u64,
}

impl WorkerConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            poll_interval_seconds: settings.execution.worker_poll_interval_seconds,
            batch_size: (settings.execution.concurrency as i64 * 4).max(16),
            ..Self::default()
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: 5,
            batch_size: 100,
            shutdown_grace_seconds: 30,
        }
    }
}

/// ExecutionWorker polls the store for Pending records and hands them to
/// [`ExecutionEngine::dispatch_queued`] oldest first, so queued records
/// start in the order they were created. Records already in flight are
/// skipped by the engine.
pub struct ExecutionWorker {
    config: WorkerConfig,
    store: Arc<dyn ExecutionStore>,
    engine: ExecutionEngine,
    shutdown_tx: broadcast::Sender<()>,
    admitting: Arc<AtomicBool>,
}

impl ExecutionWorker {
    pub fn new(config: WorkerConfig, store: Arc<dyn ExecutionStore>, engine: ExecutionEngine) -> Self {
        let (shutdown_tx, _shutdown_rx) = broadcast::channel(1);
        Self {
            config,
            store,
            engine,
            shutdown_tx,
            admitting: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Poll until [`ExecutionWorker::shutdown`] is called, then wait for
    /// in-flight executions up to the grace period
    #[instrument(skip(self))]
    pub async fn start(&self) {
        info!(
            poll_interval_seconds = self.config.poll_interval_seconds,
            batch_size = self.config.batch_size,
            "Starting execution worker"
        );

        let mut poll_interval = interval(Duration::from_secs(self.config.poll_interval_seconds.max(1)));
        poll_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                _ = poll_interval.tick() => {
                    if let Err(e) = self.poll_once().await {
                        error!(error = %e, "Failed to poll pending executions");
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, no new executions will be picked up");
                    break;
                }
            }
        }

        self.drain().await;
        info!("Execution worker stopped");
    }

    /// Request graceful shutdown
    pub fn shutdown(&self) {
        info!("Requesting worker shutdown");
        let _ = self.shutdown_tx.send(());
    }

    /// Fetch one batch of Pending records and admit them to the engine in
    /// creation order on a single task. Returns how many were fetched; a
    /// poll made while the previous batch is still waiting for slots
    /// fetches nothing.
    pub async fn poll_once(&self) -> Result<usize, ExecutionError> {
        if self.admitting.swap(true, AtomicOrdering::SeqCst) {
            debug!("Previous batch still waiting for execution slots");
            return Ok(0);
        }

        let pending = match self
            .store
            .list_executions_by_status(ExecutionStatus::Pending, self.config.batch_size)
            .await
        {
            Ok(pending) if !pending.is_empty() => pending,
            other => {
                self.admitting.store(false, AtomicOrdering::SeqCst);
                return other.map(|_| 0).map_err(ExecutionError::from);
            }
        };
        debug!(count = pending.len(), "Found pending executions");

        let count = pending.len();
        let engine = self.engine.clone();
        let admitting = Arc::clone(&self.admitting);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            for record in pending {
                if !matches!(shutdown_rx.try_recv(), Err(TryRecvError::Empty)) {
                    debug!("Worker stopping, remaining batch left pending");
                    break;
                }
                let execution_id = record.id;
                if let Err(e) = engine.dispatch_queued(record).await {
                    error!(execution_id = %execution_id, error = %e, "Dispatch failed");
                }
            }
            admitting.store(false, AtomicOrdering::SeqCst);
        });
        Ok(count)
    }

    async fn drain(&self) {
        let grace = Duration::from_secs(self.config.shutdown_grace_seconds);
        let waited = tokio::time::timeout(grace, async {
            while self.engine.in_flight_count() > 0 {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        })
        .await;
        if waited.is_err() {
            warn!(
                in_flight = self.engine.in_flight_count(),
                "Shutdown grace period elapsed with executions still in flight"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{ExecutionOptions, OutputLine, RuntimeExit, RuntimeInvocation, ScriptRuntime};
    use crate::models::ExecutionRecord;
    use crate::progress::NoopProgressSink;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    struct SucceedingRuntime;

    #[async_trait]
    impl ScriptRuntime for SucceedingRuntime {
        async fn version(&self) -> Result<String, ExecutionError> {
            Ok("7.4.0".to_string())
        }

        async fn run(
            &self,
            _invocation: RuntimeInvocation,
            _output: mpsc::UnboundedSender<OutputLine>,
            _cancel: CancellationToken,
        ) -> Result<RuntimeExit, ExecutionError> {
            Ok(RuntimeExit { exit_code: Some(0) })
        }
    }

    fn worker(store: Arc<MemoryStore>) -> ExecutionWorker {
        let engine = ExecutionEngine::new(
            store.clone(),
            Arc::new(SucceedingRuntime),
            Arc::new(NoopProgressSink),
            ExecutionOptions::default(),
        );
        ExecutionWorker::new(WorkerConfig::default(), store, engine)
    }

    #[tokio::test]
    async fn test_poll_dispatches_pending_records() {
        let store = Arc::new(MemoryStore::new());
        for _ in 0..3 {
            let record = ExecutionRecord::new_pending(
                None,
                Some("Write-Output 'hi'".to_string()),
                Default::default(),
                30,
                true,
            );
            store.insert_execution(&record).await.unwrap();
        }
        let worker = worker(store.clone());

        assert_eq!(worker.poll_once().await.unwrap(), 3);

        tokio::time::timeout(Duration::from_secs(5), async {
            while store.executions().iter().any(|e| !e.status.is_terminal()) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(store
            .executions()
            .iter()
            .all(|e| e.status == ExecutionStatus::Completed));
    }

    /// Records the order scripts start in; each run holds its slot briefly
    #[derive(Default)]
    struct OrderRecordingRuntime {
        started: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ScriptRuntime for OrderRecordingRuntime {
        async fn version(&self) -> Result<String, ExecutionError> {
            Ok("7.4.0".to_string())
        }

        async fn run(
            &self,
            invocation: RuntimeInvocation,
            _output: mpsc::UnboundedSender<OutputLine>,
            _cancel: CancellationToken,
        ) -> Result<RuntimeExit, ExecutionError> {
            self.started.lock().unwrap().push(invocation.content);
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(RuntimeExit { exit_code: Some(0) })
        }
    }

    #[tokio::test]
    async fn test_queued_records_start_oldest_first() {
        let store = Arc::new(MemoryStore::new());
        let base = chrono::Utc::now() - chrono::Duration::seconds(60);
        let scripts: Vec<String> = (0..6).map(|i| format!("Write-Output {}", i)).collect();
        // Insert newest first so store order alone would reverse them
        for (i, content) in scripts.iter().enumerate().rev() {
            let mut record =
                ExecutionRecord::new_pending(None, Some(content.clone()), Default::default(), 30, true);
            record.created_at = base + chrono::Duration::seconds(i as i64);
            store.insert_execution(&record).await.unwrap();
        }

        let runtime = Arc::new(OrderRecordingRuntime::default());
        let options = ExecutionOptions {
            concurrency: 1,
            ..ExecutionOptions::default()
        };
        let engine = ExecutionEngine::new(store.clone(), runtime.clone(), Arc::new(NoopProgressSink), options);
        let worker = ExecutionWorker::new(WorkerConfig::default(), store.clone(), engine);

        assert_eq!(worker.poll_once().await.unwrap(), 6);
        // The first batch is still being admitted, so nothing is fetched twice
        assert_eq!(worker.poll_once().await.unwrap(), 0);

        tokio::time::timeout(Duration::from_secs(5), async {
            while store.executions().iter().any(|e| !e.status.is_terminal()) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(*runtime.started.lock().unwrap(), scripts);
    }

    #[tokio::test]
    async fn test_poll_with_nothing_pending() {
        let worker = worker(Arc::new(MemoryStore::new()));
        assert_eq!(worker.poll_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_stops_polling_loop() {
        let worker = Arc::new(worker(Arc::new(MemoryStore::new())));
        let running = worker.clone();
        let handle = tokio::spawn(async move { running.start().await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        worker.shutdown();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_config_follows_settings() {
        let mut settings = Settings::default();
        settings.execution.worker_poll_interval_seconds = 9;
        settings.execution.concurrency = 2;
        let config = WorkerConfig::from_settings(&settings);
        assert_eq!(config.poll_interval_seconds, 9);
        assert_eq!(config.batch_size, 16);
    }
}
