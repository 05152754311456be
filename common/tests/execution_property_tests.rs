// Property-based tests for the execution engine
// Concurrency ceiling, timeouts, cancellation and progress events

use async_trait::async_trait;
use common::errors::{ExecutionError, ProgressError};
use common::executor::{
    ExecutionEngine, ExecutionOptions, ExecutionRequest, OutputLine, OutputStream, RuntimeExit,
    RuntimeInvocation, ScriptRuntime,
};
use common::models::{ExecutionRecord, ExecutionStatus};
use common::progress::{ProgressEvent, ProgressSink};
use common::store::{ExecutionStore, MemoryStore};
use proptest::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Runtime double driven by the script text:
/// `block` waits for a release, `hang` waits for cancellation,
/// `echo <text>` prints one line, `exit <code>` exits with that code
struct GatedRuntime {
    current: AtomicUsize,
    max_seen: AtomicUsize,
    started: AtomicUsize,
    release: Arc<Semaphore>,
}

impl GatedRuntime {
    fn new() -> Self {
        Self {
            current: AtomicUsize::new(0),
            max_seen: AtomicUsize::new(0),
            started: AtomicUsize::new(0),
            release: Arc::new(Semaphore::new(0)),
        }
    }

    fn release_all(&self) {
        self.release.add_permits(1_000);
    }
}

#[async_trait]
impl ScriptRuntime for GatedRuntime {
    async fn version(&self) -> Result<String, ExecutionError> {
        Ok("7.4.1".to_string())
    }

    async fn run(
        &self,
        invocation: RuntimeInvocation,
        output: mpsc::UnboundedSender<OutputLine>,
        cancel: CancellationToken,
    ) -> Result<RuntimeExit, ExecutionError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_seen.fetch_max(now, Ordering::SeqCst);

        let content = invocation.content.trim().to_string();
        let result = if content == "block" {
            tokio::select! {
                permit = self.release.acquire() => {
                    if let Ok(permit) = permit {
                        permit.forget();
                    }
                    Ok(RuntimeExit { exit_code: Some(0) })
                }
                _ = cancel.cancelled() => Err(ExecutionError::Cancelled),
            }
        } else if content == "hang" {
            cancel.cancelled().await;
            Err(ExecutionError::Cancelled)
        } else if let Some(text) = content.strip_prefix("echo ") {
            let _ = output.send(OutputLine {
                stream: OutputStream::Stdout,
                line: text.to_string(),
            });
            Ok(RuntimeExit { exit_code: Some(0) })
        } else if let Some(code) = content.strip_prefix("exit ") {
            let _ = output.send(OutputLine {
                stream: OutputStream::Stderr,
                line: "failing".to_string(),
            });
            Ok(RuntimeExit {
                exit_code: Some(code.parse().unwrap_or(1)),
            })
        } else {
            Ok(RuntimeExit { exit_code: Some(0) })
        };

        self.current.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<ProgressEvent>>,
}

#[async_trait]
impl ProgressSink for RecordingSink {
    async fn publish(&self, event: &ProgressEvent) -> Result<(), ProgressError> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

struct Harness {
    store: Arc<MemoryStore>,
    runtime: Arc<GatedRuntime>,
    sink: Arc<RecordingSink>,
    engine: ExecutionEngine,
}

fn harness(concurrency: usize) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let runtime = Arc::new(GatedRuntime::new());
    let sink = Arc::new(RecordingSink::default());
    let options = ExecutionOptions {
        concurrency,
        host_name: "test-host".to_string(),
        ..ExecutionOptions::default()
    };
    let engine = ExecutionEngine::new(store.clone(), runtime.clone(), sink.clone(), options);
    Harness {
        store,
        runtime,
        sink,
        engine,
    }
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn wait_terminal(store: &MemoryStore, id: Uuid) -> ExecutionRecord {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Some(record) = store.find_execution(id).await.unwrap() {
                if record.status.is_terminal() {
                    return record;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("execution did not finish in time")
}

fn count_with_status(store: &MemoryStore, status: ExecutionStatus) -> usize {
    store.executions().iter().filter(|e| e.status == status).count()
}

// Property: for any ceiling and load, no more than `concurrency` executions
// run at once, the rest wait as Pending, and all of them finish
#[test]
fn property_running_executions_never_exceed_ceiling() {
    proptest!(ProptestConfig::with_cases(12), |(
        concurrency in 1usize..4,
        submitted in 1usize..9
    )| {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            let h = harness(concurrency);
            let mut ids = Vec::new();
            for _ in 0..submitted {
                let record = h.engine.submit(ExecutionRequest::ad_hoc("block")).await.unwrap();
                prop_assert_eq!(record.status, ExecutionStatus::Pending);
                ids.push(record.id);
            }

            let expected_running = concurrency.min(submitted);
            let gated = h.runtime.clone();
            wait_until(|| gated.current.load(Ordering::SeqCst) == expected_running).await;
            // Give any excess admission a chance to show up
            tokio::time::sleep(Duration::from_millis(20)).await;

            prop_assert_eq!(h.runtime.current.load(Ordering::SeqCst), expected_running);
            prop_assert_eq!(count_with_status(&h.store, ExecutionStatus::Running), expected_running);
            prop_assert_eq!(
                count_with_status(&h.store, ExecutionStatus::Pending),
                submitted - expected_running
            );

            h.runtime.release_all();
            for id in ids {
                let record = wait_terminal(&h.store, id).await;
                prop_assert_eq!(record.status, ExecutionStatus::Completed);
            }
            prop_assert!(h.runtime.max_seen.load(Ordering::SeqCst) <= concurrency);
            let engine = h.engine.clone();
            wait_until(|| engine.in_flight_count() == 0).await;
            Ok(())
        })?;
    });
}

#[tokio::test]
async fn completed_execution_captures_output_and_publishes_progress() {
    let h = harness(2);

    let record = h
        .engine
        .run(ExecutionRequest::ad_hoc("echo hello world"))
        .await
        .unwrap();

    assert_eq!(record.status, ExecutionStatus::Completed);
    assert_eq!(record.exit_code, Some(0));
    assert_eq!(record.output.as_deref(), Some("hello world\n"));
    assert_eq!(record.host_name.as_deref(), Some("test-host"));
    assert_eq!(record.runtime_version.as_deref(), Some("7.4.1"));
    assert!(record.started_at.is_some());
    assert!(record.completed_at.is_some());

    let events = h.sink.events.lock().unwrap().clone();
    assert!(events.iter().all(|e| e.execution_id() == record.id));
    assert!(events.iter().all(|e| e.subject() == format!("status.execution.{}", record.id)));
    assert!(matches!(
        events.first(),
        Some(ProgressEvent::ExecutionStatusChanged { status: ExecutionStatus::Running, .. })
    ));
    assert!(events.iter().any(|e| matches!(
        e,
        ProgressEvent::ExecutionOutput { line, .. } if line == "hello world"
    )));
    assert!(matches!(
        events.last(),
        Some(ProgressEvent::ExecutionStatusChanged { status: ExecutionStatus::Completed, .. })
    ));
}

#[tokio::test]
async fn non_zero_exit_fails_with_captured_stderr() {
    let h = harness(1);

    let record = h.engine.run(ExecutionRequest::ad_hoc("exit 3")).await.unwrap();

    assert_eq!(record.status, ExecutionStatus::Failed);
    assert_eq!(record.exit_code, Some(3));
    assert_eq!(record.error_output.as_deref(), Some("failing\n"));
    assert!(record.error.unwrap().contains('3'));
}

#[tokio::test]
async fn execution_exceeding_timeout_fails_as_timed_out() {
    let h = harness(1);

    let request = ExecutionRequest {
        timeout_seconds: Some(1),
        ..ExecutionRequest::ad_hoc("hang")
    };
    let record = h.engine.run(request).await.unwrap();

    assert_eq!(record.status, ExecutionStatus::Failed);
    assert_eq!(record.timeout_seconds, 1);
    assert!(record.error.unwrap().to_lowercase().contains("timeout"));
    assert_eq!(h.engine.running_count(), 0);
}

#[tokio::test]
async fn cancelling_running_execution_marks_it_cancelled() {
    let h = harness(1);

    let record = h.engine.submit(ExecutionRequest::ad_hoc("hang")).await.unwrap();
    let gated = h.runtime.clone();
    wait_until(|| gated.current.load(Ordering::SeqCst) == 1).await;

    assert!(h.engine.cancel(record.id).await.unwrap());

    let finished = wait_terminal(&h.store, record.id).await;
    assert_eq!(finished.status, ExecutionStatus::Cancelled);
    let engine = h.engine.clone();
    wait_until(|| engine.in_flight_count() == 0).await;

    // No longer in flight, but known
    assert!(!h.engine.cancel(record.id).await.unwrap());
}

#[tokio::test]
async fn cancelling_queued_execution_never_starts_it() {
    let h = harness(1);

    let first = h.engine.submit(ExecutionRequest::ad_hoc("block")).await.unwrap();
    let gated = h.runtime.clone();
    wait_until(|| gated.current.load(Ordering::SeqCst) == 1).await;

    let queued = h.engine.submit(ExecutionRequest::ad_hoc("block")).await.unwrap();
    assert!(h.engine.cancel(queued.id).await.unwrap());

    let cancelled = wait_terminal(&h.store, queued.id).await;
    assert_eq!(cancelled.status, ExecutionStatus::Cancelled);
    assert!(cancelled.started_at.is_none());

    h.runtime.release_all();
    let completed = wait_terminal(&h.store, first.id).await;
    assert_eq!(completed.status, ExecutionStatus::Completed);
    assert_eq!(h.runtime.started.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn cancel_of_unknown_execution_is_not_found() {
    let h = harness(1);
    let id = Uuid::new_v4();
    assert!(matches!(
        h.engine.cancel(id).await,
        Err(ExecutionError::ExecutionNotFound(missing)) if missing == id
    ));
}

#[tokio::test]
async fn dispatch_runs_records_created_elsewhere_once() {
    let h = harness(1);
    let pending = ExecutionRecord::new_pending(
        None,
        Some("echo queued".to_string()),
        Default::default(),
        30,
        true,
    );
    h.store.insert_execution(&pending).await.unwrap();

    let finished = h.engine.dispatch(pending.clone()).await.unwrap().unwrap();
    assert_eq!(finished.status, ExecutionStatus::Completed);
    assert_eq!(finished.output.as_deref(), Some("queued\n"));

    assert!(matches!(
        h.engine.dispatch(finished).await,
        Err(ExecutionError::InvalidRequest(_))
    ));
}
