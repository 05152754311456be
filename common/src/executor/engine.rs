// Execution engine with bounded admission, timeouts and cancellation

use super::{
    ExecutionRequest, OutputLine, OutputStream, RuntimeInvocation, ScriptRuntime, ValidationReport,
};
use crate::config::Settings;
use crate::errors::ExecutionError;
use crate::models::{ExecutionRecord, ExecutionStatus, RiskLevel, Script};
use crate::parser::{compare_versions, ScriptParser};
use crate::progress::{ProgressEvent, ProgressSink};
use crate::store::ExecutionStore;
use crate::telemetry;
use chrono::Utc;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, OnceCell, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Captured output per stream is truncated past this size (10 MiB)
const MAX_OUTPUT_BYTES: usize = 10 * 1024 * 1024;

/// Appended once to a stream that hit the cap
const TRUNCATION_MARKER: &str = "[output truncated]";

/// How long to wait for trailing output after the process has gone
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

const AD_HOC_FILENAME: &str = "ad-hoc.ps1";

/// Execution limits and defaults
#[derive(Debug, Clone)]
pub struct ExecutionOptions {
    /// Maximum simultaneously running executions
    pub concurrency: usize,
    pub default_timeout_seconds: u64,
    pub max_timeout_seconds: u64,
    pub constrained_mode_default: bool,
    pub memory_limit_mb: Option<u64>,
    /// Overrides the version reported by the runtime
    pub runtime_version: Option<String>,
    pub block_high_risk: bool,
    pub host_name: String,
}

impl ExecutionOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        let execution = &settings.execution;
        Self {
            concurrency: execution.concurrency.max(1) as usize,
            default_timeout_seconds: execution.default_timeout_seconds,
            max_timeout_seconds: execution.max_timeout_seconds,
            constrained_mode_default: execution.constrained_mode_default,
            memory_limit_mb: execution.memory_limit_mb,
            runtime_version: execution.runtime_version.clone(),
            block_high_risk: execution.block_high_risk,
            host_name: resolve_host_name(execution.host_name.as_deref()),
        }
    }
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

/// Configured name, then `HOSTNAME`, then `unknown`
fn resolve_host_name(configured: Option<&str>) -> String {
    configured
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .map(str::to_string)
        .or_else(|| std::env::var("HOSTNAME").ok().filter(|h| !h.is_empty()))
        .unwrap_or_else(|| "unknown".to_string())
}

/// Keeps the running gauge accurate on every exit path
struct RunningGuard(Arc<AtomicUsize>);

impl RunningGuard {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        let now = counter.fetch_add(1, AtomicOrdering::SeqCst) + 1;
        telemetry::update_running_executions(now);
        Self(Arc::clone(counter))
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        let now = self.0.fetch_sub(1, AtomicOrdering::SeqCst).saturating_sub(1);
        telemetry::update_running_executions(now);
    }
}

/// One captured stream, capped at [`MAX_OUTPUT_BYTES`] including the marker
#[derive(Debug, Default)]
struct StreamCapture {
    text: String,
    truncated: bool,
}

impl StreamCapture {
    fn append(&mut self, line: &str) {
        if self.truncated {
            return;
        }
        let budget = MAX_OUTPUT_BYTES - TRUNCATION_MARKER.len() - 1;
        if self.text.len() + line.len() + 1 > budget {
            self.truncated = true;
            self.text.push_str(TRUNCATION_MARKER);
        } else {
            self.text.push_str(line);
        }
        self.text.push('\n');
    }
}

/// Output gathered so far; readable even if the collector never finishes
#[derive(Debug, Default)]
struct CapturedOutput {
    stdout: StreamCapture,
    stderr: StreamCapture,
}

impl CapturedOutput {
    fn append(&mut self, stream: OutputStream, line: &str) {
        match stream {
            OutputStream::Stdout => self.stdout.append(line),
            OutputStream::Stderr => self.stderr.append(line),
        }
    }

    fn take(&mut self) -> (String, String) {
        (
            std::mem::take(&mut self.stdout.text),
            std::mem::take(&mut self.stderr.text),
        )
    }
}

fn non_empty(text: String) -> Option<String> {
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

/// ExecutionEngine runs scripts through a [`ScriptRuntime`].
///
/// At most `concurrency` executions are Running at once; further requests
/// wait in FIFO order on a fair semaphore while their records stay Pending.
/// Every admitted request ends in a terminal record.
#[derive(Clone)]
pub struct ExecutionEngine {
    store: Arc<dyn ExecutionStore>,
    runtime: Arc<dyn ScriptRuntime>,
    sink: Arc<dyn ProgressSink>,
    parser: ScriptParser,
    options: Arc<ExecutionOptions>,
    slots: Arc<Semaphore>,
    in_flight: Arc<Mutex<HashMap<Uuid, CancellationToken>>>,
    running: Arc<AtomicUsize>,
    detected_version: Arc<OnceCell<String>>,
}

impl ExecutionEngine {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        runtime: Arc<dyn ScriptRuntime>,
        sink: Arc<dyn ProgressSink>,
        options: ExecutionOptions,
    ) -> Self {
        Self {
            store,
            runtime,
            sink,
            parser: ScriptParser::default(),
            slots: Arc::new(Semaphore::new(options.concurrency.max(1))),
            options: Arc::new(options),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            running: Arc::new(AtomicUsize::new(0)),
            detected_version: Arc::new(OnceCell::new()),
        }
    }

    /// Executions currently holding a slot
    pub fn running_count(&self) -> usize {
        self.running.load(AtomicOrdering::SeqCst)
    }

    /// Executions admitted or dispatched and not yet finished
    pub fn in_flight_count(&self) -> usize {
        self.lock_in_flight().len()
    }

    /// Admit the request and run it in the background. Returns the Pending
    /// record immediately.
    #[instrument(skip(self, request), fields(script_id = ?request.script_id))]
    pub async fn submit(&self, request: ExecutionRequest) -> Result<ExecutionRecord, ExecutionError> {
        let record = self.admit(request).await?;
        let engine = self.clone();
        let pending = record.clone();
        tokio::spawn(async move {
            let execution_id = pending.id;
            if let Err(e) = engine.execute(pending).await {
                error!(execution_id = %execution_id, error = %e, "Execution could not be recorded");
            }
        });
        Ok(record)
    }

    /// Admit the request and wait for its terminal record
    #[instrument(skip(self, request), fields(script_id = ?request.script_id))]
    pub async fn run(&self, request: ExecutionRequest) -> Result<ExecutionRecord, ExecutionError> {
        let record = self.admit(request).await?;
        self.execute(record).await
    }

    /// Run a Pending record created elsewhere. Returns `Ok(None)` when the
    /// execution is already in flight here.
    #[instrument(skip(self, record), fields(execution_id = %record.id))]
    pub async fn dispatch(
        &self,
        record: ExecutionRecord,
    ) -> Result<Option<ExecutionRecord>, ExecutionError> {
        if record.status != ExecutionStatus::Pending {
            return Err(ExecutionError::InvalidRequest(format!(
                "Execution {} is {}, not pending",
                record.id, record.status
            )));
        }
        if !self.track(record.id) {
            debug!("Execution already in flight, dispatch ignored");
            return Ok(None);
        }
        self.execute(record).await.map(Some)
    }

    /// Wait for a slot for a Pending record created elsewhere, then run it
    /// in the background. Slots are granted in call order, so a caller that
    /// awaits each record in turn starts them in that order. Returns
    /// `Ok(None)` when the execution is already in flight here or was
    /// cancelled while waiting.
    #[instrument(skip(self, record), fields(execution_id = %record.id))]
    pub async fn dispatch_queued(
        &self,
        mut record: ExecutionRecord,
    ) -> Result<Option<JoinHandle<()>>, ExecutionError> {
        if record.status != ExecutionStatus::Pending {
            return Err(ExecutionError::InvalidRequest(format!(
                "Execution {} is {}, not pending",
                record.id, record.status
            )));
        }
        if !self.track(record.id) {
            debug!("Execution already in flight, dispatch ignored");
            return Ok(None);
        }

        let token = self.token_for(record.id);
        let permit = match self.wait_for_slot(&token).await {
            Ok(Some(permit)) => permit,
            Ok(None) => {
                info!("Execution cancelled while queued");
                let result = self
                    .complete(
                        &mut record,
                        ExecutionStatus::Cancelled,
                        Some(ExecutionError::Cancelled.to_string()),
                        Instant::now(),
                    )
                    .await;
                self.untrack(record.id);
                return result.map(|_| None);
            }
            Err(e) => {
                self.untrack(record.id);
                return Err(e);
            }
        };

        let engine = self.clone();
        Ok(Some(tokio::spawn(async move {
            let execution_id = record.id;
            match engine.execute_with(record, Some(permit)).await {
                Ok(finished) => {
                    debug!(execution_id = %execution_id, status = %finished.status, "Dispatched execution finished");
                }
                Err(e) => error!(execution_id = %execution_id, error = %e, "Execution could not be recorded"),
            }
        })))
    }

    /// Cancel a queued or running execution. Returns `false` when the
    /// execution exists but is not in flight in this engine.
    #[instrument(skip(self))]
    pub async fn cancel(&self, execution_id: Uuid) -> Result<bool, ExecutionError> {
        let token = self.lock_in_flight().get(&execution_id).cloned();
        if let Some(token) = token {
            token.cancel();
            info!("Execution cancellation requested");
            return Ok(true);
        }
        match self.store.find_execution(execution_id).await? {
            Some(_) => Ok(false),
            None => Err(ExecutionError::ExecutionNotFound(execution_id)),
        }
    }

    /// Pre-flight check of a catalogued script against its current content
    #[instrument(skip(self))]
    pub async fn validate(&self, script_id: Uuid) -> Result<ValidationReport, ExecutionError> {
        let script = self
            .store
            .fetch_script(script_id)
            .await?
            .ok_or(ExecutionError::ScriptNotFound(script_id))?;

        let filename = script.source_path.as_deref().unwrap_or(&script.name);
        let metadata = self.parser.parse(&script.content, filename);

        let mut blocking_issues = Vec::new();
        let mut warnings = metadata.warnings.clone();

        if !script.is_active {
            blocking_issues.push("Script is inactive".to_string());
        }

        if let Some(required) = &metadata.min_runtime_version {
            match self.runtime_version().await {
                Some(available) if compare_versions(required, &available) == Ordering::Greater => {
                    blocking_issues.push(format!(
                        "Script requires runtime version {} but {} is available",
                        required, available
                    ));
                }
                Some(_) => {}
                None => warnings.push(format!(
                    "Script requires runtime version {} and the available version is unknown",
                    required
                )),
            }
        }

        if metadata.is_high_risk() {
            let categories = metadata
                .security
                .categories()
                .iter()
                .map(|c| c.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            let message = format!("High-risk constructs found: {}", categories);
            if self.options.block_high_risk {
                blocking_issues.push(message);
            } else {
                warnings.push(message);
            }
        }

        if metadata.security.requires_elevation {
            warnings.push("Script requires elevated privileges".to_string());
        }

        debug!(
            blocking = blocking_issues.len(),
            warnings = warnings.len(),
            "Script validated"
        );

        Ok(ValidationReport {
            script_id: script.id,
            version: script.version,
            risk_level: metadata.security.risk_level,
            requires_elevation: metadata.security.requires_elevation,
            findings: metadata.security.findings,
            warnings,
            blocking_issues,
        })
    }

    /// Validate a request and write its Pending record
    async fn admit(&self, request: ExecutionRequest) -> Result<ExecutionRecord, ExecutionError> {
        let (script, content) = match (request.script_id, request.content) {
            (Some(_), Some(_)) => {
                return Err(ExecutionError::InvalidRequest(
                    "Provide either script_id or content, not both".to_string(),
                ))
            }
            (None, None) => {
                return Err(ExecutionError::InvalidRequest(
                    "Either script_id or content is required".to_string(),
                ))
            }
            (Some(id), None) => (Some(self.load_runnable(id).await?), None),
            (None, Some(content)) => {
                if content.trim().is_empty() {
                    return Err(ExecutionError::InvalidRequest(
                        "Script content is empty".to_string(),
                    ));
                }
                (None, Some(content))
            }
        };

        if self.options.block_high_risk {
            let risk = match (&script, &content) {
                (Some(script), _) => script.risk_level,
                (None, Some(content)) => self.parser.parse(content, AD_HOC_FILENAME).security.risk_level,
                (None, None) => RiskLevel::Low,
            };
            if risk == RiskLevel::High {
                return Err(ExecutionError::InvalidRequest(
                    "High-risk scripts are blocked by configuration".to_string(),
                ));
            }
        }

        let requested_timeout = request
            .timeout_seconds
            .or_else(|| script.as_ref().map(|s| s.timeout_seconds.max(0) as u64))
            .unwrap_or(self.options.default_timeout_seconds);
        let timeout_seconds = self.clamp_timeout(requested_timeout);
        let constrained_mode = request
            .constrained_mode
            .unwrap_or(self.options.constrained_mode_default);

        let mut record = ExecutionRecord::new_pending(
            script.as_ref().map(|s| s.id),
            content,
            request.parameters,
            timeout_seconds.min(i32::MAX as u64) as i32,
            constrained_mode,
        );
        record.script_version = script.as_ref().map(|s| s.version);
        record.memory_limit_mb = self.options.memory_limit_mb.map(|mb| mb as i64);
        record.requested_by = request.requested_by;

        self.store.insert_execution(&record).await?;
        self.track(record.id);

        info!(
            execution_id = %record.id,
            script_id = ?record.script_id,
            timeout_seconds = record.timeout_seconds,
            constrained_mode = record.constrained_mode,
            "Execution admitted"
        );
        Ok(record)
    }

    async fn load_runnable(&self, script_id: Uuid) -> Result<Script, ExecutionError> {
        let script = self
            .store
            .fetch_script(script_id)
            .await?
            .ok_or(ExecutionError::ScriptNotFound(script_id))?;
        if !script.is_active {
            return Err(ExecutionError::ScriptInactive(script_id));
        }
        Ok(script)
    }

    fn clamp_timeout(&self, seconds: u64) -> u64 {
        seconds.clamp(1, self.options.max_timeout_seconds.max(1))
    }

    fn lock_in_flight(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, CancellationToken>> {
        self.in_flight.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Register a cancellation token; `false` if one already exists
    fn track(&self, execution_id: Uuid) -> bool {
        let mut in_flight = self.lock_in_flight();
        if in_flight.contains_key(&execution_id) {
            return false;
        }
        in_flight.insert(execution_id, CancellationToken::new());
        true
    }

    fn token_for(&self, execution_id: Uuid) -> CancellationToken {
        self.lock_in_flight()
            .entry(execution_id)
            .or_insert_with(CancellationToken::new)
            .clone()
    }

    fn untrack(&self, execution_id: Uuid) {
        self.lock_in_flight().remove(&execution_id);
    }

    /// Configured version, else the version the runtime reports (detected once)
    async fn runtime_version(&self) -> Option<String> {
        if let Some(version) = &self.options.runtime_version {
            return Some(version.clone());
        }
        match self
            .detected_version
            .get_or_try_init(|| self.runtime.version())
            .await
        {
            Ok(version) => Some(version.clone()),
            Err(e) => {
                warn!(error = %e, "Failed to detect script runtime version");
                None
            }
        }
    }

    async fn publish(&self, event: ProgressEvent) {
        if let Err(e) = self.sink.publish(&event).await {
            warn!(execution_id = %event.execution_id(), error = %e, "Failed to publish progress event");
        }
    }

    async fn execute(&self, record: ExecutionRecord) -> Result<ExecutionRecord, ExecutionError> {
        self.execute_with(record, None).await
    }

    async fn execute_with(
        &self,
        mut record: ExecutionRecord,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Result<ExecutionRecord, ExecutionError> {
        let token = self.token_for(record.id);
        let result = self.execute_tracked(&mut record, &token, permit).await;
        self.untrack(record.id);
        result.map(|_| record)
    }

    /// `None` when the execution was cancelled before a slot freed up
    async fn wait_for_slot(
        &self,
        token: &CancellationToken,
    ) -> Result<Option<OwnedSemaphorePermit>, ExecutionError> {
        tokio::select! {
            biased;
            _ = token.cancelled() => Ok(None),
            permit = Arc::clone(&self.slots).acquire_owned() => permit
                .map(Some)
                .map_err(|_| ExecutionError::Runtime("Execution slots are closed".to_string())),
        }
    }

    async fn execute_tracked(
        &self,
        record: &mut ExecutionRecord,
        token: &CancellationToken,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Result<(), ExecutionError> {
        let started = Instant::now();

        let permit = match permit {
            Some(permit) => Some(permit),
            None => self.wait_for_slot(token).await?,
        };
        let Some(_permit) = permit else {
            info!(execution_id = %record.id, "Execution cancelled while queued");
            return self
                .complete(record, ExecutionStatus::Cancelled, Some(ExecutionError::Cancelled.to_string()), started)
                .await;
        };

        let content = match (&record.ad_hoc_content, record.script_id) {
            (Some(content), _) => content.clone(),
            (None, Some(script_id)) => match self.load_runnable(script_id).await {
                Ok(script) => {
                    record.script_version = Some(script.version);
                    script.content
                }
                Err(ExecutionError::Storage(e)) => return Err(ExecutionError::Storage(e)),
                Err(e) => {
                    return self
                        .complete(record, ExecutionStatus::Failed, Some(e.to_string()), started)
                        .await
                }
            },
            (None, None) => {
                let message = ExecutionError::InvalidRequest("Execution has no script".to_string());
                return self
                    .complete(record, ExecutionStatus::Failed, Some(message.to_string()), started)
                    .await;
            }
        };

        let _running = RunningGuard::enter(&self.running);
        record.status = ExecutionStatus::Running;
        record.started_at = Some(Utc::now());
        record.host_name = Some(self.options.host_name.clone());
        record.runtime_version = self.runtime_version().await;
        self.store.update_execution(record).await?;
        self.publish(ProgressEvent::status(record.id, ExecutionStatus::Running)).await;
        info!(execution_id = %record.id, "Execution started");

        let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
        let sink = Arc::clone(&self.sink);
        let execution_id = record.id;
        let captured = Arc::new(Mutex::new(CapturedOutput::default()));
        let capture = Arc::clone(&captured);
        let mut collector = tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                capture
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .append(line.stream, &line.line);
                let event = ProgressEvent::output(execution_id, line.stream, line.line);
                if let Err(e) = sink.publish(&event).await {
                    debug!(execution_id = %execution_id, error = %e, "Failed to publish output line");
                }
            }
        });

        let invocation = RuntimeInvocation {
            execution_id: record.id,
            content,
            parameters: record.parameters.clone(),
            constrained_mode: record.constrained_mode,
        };
        let timeout_seconds = record.timeout_seconds.max(1) as u64;
        let outcome = tokio::time::timeout(
            Duration::from_secs(timeout_seconds),
            self.runtime.run(invocation, tx, token.child_token()),
        )
        .await;

        let (status, error_message, exit_code) = match outcome {
            Err(_elapsed) => {
                // The runtime future was dropped, which kills the process
                warn!(execution_id = %record.id, timeout_seconds, "Execution timed out");
                (
                    ExecutionStatus::Failed,
                    Some(ExecutionError::Timeout(timeout_seconds).to_string()),
                    None,
                )
            }
            Ok(Ok(exit)) => match exit.exit_code {
                Some(0) => (ExecutionStatus::Completed, None, Some(0)),
                Some(code) => (
                    ExecutionStatus::Failed,
                    Some(format!("Script exited with code {}", code)),
                    Some(code),
                ),
                None => (
                    ExecutionStatus::Failed,
                    Some("Script process was terminated by a signal".to_string()),
                    None,
                ),
            },
            Ok(Err(_)) if token.is_cancelled() => (
                ExecutionStatus::Cancelled,
                Some(ExecutionError::Cancelled.to_string()),
                None,
            ),
            Ok(Err(e)) => (ExecutionStatus::Failed, Some(e.to_string()), None),
        };

        // A descendant process can keep the pipes open after the script is
        // gone; keep whatever arrived before giving up on it
        if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, &mut collector).await.is_err() {
            warn!(execution_id = %record.id, "Output collection did not finish, keeping partial output");
            collector.abort();
        }
        let (stdout, stderr) = captured.lock().unwrap_or_else(|p| p.into_inner()).take();
        record.output = non_empty(stdout);
        record.error_output = non_empty(stderr);
        record.exit_code = exit_code;

        self.complete(record, status, error_message, started).await
    }

    async fn complete(
        &self,
        record: &mut ExecutionRecord,
        status: ExecutionStatus,
        error_message: Option<String>,
        started: Instant,
    ) -> Result<(), ExecutionError> {
        record.status = status;
        record.error = error_message;
        record.completed_at = Some(Utc::now());

        self.store.update_execution(record).await?;
        telemetry::record_execution(status, started.elapsed().as_secs_f64());
        self.publish(ProgressEvent::status(record.id, status)).await;

        match status {
            ExecutionStatus::Completed => info!(
                execution_id = %record.id,
                duration_ms = started.elapsed().as_millis() as u64,
                "Execution completed"
            ),
            _ => warn!(
                execution_id = %record.id,
                status = %status,
                error = ?record.error,
                exit_code = ?record.exit_code,
                "Execution did not complete"
            ),
        }
        Ok(())
    }
}
