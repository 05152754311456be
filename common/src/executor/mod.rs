// Executor module for running catalogued and ad hoc scripts
// Provides the runtime seam and the bounded execution engine

pub mod engine;
pub mod process;

pub use engine::{ExecutionEngine, ExecutionOptions};
pub use process::PwshRuntime;

use crate::errors::ExecutionError;
use crate::models::RiskLevel;
use crate::parser::SecurityFinding;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// A request to run a script. Exactly one of `script_id` and `content`
/// must be set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionRequest {
    #[serde(default)]
    pub script_id: Option<Uuid>,
    /// Ad hoc script text
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
    /// Overrides the catalog timeout; clamped to the configured maximum
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub constrained_mode: Option<bool>,
    #[serde(default)]
    pub requested_by: Option<String>,
}

impl ExecutionRequest {
    pub fn catalog(script_id: Uuid) -> Self {
        Self {
            script_id: Some(script_id),
            ..Default::default()
        }
    }

    pub fn ad_hoc(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One line of script output, in arrival order per stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub line: String,
}

/// Everything the runtime needs to start one script
#[derive(Debug, Clone)]
pub struct RuntimeInvocation {
    pub execution_id: Uuid,
    pub content: String,
    pub parameters: HashMap<String, serde_json::Value>,
    pub constrained_mode: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeExit {
    /// `None` when the process was ended by a signal
    pub exit_code: Option<i32>,
}

/// ScriptRuntime starts a script process, streams its output lines into
/// `output` and resolves when the process exits.
///
/// When `cancel` fires the process must be killed and the call must return
/// [`ExecutionError::Cancelled`]. Dropping the returned future must also
/// kill the process.
#[async_trait]
pub trait ScriptRuntime: Send + Sync {
    /// Version string of the runtime, e.g. `7.4.1`
    async fn version(&self) -> Result<String, ExecutionError>;

    async fn run(
        &self,
        invocation: RuntimeInvocation,
        output: mpsc::UnboundedSender<OutputLine>,
        cancel: CancellationToken,
    ) -> Result<RuntimeExit, ExecutionError>;
}

/// Pre-flight report for a catalogued script
#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub script_id: Uuid,
    pub version: i32,
    pub risk_level: RiskLevel,
    pub requires_elevation: bool,
    pub findings: Vec<SecurityFinding>,
    pub warnings: Vec<String>,
    /// Reasons the script would be refused
    pub blocking_issues: Vec<String>,
}

impl ValidationReport {
    pub fn can_execute(&self) -> bool {
        self.blocking_issues.is_empty()
    }
}
