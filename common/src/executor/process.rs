// PowerShell runtime backed by a child process

use super::{OutputLine, OutputStream, RuntimeExit, RuntimeInvocation, ScriptRuntime};
use crate::errors::ExecutionError;
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// Environment variable carrying the JSON-encoded parameters
const PARAMETERS_ENV: &str = "SCRIPT_PARAMETERS";

const VERSION_PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Runs scripts with `pwsh`. Each script is written to a temporary `.ps1`
/// file and invoked through a small launcher that splats the parameters.
#[derive(Debug, Clone)]
pub struct PwshRuntime {
    executable: String,
}

impl PwshRuntime {
    pub fn new(executable: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
        }
    }

    fn base_command(&self) -> Command {
        let mut cmd = Command::new(&self.executable);
        cmd.args(["-NoLogo", "-NoProfile", "-NonInteractive"]);
        cmd
    }
}

/// Quote a value as a single-quoted PowerShell string literal
fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Launcher passed to `-Command`. Parameters arrive as JSON in the
/// environment and are splatted into the script.
fn launcher(script_path: &str, constrained_mode: bool) -> String {
    let mut lines = vec![
        "$ErrorActionPreference = 'Stop'".to_string(),
        format!(
            "$__params = if ($env:{0}) {{ $env:{0} | ConvertFrom-Json -AsHashtable }} else {{ @{{}} }}",
            PARAMETERS_ENV
        ),
    ];
    if constrained_mode {
        lines.push("$ExecutionContext.SessionState.LanguageMode = 'ConstrainedLanguage'".to_string());
    }
    lines.push(format!("& {} @__params", quote_literal(script_path)));
    lines.push("if ($LASTEXITCODE) { exit $LASTEXITCODE }".to_string());
    lines.join("\n")
}

/// Forward every line of a stream until EOF
async fn forward_lines<R: AsyncRead + Unpin>(
    reader: Option<R>,
    stream: OutputStream,
    output: mpsc::UnboundedSender<OutputLine>,
) {
    let Some(reader) = reader else {
        return;
    };
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if output.send(OutputLine { stream, line }).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "Output stream read failed");
                break;
            }
        }
    }
}

#[async_trait]
impl ScriptRuntime for PwshRuntime {
    #[instrument(skip(self), fields(executable = %self.executable))]
    async fn version(&self) -> Result<String, ExecutionError> {
        let mut cmd = self.base_command();
        cmd.args(["-Command", "$PSVersionTable.PSVersion.ToString()"])
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = tokio::time::timeout(VERSION_PROBE_TIMEOUT, cmd.output())
            .await
            .map_err(|_| ExecutionError::Runtime("Runtime version probe timed out".to_string()))?
            .map_err(|e| ExecutionError::Runtime(format!("Failed to start {}: {}", self.executable, e)))?;

        if !output.status.success() {
            return Err(ExecutionError::Runtime(format!(
                "Runtime version probe exited with {}",
                output.status
            )));
        }
        let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if version.is_empty() {
            return Err(ExecutionError::Runtime(
                "Runtime version probe returned nothing".to_string(),
            ));
        }
        Ok(version)
    }

    #[instrument(skip(self, invocation, output, cancel), fields(execution_id = %invocation.execution_id))]
    async fn run(
        &self,
        invocation: RuntimeInvocation,
        output: mpsc::UnboundedSender<OutputLine>,
        cancel: CancellationToken,
    ) -> Result<RuntimeExit, ExecutionError> {
        let script_file = tempfile::Builder::new()
            .prefix("script-")
            .suffix(".ps1")
            .tempfile()
            .map_err(|e| ExecutionError::Runtime(format!("Failed to create script file: {}", e)))?;
        let mut file = tokio::fs::File::create(script_file.path())
            .await
            .map_err(|e| ExecutionError::Runtime(format!("Failed to open script file: {}", e)))?;
        file.write_all(invocation.content.as_bytes())
            .await
            .map_err(|e| ExecutionError::Runtime(format!("Failed to write script file: {}", e)))?;
        file.flush()
            .await
            .map_err(|e| ExecutionError::Runtime(format!("Failed to write script file: {}", e)))?;
        drop(file);

        let parameters = serde_json::to_string(&invocation.parameters)
            .map_err(|e| ExecutionError::InvalidRequest(format!("Unserializable parameters: {}", e)))?;
        let script_path = script_file.path().to_string_lossy().into_owned();

        let mut cmd = self.base_command();
        cmd.arg("-Command")
            .arg(launcher(&script_path, invocation.constrained_mode))
            .env(PARAMETERS_ENV, parameters)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| ExecutionError::Runtime(format!("Failed to start {}: {}", self.executable, e)))?;
        debug!(pid = ?child.id(), "Script process started");

        let stdout_task = tokio::spawn(forward_lines(
            child.stdout.take(),
            OutputStream::Stdout,
            output.clone(),
        ));
        let stderr_task = tokio::spawn(forward_lines(child.stderr.take(), OutputStream::Stderr, output));

        tokio::select! {
            status = child.wait() => {
                let status = status
                    .map_err(|e| ExecutionError::Runtime(format!("Failed to wait for script: {}", e)))?;
                let _ = stdout_task.await;
                let _ = stderr_task.await;
                Ok(RuntimeExit { exit_code: status.code() })
            }
            _ = cancel.cancelled() => {
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "Failed to kill cancelled script process");
                }
                stdout_task.abort();
                stderr_task.abort();
                Err(ExecutionError::Cancelled)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use uuid::Uuid;

    #[test]
    fn test_quote_literal_doubles_single_quotes() {
        assert_eq!(quote_literal("C:\\it's\\a.ps1"), "'C:\\it''s\\a.ps1'");
    }

    #[test]
    fn test_launcher_enables_constrained_language_only_when_asked() {
        let constrained = launcher("/tmp/a.ps1", true);
        assert!(constrained.contains("ConstrainedLanguage"));
        assert!(constrained.contains("& '/tmp/a.ps1' @__params"));
        assert!(constrained.contains("$env:SCRIPT_PARAMETERS"));

        let full = launcher("/tmp/a.ps1", false);
        assert!(!full.contains("ConstrainedLanguage"));
    }

    #[tokio::test]
    async fn test_missing_executable_is_a_runtime_error() {
        let runtime = PwshRuntime::new("definitely-not-a-real-pwsh-binary");
        let (tx, _rx) = mpsc::unbounded_channel();
        let invocation = RuntimeInvocation {
            execution_id: Uuid::new_v4(),
            content: "Write-Output 'hi'".to_string(),
            parameters: HashMap::new(),
            constrained_mode: false,
        };
        let result = runtime.run(invocation, tx, CancellationToken::new()).await;
        assert!(matches!(result, Err(ExecutionError::Runtime(_))));
        assert!(matches!(runtime.version().await, Err(ExecutionError::Runtime(_))));
    }

    #[tokio::test]
    #[ignore] // Requires pwsh on PATH
    async fn test_pwsh_runs_script_with_parameters() {
        let runtime = PwshRuntime::new("pwsh");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut parameters = HashMap::new();
        parameters.insert("Name".to_string(), serde_json::json!("world"));
        let invocation = RuntimeInvocation {
            execution_id: Uuid::new_v4(),
            content: "param([string]$Name)\nWrite-Output \"hello $Name\"".to_string(),
            parameters,
            constrained_mode: true,
        };

        let exit = runtime.run(invocation, tx, CancellationToken::new()).await.unwrap();
        assert_eq!(exit.exit_code, Some(0));
        let line = rx.recv().await.unwrap();
        assert_eq!(line.line, "hello world");
        assert!(!runtime.version().await.unwrap().is_empty());
    }
}
