use futures::future::BoxFuture;
use serde::Deserialize;
use tracing::debug;

use conductor_core::error::{ConductorError, Result};
use conductor_core::traits::Executor;
use conductor_core::types::{ExecutorOutput, InvocationContext};

const MAX_OUTPUT: usize = 30_000;

/// Runs a command through `sh -c`.
pub struct ShellTool;

#[derive(Deserialize)]
struct ShellInput {
    command: String,
    #[serde(default = "default_timeout")]
    timeout: u64,
}

fn default_timeout() -> u64 { 120 }

fn truncate_output(mut text: String) -> String {
    if text.len() > MAX_OUTPUT {
        let mut cut = MAX_OUTPUT;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
        text.push_str("\n... (output truncated)");
    }
    text
}

impl Executor for ShellTool {
    fn id(&self) -> &str {
        "shell"
    }

    fn description(&self) -> &str {
        "Execute a shell command. Returns stdout, stderr, and the exit code."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute"
                },
                "timeout": {
                    "type": "integer",
                    "description": "Timeout in seconds (default 120)",
                    "default": 120
                }
            },
            "required": ["command"]
        })
    }

    fn execute(
        &self,
        params: serde_json::Value,
        ctx: InvocationContext,
    ) -> BoxFuture<'_, Result<ExecutorOutput>> {
        Box::pin(async move {
            let p: ShellInput =
                serde_json::from_value(params).map_err(|e| ConductorError::InvalidParameters {
                    stage: ctx.stage_id.clone(),
                    reason: e.to_string(),
                })?;

            debug!(command = %p.command, stage = %ctx.stage_id, "Executing shell command");

            let mut command = tokio::process::Command::new("sh");
            command.arg("-c").arg(&p.command).kill_on_drop(true);
            if ctx.working_dir.is_dir() {
                command.current_dir(&ctx.working_dir);
            }

            let timeout = std::time::Duration::from_secs(p.timeout);
            let started = tokio::time::Instant::now();
            let output = match tokio::time::timeout(timeout, command.output()).await {
                Ok(Ok(output)) => output,
                Ok(Err(e)) => {
                    return Err(ConductorError::ExecutorFailed {
                        executor: "shell".to_string(),
                        message: e.to_string(),
                    })
                }
                Err(_) => {
                    return Err(ConductorError::Timeout {
                        executor: "shell".to_string(),
                        timeout_ms: timeout.as_millis() as u64,
                        elapsed_ms: started.elapsed().as_millis() as u64,
                    })
                }
            };

            let stdout = truncate_output(String::from_utf8_lossy(&output.stdout).into_owned());
            let stderr = truncate_output(String::from_utf8_lossy(&output.stderr).into_owned());
            let code = output.status.code().unwrap_or(-1);
            let result = serde_json::json!({
                "stdout": stdout,
                "stderr": stderr,
                "exit_code": code,
            });

            if output.status.success() {
                Ok(ExecutorOutput::success(result))
            } else {
                let mut failure = ExecutorOutput::failure(format!("Exit code {code}\n{stderr}"));
                failure.output = result;
                Ok(failure)
            }
        })
    }
}
