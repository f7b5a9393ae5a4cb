//! Shell-backed tools. Every run has a bounded timeout and is killed on expiry.

use super::{get_string, ParamKind, ParamSpec, Tool, ToolEnv, ToolOutput};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Outcome of a finished shell command.
#[derive(Debug, Clone)]
pub struct CommandRun {
    pub exit_code: Option<i32>,
    pub output: String,
    pub timed_out: bool,
}

impl CommandRun {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    fn into_tool_output(self, command: &str) -> ToolOutput {
        let data = json!({
            "command": command,
            "exit_code": self.exit_code,
            "timed_out": self.timed_out,
        });
        if self.success() {
            ToolOutput::ok(self.output).with_data(data)
        } else {
            let error = if self.timed_out {
                format!("command timed out: {}", command)
            } else {
                format!("command exited with {:?}: {}", self.exit_code, command)
            };
            ToolOutput::failed(self.output, error).with_data(data)
        }
    }
}

/// Run `command` through the shell in `cwd`, killing it after `timeout`.
pub async fn run_shell(command: &str, cwd: &Path, timeout: Duration) -> Result<CommandRun> {
    let child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("spawning {}", command))?;

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(output) => {
            let output = output.with_context(|| format!("waiting for {}", command))?;
            let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stderr.is_empty() {
                if !text.is_empty() && !text.ends_with('\n') {
                    text.push('\n');
                }
                text.push_str(&stderr);
            }
            Ok(CommandRun {
                exit_code: output.status.code(),
                output: text,
                timed_out: false,
            })
        }
        // The child future is dropped here, which kills the process.
        Err(_) => Ok(CommandRun {
            exit_code: None,
            output: String::new(),
            timed_out: true,
        }),
    }
}

pub struct RunCommand;

const RUN_COMMAND_PARAMS: &[ParamSpec] = &[ParamSpec::required(
    "command",
    ParamKind::String,
    "Shell command run from the workspace root",
)];

#[async_trait]
impl Tool for RunCommand {
    fn name(&self) -> &'static str {
        "run_command"
    }

    fn category(&self) -> &'static str {
        "shell"
    }

    fn read_only(&self) -> bool {
        false
    }

    fn description(&self) -> &'static str {
        "Run a shell command in the workspace"
    }

    fn params(&self) -> &'static [ParamSpec] {
        RUN_COMMAND_PARAMS
    }

    fn records_transcript(&self) -> bool {
        true
    }

    async fn execute(&self, env: &ToolEnv, params: &Value) -> Result<ToolOutput> {
        let command = get_string(params, "command").unwrap_or_default();
        let timeout = Duration::from_millis(env.config.command_timeout_ms);
        let run = run_shell(&command, env.workspace.root(), timeout).await?;
        Ok(run.into_tool_output(&command))
    }
}

pub struct Typecheck;

#[async_trait]
impl Tool for Typecheck {
    fn name(&self) -> &'static str {
        "typecheck"
    }

    fn category(&self) -> &'static str {
        "verification"
    }

    fn read_only(&self) -> bool {
        true
    }

    fn description(&self) -> &'static str {
        "Run the configured type checker over the workspace"
    }

    fn params(&self) -> &'static [ParamSpec] {
        &[]
    }

    fn records_transcript(&self) -> bool {
        true
    }

    async fn execute(&self, env: &ToolEnv, _params: &Value) -> Result<ToolOutput> {
        let Some(command) = env.config.typecheck_command.as_deref() else {
            return Ok(ToolOutput::ok("no typecheck command configured")
                .with_data(json!({ "skipped": true })));
        };
        let timeout = Duration::from_millis(env.config.command_timeout_ms);
        let run = run_shell(command, env.workspace.root(), timeout).await?;
        Ok(run.into_tool_output(command))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_shell_captures_output_and_status() {
        let cwd = std::env::temp_dir();
        let run = run_shell("echo hi; echo err 1>&2; exit 3", &cwd, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(run.exit_code, Some(3));
        assert!(!run.success());
        assert!(run.output.contains("hi"));
        assert!(run.output.contains("err"));
    }

    #[tokio::test]
    async fn test_run_shell_times_out() {
        let cwd = std::env::temp_dir();
        let run = run_shell("sleep 5", &cwd, Duration::from_millis(100))
            .await
            .unwrap();
        assert!(run.timed_out);
        assert!(!run.success());
    }
}
