use super::{StepTool, ToolInvocation, ToolOutput};
use crate::PlanError;
use async_trait::async_trait;
use helm_store::ToolKind;
use serde_json::json;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{info, warn};

const DEFAULT_SHELL_TIMEOUT: Duration = Duration::from_secs(60);

/// Runs the step's command locally through `sh -c`.
#[derive(Clone, Debug)]
pub struct ShellTool {
    timeout: Duration,
    working_dir: Option<PathBuf>,
}

impl Default for ShellTool {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_SHELL_TIMEOUT,
            working_dir: None,
        }
    }
}

impl ShellTool {
    pub fn new(timeout: Duration, working_dir: Option<PathBuf>) -> Self {
        Self {
            timeout,
            working_dir,
        }
    }
}

struct ShellRun {
    stdout: String,
    stderr: String,
    exit_code: i32,
    timed_out: bool,
    duration_ms: u128,
}

#[async_trait]
impl StepTool for ShellTool {
    fn kind(&self) -> ToolKind {
        ToolKind::Shell
    }

    async fn execute(&self, invocation: &ToolInvocation) -> Result<ToolOutput, PlanError> {
        let command = extract_shell_command(&invocation.prompt).ok_or_else(|| {
            PlanError::Tool(format!(
                "no shell command found in step '{}'",
                invocation.prompt
            ))
        })?;
        info!(task_id = %invocation.task_id, command = %command, "running shell step");

        let run = self.run(&command).await?;
        let data = json!({
            "command": command,
            "exitCode": run.exit_code,
            "stdout": run.stdout,
            "stderr": run.stderr,
            "timedOut": run.timed_out,
        });
        let message = format_shell_run(&run);
        if run.timed_out {
            warn!(task_id = %invocation.task_id, "shell step timed out");
            return Ok(ToolOutput::failure(
                format!("command timed out after {} ms\n{message}", self.timeout.as_millis()),
                data,
            ));
        }
        if run.exit_code == 0 {
            Ok(ToolOutput::success(message, data))
        } else {
            Ok(ToolOutput::failure(message, data))
        }
    }
}

impl ShellTool {
    async fn run(&self, command: &str) -> Result<ShellRun, PlanError> {
        let mut process = Command::new("sh");
        process
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = self.working_dir.as_ref() {
            process.current_dir(dir);
        }

        let started = Instant::now();
        let child = process
            .spawn()
            .map_err(|error| PlanError::Tool(format!("failed to launch shell command: {error}")))?;
        match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(output) => {
                let output = output.map_err(|error| {
                    PlanError::Tool(format!("failed waiting for shell command: {error}"))
                })?;
                Ok(ShellRun {
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                    exit_code: output.status.code().unwrap_or(-1),
                    timed_out: false,
                    duration_ms: started.elapsed().as_millis(),
                })
            }
            // The child future is dropped here, which kills the process.
            Err(_) => Ok(ShellRun {
                stdout: String::new(),
                stderr: String::new(),
                exit_code: -1,
                timed_out: true,
                duration_ms: started.elapsed().as_millis(),
            }),
        }
    }
}

/// First backtick-quoted span, else the rest of a `$ ` prefixed line.
pub fn extract_shell_command(prompt: &str) -> Option<String> {
    if let Some(start) = prompt.find('`') {
        let rest = &prompt[start + 1..];
        if let Some(end) = rest.find('`') {
            let command = rest[..end].trim();
            if !command.is_empty() {
                return Some(command.to_string());
            }
        }
    }
    prompt
        .lines()
        .map(str::trim)
        .find_map(|line| line.strip_prefix("$ "))
        .map(|command| command.trim().to_string())
        .filter(|command| !command.is_empty())
}

fn format_shell_run(run: &ShellRun) -> String {
    let mut output = format!(
        "exit_code: {}\nduration_ms: {}",
        run.exit_code, run.duration_ms
    );
    if !run.stdout.is_empty() {
        output.push_str("\nstdout:\n");
        output.push_str(&run.stdout);
    }
    if !run.stderr.is_empty() {
        output.push_str("\nstderr:\n");
        output.push_str(&run.stderr);
    }
    output
}
