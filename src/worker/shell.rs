//! `run-task` action: runs a task payload's command inside the sandbox.
//!
//! Payload parameters:
//! - `command` (required): shell command line
//! - `workdir`: working directory, defaults to the worker's configured one
//! - `timeoutSecs`: per-task deadline, defaults to the action's timeout
//! - `env`: object of extra environment variables

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use super::handlers::{ActionError, ActionHandler, require_str};

/// Maximum captured output per stream (64KB).
const MAX_OUTPUT_SIZE: usize = 64 * 1024;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1800);

/// Command fragments refused outright, even inside a sandbox.
static BLOCKED_PATTERNS: LazyLock<Vec<&'static str>> = LazyLock::new(|| {
    vec![
        "rm -rf /",
        "rm -rf /*",
        ":(){ :|:& };:",
        "mkfs",
        "dd if=/dev/zero of=/dev/",
        "> /dev/sda",
    ]
});

/// Runs a task's shell command and reports output and exit status.
#[derive(Debug)]
pub struct ShellAction {
    name: String,
    working_dir: Option<PathBuf>,
    timeout: Duration,
}

impl ShellAction {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            working_dir: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = Some(dir);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn blocked_pattern(cmd: &str) -> Option<&'static str> {
        let normalized = cmd.to_lowercase();
        BLOCKED_PATTERNS
            .iter()
            .find(|p| normalized.contains(*p))
            .copied()
    }

    async fn run(
        &self,
        cmd: &str,
        workdir: &PathBuf,
        env: &serde_json::Map<String, Value>,
        timeout: Duration,
    ) -> Result<(String, i32), ActionError> {
        let mut command = Command::new("sh");
        command
            .args(["-c", cmd])
            .current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in env {
            if let Some(value) = value.as_str() {
                command.env(key, value);
            }
        }

        let mut child = command
            .spawn()
            .map_err(|e| ActionError::Failed(format!("failed to spawn command: {e}")))?;

        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();

        let result = tokio::time::timeout(timeout, async {
            let read_stdout = async {
                let mut buf = Vec::new();
                if let Some(out) = stdout_pipe.as_mut() {
                    out.read_to_end(&mut buf).await?;
                }
                Ok::<_, std::io::Error>(buf)
            };
            let read_stderr = async {
                let mut buf = Vec::new();
                if let Some(err) = stderr_pipe.as_mut() {
                    err.read_to_end(&mut buf).await?;
                }
                Ok::<_, std::io::Error>(buf)
            };
            let (stdout, stderr) = tokio::try_join!(read_stdout, read_stderr)?;
            let status = child.wait().await?;

            let stdout = String::from_utf8_lossy(&stdout).to_string();
            let stderr = String::from_utf8_lossy(&stderr).to_string();
            let output = if stderr.is_empty() {
                stdout
            } else if stdout.is_empty() {
                stderr
            } else {
                format!("{stdout}\n\n--- stderr ---\n{stderr}")
            };
            Ok::<_, std::io::Error>((output, status.code().unwrap_or(-1)))
        })
        .await;

        match result {
            Ok(Ok((output, code))) => Ok((truncate_output(&output), code)),
            Ok(Err(e)) => Err(ActionError::Failed(format!("command execution failed: {e}"))),
            Err(_) => {
                let _ = child.kill().await;
                Err(ActionError::Timeout(timeout))
            }
        }
    }
}

#[async_trait]
impl ActionHandler for ShellAction {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Run the task's shell command in the sandbox and report its output"
    }

    async fn execute(&self, params: Value) -> Result<Value, ActionError> {
        let command = require_str(&params, "command")?;
        if let Some(pattern) = Self::blocked_pattern(command) {
            return Err(ActionError::NotAuthorized(format!(
                "command contains blocked pattern '{pattern}'"
            )));
        }

        let workdir = params
            .get("workdir")
            .and_then(|v| v.as_str())
            .map(PathBuf::from)
            .or_else(|| self.working_dir.clone())
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
        let timeout = params
            .get("timeoutSecs")
            .and_then(|v| v.as_u64())
            .map(Duration::from_secs)
            .unwrap_or(self.timeout);
        let empty = serde_json::Map::new();
        let env = params
            .get("env")
            .and_then(|v| v.as_object())
            .unwrap_or(&empty);

        let start = Instant::now();
        let (output, exit_code) = self.run(command, &workdir, env, timeout).await?;
        let duration_ms = start.elapsed().as_millis() as u64;

        if exit_code != 0 {
            return Err(ActionError::Failed(format!(
                "command exited with status {exit_code}: {}",
                tail(&output, 2000)
            )));
        }

        Ok(serde_json::json!({
            "output": output,
            "exitCode": exit_code,
            "durationMs": duration_ms,
        }))
    }
}

/// Keep head and tail of oversized output (UTF-8 safe).
fn truncate_output(s: &str) -> String {
    if s.len() <= MAX_OUTPUT_SIZE {
        return s.to_string();
    }
    let half = MAX_OUTPUT_SIZE / 2;
    let head_end = floor_char_boundary(s, half);
    let tail_start = floor_char_boundary(s, s.len() - half);
    format!(
        "{}\n\n... [truncated {} bytes] ...\n\n{}",
        &s[..head_end],
        s.len() - MAX_OUTPUT_SIZE,
        &s[tail_start..]
    )
}

/// Last `max` bytes of `s`, on a char boundary.
fn tail(s: &str, max: usize) -> &str {
    if s.len() <= max {
        s
    } else {
        &s[floor_char_boundary(s, s.len() - max)..]
    }
}

fn floor_char_boundary(s: &str, i: usize) -> usize {
    if i >= s.len() {
        return s.len();
    }
    let mut pos = i;
    while pos > 0 && !s.is_char_boundary(pos) {
        pos -= 1;
    }
    pos
}
