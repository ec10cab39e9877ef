//! Agent process spawner.
//!
//! Spawns one headless agent process per task with:
//! - `kill_on_drop(true)` so an abandoned handle never leaks a process.
//! - stdout and stderr captured as pipes, stdin closed.
//! - the configured project directory as working directory.
//!
//! Invocation shape: `<binary> [args…] -p <prompt> --dangerously-skip-permissions
//! --output-format stream-json --verbose`.

use std::process::Stdio;

use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tracing::debug;

use crate::config::AgentConfig;
use crate::{AppError, Result};

/// Flags requesting unattended, line-delimited structured output.
pub const STREAM_FLAGS: &[&str] = &[
    "--dangerously-skip-permissions",
    "--output-format",
    "stream-json",
    "--verbose",
];

/// Running agent process with its output pipes detached.
#[derive(Debug)]
pub struct AgentChild {
    /// Child process handle, kept alive so `kill_on_drop` works.
    pub child: Child,
    /// Agent's stdout carrying stream-json lines.
    pub stdout: ChildStdout,
    /// Agent's stderr, drained for error reporting.
    pub stderr: ChildStderr,
}

/// Combine the prompt with optional conversation context.
///
/// Empty context leaves the prompt unchanged.
#[must_use]
pub fn assemble_prompt(prompt: &str, context: Option<&str>) -> String {
    match context {
        Some(history) if !history.trim().is_empty() => {
            format!("[Previous conversation]\n{history}\n\n[Current message]\n{prompt}")
        }
        _ => prompt.to_owned(),
    }
}

/// Full argument list passed to the agent binary.
#[must_use]
pub fn build_args(config: &AgentConfig, prompt: &str) -> Vec<String> {
    let mut args = config.args.clone();
    args.push("-p".to_owned());
    args.push(prompt.to_owned());
    args.extend(STREAM_FLAGS.iter().map(|&flag| flag.to_owned()));
    args
}

/// Spawn the agent for one task.
///
/// # Errors
///
/// - `AppError::Spawn("failed to spawn agent: …")`: OS spawn failure
///   (e.g., executable not found).
/// - `AppError::Spawn("failed to capture agent …")`: a pipe was not set up.
pub fn spawn_agent(config: &AgentConfig, task_id: &str, prompt: &str) -> Result<AgentChild> {
    let mut cmd = Command::new(&config.binary);
    cmd.args(build_args(config, prompt))
        .env("AGENT_RELAY_TASK_ID", task_id)
        .current_dir(&config.project_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|err| AppError::Spawn(format!("failed to spawn agent: {err}")))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AppError::Spawn("failed to capture agent stdout".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| AppError::Spawn("failed to capture agent stderr".into()))?;

    debug!(
        task_id,
        binary = %config.binary,
        pid = child.id(),
        prompt_len = prompt.len(),
        "agent process spawned"
    );

    Ok(AgentChild {
        child,
        stdout,
        stderr,
    })
}
