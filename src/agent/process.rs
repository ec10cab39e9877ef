//! Process protocol engine.
//!
//! Drives one agent process per call: spawn, read stream-json from stdout,
//! emit deduplicated [`StreamEvent`]s on a bounded channel, then settle the
//! exit status. Failures never escape as errors; they become a single
//! terminal [`StreamEvent::Error`].
//!
//! # Terminal events
//!
//! The first terminal event is latched. A non-zero exit that follows a
//! `Done` is logged, not emitted. Cancellation kills the process and closes
//! the channel without any terminal event.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::agent::reader::{run_reader, ReadOutcome};
use crate::agent::spawner::{assemble_prompt, spawn_agent};
use crate::config::AgentConfig;
use crate::models::event::StreamEvent;
use crate::AppError;

/// How long a process may linger after its `result` envelope before it is killed.
const EXIT_GRACE: Duration = Duration::from_secs(5);

/// Start an agent for `prompt` and return the receiving end of its event stream.
///
/// The process runs on a background task. The stream is single-use: a new
/// call spawns a new process. Firing `cancel` (or dropping the receiver)
/// kills the process.
#[must_use]
pub fn stream_agent(
    config: Arc<AgentConfig>,
    task_id: String,
    prompt: &str,
    context: Option<&str>,
    cancel: CancellationToken,
) -> mpsc::Receiver<StreamEvent> {
    let (event_tx, event_rx) = mpsc::channel(config.channel_capacity.max(1));
    let full_prompt = assemble_prompt(prompt, context);
    let span = info_span!("agent_process", task_id = %task_id);

    tokio::spawn(
        async move {
            let mut emitter = TerminalLatch::new(event_tx);
            drive_process(&config, &task_id, &full_prompt, &cancel, &mut emitter).await;
        }
        .instrument(span),
    );

    event_rx
}

// ── Terminal latch ────────────────────────────────────────────────────────────

/// Event sender that admits at most one terminal event.
#[derive(Debug)]
struct TerminalLatch {
    tx: mpsc::Sender<StreamEvent>,
    terminated: bool,
}

impl TerminalLatch {
    fn new(tx: mpsc::Sender<StreamEvent>) -> Self {
        Self {
            tx,
            terminated: false,
        }
    }

    async fn finish(&mut self, event: StreamEvent) {
        if self.terminated {
            warn!(?event, "terminal event already emitted, dropping");
            return;
        }
        self.terminated = true;
        if self.tx.send(event).await.is_err() {
            debug!("event receiver dropped before terminal event");
        }
    }
}

// ── Engine ────────────────────────────────────────────────────────────────────

/// How waiting for process exit ended.
enum Settled {
    Exited(std::io::Result<std::process::ExitStatus>),
    Cancelled,
    Lingering,
}

// ── Driver ────────────────────────────────────────────────────────────────────

async fn drive_process(
    config: &AgentConfig,
    task_id: &str,
    prompt: &str,
    cancel: &CancellationToken,
    latch: &mut TerminalLatch,
) {
    let agent = match spawn_agent(config, task_id, prompt) {
        Ok(agent) => agent,
        Err(err) => {
            error!(%err, "agent spawn failed");
            latch
                .finish(StreamEvent::Error {
                    message: err.to_string(),
                })
                .await;
            return;
        }
    };

    let mut child = agent.child;
    let stderr_task = tokio::spawn(collect_stderr(agent.stderr, config.max_stderr_bytes));

    let outcome = run_reader(
        task_id,
        agent.stdout,
        config.max_line_bytes,
        &latch.tx,
        cancel,
    )
    .await;

    let last_text = match outcome {
        ReadOutcome::Cancelled | ReadOutcome::ReceiverClosed => {
            info!("agent run stopped, killing process");
            kill(&mut child).await;
            stderr_task.abort();
            return;
        }
        ReadOutcome::Failed(message) => {
            error!(error = %message, "agent stdout failed, killing process");
            kill(&mut child).await;
            stderr_task.abort();
            latch
                .finish(StreamEvent::Error {
                    message: format!("failed to read agent output: {message}"),
                })
                .await;
            return;
        }
        ReadOutcome::Completed(text) => {
            latch.finish(StreamEvent::Done { text }).await;
            None
        }
        ReadOutcome::Eof(text) => Some(text),
    };

    // After a result envelope the process gets a short grace period to exit.
    let grace = if latch.terminated {
        EXIT_GRACE
    } else {
        Duration::MAX
    };

    let settled = tokio::select! {
        biased;
        () = cancel.cancelled() => Settled::Cancelled,
        res = tokio::time::timeout(grace, child.wait()) => match res {
            Ok(status) => Settled::Exited(status),
            Err(_) => Settled::Lingering,
        },
    };

    let wait_result = match settled {
        Settled::Exited(status) => status,
        Settled::Cancelled => {
            info!("agent run cancelled while awaiting exit");
            kill(&mut child).await;
            stderr_task.abort();
            return;
        }
        Settled::Lingering => {
            warn!("agent did not exit after result, forcing kill");
            kill(&mut child).await;
            stderr_task.abort();
            return;
        }
    };

    let stderr = stderr_task.await.unwrap_or_default();

    match wait_result {
        Ok(status) if status.success() => {
            debug!("agent exited cleanly");
            if let Some(text) = last_text {
                latch.finish(StreamEvent::Done { text }).await;
            }
        }
        Ok(status) => {
            let err = AppError::Exit {
                code: status.code(),
                stderr,
            };
            if latch.terminated {
                warn!(exit_code = status.code(), %err, "agent exited non-zero after completion");
            } else {
                error!(exit_code = status.code(), %err, "agent exited non-zero");
                latch
                    .finish(StreamEvent::Error {
                        message: err.to_string(),
                    })
                    .await;
            }
        }
        Err(err) => {
            let message = format!("failed to wait for agent: {err}");
            if latch.terminated {
                warn!(error = %message, "agent wait failed after completion");
            } else {
                latch.finish(StreamEvent::Error { message }).await;
            }
        }
    }
}

/// Kill the child, ignoring "already exited" races.
async fn kill(child: &mut Child) {
    if let Err(err) = child.kill().await {
        debug!(%err, "agent kill failed (process likely already exited)");
    }
}

/// Read stderr into a string of at most `limit` bytes, draining the rest.
async fn collect_stderr<R>(stderr: R, limit: usize) -> String
where
    R: AsyncRead + Unpin,
{
    let mut stderr = stderr;
    let mut buf = Vec::new();
    let limit = u64::try_from(limit).unwrap_or(u64::MAX);

    let mut head = (&mut stderr).take(limit);
    if let Err(err) = head.read_to_end(&mut buf).await {
        debug!(%err, "agent stderr read failed");
    }
    if let Err(err) = tokio::io::copy(&mut stderr, &mut tokio::io::sink()).await {
        debug!(%err, "agent stderr drain failed");
    }

    String::from_utf8_lossy(&buf).trim().to_owned()
}
