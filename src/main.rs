#![forbid(unsafe_code)]

//! `agent-relay`: line-oriented front end for the session scheduler.
//!
//! Every stdin line is a message for one session. Plain lines become agent
//! tasks; `/status`, `/stop`, `/interrupt <id>` and `/queue <id>` are
//! control commands. Stream events and command results are written to
//! stdout as JSON lines; logs go to stderr.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use agent_relay::agent::client::AgentClient;
use agent_relay::config::GlobalConfig;
use agent_relay::models::event::StreamEvent;
use agent_relay::models::task::{SessionKey, Task};
use agent_relay::orchestrator::decision::{
    Decision, DecisionOutcome, DecisionWindow, SubmitOutcome,
};
use agent_relay::orchestrator::scheduler::{SessionScheduler, SharedExecutor};
use agent_relay::{AppError, Result};

/// Poll interval while waiting for outstanding work after stdin closes.
const IDLE_POLL: Duration = Duration::from_millis(200);

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "agent-relay", about = "Single-flight agent task relay", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file; built-in defaults when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Override the agent working directory.
    #[arg(long)]
    project_dir: Option<PathBuf>,

    /// Session key all stdin messages are scheduled under.
    #[arg(long, default_value = "cli")]
    session: String,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("agent-relay bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let mut config = match &args.config {
        Some(path) => GlobalConfig::load_from_path(path)?,
        None => {
            let mut config = GlobalConfig::default();
            config.validate()?;
            config
        }
    };

    if let Some(dir) = &args.project_dir {
        config.set_project_dir(dir)?;
    }
    info!(
        binary = %config.agent.binary,
        project_dir = %config.agent.project_dir.display(),
        "configuration loaded"
    );

    // ── Build scheduler stack ───────────────────────────
    let client = AgentClient::from_config(&config);
    let scheduler = SessionScheduler::new();
    let window = DecisionWindow::from_config(scheduler.clone(), &config.decision);
    let executor = streaming_executor(client);
    let session = SessionKey::new(args.session);

    // ── Read messages until EOF or shutdown ─────────────
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            () = shutdown_signal() => {
                info!("shutdown signal received");
                scheduler.stop(&session).await;
                return Ok(());
            }
            line = lines.next_line() => line?,
        };

        let Some(line) = line else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        handle_line(line, &session, &window, &executor).await;
    }

    wait_until_idle(&scheduler, &session).await;
    info!("agent-relay shut down");
    Ok(())
}

/// Dispatch one input line.
async fn handle_line(
    line: &str,
    session: &SessionKey,
    window: &DecisionWindow,
    executor: &SharedExecutor,
) {
    let scheduler = window.scheduler();

    if line == "/status" {
        let status = scheduler.get_status(session).await;
        emit(&json!({ "status": status }));
        return;
    }

    if line == "/stop" {
        let (aborted, cleared) = scheduler.stop(session).await;
        emit(&json!({ "stopped": { "aborted": aborted, "cleared": cleared } }));
        return;
    }

    if let Some(rest) = line.strip_prefix('/') {
        let (action, task_id) = rest.split_once(' ').unwrap_or((rest, ""));
        let Some(decision) = Decision::from_action(action) else {
            emit(&json!({ "error": format!("unknown command: /{action}") }));
            return;
        };
        let outcome = window.resolve(task_id.trim(), decision).await;
        emit(&decision_json(task_id.trim(), outcome));
        return;
    }

    let task = Task::new(session.clone(), line);
    match window.submit(task, Arc::clone(executor)).await {
        SubmitOutcome::Started { task_id } => {
            emit(&json!({ "task_id": task_id, "submitted": "started" }));
        }
        SubmitOutcome::AwaitingDecision {
            task_id,
            queue_size,
            timeout,
        } => {
            emit(&json!({
                "task_id": task_id,
                "submitted": "awaiting_decision",
                "queue_size": queue_size,
                "timeout_seconds": timeout.as_secs(),
            }));
        }
    }
}

/// Executor that streams every agent event to stdout.
fn streaming_executor(client: AgentClient) -> SharedExecutor {
    Arc::new(move |task: Task, cancel: CancellationToken| {
        let client = client.clone();
        async move {
            let mut events =
                client.stream(task.id.clone(), &task.prompt, task.context.as_deref(), cancel);
            while let Some(event) = events.recv().await {
                emit(&json!({ "task_id": task.id, "event": event }));
                if let StreamEvent::Error { message } = event {
                    return Err(AppError::Agent(message));
                }
            }
            Ok(())
        }
    })
}

fn decision_json(task_id: &str, outcome: DecisionOutcome) -> serde_json::Value {
    match outcome {
        DecisionOutcome::Interrupted { cleared } => {
            json!({ "task_id": task_id, "decision": "interrupted", "cleared": cleared })
        }
        DecisionOutcome::Queued { position } => {
            json!({ "task_id": task_id, "decision": "queued", "position": position })
        }
        DecisionOutcome::AlreadyStarted => {
            json!({ "task_id": task_id, "decision": "already_started" })
        }
        DecisionOutcome::Expired => json!({ "task_id": task_id, "decision": "expired" }),
    }
}

fn emit(value: &serde_json::Value) {
    println!("{value}");
}

/// Wait until the session has been idle with an empty queue for two polls.
async fn wait_until_idle(scheduler: &SessionScheduler, session: &SessionKey) {
    let mut idle_polls = 0;
    while idle_polls < 2 {
        tokio::select! {
            () = shutdown_signal() => {
                warn!("shutdown during drain, aborting outstanding work");
                scheduler.stop(session).await;
                return;
            }
            () = tokio::time::sleep(IDLE_POLL) => {}
        }
        let status = scheduler.get_status(session).await;
        if status.is_processing || status.queue_size > 0 {
            idle_polls = 0;
        } else {
            idle_polls += 1;
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
