//! Non-streaming execution facade.
//!
//! [`AgentClient::call`] drives the protocol engine to completion and
//! returns the final [`AgentReply`]. A failed attempt is retried with a
//! fresh process after a linearly growing delay; once the retry budget is
//! spent the caller receives [`AppError::RetryExhausted`] carrying only the
//! configured user-facing message.
//!
//! The client does no scheduling. Concurrency control belongs to
//! [`SessionScheduler`](crate::orchestrator::scheduler::SessionScheduler).

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, Instrument};

use crate::agent::process::stream_agent;
use crate::config::{AgentConfig, GlobalConfig, RetryConfig};
use crate::models::event::{AgentReply, StreamEvent};
use crate::models::task::generate_task_id;
use crate::{AppError, Result};

/// Entry point for running prompts against the configured agent.
#[derive(Debug, Clone)]
pub struct AgentClient {
    agent: Arc<AgentConfig>,
    retry: RetryConfig,
}

impl AgentClient {
    /// Create a client from explicit agent and retry settings.
    #[must_use]
    pub fn new(agent: AgentConfig, retry: RetryConfig) -> Self {
        Self {
            agent: Arc::new(agent),
            retry,
        }
    }

    /// Create a client from the global configuration.
    #[must_use]
    pub fn from_config(config: &GlobalConfig) -> Self {
        Self::new(config.agent.clone(), config.retry.clone())
    }

    /// Agent settings used for every spawned process.
    #[must_use]
    pub fn agent_config(&self) -> &AgentConfig {
        &self.agent
    }

    /// Start one agent process and return its event stream.
    ///
    /// See [`stream_agent`] for the stream contract.
    #[must_use]
    pub fn stream(
        &self,
        task_id: impl Into<String>,
        prompt: &str,
        context: Option<&str>,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<StreamEvent> {
        stream_agent(
            Arc::clone(&self.agent),
            task_id.into(),
            prompt,
            context,
            cancel,
        )
    }

    /// Run `prompt` to completion with retries.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::RetryExhausted`] with the configured fallback
    /// message once `1 + max_retries` attempts have failed.
    pub async fn call(&self, prompt: &str, context: Option<&str>) -> Result<AgentReply> {
        self.call_cancellable(prompt, context, &CancellationToken::new())
            .await
    }

    /// Run `prompt` to completion with retries, stopping early on `cancel`.
    ///
    /// # Errors
    ///
    /// - [`AppError::Cancelled`]: `cancel` fired; no further attempts run.
    /// - [`AppError::RetryExhausted`]: every attempt failed.
    pub async fn call_cancellable(
        &self,
        prompt: &str,
        context: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<AgentReply> {
        let call_id = generate_task_id();
        let span = info_span!("agent_call", call_id = %call_id);

        async {
            for attempt in 0..=self.retry.max_retries {
                if attempt > 0 {
                    let delay = self.retry.delay_for(attempt);
                    info!(attempt, ?delay, "retrying agent call");
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => return Err(cancelled()),
                        () = tokio::time::sleep(delay) => {}
                    }
                }

                match self
                    .attempt(&call_id, prompt, context, cancel.child_token())
                    .await
                {
                    Ok(reply) => {
                        debug!(attempt, response_len = reply.response.len(), "agent call succeeded");
                        return Ok(reply);
                    }
                    Err(_) if cancel.is_cancelled() => return Err(cancelled()),
                    Err(err) => {
                        error!(attempt = attempt + 1, %err, "agent call failed");
                    }
                }
            }

            Err(AppError::RetryExhausted(self.retry.fallback_message.clone()))
        }
        .instrument(span)
        .await
    }

    /// Single attempt: one process, one stream.
    async fn attempt(
        &self,
        call_id: &str,
        prompt: &str,
        context: Option<&str>,
        cancel: CancellationToken,
    ) -> Result<AgentReply> {
        // Leaving early (error or drop) kills the process.
        let _guard = cancel.clone().drop_guard();
        let mut events = self.stream(call_id, prompt, context, cancel);
        collect_reply(&mut events).await
    }
}

/// Fold an event stream into the final reply.
///
/// # Errors
///
/// - [`AppError::Agent`]: the stream ended with an `Error` event.
/// - [`AppError::Cancelled`]: the stream closed without a terminal event.
pub async fn collect_reply(events: &mut mpsc::Receiver<StreamEvent>) -> Result<AgentReply> {
    let mut reply = AgentReply::default();

    while let Some(event) = events.recv().await {
        match event {
            StreamEvent::Thinking { text } => reply.thinking = Some(text),
            StreamEvent::Text { text } => reply.response = text,
            StreamEvent::Tool { name, .. } => debug!(tool = %name, "agent used tool"),
            StreamEvent::Done { text } => {
                if !text.is_empty() {
                    reply.response = text;
                }
                return Ok(reply);
            }
            StreamEvent::Error { message } => return Err(AppError::Agent(message)),
        }
    }

    Err(AppError::Cancelled(
        "agent stream ended without a result".into(),
    ))
}

fn cancelled() -> AppError {
    AppError::Cancelled("agent call aborted".into())
}
