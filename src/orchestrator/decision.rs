//! Interrupt-or-queue decision window.
//!
//! A task submitted while its session is busy is held for a bounded
//! window. Within it a caller may choose [`Decision::Interrupt`] (abort the
//! running task, drop the queue, run the new one) or [`Decision::Queue`].
//! If nobody answers, the deadline job queues the task, so an unattended
//! session never stalls.
//!
//! ```text
//! submit ──busy──▶ AwaitingDecision ──interrupt──▶ running
//!   │                    │ ├──queue────────▶ queued
//!   └──idle──▶ running   │ └──deadline─────▶ queued
//!                        └──late decision──▶ AlreadyStarted / Expired
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::DecisionConfig;
use crate::models::task::Task;
use crate::orchestrator::scheduler::{
    Admission, PendingDecision, SessionScheduler, SharedExecutor,
};
use crate::Result;

/// Caller's answer for a held task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Abort the running task, clear the queue, and run the held task now.
    Interrupt,
    /// Append the held task to the queue.
    Queue,
}

impl Decision {
    /// Parse a front-end action string (`abort` / `interrupt` / `queue`).
    #[must_use]
    pub fn from_action(action: &str) -> Option<Self> {
        match action {
            "abort" | "interrupt" => Some(Self::Interrupt),
            "queue" => Some(Self::Queue),
            _ => None,
        }
    }
}

/// What happened to a newly submitted task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Session was idle; the task is running.
    Started {
        /// Submitted task.
        task_id: String,
    },
    /// Session was busy; the task awaits a decision.
    AwaitingDecision {
        /// Held task.
        task_id: String,
        /// Queue length when the task was held.
        queue_size: usize,
        /// Window before the task is queued automatically.
        timeout: Duration,
    },
}

/// Result of resolving a held task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionOutcome {
    /// Running task aborted, `cleared` queued tasks dropped, held task started.
    Interrupted {
        /// Number of queued tasks discarded.
        cleared: usize,
    },
    /// Held task appended to the queue at `position` (1-based).
    Queued {
        /// Queue position.
        position: usize,
    },
    /// Task already left the decision window and is running or queued.
    AlreadyStarted,
    /// Task is unknown or was resolved by another path.
    Expired,
}

/// Decision protocol layered on a [`SessionScheduler`].
#[derive(Debug, Clone)]
pub struct DecisionWindow {
    scheduler: SessionScheduler,
    timeout: Duration,
}

impl DecisionWindow {
    /// Create a window with an explicit timeout.
    #[must_use]
    pub fn new(scheduler: SessionScheduler, timeout: Duration) -> Self {
        Self { scheduler, timeout }
    }

    /// Create a window from configuration.
    #[must_use]
    pub fn from_config(scheduler: SessionScheduler, config: &DecisionConfig) -> Self {
        Self::new(scheduler, config.timeout())
    }

    /// Underlying scheduler.
    #[must_use]
    pub fn scheduler(&self) -> &SessionScheduler {
        &self.scheduler
    }

    /// Decision window length.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Submit `task`: run it if the session is idle, otherwise hold it.
    ///
    /// The choice is made under the session lock, so a `Started` task is
    /// already active when this returns and a second submission is held.
    /// A held task replaces any earlier held task for the same session; the
    /// displaced one is queued first.
    pub async fn submit(&self, task: Task, executor: SharedExecutor) -> SubmitOutcome {
        let deadline = CancellationToken::new();
        let task_id = task.id.clone();

        let hold = match self.scheduler.admit(&task, &executor, &deadline).await {
            Admission::Started(claim) => {
                debug!(session_key = %task.session_key, task_id, "session idle, task started");
                let scheduler = self.scheduler.clone();
                spawn_reported(task_id.clone(), async move {
                    scheduler.run_claimed(claim, task, executor).await
                });
                return SubmitOutcome::Started { task_id };
            }
            Admission::Held(hold) => hold,
        };

        let queue_size = match hold.displaced {
            Some(displaced) => {
                info!(task_id = %displaced.task_id, "pending decision superseded, queueing it");
                self.queue_displaced(displaced).await;
                self.scheduler.get_queue_length(&task.session_key).await
            }
            None => hold.queue_size,
        };

        info!(
            session_key = %task.session_key,
            task_id,
            queue_size,
            "session busy, awaiting decision"
        );
        self.spawn_deadline(task_id.clone(), deadline);

        SubmitOutcome::AwaitingDecision {
            task_id,
            queue_size,
            timeout: self.timeout,
        }
    }

    /// Apply `decision` to the held task `task_id`.
    ///
    /// Late decisions are reported, never raised.
    pub async fn resolve(&self, task_id: &str, decision: Decision) -> DecisionOutcome {
        if self.scheduler.is_task_started(task_id).await {
            debug!(task_id, ?decision, "decision for task that already started");
            return DecisionOutcome::AlreadyStarted;
        }

        let Some(task) = self.scheduler.get_pending_task(task_id).await else {
            return DecisionOutcome::Expired;
        };
        let Some(slot) = self
            .scheduler
            .take_pending_decision(&task.session_key, task_id)
            .await
        else {
            return DecisionOutcome::Expired;
        };
        slot.deadline.cancel();

        let Some(task) = self.scheduler.remove_pending_task(task_id).await else {
            return DecisionOutcome::Expired;
        };

        match decision {
            Decision::Interrupt => {
                let (cleared, handle) = self.scheduler.interrupt_with(task, slot.executor).await;
                info!(task_id, cleared, "task interrupted, queue cleared");
                let task_id = task_id.to_owned();
                tokio::spawn(async move {
                    match handle.await {
                        Ok(result) => report(&task_id, result),
                        Err(err) => warn!(task_id, %err, "interrupting task join failed"),
                    }
                });
                DecisionOutcome::Interrupted { cleared }
            }
            Decision::Queue => {
                let (position, completion) =
                    self.scheduler.push_queued(task, slot.executor).await;
                info!(task_id, position, "task queued");
                spawn_reported(task_id.to_owned(), completion.wait());
                DecisionOutcome::Queued { position }
            }
        }
    }

    /// Queue a pending decision that lost its slot.
    async fn queue_displaced(&self, displaced: PendingDecision) {
        displaced.deadline.cancel();
        let Some(task) = self.scheduler.remove_pending_task(&displaced.task_id).await else {
            return;
        };
        let (_, completion) = self
            .scheduler
            .push_queued(task, Arc::clone(&displaced.executor))
            .await;
        spawn_reported(displaced.task_id, completion.wait());
    }

    /// Queue `task_id` automatically unless `deadline` is cancelled first.
    fn spawn_deadline(&self, task_id: String, deadline: CancellationToken) {
        let window = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                () = deadline.cancelled() => {
                    debug!(task_id, "decision made before deadline");
                }
                () = tokio::time::sleep(window.timeout) => {
                    info!(task_id, "auto-queuing due to timeout");
                    let outcome = window.resolve(&task_id, Decision::Queue).await;
                    debug!(task_id, ?outcome, "deadline resolution");
                }
            }
        });
    }
}

/// Run `fut` in the background and log its outcome.
fn spawn_reported<F>(task_id: String, fut: F)
where
    F: std::future::Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let result = fut.await;
        report(&task_id, result);
    });
}

fn report(task_id: &str, result: Result<()>) {
    match result {
        Ok(()) => debug!(task_id, "task completed"),
        Err(err) => warn!(task_id, %err, "task failed"),
    }
}
