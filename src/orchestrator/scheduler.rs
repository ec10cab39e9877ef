//! Per-session single-flight task scheduler.
//!
//! Every [`SessionKey`] owns a [`SessionState`] holding at most one active
//! task, a FIFO queue, and at most one task awaiting an interrupt/queue
//! decision. All mutations of one session happen under that session's
//! mutex; different sessions never contend with each other.
//!
//! # Drain loop
//!
//! When the active task finishes (success, failure, or abort) the
//! scheduler clears it and claims the queue head under the same lock,
//! repeating until the queue is empty. If the queue is empty but a decision
//! is still pending, the pending task is promoted so a session never sits
//! idle with work waiting. The session therefore never reports idle while
//! queued work is about to start.
//!
//! # Cancellation
//!
//! Each running task receives a [`CancellationToken`] that acts as its
//! process handle. Only the scheduler fires it, via [`SessionScheduler::abort`]
//! or an interrupt. An abort parks the drain loop: queued tasks stay put
//! until the next submission, so the caller can follow up with
//! [`SessionScheduler::clear_queue`] without racing the queue head.

use std::collections::{HashMap, VecDeque};
use std::fmt::{Debug, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::models::status::SessionStatus;
use crate::models::task::{generate_task_id, SessionKey, Task};
use crate::{AppError, Result};

// ── Executor contract ─────────────────────────────────────────────────────────

/// Boxed future returned by a [`TaskExecutor`].
pub type ExecFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// Caller-supplied work for one task.
///
/// Implementations drive the agent (streaming or via the facade) and
/// render events to their channel. They must stop promptly when `cancel`
/// fires.
pub trait TaskExecutor: Send + Sync {
    /// Run `task` to completion.
    fn execute(&self, task: Task, cancel: CancellationToken) -> ExecFuture;
}

impl<F, Fut> TaskExecutor for F
where
    F: Fn(Task, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn execute(&self, task: Task, cancel: CancellationToken) -> ExecFuture {
        Box::pin(self(task, cancel))
    }
}

/// Shared executor handle stored alongside queued and pending tasks.
pub type SharedExecutor = Arc<dyn TaskExecutor>;

// ── Session state ─────────────────────────────────────────────────────────────

/// The running task and its cancellation capability.
struct ActiveTask {
    task_id: String,
    process: CancellationToken,
}

/// A queued task with its executor and completion notifier.
struct QueuedTask {
    task: Task,
    executor: SharedExecutor,
    done: oneshot::Sender<Result<()>>,
}

/// A task held in the decision window.
pub(crate) struct PendingDecision {
    pub(crate) task_id: String,
    pub(crate) executor: SharedExecutor,
    pub(crate) deadline: CancellationToken,
}

/// Scheduling state of one session.
#[derive(Default)]
pub struct SessionState {
    active: Option<ActiveTask>,
    queue: VecDeque<QueuedTask>,
    pending: Option<PendingDecision>,
    /// Set by an abort; the queue waits for the next submission.
    parked: bool,
}

impl Debug for SessionState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionState")
            .field("active", &self.active.as_ref().map(|a| a.task_id.as_str()))
            .field("queue_len", &self.queue.len())
            .field("pending", &self.pending.as_ref().map(|p| p.task_id.as_str()))
            .field("parked", &self.parked)
            .finish()
    }
}

impl SessionState {
    /// Mark `task_id` as the running task and hand out its process token.
    fn activate(&mut self, task_id: &str) -> CancellationToken {
        let process = CancellationToken::new();
        self.active = Some(ActiveTask {
            task_id: task_id.to_owned(),
            process: process.clone(),
        });
        self.parked = false;
        process
    }
}

type SharedSession = Arc<Mutex<SessionState>>;

// ── Registry ──────────────────────────────────────────────────────────────────

/// Concurrency-safe map from session key to session state.
///
/// Sessions are created on first submission and kept for the lifetime of
/// the registry. The map lock is held only for lookups; per-session work
/// happens under each session's own mutex.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<SessionKey, SharedSession>>,
}

impl SessionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a session, creating it on first use.
    async fn session(&self, key: &SessionKey) -> SharedSession {
        let mut sessions = self.sessions.lock().await;
        Arc::clone(sessions.entry(key.clone()).or_default())
    }

    /// Look up a session without creating it.
    async fn get(&self, key: &SessionKey) -> Option<SharedSession> {
        self.sessions.lock().await.get(key).map(Arc::clone)
    }

    async fn snapshot(&self) -> Vec<SharedSession> {
        self.sessions.lock().await.values().map(Arc::clone).collect()
    }

    /// Number of sessions seen so far.
    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Whether no session has been created yet.
    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }
}

/// Resolves when a queued task has run or been discarded.
pub(crate) struct QueuedCompletion {
    task_id: String,
    done: oneshot::Receiver<Result<()>>,
}

impl QueuedCompletion {
    pub(crate) async fn wait(self) -> Result<()> {
        let task_id = self.task_id;
        self.done
            .await
            .map_err(|_| AppError::Cancelled(format!("queued task {task_id} was discarded")))?
    }
}

/// Active slot claimed for a task that has not started running yet.
pub(crate) struct Claim {
    session: SharedSession,
    process: CancellationToken,
}

/// Task held for a decision by [`SessionScheduler::admit`].
pub(crate) struct Hold {
    /// Earlier pending decision displaced by this one.
    pub(crate) displaced: Option<PendingDecision>,
    /// Queue length at the time the task was held.
    pub(crate) queue_size: usize,
}

/// Result of [`SessionScheduler::admit`].
pub(crate) enum Admission {
    /// The session was idle; the task owns the active slot.
    Started(Claim),
    /// The session was busy; the task awaits a decision.
    Held(Hold),
}


// ── Scheduler ─────────────────────────────────────────────────────────────────

/// Per-session single-flight scheduler.
///
/// Cheap to clone; all clones share the same registry and pending store.
#[derive(Debug, Clone, Default)]
pub struct SessionScheduler {
    registry: Arc<SessionRegistry>,
    /// Tasks awaiting an interrupt/queue decision, keyed by task id.
    pending_tasks: Arc<Mutex<HashMap<String, Task>>>,
}

impl SessionScheduler {
    /// Create a scheduler with a fresh registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a scheduler over an injected registry.
    #[must_use]
    pub fn with_registry(registry: Arc<SessionRegistry>) -> Self {
        Self {
            registry,
            pending_tasks: Arc::default(),
        }
    }

    /// Registry backing this scheduler.
    #[must_use]
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Generate an opaque unique task identifier.
    #[must_use]
    pub fn generate_task_id() -> String {
        generate_task_id()
    }

    /// Whether `key` currently has an executing task.
    pub async fn is_processing(&self, key: &SessionKey) -> bool {
        self.get_status(key).await.is_processing
    }

    /// Number of queued tasks for `key`; pending decisions are not counted.
    pub async fn get_queue_length(&self, key: &SessionKey) -> usize {
        self.get_status(key).await.queue_size
    }

    /// Queue size and processing flag for `key`.
    pub async fn get_status(&self, key: &SessionKey) -> SessionStatus {
        let Some(session) = self.registry.get(key).await else {
            return SessionStatus::default();
        };
        let state = session.lock().await;
        SessionStatus {
            queue_size: state.queue.len(),
            is_processing: state.active.is_some(),
        }
    }

    /// Run `task` now and wait for it to finish.
    ///
    /// Intended for idle sessions. If another task is active the call
    /// degrades to [`enqueue`](Self::enqueue) so single-flight holds. On a
    /// session parked by [`abort`](Self::abort) the task runs first and the
    /// parked queue drains after it.
    ///
    /// # Errors
    ///
    /// Returns whatever the executor returned, or [`AppError::Cancelled`]
    /// when the task was aborted or discarded.
    pub async fn execute_immediately(&self, task: Task, executor: SharedExecutor) -> Result<()> {
        let key = task.session_key.clone();
        let session = self.registry.session(&key).await;

        let claim = {
            let mut state = session.lock().await;
            if let Some(active_task_id) = state.active.as_ref().map(|a| a.task_id.clone()) {
                warn!(
                    session_key = %key,
                    task_id = %task.id,
                    active_task_id,
                    "session busy, queueing instead of running immediately"
                );
                drop(state);
                return self.enqueue(task, executor).await;
            }
            Claim {
                session: Arc::clone(&session),
                process: state.activate(&task.id),
            }
        };

        self.run_claimed(claim, task, executor).await
    }

    /// Append `task` to the session queue and wait until it has run.
    ///
    /// Starts it straight away when the session is idle.
    ///
    /// # Errors
    ///
    /// Returns the executor's error, or [`AppError::Cancelled`] when the
    /// task is discarded by [`clear_queue`](Self::clear_queue) before running.
    pub async fn enqueue(&self, task: Task, executor: SharedExecutor) -> Result<()> {
        let (_, completion) = self.push_queued(task, executor).await;
        completion.wait().await
    }

    /// Append `task` to the queue without waiting for it to run.
    ///
    /// Returns the 1-based queue position and a handle resolving once the
    /// task has finished. Resumes a parked queue.
    pub(crate) async fn push_queued(
        &self,
        task: Task,
        executor: SharedExecutor,
    ) -> (usize, QueuedCompletion) {
        let key = task.session_key.clone();
        let task_id = task.id.clone();
        let session = self.registry.session(&key).await;
        let (done_tx, done_rx) = oneshot::channel();

        let (position, next) = {
            let mut state = session.lock().await;
            state.queue.push_back(QueuedTask {
                task,
                executor,
                done: done_tx,
            });
            let position = state.queue.len();
            state.parked = false;
            (position, self.claim_next(&mut state).await)
        };
        debug!(session_key = %key, task_id, position, "task queued");

        self.spawn_drain(key, session, next);

        (
            position,
            QueuedCompletion {
                task_id,
                done: done_rx,
            },
        )
    }

    /// Hold `task` for a decision.
    ///
    /// Independent of the queue and not counted by
    /// [`get_queue_length`](Self::get_queue_length).
    pub async fn store_pending_task(&self, task: Task) {
        self.pending_tasks.lock().await.insert(task.id.clone(), task);
    }

    /// Look up a held task by id.
    pub async fn get_pending_task(&self, task_id: &str) -> Option<Task> {
        self.pending_tasks.lock().await.get(task_id).cloned()
    }

    /// Remove a held task, returning it if it was present.
    pub async fn remove_pending_task(&self, task_id: &str) -> Option<Task> {
        self.pending_tasks.lock().await.remove(task_id)
    }

    /// Whether `task_id` has left both the pending store and every queue.
    ///
    /// Unknown ids count as started, so late decisions are rejected.
    pub async fn is_task_started(&self, task_id: &str) -> bool {
        if self.pending_tasks.lock().await.contains_key(task_id) {
            return false;
        }
        for session in self.registry.snapshot().await {
            if session
                .lock()
                .await
                .queue
                .iter()
                .any(|queued| queued.task.id == task_id)
            {
                return false;
            }
        }
        true
    }

    /// Discard every queued task for `key`, returning how many were removed.
    ///
    /// Active and pending tasks are untouched. Callers waiting in
    /// [`enqueue`](Self::enqueue) receive [`AppError::Cancelled`].
    pub async fn clear_queue(&self, key: &SessionKey) -> usize {
        let Some(session) = self.registry.get(key).await else {
            return 0;
        };
        let cleared = session.lock().await.queue.drain(..).count();
        if cleared > 0 {
            info!(session_key = %key, cleared, "queue cleared");
        }
        cleared
    }

    /// Cancel the active task for `key`, if any.
    ///
    /// The session is marked idle at once. The queue is left alone but
    /// parked: nothing starts until the next submission, so a following
    /// [`clear_queue`](Self::clear_queue) sees every task that was queued.
    /// Returns whether a task was aborted.
    pub async fn abort(&self, key: &SessionKey) -> bool {
        let Some(session) = self.registry.get(key).await else {
            return false;
        };
        let active = {
            let mut state = session.lock().await;
            let active = state.active.take();
            if active.is_some() {
                state.parked = true;
            }
            active
        };
        match active {
            Some(active) => {
                active.process.cancel();
                info!(session_key = %key, task_id = %active.task_id, "active task aborted");
                true
            }
            None => false,
        }
    }

    /// Clear the queue and abort the active task under one lock.
    ///
    /// Returns whether a task was aborted and how many queued tasks were
    /// discarded.
    pub async fn stop(&self, key: &SessionKey) -> (bool, usize) {
        let Some(session) = self.registry.get(key).await else {
            return (false, 0);
        };
        let (active, cleared) = {
            let mut state = session.lock().await;
            let cleared = state.queue.drain(..).count();
            let active = state.active.take();
            if active.is_some() {
                state.parked = true;
            }
            (active, cleared)
        };

        let aborted = active.is_some();
        if let Some(active) = active {
            active.process.cancel();
        }
        info!(session_key = %key, aborted, cleared, "session stopped");
        (aborted, cleared)
    }

    /// Abort the active task, clear the queue, and run `task` in one step.
    ///
    /// Returns the number of queued tasks discarded plus a handle resolving
    /// when `task` finishes.
    pub(crate) async fn interrupt_with(
        &self,
        task: Task,
        executor: SharedExecutor,
    ) -> (usize, tokio::task::JoinHandle<Result<()>>) {
        let key = task.session_key.clone();
        let session = self.registry.session(&key).await;

        let (cleared, claim) = {
            let mut state = session.lock().await;
            if let Some(previous) = state.active.take() {
                previous.process.cancel();
                info!(session_key = %key, task_id = %previous.task_id, "active task interrupted");
            }
            let cleared = state.queue.drain(..).count();
            let claim = Claim {
                session: Arc::clone(&session),
                process: state.activate(&task.id),
            };
            (cleared, claim)
        };

        let scheduler = self.clone();
        let handle =
            tokio::spawn(async move { scheduler.run_claimed(claim, task, executor).await });

        (cleared, handle)
    }

    /// Claim the active slot for `task`, or hold it for a decision.
    ///
    /// Decided under the session lock: an idle session hands back a
    /// [`Claim`] that [`run_claimed`](Self::run_claimed) must consume, so
    /// the session reports processing before the caller returns.
    pub(crate) async fn admit(
        &self,
        task: &Task,
        executor: &SharedExecutor,
        deadline: &CancellationToken,
    ) -> Admission {
        let session = self.registry.session(&task.session_key).await;
        let mut state = session.lock().await;
        if state.active.is_none() {
            let process = state.activate(&task.id);
            return Admission::Started(Claim {
                session: Arc::clone(&session),
                process,
            });
        }

        self.pending_tasks
            .lock()
            .await
            .insert(task.id.clone(), task.clone());
        let displaced = state.pending.replace(PendingDecision {
            task_id: task.id.clone(),
            executor: Arc::clone(executor),
            deadline: deadline.clone(),
        });

        Admission::Held(Hold {
            displaced,
            queue_size: state.queue.len(),
        })
    }

    /// Detach the pending decision for `task_id`, if it still occupies the slot.
    pub(crate) async fn take_pending_decision(
        &self,
        key: &SessionKey,
        task_id: &str,
    ) -> Option<PendingDecision> {
        let session = self.registry.get(key).await?;
        let mut state = session.lock().await;
        if state.pending.as_ref()?.task_id != task_id {
            return None;
        }
        state.pending.take()
    }

    /// Run a task that already owns the active slot, then drain the queue.
    pub(crate) async fn run_claimed(
        &self,
        claim: Claim,
        task: Task,
        executor: SharedExecutor,
    ) -> Result<()> {
        let key = task.session_key.clone();
        let task_id = task.id.clone();

        let result = run_task(task, executor, &claim.process).await;
        let next = self.release(&claim.session, &task_id).await;
        self.spawn_drain(key, claim.session, next);
        result
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    /// Clear `task_id` from the active slot and claim the next task, under one lock.
    async fn release(&self, session: &SharedSession, task_id: &str) -> Option<Claimed> {
        let mut state = session.lock().await;
        if state
            .active
            .as_ref()
            .is_some_and(|active| active.task_id == task_id)
        {
            state.active = None;
        }
        self.claim_next(&mut state).await
    }

    /// Pick the queue head (or the pending task) for an idle, unparked session.
    ///
    /// Called with the session lock held; takes the pending store lock second.
    async fn claim_next(&self, state: &mut SessionState) -> Option<Claimed> {
        if state.active.is_some() || state.parked {
            return None;
        }

        let work = if let Some(queued) = state.queue.pop_front() {
            NextTask::Queued(queued)
        } else {
            let pending = state.pending.take()?;
            pending.deadline.cancel();
            let task = self.pending_tasks.lock().await.remove(&pending.task_id)?;
            NextTask::Promoted(task, pending.executor)
        };

        let process = state.activate(work.task_id());
        Some(Claimed { work, process })
    }

    fn spawn_drain(&self, key: SessionKey, session: SharedSession, next: Option<Claimed>) {
        let Some(next) = next else {
            return;
        };
        let scheduler = self.clone();
        tokio::spawn(async move { scheduler.drain(key, session, next).await });
    }

    /// Run claimed tasks until the session is idle and empty, or parked.
    async fn drain(&self, key: SessionKey, session: SharedSession, first: Claimed) {
        let mut next = Some(first);
        while let Some(Claimed { work, process }) = next {
            let task_id = work.task_id().to_owned();
            match work {
                NextTask::Queued(queued) => {
                    let result = run_task(queued.task, queued.executor, &process).await;
                    next = self.release(&session, &task_id).await;
                    if queued.done.send(result).is_err() {
                        debug!(session_key = %key, "queued task caller no longer waiting");
                    }
                }
                NextTask::Promoted(task, executor) => {
                    info!(session_key = %key, task_id, "pending task promoted on idle session");
                    if let Err(err) = run_task(task, executor, &process).await {
                        debug!(session_key = %key, %err, "promoted task ended with error");
                    }
                    next = self.release(&session, &task_id).await;
                }
            }
        }
    }
}

/// Run one task's executor on its own tokio task.
async fn run_task(task: Task, executor: SharedExecutor, process: &CancellationToken) -> Result<()> {
    let task_id = task.id.clone();
    let span = info_span!("scheduled_task", session_key = %task.session_key, task_id = %task_id);

    info!(parent: &span, "task started");
    let result = tokio::spawn(executor.execute(task, process.clone()).instrument(span.clone()))
        .await
        .unwrap_or_else(|err| Err(AppError::Agent(format!("task executor panicked: {err}"))));

    match &result {
        Ok(()) => info!(parent: &span, "task finished"),
        Err(_) if process.is_cancelled() => info!(parent: &span, "task aborted"),
        Err(err) => warn!(parent: &span, %err, "task failed"),
    }

    if process.is_cancelled() && result.is_ok() {
        return Err(AppError::Cancelled(format!("task {task_id} was aborted")));
    }
    result
}

/// Work claimed by the drain loop.
enum NextTask {
    Queued(QueuedTask),
    Promoted(Task, SharedExecutor),
}

impl NextTask {
    fn task_id(&self) -> &str {
        match self {
            Self::Queued(queued) => &queued.task.id,
            Self::Promoted(task, _) => &task.id,
        }
    }
}

/// A task that owns the active slot and is about to run.
struct Claimed {
    work: NextTask,
    process: CancellationToken,
}
