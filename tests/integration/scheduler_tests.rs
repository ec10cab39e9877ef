//! Integration tests for the per-session single-flight scheduler.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use agent_relay::models::task::{SessionKey, Task};
use agent_relay::orchestrator::scheduler::{SessionRegistry, SessionScheduler, SharedExecutor};
use agent_relay::AppError;

use super::test_helpers::{wait_processing, wait_queue_len, Journal, WAIT};

const LONG: Duration = Duration::from_secs(30);
const SHORT: Duration = Duration::from_millis(30);

/// Start `prompt` on `session` in the background and wait until it is active.
async fn start_active(
    scheduler: &SessionScheduler,
    journal: &Journal,
    session: &str,
    prompt: &str,
    hold: Duration,
) -> tokio::task::JoinHandle<agent_relay::Result<()>> {
    let handle = {
        let scheduler = scheduler.clone();
        let executor = journal.executor(hold);
        let task = Task::new(session, prompt);
        tokio::spawn(async move { scheduler.execute_immediately(task, executor).await })
    };
    let key = SessionKey::from(session);
    wait_processing(scheduler, &key, true).await;
    handle
}

/// Enqueue `prompt` in the background and wait until the queue has `len` entries.
async fn enqueue_at(
    scheduler: &SessionScheduler,
    journal: &Journal,
    session: &str,
    prompt: &str,
    len: usize,
) -> tokio::task::JoinHandle<agent_relay::Result<()>> {
    let handle = {
        let scheduler = scheduler.clone();
        let executor = journal.executor(SHORT);
        let task = Task::new(session, prompt);
        tokio::spawn(async move { scheduler.enqueue(task, executor).await })
    };
    let key = SessionKey::from(session);
    wait_queue_len(&scheduler, &key, len).await;
    handle
}

// ── Status ───────────────────────────────────────────────────────────────────

/// Unknown sessions report idle and empty.
#[tokio::test]
async fn unknown_session_is_idle() {
    let scheduler = SessionScheduler::new();
    let key = SessionKey::from("nobody");

    assert!(!scheduler.is_processing(&key).await);
    assert_eq!(scheduler.get_queue_length(&key).await, 0);
    assert!(!scheduler.abort(&key).await, "nothing to abort");
    assert_eq!(scheduler.clear_queue(&key).await, 0);
}

#[tokio::test]
async fn generated_task_ids_are_distinct() {
    assert_ne!(
        SessionScheduler::generate_task_id(),
        SessionScheduler::generate_task_id()
    );
}

// ── Immediate execution ──────────────────────────────────────────────────────

/// An idle session runs the task at once and is idle again afterwards.
#[tokio::test]
async fn idle_session_runs_immediately() {
    let scheduler = SessionScheduler::new();
    let journal = Journal::default();
    let key = SessionKey::from("s1");

    let result = scheduler
        .execute_immediately(Task::new("s1", "A"), journal.executor(SHORT))
        .await;

    assert!(result.is_ok(), "{result:?}");
    assert_eq!(journal.entries(), vec!["start:A", "end:A"]);
    assert!(!scheduler.is_processing(&key).await);
}

/// Executor errors propagate to the caller and the session is released.
#[tokio::test]
async fn executor_failure_releases_session() {
    let scheduler = SessionScheduler::new();
    let key = SessionKey::from("s1");
    let failing: SharedExecutor = Arc::new(|_task: Task, _cancel: CancellationToken| async {
        Err(AppError::Agent("boom".into()))
    });

    let result = scheduler
        .execute_immediately(Task::new("s1", "A"), failing)
        .await;

    assert!(matches!(result, Err(AppError::Agent(ref msg)) if msg == "boom"));
    assert!(!scheduler.is_processing(&key).await);
}

/// Calling `execute_immediately` on a busy session queues instead.
#[tokio::test]
async fn execute_immediately_on_busy_session_queues() {
    let scheduler = SessionScheduler::new();
    let journal = Journal::default();
    let key = SessionKey::from("s1");

    let first = start_active(&scheduler, &journal, "s1", "A", Duration::from_millis(200)).await;
    let second = {
        let scheduler = scheduler.clone();
        let executor = journal.executor(SHORT);
        tokio::spawn(async move {
            scheduler
                .execute_immediately(Task::new("s1", "B"), executor)
                .await
        })
    };

    wait_queue_len(&scheduler, &key, 1).await;
    assert!(first.await.unwrap().is_ok());
    assert!(second.await.unwrap().is_ok());
    assert_eq!(journal.started(), vec!["A", "B"]);
    assert_eq!(journal.max_running(), 1);
}

// ── Queue ────────────────────────────────────────────────────────────────────

/// Queued tasks run one at a time in submission order.
#[tokio::test]
async fn queued_tasks_run_in_fifo_order() {
    let scheduler = SessionScheduler::new();
    let journal = Journal::default();
    let key = SessionKey::from("s1");

    let a = start_active(&scheduler, &journal, "s1", "A", Duration::from_millis(100)).await;
    let b = enqueue_at(&scheduler, &journal, "s1", "B", 1).await;
    let c = enqueue_at(&scheduler, &journal, "s1", "C", 2).await;
    let d = enqueue_at(&scheduler, &journal, "s1", "D", 3).await;

    for handle in [a, b, c, d] {
        let result = tokio::time::timeout(WAIT, handle).await.unwrap().unwrap();
        assert!(result.is_ok(), "{result:?}");
    }

    assert_eq!(journal.started(), vec!["A", "B", "C", "D"]);
    assert_eq!(journal.max_running(), 1);
    wait_processing(&scheduler, &key, false).await;
    assert_eq!(scheduler.get_queue_length(&key).await, 0);
}

/// Enqueue on an idle session starts the task straight away.
#[tokio::test]
async fn enqueue_on_idle_session_runs() {
    let scheduler = SessionScheduler::new();
    let journal = Journal::default();

    let result = tokio::time::timeout(
        WAIT,
        scheduler.enqueue(Task::new("s1", "A"), journal.executor(SHORT)),
    )
    .await
    .unwrap();

    assert!(result.is_ok());
    assert_eq!(journal.started(), vec!["A"]);
}

/// Many concurrent submissions never overlap within one session.
#[tokio::test]
async fn concurrent_submissions_are_single_flight() {
    let scheduler = SessionScheduler::new();
    let journal = Journal::default();

    let handles: Vec<_> = (0..20)
        .map(|i| {
            let scheduler = scheduler.clone();
            let executor = journal.executor(Duration::from_millis(5));
            let task = Task::new("s1", format!("T{i}"));
            tokio::spawn(async move {
                if i % 2 == 0 {
                    scheduler.execute_immediately(task, executor).await
                } else {
                    scheduler.enqueue(task, executor).await
                }
            })
        })
        .collect();

    for handle in handles {
        let result = tokio::time::timeout(WAIT, handle).await.unwrap().unwrap();
        assert!(result.is_ok(), "{result:?}");
    }

    assert_eq!(journal.started().len(), 20);
    assert_eq!(journal.max_running(), 1, "tasks must never overlap");
}

/// Different sessions run in parallel.
#[tokio::test]
async fn sessions_are_independent() {
    let scheduler = SessionScheduler::new();
    let journal = Journal::default();

    let a = start_active(&scheduler, &journal, "s1", "A", Duration::from_millis(200)).await;
    let b = start_active(&scheduler, &journal, "s2", "B", Duration::from_millis(200)).await;

    assert_eq!(journal.max_running(), 2);
    assert!(a.await.unwrap().is_ok());
    assert!(b.await.unwrap().is_ok());
    assert_eq!(scheduler.registry().len().await, 2);
}

/// An injected registry is shared between schedulers.
#[tokio::test]
async fn injected_registry_is_shared() {
    let registry = Arc::new(SessionRegistry::new());
    let first = SessionScheduler::with_registry(Arc::clone(&registry));
    let second = SessionScheduler::with_registry(Arc::clone(&registry));
    let journal = Journal::default();

    let handle = start_active(&first, &journal, "s1", "A", LONG).await;

    assert!(second.is_processing(&SessionKey::from("s1")).await);
    assert!(second.abort(&SessionKey::from("s1")).await);
    assert!(handle.await.unwrap().is_err());
}

// ── Abort and clear ──────────────────────────────────────────────────────────

/// Clearing then aborting stops everything; discarded callers are told so.
#[tokio::test]
async fn clear_queue_and_abort_stop_all_work() {
    let scheduler = SessionScheduler::new();
    let journal = Journal::default();
    let key = SessionKey::from("s1");

    let a = start_active(&scheduler, &journal, "s1", "A", LONG).await;
    let b = enqueue_at(&scheduler, &journal, "s1", "B", 1).await;
    let c = enqueue_at(&scheduler, &journal, "s1", "C", 2).await;

    assert_eq!(scheduler.clear_queue(&key).await, 2);
    assert!(scheduler.abort(&key).await);
    assert!(
        !scheduler.is_processing(&key).await,
        "abort marks the session idle at once"
    );

    let a = tokio::time::timeout(WAIT, a).await.unwrap().unwrap();
    assert!(matches!(a, Err(AppError::Cancelled(_))), "{a:?}");
    for handle in [b, c] {
        let result = tokio::time::timeout(WAIT, handle).await.unwrap().unwrap();
        assert!(matches!(result, Err(AppError::Cancelled(_))), "{result:?}");
    }

    assert!(journal.contains("cancel:A"));
    assert_eq!(journal.started(), vec!["A"], "cleared tasks must never start");
    assert_eq!(scheduler.get_queue_length(&key).await, 0);
}

/// Abort then clear sees every queued task, even on a multi-threaded runtime.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn abort_then_clear_counts_every_queued_task() {
    for _ in 0..50 {
        let scheduler = SessionScheduler::new();
        let journal = Journal::default();
        let key = SessionKey::from("s1");

        let a = start_active(&scheduler, &journal, "s1", "A", LONG).await;
        let b = enqueue_at(&scheduler, &journal, "s1", "B", 1).await;
        let c = enqueue_at(&scheduler, &journal, "s1", "C", 2).await;

        assert!(scheduler.abort(&key).await);
        assert_eq!(scheduler.clear_queue(&key).await, 2);
        assert!(!scheduler.is_processing(&key).await);

        for handle in [a, b, c] {
            let result = tokio::time::timeout(WAIT, handle).await.unwrap().unwrap();
            assert!(matches!(result, Err(AppError::Cancelled(_))), "{result:?}");
        }
        assert_eq!(journal.started(), vec!["A"], "cleared tasks must never start");
    }
}

/// Abort alone parks the queue; the next submission runs first and the
/// parked tasks follow it.
#[tokio::test]
async fn abort_parks_queue_until_next_submission() {
    let scheduler = SessionScheduler::new();
    let journal = Journal::default();
    let key = SessionKey::from("s1");

    let a = start_active(&scheduler, &journal, "s1", "A", LONG).await;
    let b = enqueue_at(&scheduler, &journal, "s1", "B", 1).await;

    assert!(scheduler.abort(&key).await);
    assert!(tokio::time::timeout(WAIT, a).await.unwrap().unwrap().is_err());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(scheduler.get_queue_length(&key).await, 1, "B stays queued");
    assert!(!scheduler.is_processing(&key).await);
    assert_eq!(journal.started(), vec!["A"]);

    let d = scheduler
        .execute_immediately(Task::new("s1", "D"), journal.executor(SHORT))
        .await;
    assert!(d.is_ok(), "{d:?}");
    assert!(tokio::time::timeout(WAIT, b).await.unwrap().unwrap().is_ok());
    assert_eq!(journal.started(), vec!["A", "D", "B"]);
    assert_eq!(journal.max_running(), 1);
}

/// Enqueueing after an abort resumes the parked queue in order.
#[tokio::test]
async fn enqueue_resumes_parked_queue() {
    let scheduler = SessionScheduler::new();
    let journal = Journal::default();
    let key = SessionKey::from("s1");

    let a = start_active(&scheduler, &journal, "s1", "A", LONG).await;
    let b = enqueue_at(&scheduler, &journal, "s1", "B", 1).await;
    assert!(scheduler.abort(&key).await);
    assert!(tokio::time::timeout(WAIT, a).await.unwrap().unwrap().is_err());

    let c = scheduler.enqueue(Task::new("s1", "C"), journal.executor(SHORT));
    assert!(tokio::time::timeout(WAIT, c).await.unwrap().is_ok());
    assert!(tokio::time::timeout(WAIT, b).await.unwrap().unwrap().is_ok());
    assert_eq!(journal.started(), vec!["A", "B", "C"]);
}

/// Abort does not affect other sessions.
#[tokio::test]
async fn abort_is_scoped_to_one_session() {
    let scheduler = SessionScheduler::new();
    let journal = Journal::default();

    let a = start_active(&scheduler, &journal, "s1", "A", LONG).await;
    let b = start_active(&scheduler, &journal, "s2", "B", Duration::from_millis(100)).await;

    assert!(scheduler.abort(&SessionKey::from("s1")).await);

    assert!(a.await.unwrap().is_err());
    assert!(b.await.unwrap().is_ok());
    assert!(!journal.contains("cancel:B"));
}

// ── Pending store ────────────────────────────────────────────────────────────

#[tokio::test]
async fn pending_store_round_trip_and_started_check() {
    let scheduler = SessionScheduler::new();
    let task = Task::with_id("p1", "s1", "held");

    assert!(scheduler.is_task_started("p1").await, "unknown ids count as started");

    scheduler.store_pending_task(task.clone()).await;
    assert_eq!(scheduler.get_pending_task("p1").await, Some(task.clone()));
    assert!(!scheduler.is_task_started("p1").await);
    assert_eq!(
        scheduler.get_queue_length(&SessionKey::from("s1")).await,
        0,
        "pending tasks are not queued"
    );

    assert_eq!(scheduler.remove_pending_task("p1").await, Some(task));
    assert!(scheduler.get_pending_task("p1").await.is_none());
    assert!(scheduler.is_task_started("p1").await);
}

/// A task waiting in the queue has not started.
#[tokio::test]
async fn queued_task_is_not_started() {
    let scheduler = SessionScheduler::new();
    let journal = Journal::default();

    let a = start_active(&scheduler, &journal, "s1", "A", Duration::from_millis(100)).await;
    let queued = Task::new("s1", "B");
    let queued_id = queued.id.clone();
    let b = {
        let scheduler = scheduler.clone();
        let executor = journal.executor(SHORT);
        tokio::spawn(async move { scheduler.enqueue(queued, executor).await })
    };
    let key = SessionKey::from("s1");
    wait_queue_len(&scheduler, &key, 1).await;

    assert!(!scheduler.is_task_started(&queued_id).await);

    assert!(a.await.unwrap().is_ok());
    assert!(b.await.unwrap().is_ok());
    assert!(scheduler.is_task_started(&queued_id).await);
}

/// `stop` clears and aborts atomically; the next submission runs at once.
#[tokio::test]
async fn stop_discards_everything_then_session_is_reusable() {
    let scheduler = SessionScheduler::new();
    let journal = Journal::default();
    let key = SessionKey::from("s1");

    let a = start_active(&scheduler, &journal, "s1", "A", LONG).await;
    let b = enqueue_at(&scheduler, &journal, "s1", "B", 1).await;
    let c = enqueue_at(&scheduler, &journal, "s1", "C", 2).await;

    assert_eq!(scheduler.stop(&key).await, (true, 2));
    assert!(!scheduler.is_processing(&key).await);

    for handle in [a, b, c] {
        let result = tokio::time::timeout(WAIT, handle).await.unwrap().unwrap();
        assert!(matches!(result, Err(AppError::Cancelled(_))), "{result:?}");
    }

    let next = scheduler
        .execute_immediately(Task::new("s1", "D"), journal.executor(SHORT))
        .await;
    assert!(next.is_ok());
    assert_eq!(journal.started(), vec!["A", "D"]);
    assert_eq!(scheduler.stop(&key).await, (false, 0));
}
