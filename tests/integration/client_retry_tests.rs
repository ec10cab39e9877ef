//! Integration tests for the non-streaming execution facade.
//!
//! Attempts are counted by having the fake agent append a line to a file
//! on every run.

#![cfg(unix)]

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use agent_relay::agent::client::{collect_reply, AgentClient};
use agent_relay::config::RetryConfig;
use agent_relay::models::event::{AgentReply, StreamEvent};
use agent_relay::AppError;

use super::test_helpers::{quoted, FakeAgent, WAIT};

const FALLBACK: &str = "The assistant is busy, please retry.";

/// Run count the flaky agent never reaches.
const NEVER: usize = 1_000_000;

fn retry(base_delay_ms: u64) -> RetryConfig {
    RetryConfig {
        max_retries: 3,
        base_delay_ms,
        fallback_message: FALLBACK.into(),
    }
}

fn attempts(agent: &FakeAgent) -> usize {
    std::fs::read_to_string(agent.path("attempts"))
        .map(|s| s.lines().count())
        .unwrap_or(0)
}

/// Fake agent that fails until its `succeed_on`-th run.
fn flaky_agent(succeed_on: usize) -> FakeAgent {
    let agent = FakeAgent::new("");
    let counter = quoted(&agent.path("attempts"));
    std::fs::write(
        &agent.script,
        format!(
            r#"echo run >> {counter}
n=$(wc -l < {counter} | tr -d ' ')
if [ "$n" -lt {succeed_on} ]; then
  echo "transient failure $n" >&2
  exit 1
fi
echo '{{"type":"assistant","message":{{"content":[{{"type":"thinking","thinking":"mull"}}]}}}}'
echo '{{"type":"result","result":"answer"}}'
"#
        ),
    )
    .expect("write script");
    agent
}

// ── Success ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn first_attempt_success_returns_reply() {
    let agent = flaky_agent(1);
    let client = AgentClient::new(agent.config(), retry(10));

    let reply = client.call("hi", None).await.expect("call succeeds");

    assert_eq!(
        reply,
        AgentReply {
            response: "answer".into(),
            thinking: Some("mull".into()),
        }
    );
    assert_eq!(attempts(&agent), 1);
}

/// Two failures are absorbed; the third attempt's reply is returned.
#[tokio::test]
async fn transient_failures_are_retried() {
    let agent = flaky_agent(3);
    let client = AgentClient::new(agent.config(), retry(10));

    let reply = client.call("hi", None).await.expect("call succeeds");

    assert_eq!(reply.response, "answer");
    assert_eq!(attempts(&agent), 3);
}

// ── Exhaustion ───────────────────────────────────────────────────────────────

/// Persistent failure makes four attempts with linear back-off, then
/// surfaces only the fallback message.
#[tokio::test]
async fn persistent_failure_exhausts_retries_with_fallback() {
    let agent = flaky_agent(NEVER);
    let client = AgentClient::new(agent.config(), retry(20));

    let started = tokio::time::Instant::now();
    let err = tokio::time::timeout(WAIT, client.call("hi", None))
        .await
        .expect("call must finish")
        .expect_err("call must fail");

    assert_eq!(attempts(&agent), 4, "one attempt plus three retries");
    // 20 + 40 + 60 ms of back-off.
    assert!(started.elapsed() >= Duration::from_millis(120));
    assert!(matches!(err, AppError::RetryExhausted(ref msg) if msg == FALLBACK));
    assert_eq!(err.user_message(), FALLBACK);
    assert!(
        !err.user_message().contains("transient failure"),
        "raw stderr must not leak to users"
    );
}

#[tokio::test]
async fn zero_retries_makes_a_single_attempt() {
    let agent = flaky_agent(NEVER);
    let client = AgentClient::new(
        agent.config(),
        RetryConfig {
            max_retries: 0,
            ..retry(10)
        },
    );

    let result = client.call("hi", None).await;

    assert!(matches!(result, Err(AppError::RetryExhausted(_))));
    assert_eq!(attempts(&agent), 1);
}

// ── Cancellation ─────────────────────────────────────────────────────────────

/// Cancelling during back-off stops further attempts.
#[tokio::test]
async fn cancellation_stops_retrying() {
    let agent = flaky_agent(NEVER);
    let client = AgentClient::new(agent.config(), retry(5_000));
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel();
    });

    let result = tokio::time::timeout(WAIT, client.call_cancellable("hi", None, &cancel))
        .await
        .expect("cancelled call must return promptly");

    assert!(matches!(result, Err(AppError::Cancelled(_))), "{result:?}");
    assert_eq!(attempts(&agent), 1);
}

// ── collect_reply ────────────────────────────────────────────────────────────

#[tokio::test]
async fn collect_reply_maps_error_event() {
    let (tx, mut rx) = tokio::sync::mpsc::channel(4);
    tx.send(StreamEvent::Text {
        text: "half".into(),
    })
    .await
    .unwrap();
    tx.send(StreamEvent::Error {
        message: "boom".into(),
    })
    .await
    .unwrap();

    let result = collect_reply(&mut rx).await;
    assert!(matches!(result, Err(AppError::Agent(ref msg)) if msg == "boom"));
}

/// A stream that closes without a terminal event is not a success.
#[tokio::test]
async fn collect_reply_rejects_unterminated_stream() {
    let (tx, mut rx) = tokio::sync::mpsc::channel(4);
    tx.send(StreamEvent::Text {
        text: "half".into(),
    })
    .await
    .unwrap();
    drop(tx);

    let result = collect_reply(&mut rx).await;
    assert!(matches!(result, Err(AppError::Cancelled(_))));
}
