//! Agent stdout reader.
//!
//! Reads newline-delimited stream-json envelopes from an agent's stdout,
//! turns content blocks into [`StreamEvent`]s, and forwards them through a
//! tokio [`mpsc`] channel.
//!
//! # Known envelopes
//!
//! | `type`      | Effect                                                |
//! |-------------|-------------------------------------------------------|
//! | `assistant` | each `thinking` / `text` / `tool_use` block → event    |
//! | `result`    | reader stops with [`ReadOutcome::Completed`]          |
//! | *(other)*   | skipped                                               |
//!
//! Lines that are not valid JSON, not UTF-8, or over the length cap are
//! skipped; the agent is known to flush partial output and a bad line is
//! never fatal. A failing read of stdout itself ends the run.

use futures_util::StreamExt;
use serde::Deserialize;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::agent::codec::{AgentCodec, Frame};
use crate::models::event::StreamEvent;

// ── Inbound envelope types ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Envelope {
    Assistant {
        message: AssistantMessage,
    },
    Result {
        #[serde(default)]
        result: Option<String>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

/// One content block of an `assistant` envelope.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Reasoning text.
    Thinking {
        /// Full thinking text.
        #[serde(default)]
        thinking: String,
    },
    /// Response text.
    Text {
        /// Full response text.
        #[serde(default)]
        text: String,
    },
    /// Tool invocation.
    ToolUse {
        /// Tool-use identifier assigned by the agent.
        #[serde(default)]
        id: Option<String>,
        /// Tool name.
        name: String,
        /// Raw tool input.
        #[serde(default)]
        input: serde_json::Value,
    },
    /// Any block type this reader does not surface.
    #[serde(other)]
    Unsupported,
}

/// A decoded stream-json line.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentMessage {
    /// Assistant message with its content blocks.
    Assistant(Vec<ContentBlock>),
    /// Completion envelope with its (possibly empty) result payload.
    Result(String),
}

// ── Deduplication ─────────────────────────────────────────────────────────────

/// Suppresses repeated partial updates from the agent.
///
/// Remembers the last emitted thinking text, response text, and tool-use
/// id. A block equal to the last emitted value of its kind yields nothing.
#[derive(Debug, Default, Clone)]
pub struct StreamDeduper {
    last_thinking: String,
    last_text: String,
    last_tool_id: Option<String>,
}

impl StreamDeduper {
    /// Create a deduper with nothing emitted yet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Convert `block` to an event unless it repeats the previous one.
    pub fn accept(&mut self, block: ContentBlock) -> Option<StreamEvent> {
        match block {
            ContentBlock::Thinking { thinking } => {
                if thinking == self.last_thinking {
                    return None;
                }
                self.last_thinking.clone_from(&thinking);
                Some(StreamEvent::Thinking { text: thinking })
            }
            ContentBlock::Text { text } => {
                if text == self.last_text {
                    return None;
                }
                self.last_text.clone_from(&text);
                Some(StreamEvent::Text { text })
            }
            ContentBlock::ToolUse { id, name, input } => {
                if id.is_some() && id == self.last_tool_id {
                    return None;
                }
                self.last_tool_id = id;
                Some(StreamEvent::Tool { name, input })
            }
            ContentBlock::Unsupported => None,
        }
    }

    /// Last emitted response text (empty if none).
    #[must_use]
    pub fn last_text(&self) -> &str {
        &self.last_text
    }

    /// Last emitted thinking text (empty if none).
    #[must_use]
    pub fn last_thinking(&self) -> &str {
        &self.last_thinking
    }
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Parse one stdout line into an [`AgentMessage`].
///
/// Returns `None` for blank lines, malformed JSON, and envelope types other
/// than `assistant` / `result`.
#[must_use]
pub fn parse_stream_line(line: &str) -> Option<AgentMessage> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }

    match serde_json::from_str::<Envelope>(trimmed) {
        Ok(Envelope::Assistant { message }) => Some(AgentMessage::Assistant(message.content)),
        Ok(Envelope::Result { result }) => Some(AgentMessage::Result(result.unwrap_or_default())),
        Ok(Envelope::Other) => None,
        Err(err) => {
            debug!(error = %err, "agent reader: skipping undecodable line");
            None
        }
    }
}

/// How a [`run_reader`] call ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// A `result` envelope arrived; carries the final response text.
    Completed(String),
    /// Stdout closed without a `result` envelope; carries the last text.
    Eof(String),
    /// Reading stdout failed; carries the error text.
    Failed(String),
    /// The cancellation token fired.
    Cancelled,
    /// The event receiver was dropped.
    ReceiverClosed,
}

/// Read stream-json from `stdout`, sending non-terminal events to `event_tx`.
///
/// Terminal signalling is left to the caller: the returned [`ReadOutcome`]
/// says whether the agent completed, the stream ended early, stdout failed,
/// or reading was stopped. On completion the final text is the `result` payload, or
/// the last emitted text when that payload is empty.
///
/// # Cancellation
///
/// Respects `cancel`: when the token fires the reader exits immediately and
/// returns [`ReadOutcome::Cancelled`], even while blocked on a full channel.
pub async fn run_reader<R>(
    task_id: &str,
    stdout: R,
    max_line_bytes: usize,
    event_tx: &mpsc::Sender<StreamEvent>,
    cancel: &CancellationToken,
) -> ReadOutcome
where
    R: AsyncRead + Unpin + Send,
{
    let mut framed = FramedRead::new(stdout, AgentCodec::with_max_length(max_line_bytes));
    let mut deduper = StreamDeduper::new();

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!(task_id, "agent reader: cancellation received, stopping");
                return ReadOutcome::Cancelled;
            }

            item = framed.next() => {
                match item {
                    None => {
                        debug!(task_id, "agent reader: EOF detected");
                        return ReadOutcome::Eof(deduper.last_text().to_owned());
                    }

                    Some(Err(err)) => {
                        warn!(task_id, error = %err, "agent reader: stdout read failed");
                        return ReadOutcome::Failed(err.to_string());
                    }

                    Some(Ok(Frame::Skipped(reason))) => {
                        warn!(task_id, reason = reason.as_str(), "agent reader: skipping line");
                    }

                    Some(Ok(Frame::Line(line))) => match parse_stream_line(&line) {
                        Some(AgentMessage::Assistant(blocks)) => {
                            for block in blocks {
                                let Some(event) = deduper.accept(block) else {
                                    continue;
                                };
                                // A full channel must not hide cancellation.
                                let sent = tokio::select! {
                                    biased;
                                    () = cancel.cancelled() => {
                                        debug!(task_id, "agent reader: cancelled while sending");
                                        return ReadOutcome::Cancelled;
                                    }
                                    sent = event_tx.send(event) => sent,
                                };
                                if sent.is_err() {
                                    debug!(task_id, "agent reader: event_tx closed, stopping");
                                    return ReadOutcome::ReceiverClosed;
                                }
                            }
                        }
                        Some(AgentMessage::Result(result)) => {
                            let text = if result.is_empty() {
                                deduper.last_text().to_owned()
                            } else {
                                result
                            };
                            return ReadOutcome::Completed(text);
                        }
                        None => {}
                    },
                }
            }
        }
    }
}
