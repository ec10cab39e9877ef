//! Events produced while an agent process runs.

use serde::{Deserialize, Serialize};

/// Typed event decoded from the agent's stream-json output.
///
/// Every uncancelled execution ends with exactly one terminal event
/// ([`Done`](Self::Done) or [`Error`](Self::Error)); nothing follows it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Updated reasoning text.
    Thinking {
        /// Full thinking text of the latest block.
        text: String,
    },
    /// Updated response text.
    Text {
        /// Full response text of the latest block.
        text: String,
    },
    /// Agent invoked a tool.
    Tool {
        /// Tool name.
        name: String,
        /// Raw tool input.
        input: serde_json::Value,
    },
    /// Execution completed; carries the final response.
    Done {
        /// Final response text.
        text: String,
    },
    /// Execution failed.
    Error {
        /// Failure description.
        message: String,
    },
}

impl StreamEvent {
    /// Whether this event ends the stream.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }
}

/// Final outcome of a non-streaming agent call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct AgentReply {
    /// Final response text.
    pub response: String,
    /// Last thinking text observed, if any.
    pub thinking: Option<String>,
}
