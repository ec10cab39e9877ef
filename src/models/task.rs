//! Task model and session key identifiers.

use std::fmt::{Display, Formatter};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of one conversation's execution slot.
///
/// Chat front ends key sessions by numeric user or channel ids, web front
/// ends by strings; both normalise to the same textual key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionKey(String);

impl SessionKey {
    /// Construct a key from any textual identifier.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Borrow the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for SessionKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for SessionKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<i64> for SessionKey {
    fn from(value: i64) -> Self {
        Self(value.to_string())
    }
}

impl From<u64> for SessionKey {
    fn from(value: u64) -> Self {
        Self(value.to_string())
    }
}

/// Generate a fresh opaque task identifier.
#[must_use]
pub fn generate_task_id() -> String {
    Uuid::new_v4().to_string()
}

/// A unit of work submitted for execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Task {
    /// Opaque unique identifier.
    pub id: String,
    /// Session this task is scheduled under.
    pub session_key: SessionKey,
    /// Instruction text for the agent.
    pub prompt: String,
    /// Auxiliary text (history, memory) passed through untouched.
    pub context: Option<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl Task {
    /// Construct a task with a generated identifier.
    #[must_use]
    pub fn new(session_key: impl Into<SessionKey>, prompt: impl Into<String>) -> Self {
        Self::with_id(generate_task_id(), session_key, prompt)
    }

    /// Construct a task with a caller-supplied identifier.
    #[must_use]
    pub fn with_id(
        id: impl Into<String>,
        session_key: impl Into<SessionKey>,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            session_key: session_key.into(),
            prompt: prompt.into(),
            context: None,
            created_at: Utc::now(),
        }
    }

    /// Attach auxiliary context text.
    #[must_use]
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        let context = context.into();
        self.context = if context.is_empty() {
            None
        } else {
            Some(context)
        };
        self
    }
}
