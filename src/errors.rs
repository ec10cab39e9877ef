//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Agent process could not be started.
    Spawn(String),
    /// Agent process exited with a non-zero status.
    Exit {
        /// Exit code, absent when the process was killed by a signal.
        code: Option<i32>,
        /// Captured standard error output.
        stderr: String,
    },
    /// Agent reported a failure through a terminal `Error` event.
    Agent(String),
    /// Task was stopped or discarded before it could finish.
    Cancelled(String),
    /// All retry attempts failed; carries the user-facing fallback message.
    RetryExhausted(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Spawn(msg) => write!(f, "spawn: {msg}"),
            Self::Exit { code, stderr } => {
                let code = code.map_or_else(|| "signal".to_owned(), |c| c.to_string());
                let stderr = stderr.trim();
                if stderr.is_empty() {
                    write!(f, "exit: agent exited with code {code}")
                } else {
                    write!(f, "exit: agent exited with code {code}: {stderr}")
                }
            }
            Self::Agent(msg) => write!(f, "agent: {msg}"),
            Self::Cancelled(msg) => write!(f, "cancelled: {msg}"),
            Self::RetryExhausted(msg) => write!(f, "retry exhausted: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl AppError {
    /// Message suitable for an end user, without the category prefix.
    ///
    /// Retry exhaustion yields the configured fallback text verbatim so raw
    /// process failures never reach the chat channel.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::RetryExhausted(msg) | Self::Cancelled(msg) | Self::Agent(msg) => msg.clone(),
            other => other.to_string(),
        }
    }
}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
