//! Global configuration parsing and validation.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::{AppError, Result};

/// Agent process settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct AgentConfig {
    /// Agent executable (e.g., `claude`).
    #[serde(default = "default_binary")]
    pub binary: String,
    /// Arguments placed before `-p <prompt>`.
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory for every spawned agent; canonicalised on load.
    #[serde(default = "default_project_dir")]
    pub project_dir: PathBuf,
    /// Capacity of the bounded event channel between reader and consumer.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// Longest stdout line accepted before it is skipped.
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
    /// Upper bound on captured stderr text.
    #[serde(default = "default_max_stderr_bytes")]
    pub max_stderr_bytes: usize,
}

/// Retry behaviour of the non-streaming execution facade.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct RetryConfig {
    /// Additional attempts after the first failure.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay unit; retry `n` waits `n * base_delay_ms`.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Message surfaced to end users once all attempts have failed.
    #[serde(default = "default_fallback_message")]
    pub fallback_message: String,
}

/// Interrupt/queue decision window settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct DecisionConfig {
    /// Seconds before an unanswered decision auto-queues the task.
    #[serde(default = "default_decision_timeout")]
    pub timeout_seconds: u64,
}

fn default_binary() -> String {
    "claude".into()
}

fn default_project_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_channel_capacity() -> usize {
    64
}

fn default_max_line_bytes() -> usize {
    1_048_576
}

fn default_max_stderr_bytes() -> usize {
    65_536
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_fallback_message() -> String {
    "The agent is temporarily unavailable. Please try again later.".into()
}

fn default_decision_timeout() -> u64 {
    10
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            args: Vec::new(),
            project_dir: default_project_dir(),
            channel_capacity: default_channel_capacity(),
            max_line_bytes: default_max_line_bytes(),
            max_stderr_bytes: default_max_stderr_bytes(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            fallback_message: default_fallback_message(),
        }
    }
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_decision_timeout(),
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (1-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.base_delay_ms.saturating_mul(u64::from(attempt)))
    }
}

impl DecisionConfig {
    /// Decision window as a [`Duration`].
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Agent process settings.
    #[serde(default)]
    pub agent: AgentConfig,
    /// Execution facade retry policy.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Decision window settings.
    #[serde(default)]
    pub decision: DecisionConfig,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and normalize paths.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Replace the project directory, canonicalising the new path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the path does not exist.
    pub fn set_project_dir(&mut self, dir: impl AsRef<Path>) -> Result<()> {
        self.agent.project_dir = dir
            .as_ref()
            .canonicalize()
            .map_err(|err| AppError::Config(format!("project_dir invalid: {err}")))?;
        Ok(())
    }

    /// Validate limits and canonicalise the project directory.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` describing the first invalid field.
    pub fn validate(&mut self) -> Result<()> {
        if self.agent.binary.trim().is_empty() {
            return Err(AppError::Config("agent.binary must not be empty".into()));
        }

        if self.agent.channel_capacity == 0 {
            return Err(AppError::Config(
                "agent.channel_capacity must be greater than zero".into(),
            ));
        }

        if self.agent.max_line_bytes == 0 {
            return Err(AppError::Config(
                "agent.max_line_bytes must be greater than zero".into(),
            ));
        }

        if self.decision.timeout_seconds == 0 {
            return Err(AppError::Config(
                "decision.timeout_seconds must be greater than zero".into(),
            ));
        }

        let dir = self.agent.project_dir.clone();
        self.set_project_dir(dir)
    }
}
