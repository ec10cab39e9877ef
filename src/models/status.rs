//! Session status snapshot.

use serde::{Deserialize, Serialize};

/// Point-in-time view of one session's scheduling state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SessionStatus {
    /// Tasks waiting in the FIFO queue; pending decisions are not counted.
    pub queue_size: usize,
    /// Whether a task is currently executing.
    pub is_processing: bool,
}
