//! Session orchestration modules.
//!
//! Covers per-session single-flight scheduling and the interrupt/queue
//! decision window layered on top of it.

pub mod decision;
pub mod scheduler;
