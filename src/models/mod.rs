//! Domain model module declarations.

pub mod event;
pub mod status;
pub mod task;
