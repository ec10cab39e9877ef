#![forbid(unsafe_code)]

//! Single-flight scheduling and stream-json process driving for headless
//! agent CLIs fed by chat front ends.

pub mod agent;
pub mod config;
pub mod errors;
pub mod models;
pub mod orchestrator;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
