//! Agent process protocol.
//!
//! Drives headless agent CLIs that print line-delimited stream-json on
//! stdout. Each call owns exactly one process.
//!
//! Submodules:
//! - `codec`: [`LinesCodec`](tokio_util::codec::LinesCodec)-based framing that skips bad lines.
//! - `reader`: envelope parsing, duplicate suppression, and the stdout read loop.
//! - `spawner`: command construction and process spawning.
//! - `process`: the streaming engine producing [`StreamEvent`](crate::models::event::StreamEvent)s.
//! - `client`: non-streaming facade with bounded retries.

pub mod client;
pub mod codec;
pub mod process;
pub mod reader;
pub mod spawner;
