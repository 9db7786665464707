//! Typed access to a running OpenCode agent server.
//!
//! [`OpencodeClient`] issues the request/response calls and opens the `/event`
//! stream; [`sse::EventStreamDecoder`] turns the raw stream bytes into JSON
//! records; [`events::ServerEvent`] classifies the records the shell reacts to.

mod client;
pub mod events;
pub mod sse;
pub mod types;

pub use cadence_error::CadenceError;
pub use client::{decode_event_stream, EventStream, OpencodeClient};
pub use events::{PartUpdated, ServerEvent, SessionChange, SessionIdle};
pub use sse::EventStreamDecoder;
pub use types::*;
