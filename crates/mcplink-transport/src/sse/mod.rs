//! Server-Sent Events reader.
//!
//! [`EventStream`] wraps any stream of byte chunks (typically an HTTP response
//! body) and yields one [`SseEvent`] per record. The reader is finite per
//! connection: when the byte source ends, so does the stream. Resuming after a
//! disconnect means opening a new connection and seeding a new reader with
//! [`EventStream::with_last_event_id`].

mod event_stream;
mod parser;

use std::time::Duration;

use thiserror::Error;

pub use event_stream::{DEFAULT_MAX_RECORD_SIZE, EventStream};

/// Event name used when a record does not declare one.
pub const MESSAGE_EVENT: &str = "message";

/// Event name under which an HTTP+SSE server announces its message endpoint.
pub const ENDPOINT_EVENT: &str = "endpoint";

/// One dispatched SSE record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// The `id` declared by this record, if any and non-empty.
    pub id: Option<String>,
    /// The event name; `message` unless the record set one.
    pub event: String,
    /// The data lines, joined with `\n`.
    pub data: String,
    /// The reconnection delay requested by the server.
    pub retry: Option<Duration>,
}

/// Errors yielded by [`EventStream`].
#[derive(Debug, Error)]
pub enum SseError<E> {
    /// The byte source failed. Terminal.
    #[error("SSE stream failed: {0}")]
    Transport(E),

    /// One record could not be parsed. The stream continues.
    #[error("Malformed SSE record: {reason}")]
    Malformed {
        /// What was wrong with the record.
        reason: String,
    },
}

impl<E> SseError<E> {
    /// Whether this error concerns a single record only.
    #[must_use]
    pub const fn is_malformed(&self) -> bool {
        matches!(self, Self::Malformed { .. })
    }
}
