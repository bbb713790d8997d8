//! Transport traits for the MCP client.
//!
//! # Overview
//!
//! - [`Transport`]: the operations a caller drives a session with
//! - [`NotificationSink`]: where server-initiated traffic is delivered
//! - [`ErrorObserver`]: where failures with no caller to report to go
//! - [`TransportMetadata`] and [`TransportStats`]: introspection
//!
//! # Example
//!
//! ```ignore
//! use mcplink_transport::{Transport, TransportContext};
//! use mcplink_core::Request;
//!
//! async fn ping<T: Transport>(transport: &T) {
//!     let outcome = transport
//!         .send(Request::new("ping", 1i64).into(), &TransportContext::empty())
//!         .await
//!         .unwrap();
//! }
//! ```

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use mcplink_core::{JsonRpcPayload, Message, Response, SessionState};

use crate::context::TransportContext;
use crate::error::TransportError;

/// What a successful `send` produced.
#[derive(Debug)]
pub enum SendOutcome {
    /// The payload carried no requests and the server accepted it.
    Accepted,
    /// The reply to a single request.
    Response(Response),
    /// One result per request in a batch, in request order.
    Batch(Vec<Result<Response, TransportError>>),
}

impl SendOutcome {
    /// The single reply, if this outcome carries one.
    #[must_use]
    pub fn into_response(self) -> Option<Response> {
        match self {
            Self::Response(response) => Some(response),
            _ => None,
        }
    }
}

/// Receives notifications and server-initiated requests.
///
/// Called from stream reader tasks; implementations should hand the message
/// off rather than block.
pub trait NotificationSink: Send + Sync {
    /// Deliver one message, with the context of the send that opened the
    /// stream it arrived on.
    fn on_message(&self, message: Message, ctx: &TransportContext);
}

impl<F> NotificationSink for F
where
    F: Fn(Message, &TransportContext) + Send + Sync,
{
    fn on_message(&self, message: Message, ctx: &TransportContext) {
        self(message, ctx);
    }
}

impl NotificationSink for tokio::sync::mpsc::UnboundedSender<Message> {
    fn on_message(&self, message: Message, _ctx: &TransportContext) {
        if self.send(message).is_err() {
            tracing::debug!("Notification receiver dropped");
        }
    }
}

/// Observes failures that happen in the background, such as a failed
/// reconnect of the inbound stream.
pub trait ErrorObserver: Send + Sync {
    /// Called once per background failure.
    fn on_error(&self, error: &TransportError);
}

impl<F> ErrorObserver for F
where
    F: Fn(&TransportError) + Send + Sync,
{
    fn on_error(&self, error: &TransportError) {
        self(error);
    }
}

/// Metadata about a transport connection.
#[derive(Debug, Clone, Default)]
pub struct TransportMetadata {
    /// Transport type identifier ("streamable-http" or "http+sse").
    pub transport_type: String,
    /// Remote endpoint.
    pub remote_addr: Option<String>,
    /// When the handshake completed.
    pub connected_at: Option<Instant>,
    /// The server-assigned session token.
    pub session_id: Option<String>,
    /// The protocol version in use.
    pub protocol_version: Option<String>,
}

impl TransportMetadata {
    /// Create new metadata for a transport type.
    #[must_use]
    pub fn new(transport_type: impl Into<String>) -> Self {
        Self {
            transport_type: transport_type.into(),
            ..Self::default()
        }
    }

    /// Set the remote address.
    #[must_use]
    pub fn remote_addr(mut self, addr: impl Into<String>) -> Self {
        self.remote_addr = Some(addr.into());
        self
    }

    /// Set the connection time.
    #[must_use]
    pub const fn connected_at(mut self, at: Option<Instant>) -> Self {
        self.connected_at = at;
        self
    }

    /// Set the session token.
    #[must_use]
    pub fn session_id(mut self, session_id: Option<String>) -> Self {
        self.session_id = session_id;
        self
    }

    /// Set the protocol version.
    #[must_use]
    pub fn protocol_version(mut self, version: impl Into<String>) -> Self {
        self.protocol_version = Some(version.into());
        self
    }
}

/// Snapshot of transport counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    /// Messages sent.
    pub messages_sent: u64,
    /// Messages received and routed.
    pub messages_received: u64,
    /// Unknown response IDs, malformed records and undecodable payloads.
    pub protocol_anomalies: u64,
    /// Successful inbound stream reconnects.
    pub reconnects: u64,
    /// Inbound stream reconnects that failed.
    pub failed_reconnects: u64,
}

#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    protocol_anomalies: AtomicU64,
    reconnects: AtomicU64,
    failed_reconnects: AtomicU64,
}

impl StatsCounters {
    pub(crate) fn record_sent(&self, count: usize) {
        self.messages_sent.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_anomaly(&self) {
        self.protocol_anomalies.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failed_reconnect(&self) {
        self.failed_reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> TransportStats {
        TransportStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            protocol_anomalies: self.protocol_anomalies.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            failed_reconnects: self.failed_reconnects.load(Ordering::Relaxed),
        }
    }
}

/// Core transport trait for the MCP client.
///
/// Implementations are `Send + Sync`; `send` may be called concurrently from
/// many tasks, and `close_gracefully` concurrently with sends.
pub trait Transport: Send + Sync {
    /// The error type for transport operations.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Send a message or batch and wait for the replies it expects.
    ///
    /// Resolves with [`SendOutcome::Accepted`] for payloads carrying no
    /// requests, otherwise with the reply (or per-request results for a
    /// batch). Each request is bounded by the configured request timeout.
    fn send(
        &self,
        payload: JsonRpcPayload,
        ctx: &TransportContext,
    ) -> impl Future<Output = Result<SendOutcome, Self::Error>> + Send;

    /// Close the session. Idempotent.
    ///
    /// Outstanding requests fail with a session-closed error and every open
    /// stream is released.
    fn close_gracefully(&self) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Install the sink for notifications and server-initiated requests.
    fn set_notification_sink(&self, sink: Arc<dyn NotificationSink>);

    /// Install the observer for background failures.
    fn set_error_observer(&self, observer: Arc<dyn ErrorObserver>);

    /// Current lifecycle state.
    fn state(&self) -> SessionState;

    /// The server-assigned session token, once assigned.
    fn session_id(&self) -> Option<String>;

    /// Counter snapshot.
    fn stats(&self) -> TransportStats;

    /// Get metadata about the transport.
    fn metadata(&self) -> TransportMetadata;
}
