//! Streamable HTTP client transport.

use std::sync::Arc;

use mcplink_core::{JsonRpcPayload, SessionState};

use crate::context::TransportContext;
use crate::error::TransportError;
use crate::traits::{
    ErrorObserver, NotificationSink, SendOutcome, Transport, TransportMetadata, TransportStats,
};

use super::client::{HttpCore, Wire};
use super::config::{HttpTransportBuilder, HttpTransportConfig};

/// Client for the streamable HTTP transport.
///
/// Every message is POSTed to one endpoint. The server answers each POST
/// with a JSON body, an SSE stream, or `202 Accepted`; after the handshake
/// the transport also keeps a `GET` stream open for server-initiated
/// traffic, resuming it once with `Last-Event-ID` if it drops.
///
/// Dropping the transport stops its stream readers but does not notify the
/// server; call [`close_gracefully`](Transport::close_gracefully) for that.
#[derive(Debug)]
pub struct StreamableHttpTransport {
    core: Arc<HttpCore>,
}

impl StreamableHttpTransport {
    /// Create a new transport with the given configuration.
    ///
    /// Nothing is sent until the first [`send`](Transport::send).
    pub fn new(config: HttpTransportConfig) -> Result<Self, TransportError> {
        Ok(Self {
            core: HttpCore::new(config, Wire::Streamable)?,
        })
    }

    /// The protocol version sent with each request.
    pub fn protocol_version(&self) -> String {
        self.core.session().protocol_version().to_string()
    }

    /// The last event ID received on the inbound stream.
    pub fn last_event_id(&self) -> Option<String> {
        self.core.inbound_cursor()
    }

    /// Whether the inbound `GET` stream is currently being read.
    pub fn inbound_active(&self) -> bool {
        self.core.inbound_active()
    }

    /// Whether the server answered the inbound `GET` with `405`.
    pub fn inbound_unsupported(&self) -> bool {
        self.core.inbound_unsupported()
    }

    /// Requests still waiting for a reply.
    pub fn pending_requests(&self) -> usize {
        self.core.session().pending().len()
    }
}

impl Transport for StreamableHttpTransport {
    type Error = TransportError;

    async fn send(
        &self,
        payload: JsonRpcPayload,
        ctx: &TransportContext,
    ) -> Result<SendOutcome, Self::Error> {
        self.core.send(payload, ctx).await
    }

    async fn close_gracefully(&self) -> Result<(), Self::Error> {
        self.core.close().await
    }

    fn set_notification_sink(&self, sink: Arc<dyn NotificationSink>) {
        self.core.session().set_notification_sink(sink);
    }

    fn set_error_observer(&self, observer: Arc<dyn ErrorObserver>) {
        self.core.session().set_error_observer(observer);
    }

    fn state(&self) -> SessionState {
        self.core.session().state()
    }

    fn session_id(&self) -> Option<String> {
        self.core.session().session_id()
    }

    fn stats(&self) -> TransportStats {
        self.core.session().stats()
    }

    fn metadata(&self) -> TransportMetadata {
        self.core.metadata()
    }
}

impl Drop for StreamableHttpTransport {
    fn drop(&mut self) {
        self.core.abandon();
    }
}

impl HttpTransportBuilder {
    /// Build a streamable HTTP transport.
    pub fn build(self) -> Result<StreamableHttpTransport, TransportError> {
        StreamableHttpTransport::new(self.config)
    }
}
