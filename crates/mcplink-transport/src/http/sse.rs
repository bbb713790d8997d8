//! HTTP+SSE client transport.

use std::sync::Arc;

use mcplink_core::{JsonRpcPayload, SessionState};
use reqwest::Url;

use crate::context::TransportContext;
use crate::error::TransportError;
use crate::runtime::{Instant, run_until};
use crate::traits::{
    ErrorObserver, NotificationSink, SendOutcome, Transport, TransportMetadata, TransportStats,
};

use super::client::{HttpCore, Wire};
use super::config::{HttpTransportBuilder, HttpTransportConfig};

/// Client for the HTTP+SSE transport.
///
/// A single `GET` stream carries every server message. Its first event,
/// `endpoint`, names the URI messages are POSTed to; POSTs are answered with
/// `202 Accepted` and the reply arrives on the stream.
#[derive(Debug)]
pub struct SseTransport {
    core: Arc<HttpCore>,
}

impl SseTransport {
    /// Create a new transport with the given configuration.
    pub fn new(config: HttpTransportConfig) -> Result<Self, TransportError> {
        Ok(Self {
            core: HttpCore::new(config, Wire::Sse)?,
        })
    }

    /// Open the event stream and wait for the message endpoint.
    ///
    /// Optional: the first [`send`](Transport::send) connects on its own.
    /// `ctx` is seen by the customizers on the `GET` and by the notification
    /// sink for everything the stream delivers.
    pub async fn connect(&self, ctx: &TransportContext) -> Result<Url, TransportError> {
        let timeout = self.core.config().request_timeout;
        match run_until(Instant::now() + timeout, self.core.connect_inbound(ctx)).await {
            Some(result) => result,
            None => Err(TransportError::timeout("Waiting for message endpoint", timeout)),
        }
    }

    /// The endpoint announced by the server, once known.
    pub fn message_endpoint(&self) -> Option<Url> {
        self.core.message_endpoint()
    }

    /// The protocol version sent with each request.
    pub fn protocol_version(&self) -> String {
        self.core.session().protocol_version().to_string()
    }

    /// The last event ID received on the stream.
    pub fn last_event_id(&self) -> Option<String> {
        self.core.inbound_cursor()
    }
}

impl Transport for SseTransport {
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

impl Drop for SseTransport {
    fn drop(&mut self) {
        self.core.abandon();
    }
}

impl HttpTransportBuilder {
    /// Build an HTTP+SSE transport.
    pub fn build_sse(self) -> Result<SseTransport, TransportError> {
        SseTransport::new(self.config)
    }
}
