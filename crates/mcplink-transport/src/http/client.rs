//! Shared HTTP client core.
//!
//! Both wire variants drive the same machinery: a [`SessionController`] for
//! lifecycle and routing, a [`StreamMultiplexer`] for SSE connections, and the
//! customizer pipeline in front of every HTTP call. They differ in where
//! replies come from and where messages are posted to.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use futures::StreamExt;
use futures::future::{BoxFuture, join_all};
use mcplink_core::{JsonRpcPayload, RequestId, SessionState, codec};
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method, Response, StatusCode, Url};
use tracing::{debug, error, info, trace, warn};

use crate::context::TransportContext;
use crate::customizer::OutboundRequest;
use crate::error::TransportError;
use crate::multiplexer::{ByteStream, StreamHandler, StreamMultiplexer};
use crate::runtime::{self, AsyncMutex, Instant, Notify, run_until};
use crate::session::SessionController;
use crate::sse::{ENDPOINT_EVENT, MESSAGE_EVENT, SseEvent};
use crate::traits::{SendOutcome, TransportMetadata};

use super::config::{
    HttpTransportConfig, InboundStreamMode, LAST_EVENT_ID_HEADER, MCP_PROTOCOL_VERSION_HEADER,
    MCP_SESSION_ID_HEADER,
};

const JSON: &str = "application/json";
const EVENT_STREAM: &str = "text/event-stream";
const JSON_OR_EVENT_STREAM: &str = "application/json, text/event-stream";

/// Which HTTP flavour a core speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Wire {
    /// One endpoint; POST responses may be SSE; optional inbound GET.
    Streamable,
    /// `GET /sse` carries every reply; POST to the announced endpoint.
    Sse,
}

/// What prompts opening the inbound stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InboundTrigger {
    Handshake,
    Send,
}

impl Wire {
    const fn transport_type(self) -> &'static str {
        match self {
            Self::Streamable => "streamable-http",
            Self::Sse => "http+sse",
        }
    }
}

pub(crate) struct HttpCore {
    wire: Wire,
    config: HttpTransportConfig,
    /// The streamable endpoint, or the SSE stream URL.
    endpoint: Url,
    client: Client,
    session: SessionController,
    streams: StreamMultiplexer,
    inbound_gate: AsyncMutex<()>,
    inbound_unsupported: AtomicBool,
    message_endpoint: RwLock<Option<Url>>,
    endpoint_announced: Notify,
    /// Requests whose POST was accepted with `202`; only the inbound stream
    /// can answer them.
    awaiting_inbound: Mutex<HashSet<RequestId>>,
}

/// Forgets a POST's request ids once its caller stops waiting.
struct InboundWaiters<'a> {
    core: &'a HttpCore,
    ids: &'a [RequestId],
}

impl Drop for InboundWaiters<'_> {
    fn drop(&mut self) {
        if self.ids.is_empty() {
            return;
        }
        let mut awaiting = self
            .core
            .awaiting_inbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for id in self.ids {
            awaiting.remove(id);
        }
    }
}

fn header_value(value: &str, what: &str) -> Result<HeaderValue, TransportError> {
    HeaderValue::from_str(value)
        .map_err(|e| TransportError::protocol(format!("Invalid {what} header: {e}")))
}

fn content_type(response: &Response) -> &str {
    response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or(JSON)
}

/// Re-issue `error` for a request that was riding on the failed exchange.
fn for_request(error: &TransportError) -> TransportError {
    match error {
        TransportError::Connection { message } => TransportError::connection(message.clone()),
        TransportError::Timeout { operation, duration } => {
            TransportError::timeout(operation.clone(), *duration)
        }
        other => TransportError::connection(other.to_string()),
    }
}

impl HttpCore {
    pub(crate) fn new(config: HttpTransportConfig, wire: Wire) -> Result<Arc<Self>, TransportError> {
        config.validate()?;
        let endpoint = match wire {
            Wire::Streamable => config.endpoint_url()?,
            Wire::Sse => config.sse_url()?,
        };

        // No whole-request timeout: it would cut long-lived streams.
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| TransportError::connection(format!("Failed to create HTTP client: {e}")))?;

        let streams = StreamMultiplexer::new();
        streams.seed_inbound_cursor(config.resume_from.clone());

        debug!(endpoint = %endpoint, wire = wire.transport_type(), "HTTP transport created");
        Ok(Arc::new(Self {
            wire,
            session: SessionController::new(config.protocol_version.clone()),
            config,
            endpoint,
            client,
            streams,
            inbound_gate: AsyncMutex::new(()),
            inbound_unsupported: AtomicBool::new(false),
            message_endpoint: RwLock::new(None),
            endpoint_announced: Notify::new(),
            awaiting_inbound: Mutex::new(HashSet::new()),
        }))
    }

    pub(crate) const fn session(&self) -> &SessionController {
        &self.session
    }

    pub(crate) const fn config(&self) -> &HttpTransportConfig {
        &self.config
    }

    pub(crate) fn metadata(&self) -> TransportMetadata {
        TransportMetadata::new(self.wire.transport_type())
            .remote_addr(self.endpoint.as_str())
            .connected_at(self.session.established_at())
            .session_id(self.session.session_id())
            .protocol_version(self.session.protocol_version())
    }

    /// Whether the server refused the inbound `GET` stream.
    pub(crate) fn inbound_unsupported(&self) -> bool {
        self.inbound_unsupported.load(Ordering::Acquire)
    }

    pub(crate) fn inbound_active(&self) -> bool {
        self.streams.inbound_active()
    }

    pub(crate) fn inbound_cursor(&self) -> Option<String> {
        self.streams.inbound_cursor()
    }

    pub(crate) fn message_endpoint(&self) -> Option<Url> {
        self.message_endpoint
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Build headers for requests.
    fn build_headers(&self, accept: &'static str) -> Result<HeaderMap, TransportError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(accept));
        headers.insert(
            MCP_PROTOCOL_VERSION_HEADER,
            header_value(self.session.protocol_version(), "protocol version")?,
        );
        if let Some(sid) = self.session.session_id() {
            headers.insert(MCP_SESSION_ID_HEADER, header_value(&sid, "session ID")?);
        }
        for (name, value) in &self.config.headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                TransportError::invalid_config(format!("Invalid header name '{name}': {e}"))
            })?;
            headers.insert(name, header_value(value, "custom")?);
        }
        Ok(headers)
    }

    /// Run the customizers, then perform the call.
    async fn dispatch(
        &self,
        operation: &str,
        mut request: OutboundRequest,
        ctx: &TransportContext,
    ) -> Result<Response, TransportError> {
        self.config.customizers.apply(&mut request, ctx).await?;
        let (method, url, headers, body) = request.into_parts();
        trace!(%method, %url, "Dispatching HTTP request");

        let mut builder = self.client.request(method, url).headers(headers);
        if let Some(body) = body {
            builder = builder.body(body);
        }
        builder
            .send()
            .await
            .map_err(|e| TransportError::from_http(operation, &e, self.config.connect_timeout))
    }

    fn body_stream(&self, response: Response, operation: &'static str) -> ByteStream {
        let connect_timeout = self.config.connect_timeout;
        response
            .bytes_stream()
            .map(move |chunk| chunk.map_err(|e| TransportError::from_http(operation, &e, connect_timeout)))
            .boxed()
    }

    fn capture_session_id(&self, response: &Response) {
        if let Some(token) = response
            .headers()
            .get(MCP_SESSION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            self.session.assign_session_id(token);
        }
    }

    /// The server forgot the session: close locally without a DELETE.
    fn expire_session(&self) -> TransportError {
        warn!(session_id = ?self.session.session_id(), "Server no longer recognises the session");
        if self.session.begin_close() {
            self.streams.close_all();
            self.session.finish_close();
            self.endpoint_announced.notify(usize::MAX);
        }
        self.session.closed_error()
    }

    // =========================================================================
    // Sending
    // =========================================================================

    pub(crate) async fn send(
        self: &Arc<Self>,
        payload: JsonRpcPayload,
        ctx: &TransportContext,
    ) -> Result<SendOutcome, TransportError> {
        let handshake = self.session.begin_send(&payload)?;
        let result = self.send_inner(payload, handshake.is_some(), ctx).await;

        if let Some(id) = &handshake {
            match &result {
                Err(e) => {
                    debug!(error = %e, "Handshake did not complete");
                    self.session.abort_handshake(id);
                }
                Ok(_) if self.wants_inbound(InboundTrigger::Handshake) => self.spawn_inbound(ctx),
                Ok(_) => {}
            }
        }
        result
    }

    async fn send_inner(
        self: &Arc<Self>,
        payload: JsonRpcPayload,
        is_handshake: bool,
        ctx: &TransportContext,
    ) -> Result<SendOutcome, TransportError> {
        let body = codec::encode(&payload)?;
        if body.len() > self.config.max_message_size {
            return Err(TransportError::MessageTooLarge {
                size: body.len(),
                max: self.config.max_message_size,
            });
        }

        let timeout = self.config.request_timeout;
        let deadline = Instant::now() + timeout;
        let ids = payload.request_ids();
        let mut waiters = ids
            .iter()
            .map(|id| self.session.pending().register(id.clone(), deadline))
            .collect::<Result<Vec<_>, _>>()?;

        let url = match self.wire {
            Wire::Streamable => {
                if !is_handshake && self.wants_inbound(InboundTrigger::Send) {
                    self.spawn_inbound(ctx);
                }
                self.endpoint.clone()
            }
            Wire::Sse => match run_until(deadline, self.connect_inbound(ctx)).await {
                Some(url) => url?,
                None => return Err(TransportError::timeout("Waiting for message endpoint", timeout)),
            },
        };

        let mut headers = self.build_headers(JSON_OR_EVENT_STREAM)?;
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(JSON));
        let request = OutboundRequest::new(Method::POST, url, headers, Some(body));

        let _parked = InboundWaiters {
            core: self,
            ids: &ids,
        };
        let exchange = async {
            let response = self.dispatch("HTTP POST", request, ctx).await?;
            self.session.counters().record_sent(payload.messages().count());
            self.handle_response(response, &ids, ctx).await
        };
        match run_until(deadline, exchange).await {
            Some(result) => result?,
            None => return Err(TransportError::timeout("HTTP POST", timeout)),
        }

        if waiters.is_empty() {
            return Ok(SendOutcome::Accepted);
        }
        if !payload.is_batch() {
            if let Some(waiter) = waiters.pop() {
                return waiter.await.map(SendOutcome::Response);
            }
        }
        Ok(SendOutcome::Batch(join_all(waiters).await))
    }

    /// Handle the HTTP response, which may be JSON or SSE.
    async fn handle_response(
        self: &Arc<Self>,
        response: Response,
        ids: &[RequestId],
        ctx: &TransportContext,
    ) -> Result<(), TransportError> {
        self.capture_session_id(&response);
        let status = response.status();

        if status == StatusCode::ACCEPTED {
            if !ids.is_empty() {
                self.awaiting_inbound
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .extend(ids.iter().cloned());
            }
            return Ok(());
        }
        if status == StatusCode::NOT_FOUND && self.session.session_id().is_some() {
            return Err(self.expire_session());
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::HttpStatus {
                status: status.as_u16(),
                body,
            });
        }

        if content_type(&response).starts_with(EVENT_STREAM) {
            let stream = self.body_stream(response, "POST stream");
            let handler: Arc<dyn StreamHandler> = self.clone();
            if !self.streams.attach_post(handler, stream, ids.to_vec(), ctx.clone()) {
                return Err(self.session.closed_error());
            }
            return Ok(());
        }

        let bytes = response.bytes().await.map_err(|e| {
            TransportError::from_http("Reading response body", &e, self.config.connect_timeout)
        })?;
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(());
        }
        if bytes.len() > self.config.max_message_size {
            return Err(TransportError::MessageTooLarge {
                size: bytes.len(),
                max: self.config.max_message_size,
            });
        }
        let payload = codec::decode_slice(&bytes)?;
        for message in payload.into_messages() {
            self.session.route(message, ctx);
        }
        Ok(())
    }

    // =========================================================================
    // Inbound stream
    // =========================================================================

    fn wants_inbound(&self, trigger: InboundTrigger) -> bool {
        let allowed = match self.config.inbound_mode {
            InboundStreamMode::Eager => true,
            InboundStreamMode::Lazy => trigger == InboundTrigger::Send,
            InboundStreamMode::Disabled => false,
        };
        allowed
            && self.wire == Wire::Streamable
            && self.session.state() == SessionState::Active
            && !self.inbound_unsupported()
            && !self.streams.inbound_active()
    }

    fn spawn_inbound(self: &Arc<Self>, ctx: &TransportContext) {
        let core = self.clone();
        let ctx = ctx.clone();
        runtime::spawn(async move {
            if let Err(error) = core.ensure_inbound(&ctx).await {
                debug!(%error, "Could not open inbound stream");
                core.session.report_error(&error);
            }
        });
    }

    /// Open the inbound stream unless one is already being read.
    pub(crate) async fn ensure_inbound(
        self: &Arc<Self>,
        ctx: &TransportContext,
    ) -> Result<(), TransportError> {
        if self.streams.inbound_active() {
            return Ok(());
        }
        let _gate = self.inbound_gate.lock().await;
        if self.streams.inbound_active() {
            return Ok(());
        }
        self.session.check_open()?;

        if let Some(stream) = self.open_inbound(self.streams.inbound_cursor(), ctx).await? {
            let handler: Arc<dyn StreamHandler> = self.clone();
            if !self.streams.attach_inbound(handler, stream, ctx.clone()) {
                return Err(self.session.closed_error());
            }
        }
        Ok(())
    }

    /// Issue the inbound `GET`. `Ok(None)` if the server does not offer one.
    async fn open_inbound(
        &self,
        last_event_id: Option<String>,
        ctx: &TransportContext,
    ) -> Result<Option<ByteStream>, TransportError> {
        let mut headers = self.build_headers(EVENT_STREAM)?;
        if let Some(id) = &last_event_id {
            headers.insert(LAST_EVENT_ID_HEADER, header_value(id, "Last-Event-ID")?);
        }
        debug!(url = %self.endpoint, last_event_id = ?last_event_id, "Opening inbound stream");

        let request = OutboundRequest::new(Method::GET, self.endpoint.clone(), headers, None);
        let response = self.dispatch("SSE GET", request, ctx).await?;
        let status = response.status();

        if status == StatusCode::METHOD_NOT_ALLOWED && self.wire == Wire::Streamable {
            debug!("Server does not offer an inbound stream");
            self.inbound_unsupported.store(true, Ordering::Release);
            return Ok(None);
        }
        if status == StatusCode::NOT_FOUND
            && self.wire == Wire::Streamable
            && self.session.session_id().is_some()
        {
            return Err(self.expire_session());
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::HttpStatus {
                status: status.as_u16(),
                body,
            });
        }
        if !content_type(&response).starts_with(EVENT_STREAM) {
            return Err(TransportError::protocol(format!(
                "Inbound stream has content type '{}'",
                content_type(&response)
            )));
        }
        self.capture_session_id(&response);
        Ok(Some(self.body_stream(response, "SSE stream")))
    }

    /// Open the inbound stream if needed and wait for the server to announce
    /// where to post messages.
    pub(crate) async fn connect_inbound(
        self: &Arc<Self>,
        ctx: &TransportContext,
    ) -> Result<Url, TransportError> {
        self.ensure_inbound(ctx).await?;
        loop {
            self.session.check_open()?;
            if let Some(url) = self.message_endpoint() {
                return Ok(url);
            }
            let listener = self.endpoint_announced.listen();
            if let Some(url) = self.message_endpoint() {
                return Ok(url);
            }
            listener.await;
        }
    }

    fn adopt_endpoint(&self, data: &str) {
        match self.endpoint.join(data.trim()) {
            Ok(url) => {
                info!(endpoint = %url, "Message endpoint announced");
                *self
                    .message_endpoint
                    .write()
                    .unwrap_or_else(PoisonError::into_inner) = Some(url);
                self.endpoint_announced.notify(usize::MAX);
            }
            Err(e) => {
                warn!(data, error = %e, "Ignoring unusable endpoint announcement");
                self.session.counters().record_anomaly();
                self.session
                    .report_error(&TransportError::protocol(format!("Invalid endpoint '{data}': {e}")));
            }
        }
    }

    // =========================================================================
    // Close
    // =========================================================================

    pub(crate) async fn close(&self) -> Result<(), TransportError> {
        if !self.session.begin_close() {
            return Ok(());
        }
        debug!(session_id = ?self.session.session_id(), "Closing transport");
        self.streams.close_all();
        let session_id = self.session.session_id();
        self.session.pending().fail_all(session_id.clone());
        self.endpoint_announced.notify(usize::MAX);

        if self.wire == Wire::Streamable && session_id.is_some() {
            self.terminate_remote().await;
        }

        self.session.finish_close();
        Ok(())
    }

    /// Best-effort DELETE of the server-side session.
    async fn terminate_remote(&self) {
        let headers = match self.build_headers(JSON_OR_EVENT_STREAM) {
            Ok(headers) => headers,
            Err(error) => {
                debug!(%error, "Skipping session DELETE");
                return;
            }
        };
        let request = OutboundRequest::new(Method::DELETE, self.endpoint.clone(), headers, None);
        let deadline = Instant::now() + self.config.request_timeout;
        match run_until(deadline, self.dispatch("HTTP DELETE", request, &TransportContext::empty())).await {
            Some(Ok(response)) => debug!(status = %response.status(), "Session DELETE answered"),
            Some(Err(error)) => debug!(%error, "Session DELETE failed"),
            None => debug!("Session DELETE timed out"),
        }
    }

    /// Stop reading without touching the server.
    pub(crate) fn abandon(&self) {
        self.streams.close_all();
    }
}

impl StreamHandler for HttpCore {
    fn on_event(&self, event: SseEvent, ctx: &TransportContext) {
        if event.event == ENDPOINT_EVENT && self.wire == Wire::Sse {
            self.adopt_endpoint(&event.data);
            return;
        }
        if event.event != MESSAGE_EVENT {
            debug!(event = %event.event, "Ignoring SSE event");
            return;
        }
        // Priming events carry only an id.
        if event.data.trim().is_empty() {
            return;
        }
        match codec::decode(&event.data) {
            Ok(payload) => {
                for message in payload.into_messages() {
                    self.session.route(message, ctx);
                }
            }
            Err(e) => {
                warn!(id = ?event.id, error = %e, "Dropping undecodable SSE record");
                self.session.counters().record_anomaly();
                self.session.report_error(&TransportError::Codec(e));
            }
        }
    }

    fn reconnect<'a>(
        &'a self,
        last_event_id: Option<String>,
        ctx: &'a TransportContext,
    ) -> BoxFuture<'a, Result<Option<ByteStream>, TransportError>> {
        Box::pin(async move {
            self.session.check_open()?;
            self.open_inbound(last_event_id, ctx).await
        })
    }

    fn on_stream_failed(&self, ids: &[RequestId], error: &TransportError) {
        let failed = ids
            .iter()
            .filter(|id| self.session.pending().fail(id, for_request(error)))
            .count();
        if failed > 0 {
            debug!(failed, "Failed requests of broken POST stream");
        }
    }

    fn on_reconnected(&self) {
        info!(last_event_id = ?self.streams.inbound_cursor(), "Inbound stream resumed");
        self.session.counters().record_reconnect();
    }

    fn on_reconnect_failed(&self, error: TransportError) {
        error!(%error, "Inbound stream could not be resumed");
        self.session.counters().record_failed_reconnect();
        if !self.session.state().is_open() {
            return;
        }
        let error = for_request(&error);

        let failed = match self.wire {
            Wire::Sse => {
                // The inbound stream was the only reply channel.
                *self
                    .message_endpoint
                    .write()
                    .unwrap_or_else(PoisonError::into_inner) = None;
                self.awaiting_inbound
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clear();
                self.session
                    .pending()
                    .fail_outstanding(|| for_request(&error))
            }
            Wire::Streamable => {
                let stranded: Vec<RequestId> = self
                    .awaiting_inbound
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .drain()
                    .collect();
                stranded
                    .iter()
                    .filter(|id| self.session.pending().fail(id, for_request(&error)))
                    .count()
            }
        };
        if failed > 0 {
            debug!(failed, "Failed requests waiting on the lost stream");
        }
        self.session.report_error(&error);
    }

    fn on_malformed(&self, reason: &str) {
        self.session.counters().record_anomaly();
        self.session
            .report_error(&TransportError::protocol(format!("Malformed SSE record: {reason}")));
    }

    fn max_record_size(&self) -> usize {
        self.config.max_message_size
    }
}

impl std::fmt::Debug for HttpCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpCore")
            .field("wire", &self.wire)
            .field("endpoint", &self.endpoint.as_str())
            .field("session", &self.session)
            .field("streams", &self.streams)
            .finish_non_exhaustive()
    }
}
