//! Scripted MCP server over HTTP.
//!
//! [`MockServer`] binds an ephemeral port and speaks both HTTP wire variants:
//!
//! | Route | Purpose |
//! |-------|---------|
//! | `POST /mcp` | streamable HTTP messages |
//! | `GET /mcp` | streamable HTTP inbound stream |
//! | `DELETE /mcp` | session termination |
//! | `GET /sse` | HTTP+SSE event stream, announces `/message?sessionId=…` |
//! | `POST /message` | HTTP+SSE messages, answered on the event stream |
//!
//! It understands four methods: `initialize`, `ping`, `echo` (returns its
//! params) and `never` (accepted, never answered). Everything else gets a
//! method-not-found error.
//!
//! Faults are injected through methods on the server handle: breaking POST
//! bodies, rejecting or refusing `GET`s, and cutting every open stream.

use std::collections::HashMap;
use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use dashmap::DashMap;
use futures::stream::{self, Stream};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::fixtures::PROTOCOL_VERSION;

const SESSION_HEADER: &str = "mcp-session-id";
const LAST_EVENT_ID_HEADER: &str = "last-event-id";

/// How `POST /mcp` delivers replies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReplyMode {
    /// A JSON body.
    #[default]
    Json,
    /// An SSE stream on the POST response.
    Sse,
    /// `202 Accepted`, with the reply pushed to the inbound `GET` stream.
    Inbound,
}

/// One request as the server saw it.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    /// HTTP method.
    pub method: Method,
    /// Path and query.
    pub uri: String,
    /// Request headers.
    pub headers: HeaderMap,
    /// Request body, if non-empty.
    pub body: Option<String>,
}

impl RecordedRequest {
    /// A header value as text.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// The path without the query.
    #[must_use]
    pub fn path(&self) -> &str {
        self.uri.split('?').next().unwrap_or_default()
    }

    /// The JSON-RPC method(s) in the body.
    #[must_use]
    pub fn rpc_methods(&self) -> Vec<String> {
        let Some(body) = self.body.as_deref() else {
            return Vec::new();
        };
        let Ok(value) = serde_json::from_str::<Value>(body) else {
            return Vec::new();
        };
        let messages = match value {
            Value::Array(items) => items,
            single => vec![single],
        };
        messages
            .iter()
            .filter_map(|m| m.get("method").and_then(Value::as_str).map(str::to_owned))
            .collect()
    }
}

#[derive(Debug, Clone)]
enum StreamItem {
    Event { id: u64, data: String },
    Abort,
}

#[derive(Debug)]
struct ServerState {
    reply_mode: Mutex<ReplyMode>,
    protocol_version: Mutex<String>,
    requests: Mutex<Vec<RecordedRequest>>,
    /// Streamable sessions; `false` once terminated.
    sessions: DashMap<String, bool>,
    history: Mutex<Vec<(u64, String)>>,
    next_event_id: AtomicU64,
    inbound: broadcast::Sender<StreamItem>,
    inbound_connections: AtomicUsize,
    legacy: DashMap<String, mpsc::UnboundedSender<StreamItem>>,
    fail_posts: AtomicUsize,
    reject_gets: AtomicUsize,
    inbound_disabled: AtomicBool,
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        .is_ok()
}

impl ServerState {
    fn new() -> Self {
        let (inbound, _) = broadcast::channel(256);
        Self {
            reply_mode: Mutex::new(ReplyMode::default()),
            protocol_version: Mutex::new(PROTOCOL_VERSION.to_string()),
            requests: Mutex::new(Vec::new()),
            sessions: DashMap::new(),
            history: Mutex::new(Vec::new()),
            next_event_id: AtomicU64::new(1),
            inbound,
            inbound_connections: AtomicUsize::new(0),
            legacy: DashMap::new(),
            fail_posts: AtomicUsize::new(0),
            reject_gets: AtomicUsize::new(0),
            inbound_disabled: AtomicBool::new(false),
        }
    }

    fn record(&self, method: Method, uri: &Uri, headers: &HeaderMap, body: &str) {
        let uri = uri
            .path_and_query()
            .map_or_else(|| uri.path().to_string(), ToString::to_string);
        lock(&self.requests).push(RecordedRequest {
            method,
            uri,
            headers: headers.clone(),
            body: (!body.is_empty()).then(|| body.to_string()),
        });
    }

    /// Append to the inbound history and broadcast.
    fn push_inbound(&self, data: String) -> u64 {
        let id = self.next_event_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.history).push((id, data.clone()));
        // No receivers is fine: the event is replayed on the next GET.
        let _ = self.inbound.send(StreamItem::Event { id, data });
        id
    }

    fn push_legacy(&self, session: &str, data: String) -> bool {
        let id = self.next_event_id.fetch_add(1, Ordering::Relaxed);
        self.legacy
            .get(session)
            .is_some_and(|tx| tx.send(StreamItem::Event { id, data }).is_ok())
    }

    /// Answer a JSON-RPC body. Returns the replies, in order, and the session
    /// created by an `initialize` in it.
    fn answer(&self, body: &Value) -> (Vec<Value>, Option<String>) {
        let messages: Vec<&Value> = match body {
            Value::Array(items) => items.iter().collect(),
            single => vec![single],
        };
        let mut replies = Vec::new();
        let mut created = None;

        for message in messages {
            let (Some(method), Some(id)) = (message.get("method").and_then(Value::as_str), message.get("id"))
            else {
                continue;
            };
            let reply = match method {
                "initialize" => {
                    let session = uuid::Uuid::new_v4().to_string();
                    self.sessions.insert(session.clone(), true);
                    created = Some(session);
                    json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "result": {
                            "protocolVersion": lock(&self.protocol_version).clone(),
                            "capabilities": {"logging": {}},
                            "serverInfo": {"name": "mcplink-mock", "version": "0.1.0"}
                        }
                    })
                }
                "ping" => json!({"jsonrpc": "2.0", "id": id, "result": {}}),
                "echo" => json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": message.get("params").cloned().unwrap_or(Value::Null)
                }),
                "never" => continue,
                other => json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": {"code": -32601, "message": format!("Method '{other}' not found")}
                }),
            };
            replies.push(reply);
        }
        (replies, created)
    }
}

fn sse_event(id: u64, data: &str) -> Event {
    Event::default().id(id.to_string()).event("message").data(data)
}

fn with_session(mut response: Response, session: Option<&str>) -> Response {
    if let Some(value) = session.and_then(|s| s.parse().ok()) {
        response.headers_mut().insert(SESSION_HEADER, value);
    }
    response
}

/// A body that fails before yielding anything.
fn broken_body() -> Response {
    let body = Body::from_stream(stream::once(async {
        Err::<Bytes, io::Error>(io::Error::other("injected body failure"))
    }));
    (StatusCode::OK, [("content-type", "application/json")], body).into_response()
}

// =============================================================================
// Streamable HTTP
// =============================================================================

/// Check the session header. `Err` carries the rejection.
fn check_session(state: &ServerState, headers: &HeaderMap) -> Result<Option<String>, Response> {
    let Some(session) = headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok()) else {
        return Ok(None);
    };
    match state.sessions.get(session).map(|live| *live) {
        Some(true) => Ok(Some(session.to_string())),
        _ => {
            debug!(session, "Unknown or terminated session");
            Err(StatusCode::NOT_FOUND.into_response())
        }
    }
}

async fn post_mcp(
    State(state): State<Arc<ServerState>>,
    uri: Uri,
    headers: HeaderMap,
    body: String,
) -> Response {
    state.record(Method::POST, &uri, &headers, &body);

    if take_one(&state.fail_posts) {
        debug!("Injecting POST body failure");
        return broken_body();
    }
    let session = match check_session(&state, &headers) {
        Ok(session) => session,
        Err(rejection) => return rejection,
    };
    let Ok(value) = serde_json::from_str::<Value>(&body) else {
        return (StatusCode::BAD_REQUEST, "invalid JSON").into_response();
    };

    let (replies, created) = state.answer(&value);
    let session = created.or(session);
    if replies.is_empty() {
        return with_session(StatusCode::ACCEPTED.into_response(), session.as_deref());
    }

    let mode = *lock(&state.reply_mode);
    let response = match mode {
        ReplyMode::Json => {
            let body = if value.is_array() {
                Value::Array(replies)
            } else {
                replies.into_iter().next().unwrap_or(Value::Null)
            };
            (StatusCode::OK, [("content-type", "application/json")], body.to_string()).into_response()
        }
        ReplyMode::Sse => {
            let events: Vec<Result<Event, Infallible>> = replies
                .iter()
                .map(|reply| {
                    let id = state.next_event_id.fetch_add(1, Ordering::Relaxed);
                    Ok(sse_event(id, &reply.to_string()))
                })
                .collect();
            Sse::new(stream::iter(events)).into_response()
        }
        ReplyMode::Inbound => {
            for reply in replies {
                state.push_inbound(reply.to_string());
            }
            StatusCode::ACCEPTED.into_response()
        }
    };
    with_session(response, session.as_deref())
}

fn inbound_stream(
    state: Arc<ServerState>,
    after: u64,
) -> impl Stream<Item = Result<Event, io::Error>> {
    // Subscribe before reading history so nothing falls in between.
    let mut rx = state.inbound.subscribe();
    let replay: Vec<(u64, String)> = lock(&state.history)
        .iter()
        .filter(|(id, _)| *id > after)
        .cloned()
        .collect();

    async_stream::stream! {
        let mut last = after;
        for (id, data) in replay {
            last = last.max(id);
            yield Ok(sse_event(id, &data));
        }
        loop {
            match rx.recv().await {
                Ok(StreamItem::Event { id, data }) if id > last => {
                    last = id;
                    yield Ok(sse_event(id, &data));
                }
                Ok(StreamItem::Event { .. }) => {}
                Ok(StreamItem::Abort) => {
                    yield Err(io::Error::other("inbound stream cut"));
                    break;
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "Inbound stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

async fn get_mcp(
    State(state): State<Arc<ServerState>>,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    state.record(Method::GET, &uri, &headers, "");

    if state.inbound_disabled.load(Ordering::Acquire) {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }
    if take_one(&state.reject_gets) {
        return (StatusCode::INTERNAL_SERVER_ERROR, "injected GET rejection").into_response();
    }
    if let Err(rejection) = check_session(&state, &headers) {
        return rejection;
    }

    let after = headers
        .get(LAST_EVENT_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);
    state.inbound_connections.fetch_add(1, Ordering::AcqRel);
    info!(after, "Inbound stream opened");

    Sse::new(inbound_stream(state, after))
        .keep_alive(KeepAlive::default())
        .into_response()
}

async fn delete_mcp(
    State(state): State<Arc<ServerState>>,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    state.record(Method::DELETE, &uri, &headers, "");
    let Some(session) = headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok()) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    match state.sessions.get_mut(session) {
        Some(mut live) => {
            *live = false;
            info!(session, "Session terminated");
            StatusCode::OK.into_response()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

// =============================================================================
// HTTP+SSE
// =============================================================================

async fn get_sse(
    State(state): State<Arc<ServerState>>,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    state.record(Method::GET, &uri, &headers, "");

    if take_one(&state.reject_gets) {
        return (StatusCode::INTERNAL_SERVER_ERROR, "injected GET rejection").into_response();
    }

    let session = uuid::Uuid::new_v4().to_string();
    let (tx, mut rx) = mpsc::unbounded_channel();
    state.legacy.insert(session.clone(), tx);
    state.inbound_connections.fetch_add(1, Ordering::AcqRel);
    info!(session = %session, "Legacy stream opened");

    let endpoint = format!("/message?sessionId={session}");
    let events = async_stream::stream! {
        yield Ok::<_, io::Error>(Event::default().event("endpoint").data(endpoint));
        while let Some(item) = rx.recv().await {
            match item {
                StreamItem::Event { id, data } => yield Ok(sse_event(id, &data)),
                StreamItem::Abort => {
                    yield Err(io::Error::other("legacy stream cut"));
                    break;
                }
            }
        }
    };
    Sse::new(events).keep_alive(KeepAlive::default()).into_response()
}

async fn post_message(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<HashMap<String, String>>,
    uri: Uri,
    headers: HeaderMap,
    body: String,
) -> Response {
    state.record(Method::POST, &uri, &headers, &body);

    let Some(session) = query.get("sessionId").filter(|s| state.legacy.contains_key(*s)) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let Ok(value) = serde_json::from_str::<Value>(&body) else {
        return (StatusCode::BAD_REQUEST, "invalid JSON").into_response();
    };

    let (replies, _) = state.answer(&value);
    for reply in replies {
        if !state.push_legacy(session, reply.to_string()) {
            warn!(session = %session, "Legacy stream gone; reply dropped");
        }
    }
    StatusCode::ACCEPTED.into_response()
}

// =============================================================================
// Handle
// =============================================================================

/// A running mock server. Stops when dropped.
#[derive(Debug)]
pub struct MockServer {
    addr: SocketAddr,
    state: Arc<ServerState>,
    task: JoinHandle<()>,
}

impl MockServer {
    /// Bind an ephemeral local port and start serving.
    ///
    /// # Panics
    ///
    /// Panics if the port cannot be bound.
    pub async fn start() -> Self {
        let state = Arc::new(ServerState::new());
        let app = Router::new()
            .route("/mcp", post(post_mcp).get(get_mcp).delete(delete_mcp))
            .route("/sse", get(get_sse))
            .route("/message", post(post_message))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock server");
        let addr = listener.local_addr().expect("mock server address");
        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                warn!(error = %e, "Mock server stopped");
            }
        });
        debug!(%addr, "Mock server listening");

        Self { addr, state, task }
    }

    /// `http://127.0.0.1:<port>`.
    #[must_use]
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Choose how `POST /mcp` replies.
    pub fn set_reply_mode(&self, mode: ReplyMode) {
        *lock(&self.state.reply_mode) = mode;
    }

    /// The protocol version `initialize` answers with.
    pub fn set_protocol_version(&self, version: impl Into<String>) {
        *lock(&self.state.protocol_version) = version.into();
    }

    /// Every request received so far.
    #[must_use]
    pub fn requests(&self) -> Vec<RecordedRequest> {
        lock(&self.state.requests).clone()
    }

    /// Requests received with `method` on `path`.
    #[must_use]
    pub fn requests_to(&self, method: &Method, path: &str) -> Vec<RecordedRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.method == *method && r.path() == path)
            .collect()
    }

    /// How many inbound streams (`GET /mcp` or `GET /sse`) were opened.
    #[must_use]
    pub fn inbound_connections(&self) -> usize {
        self.state.inbound_connections.load(Ordering::Acquire)
    }

    /// Push a notification to the streamable inbound stream. Returns its
    /// event ID.
    pub fn push_notification(&self, method: &str, params: Value) -> u64 {
        self.push_data(json!({"jsonrpc": "2.0", "method": method, "params": params}).to_string())
    }

    /// Push an arbitrary `data` payload to the streamable inbound stream.
    pub fn push_data(&self, data: impl Into<String>) -> u64 {
        self.state.push_inbound(data.into())
    }

    /// Push a notification to every HTTP+SSE stream.
    pub fn push_legacy_notification(&self, method: &str, params: Value) {
        let data = json!({"jsonrpc": "2.0", "method": method, "params": params}).to_string();
        let sessions: Vec<String> = self.state.legacy.iter().map(|e| e.key().clone()).collect();
        for session in sessions {
            self.state.push_legacy(&session, data.clone());
        }
    }

    /// Cut every open stream mid-body.
    pub fn drop_inbound_streams(&self) {
        let _ = self.state.inbound.send(StreamItem::Abort);
        let legacy: Vec<_> = self.state.legacy.iter().map(|e| e.key().clone()).collect();
        for session in legacy {
            if let Some((_, tx)) = self.state.legacy.remove(&session) {
                let _ = tx.send(StreamItem::Abort);
            }
        }
    }

    /// Make the next `n` `POST /mcp` responses fail mid-body.
    pub fn fail_next_posts(&self, n: usize) {
        self.state.fail_posts.store(n, Ordering::Release);
    }

    /// Answer the next `n` inbound `GET`s with `500`.
    pub fn reject_next_gets(&self, n: usize) {
        self.state.reject_gets.store(n, Ordering::Release);
    }

    /// Answer every `GET /mcp` with `405 Method Not Allowed`.
    pub fn disable_inbound(&self) {
        self.state.inbound_disabled.store(true, Ordering::Release);
    }

    /// Whether the streamable session `id` is still live.
    #[must_use]
    pub fn session_live(&self, id: &str) -> bool {
        self.state.sessions.get(id).is_some_and(|live| *live)
    }

    /// Stop serving.
    pub fn shutdown(&self) {
        self.task.abort();
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_initialize_creates_session() {
        let server = MockServer::start().await;
        let client = reqwest::Client::new();
        let response = client
            .post(format!("{}/mcp", server.base_url()))
            .body(r#"{"jsonrpc":"2.0","id":"test-id","method":"initialize","params":{}}"#)
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), 200);
        let session = response.headers()[SESSION_HEADER].to_str().unwrap().to_string();
        assert!(server.session_live(&session));

        let body: Value = response.json().await.unwrap();
        assert_eq!(body["id"], "test-id");
        assert_eq!(body["result"]["protocolVersion"], PROTOCOL_VERSION);
    }

    #[tokio::test]
    async fn test_notification_is_accepted() {
        let server = MockServer::start().await;
        let response = reqwest::Client::new()
            .post(format!("{}/mcp", server.base_url()))
            .body(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 202);
        assert_eq!(server.requests()[0].rpc_methods(), vec!["notifications/initialized"]);
    }

    #[tokio::test]
    async fn test_terminated_session_is_not_found() {
        let server = MockServer::start().await;
        server.state.sessions.insert("gone".to_string(), false);
        let response = reqwest::Client::new()
            .post(format!("{}/mcp", server.base_url()))
            .header(SESSION_HEADER, "gone")
            .body(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 404);
    }
}
