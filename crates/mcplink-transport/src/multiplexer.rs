//! Stream multiplexer.
//!
//! Tracks every open SSE connection of a session: at most one long-lived
//! inbound stream and any number of POST response streams. Each connection is
//! read by its own task, so events on one stream keep their order while
//! different streams interleave freely.
//!
//! What an event *means* is up to the [`StreamHandler`]; the multiplexer only
//! frames, counts and resumes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use futures::StreamExt;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use mcplink_core::RequestId;
use tracing::{debug, info, warn};

use crate::context::TransportContext;
use crate::error::TransportError;
use crate::runtime::{self, TaskHandle};
use crate::sse::{EventStream, SseError, SseEvent};

/// The body of an HTTP response, as a stream of chunks.
pub type ByteStream = BoxStream<'static, Result<Bytes, TransportError>>;

/// Receives what the reader tasks produce.
pub trait StreamHandler: Send + Sync + 'static {
    /// A complete SSE record arrived.
    fn on_event(&self, event: SseEvent, ctx: &TransportContext);

    /// Open a replacement inbound stream resuming after `last_event_id`.
    ///
    /// `Ok(None)` means the server no longer offers an inbound stream.
    fn reconnect<'a>(
        &'a self,
        last_event_id: Option<String>,
        ctx: &'a TransportContext,
    ) -> BoxFuture<'a, Result<Option<ByteStream>, TransportError>>;

    /// A POST stream broke before answering `ids`.
    fn on_stream_failed(&self, ids: &[RequestId], error: &TransportError);

    /// The inbound stream was replaced after a failure.
    fn on_reconnected(&self) {}

    /// The inbound stream failed and could not be resumed.
    fn on_reconnect_failed(&self, error: TransportError);

    /// A record was skipped.
    fn on_malformed(&self, reason: &str);

    /// Upper bound for a single SSE record.
    fn max_record_size(&self) -> usize;
}

/// What a connection is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamRole {
    /// The long-lived `GET` stream.
    Inbound,
    /// The response stream of one `POST`.
    Post,
}

/// Read position of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// Events are flowing.
    Open = 0,
    /// The byte source failed; a resume is in progress.
    Draining = 1,
    /// Finished.
    Closed = 2,
}

impl ConnectionState {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Open,
            1 => Self::Draining,
            _ => Self::Closed,
        }
    }
}

/// One open HTTP exchange carrying SSE.
#[derive(Debug)]
pub struct StreamConnection {
    role: StreamRole,
    state: AtomicU8,
    last_event_id: Mutex<Option<String>>,
}

impl StreamConnection {
    fn new(role: StreamRole, last_event_id: Option<String>) -> Self {
        Self {
            role,
            state: AtomicU8::new(ConnectionState::Open as u8),
            last_event_id: Mutex::new(last_event_id),
        }
    }

    /// The connection's role.
    pub const fn role(&self) -> StreamRole {
        self.role
    }

    /// Current read position.
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// The last event ID processed on this connection.
    pub fn last_event_id(&self) -> Option<String> {
        self.last_event_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Move the cursor to `seen`, the reader's most recent non-empty id.
    fn record_event_id(&self, seen: Option<&str>) {
        let Some(id) = seen else { return };
        let mut current = self.last_event_id.lock().unwrap_or_else(PoisonError::into_inner);
        if current.as_deref() != Some(id) {
            *current = Some(id.to_string());
        }
    }
}

struct Slot {
    conn: Arc<StreamConnection>,
    task: TaskHandle,
}

#[derive(Default)]
struct Registry {
    streams: Mutex<HashMap<u64, Slot>>,
    next_key: AtomicU64,
    closed: AtomicBool,
    inbound_cursor: Mutex<Option<String>>,
}

impl Registry {
    fn remove(&self, key: u64) {
        self.streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&key);
    }

    fn saved_cursor(&self) -> Option<String> {
        self.inbound_cursor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_inbound_cursor(&self, id: Option<String>) {
        if id.is_some() {
            *self.inbound_cursor.lock().unwrap_or_else(PoisonError::into_inner) = id;
        }
    }
}

/// Owns the reader tasks of one session.
#[derive(Clone, Default)]
pub struct StreamMultiplexer {
    registry: Arc<Registry>,
}

impl StreamMultiplexer {
    /// An empty multiplexer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start the inbound cursor at `id`, e.g. to resume a previous session.
    pub fn seed_inbound_cursor(&self, id: Option<String>) {
        self.registry.set_inbound_cursor(id);
    }

    /// The last event ID seen on the inbound stream, across reconnects.
    pub fn inbound_cursor(&self) -> Option<String> {
        let live = self
            .registry
            .streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .find(|slot| slot.conn.role == StreamRole::Inbound)
            .and_then(|slot| slot.conn.last_event_id());
        live.or_else(|| self.registry.saved_cursor())
    }

    /// Whether an inbound stream is being read.
    pub fn inbound_active(&self) -> bool {
        self.registry
            .streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .any(|slot| slot.conn.role == StreamRole::Inbound)
    }

    /// Number of connections currently read.
    pub fn active_streams(&self) -> usize {
        self.registry
            .streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether [`close_all`](Self::close_all) has run.
    pub fn is_closed(&self) -> bool {
        self.registry.closed.load(Ordering::Acquire)
    }

    /// Start reading the inbound stream.
    ///
    /// Returns `false`, dropping `stream`, if one is already being read or the
    /// multiplexer is closed.
    pub fn attach_inbound(
        &self,
        handler: Arc<dyn StreamHandler>,
        stream: ByteStream,
        ctx: TransportContext,
    ) -> bool {
        let mut streams = self.registry.streams.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_closed() || streams.values().any(|s| s.conn.role == StreamRole::Inbound) {
            return false;
        }
        let key = self.registry.next_key.fetch_add(1, Ordering::Relaxed);
        let conn = Arc::new(StreamConnection::new(StreamRole::Inbound, self.registry.saved_cursor()));
        debug!(key, last_event_id = ?conn.last_event_id(), "Inbound stream attached");

        // The task removes its own slot, so insert before it can finish.
        let task = runtime::spawn(run_inbound(
            self.registry.clone(),
            key,
            conn.clone(),
            handler,
            stream,
            ctx,
        ));
        streams.insert(key, Slot { conn, task });
        true
    }

    /// Start reading the SSE response of a POST carrying `ids`.
    pub fn attach_post(
        &self,
        handler: Arc<dyn StreamHandler>,
        stream: ByteStream,
        ids: Vec<RequestId>,
        ctx: TransportContext,
    ) -> bool {
        let mut streams = self.registry.streams.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_closed() {
            return false;
        }
        let key = self.registry.next_key.fetch_add(1, Ordering::Relaxed);
        let conn = Arc::new(StreamConnection::new(StreamRole::Post, None));
        debug!(key, requests = ids.len(), "POST stream attached");

        let task = runtime::spawn(run_post(
            self.registry.clone(),
            key,
            conn.clone(),
            handler,
            stream,
            ids,
            ctx,
        ));
        streams.insert(key, Slot { conn, task });
        true
    }

    /// Abort every reader task and refuse new streams.
    pub fn close_all(&self) {
        self.registry.closed.store(true, Ordering::Release);
        let drained: Vec<Slot> = self
            .registry
            .streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, slot)| slot)
            .collect();
        if !drained.is_empty() {
            debug!(count = drained.len(), "Closing streams");
        }
        for slot in drained {
            slot.conn.set_state(ConnectionState::Closed);
            slot.task.abort();
        }
    }
}

impl std::fmt::Debug for StreamMultiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamMultiplexer")
            .field("active_streams", &self.active_streams())
            .field("closed", &self.is_closed())
            .finish()
    }
}

enum PumpEnd {
    Graceful,
    Failed {
        error: TransportError,
        delivered: usize,
    },
}

async fn pump(
    handler: &dyn StreamHandler,
    conn: &StreamConnection,
    source: ByteStream,
    ctx: &TransportContext,
) -> PumpEnd {
    let mut events = EventStream::new(source)
        .with_last_event_id(conn.last_event_id())
        .with_max_record_size(handler.max_record_size());
    let mut delivered = 0;

    while let Some(item) = events.next().await {
        match item {
            Ok(event) => {
                delivered += 1;
                handler.on_event(event, ctx);
            }
            Err(SseError::Malformed { reason }) => {
                warn!(role = ?conn.role, %reason, "Skipping malformed SSE record");
                handler.on_malformed(&reason);
            }
            Err(SseError::Transport(error)) => {
                conn.record_event_id(events.last_event_id());
                return PumpEnd::Failed { error, delivered };
            }
        }
        // Id-only records move the reader's cursor without yielding an event.
        conn.record_event_id(events.last_event_id());
    }
    conn.record_event_id(events.last_event_id());
    PumpEnd::Graceful
}

        conn.set_state(ConnectionState::Draining);
        let last_event_id = conn.last_event_id();
        info!(key, %error, last_event_id = ?last_event_id, "Inbound stream lost; reconnecting");

        match handler.reconnect(last_event_id, &ctx).await {
            Ok(Some(next)) => {
                conn.set_state(ConnectionState::Open);
                handler.on_reconnected();
                source = next;
                resumed = true;
            }
            Ok(None) => {
                debug!(key, "Server no longer offers an inbound stream");
                break None;
            }
            Err(error) => break Some(error),
        }
    };

    // Release the slot first so the handler may open a replacement.
    conn.set_state(ConnectionState::Closed);
    registry.remove(key);
    if let Some(error) = failure {
        handler.on_reconnect_failed(error);
    }
}

async fn run_post(
    registry: Arc<Registry>,
    key: u64,
    conn: Arc<StreamConnection>,
    handler: Arc<dyn StreamHandler>,
    stream: ByteStream,
    ids: Vec<RequestId>,
    ctx: TransportContext,
) {
    match pump(&*handler, &conn, stream, &ctx).await {
        PumpEnd::Graceful => debug!(key, "POST stream ended"),
        PumpEnd::Failed { error, .. } => {
            warn!(key, %error, "POST stream failed");
            handler.on_stream_failed(&ids, &error);
        }
    }
    conn.set_state(ConnectionState::Closed);
    registry.remove(key);
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<SseEvent>>,
        failed: Mutex<Vec<RequestId>>,
        reconnect_requests: Mutex<Vec<Option<String>>>,
        replacements: Mutex<Vec<ByteStream>>,
        reconnect_failures: AtomicUsize,
        malformed: AtomicUsize,
    }

    impl StreamHandler for Recorder {
        fn on_event(&self, event: SseEvent, _ctx: &TransportContext) {
            self.events.lock().unwrap().push(event);
        }

        fn reconnect<'a>(
            &'a self,
            last_event_id: Option<String>,
            _ctx: &'a TransportContext,
        ) -> BoxFuture<'a, Result<Option<ByteStream>, TransportError>> {
            self.reconnect_requests.lock().unwrap().push(last_event_id);
            let next = self.replacements.lock().unwrap().pop();
            Box::pin(async move {
                next.map(Some)
                    .ok_or_else(|| TransportError::connection("connection refused"))
            })
        }

        fn on_stream_failed(&self, ids: &[RequestId], _error: &TransportError) {
            self.failed.lock().unwrap().extend_from_slice(ids);
        }

        fn on_reconnect_failed(&self, _error: TransportError) {
            self.reconnect_failures.fetch_add(1, Ordering::SeqCst);
        }

        fn on_malformed(&self, _reason: &str) {
            self.malformed.fetch_add(1, Ordering::SeqCst);
        }

        fn max_record_size(&self) -> usize {
            1024
        }
    }

    fn body(parts: Vec<Result<&str, &str>>) -> ByteStream {
        let chunks: Vec<Result<Bytes, TransportError>> = parts
            .into_iter()
            .map(|p| {
                p.map(|s| Bytes::copy_from_slice(s.as_bytes()))
                    .map_err(TransportError::connection)
            })
            .collect();
        stream::iter(chunks).boxed()
    }

    async fn settle(mux: &StreamMultiplexer) {
        for _ in 0..100 {
            if mux.active_streams() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("streams did not settle");
    }

    #[tokio::test]
    async fn test_inbound_graceful_end() {
        let mux = StreamMultiplexer::new();
        let handler = Arc::new(Recorder::default());
        assert!(mux.attach_inbound(
            handler.clone(),
            body(vec![Ok("id: 1\ndata: a\n\n"), Ok("id: 2\ndata: b\n\n")]),
            TransportContext::empty(),
        ));
        settle(&mux).await;

        assert_eq!(handler.events.lock().unwrap().len(), 2);
        assert!(handler.reconnect_requests.lock().unwrap().is_empty());
        assert_eq!(mux.inbound_cursor().as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn test_inbound_reconnects_once_with_last_event_id() {
        let mux = StreamMultiplexer::new();
        let handler = Arc::new(Recorder::default());
        handler
            .replacements
            .lock()
            .unwrap()
            .push(body(vec![Ok("id: 8\ndata: c\n\n")]));

        mux.attach_inbound(
            handler.clone(),
            body(vec![Ok("id: 7\ndata: a\n\n"), Err("reset by peer")]),
            TransportContext::empty(),
        );
        settle(&mux).await;

        assert_eq!(
            *handler.reconnect_requests.lock().unwrap(),
            vec![Some("7".to_string())]
        );
        assert_eq!(handler.events.lock().unwrap().len(), 2);
        assert_eq!(handler.reconnect_failures.load(Ordering::SeqCst), 0);
        assert_eq!(mux.inbound_cursor().as_deref(), Some("8"));
    }

    #[tokio::test]
    async fn test_id_only_record_moves_resume_cursor() {
        let mux = StreamMultiplexer::new();
        let handler = Arc::new(Recorder::default());

        mux.attach_inbound(
            handler.clone(),
            body(vec![Ok("id: 4\ndata: a\n\n"), Ok("id: 5\n\n"), Err("reset by peer")]),
            TransportContext::empty(),
        );
        settle(&mux).await;

        assert_eq!(handler.events.lock().unwrap().len(), 1);
        assert_eq!(
            *handler.reconnect_requests.lock().unwrap(),
            vec![Some("5".to_string())]
        );
    }

    #[tokio::test]
    async fn test_failed_reconnect_is_reported_once() {
        let mux = StreamMultiplexer::new();
        let handler = Arc::new(Recorder::default());

        mux.attach_inbound(
            handler.clone(),
            body(vec![Ok("data: a\n\n"), Err("reset by peer")]),
            TransportContext::empty(),
        );
        settle(&mux).await;

        assert_eq!(handler.reconnect_requests.lock().unwrap().len(), 1);
        assert_eq!(handler.reconnect_failures.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_replacement_without_progress_counts_as_failure() {
        let mux = StreamMultiplexer::new();
        let handler = Arc::new(Recorder::default());
        handler
            .replacements
            .lock()
            .unwrap()
            .push(body(vec![Err("reset again")]));

        mux.attach_inbound(
            handler.clone(),
            body(vec![Err("reset by peer")]),
            TransportContext::empty(),
        );
        settle(&mux).await;

        assert_eq!(handler.reconnect_requests.lock().unwrap().len(), 1);
        assert_eq!(handler.reconnect_failures.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_single_inbound_stream() {
        let mux = StreamMultiplexer::new();
        let handler = Arc::new(Recorder::default());
        let pending = stream::pending::<Result<Bytes, TransportError>>().boxed();
        assert!(mux.attach_inbound(handler.clone(), pending, TransportContext::empty()));
        assert!(mux.inbound_active());
        assert!(!mux.attach_inbound(handler, body(vec![]), TransportContext::empty()));
        mux.close_all();
        assert!(!mux.inbound_active());
    }

    #[tokio::test]
    async fn test_post_stream_failure_fails_its_requests() {
        let mux = StreamMultiplexer::new();
        let handler = Arc::new(Recorder::default());
        mux.attach_post(
            handler.clone(),
            body(vec![Ok(": keep-alive\n\n"), Err("broken pipe")]),
            vec![RequestId::number(1), RequestId::number(2)],
            TransportContext::empty(),
        );
        settle(&mux).await;
        assert_eq!(handler.failed.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_post_stream_graceful_end_leaves_requests() {
        let mux = StreamMultiplexer::new();
        let handler = Arc::new(Recorder::default());
        mux.attach_post(
            handler.clone(),
            body(vec![Ok("event: progress\ndata: {}\n\n")]),
            vec![RequestId::number(1)],
            TransportContext::empty(),
        );
        settle(&mux).await;
        assert!(handler.failed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_record_keeps_reading() {
        let mux = StreamMultiplexer::new();
        let handler = Arc::new(Recorder::default());
        let oversized = format!("data: {}\n\n", "x".repeat(2048));
        mux.attach_inbound(
            handler.clone(),
            body(vec![Ok(&oversized), Ok("data: ok\n\n")]),
            TransportContext::empty(),
        );
        settle(&mux).await;
        assert_eq!(handler.malformed.load(Ordering::SeqCst), 1);
        assert_eq!(handler.events.lock().unwrap()[0].data, "ok");
    }

    #[tokio::test]
    async fn test_closed_multiplexer_refuses_streams() {
        let mux = StreamMultiplexer::new();
        mux.close_all();
        let handler = Arc::new(Recorder::default());
        assert!(!mux.attach_post(handler, body(vec![]), vec![], TransportContext::empty()));
        assert!(mux.is_closed());
    }
}
