//! Session lifecycle and message routing.
//!
//! [`SessionController`] owns everything about a session that does not
//! depend on the wire:
//!
//! - the lifecycle state, an atomic advanced only by compare-and-swap along
//!   the transitions [`SessionState::can_transition_to`] allows,
//! - the server-assigned session token, a write-once cell,
//! - the negotiated protocol version,
//! - the [`PendingRequests`] table,
//! - routing of decoded inbound messages to waiters or to the notification
//!   sink.
//!
//! There is no lock around the session as a whole, so sends, stream readers
//! and `close` can run concurrently.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock};
use std::time::Instant;

use mcplink_core::{JsonRpcPayload, Message, RequestId, Response, SessionState};
use tracing::{debug, info, trace, warn};

use crate::context::TransportContext;
use crate::error::TransportError;
use crate::pending::PendingRequests;
use crate::traits::{ErrorObserver, NotificationSink, StatsCounters, TransportStats};

/// The request method that opens a session.
pub const HANDSHAKE_METHOD: &str = "initialize";

/// Lifecycle, identity and routing for one client session.
pub struct SessionController {
    state: AtomicU8,
    session_id: OnceLock<String>,
    configured_version: String,
    negotiated_version: OnceLock<String>,
    established_at: OnceLock<Instant>,
    handshake_id: Mutex<Option<RequestId>>,
    pending: PendingRequests,
    stats: StatsCounters,
    sink: RwLock<Option<Arc<dyn NotificationSink>>>,
    observer: RwLock<Option<Arc<dyn ErrorObserver>>>,
}

impl SessionController {
    /// Create a controller for a session that will offer `protocol_version`.
    pub fn new(protocol_version: impl Into<String>) -> Self {
        Self {
            state: AtomicU8::new(SessionState::Uninitialized.as_u8()),
            session_id: OnceLock::new(),
            configured_version: protocol_version.into(),
            negotiated_version: OnceLock::new(),
            established_at: OnceLock::new(),
            handshake_id: Mutex::new(None),
            pending: PendingRequests::new(),
            stats: StatsCounters::default(),
            sink: RwLock::new(None),
            observer: RwLock::new(None),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// The session token, once assigned.
    pub fn session_id(&self) -> Option<String> {
        self.session_id.get().cloned()
    }

    /// The protocol version to advertise: negotiated if the handshake
    /// returned one, configured otherwise.
    pub fn protocol_version(&self) -> &str {
        self.negotiated_version
            .get()
            .map_or(self.configured_version.as_str(), String::as_str)
    }

    /// When the handshake completed.
    pub fn established_at(&self) -> Option<Instant> {
        self.established_at.get().copied()
    }

    /// The pending-request table.
    pub const fn pending(&self) -> &PendingRequests {
        &self.pending
    }

    pub(crate) const fn counters(&self) -> &StatsCounters {
        &self.stats
    }

    /// Counter snapshot.
    pub fn stats(&self) -> TransportStats {
        self.stats.snapshot()
    }

    /// Install the notification sink.
    pub fn set_notification_sink(&self, sink: Arc<dyn NotificationSink>) {
        *self.sink.write().unwrap_or_else(PoisonError::into_inner) = Some(sink);
    }

    /// Install the background error observer.
    pub fn set_error_observer(&self, observer: Arc<dyn ErrorObserver>) {
        *self.observer.write().unwrap_or_else(PoisonError::into_inner) = Some(observer);
    }

    /// Hand a background failure to the observer, if any.
    pub fn report_error(&self, error: &TransportError) {
        let observer = self
            .observer
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(observer) = observer {
            observer.on_error(error);
        }
    }

    /// The error a send gets once the session is closing or closed.
    pub fn closed_error(&self) -> TransportError {
        TransportError::session_closed(self.session_id())
    }

    /// Fail fast if the session no longer accepts work.
    pub fn check_open(&self) -> Result<(), TransportError> {
        if self.state().is_open() {
            Ok(())
        } else {
            Err(self.closed_error())
        }
    }

    fn transition(&self, from: SessionState, to: SessionState) -> bool {
        debug_assert!(from.can_transition_to(to));
        let moved = self
            .state
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if moved {
            debug!(%from, %to, "Session state changed");
        }
        moved
    }

    /// Admit an outbound payload.
    ///
    /// Returns the handshake request ID if the payload carries the handshake,
    /// after moving `Uninitialized` to `Initializing`.
    pub fn begin_send(&self, payload: &JsonRpcPayload) -> Result<Option<RequestId>, TransportError> {
        self.check_open()?;
        let handshake = payload
            .messages()
            .filter_map(Message::as_request)
            .find(|r| r.method() == HANDSHAKE_METHOD)
            .map(|r| r.id.clone());

        if let Some(id) = &handshake {
            self.transition(SessionState::Uninitialized, SessionState::Initializing);
            *self.handshake_id.lock().unwrap_or_else(PoisonError::into_inner) = Some(id.clone());
            // A close may have won the race since check_open.
            self.check_open()?;
        }
        Ok(handshake)
    }

    /// Roll back a handshake that never got a well-formed answer.
    pub fn abort_handshake(&self, id: &RequestId) {
        let mut current = self.handshake_id.lock().unwrap_or_else(PoisonError::into_inner);
        if current.as_ref() == Some(id) {
            *current = None;
            drop(current);
            self.transition(SessionState::Initializing, SessionState::Uninitialized);
        }
    }

    fn observe_handshake(&self, response: &Response) {
        let mut current = self.handshake_id.lock().unwrap_or_else(PoisonError::into_inner);
        if current.as_ref() != Some(&response.id) {
            return;
        }
        *current = None;
        drop(current);

        if !response.is_success() {
            warn!(id = %response.id, "Handshake rejected by server");
            self.transition(SessionState::Initializing, SessionState::Uninitialized);
            return;
        }

        if let Some(version) = response
            .result
            .as_ref()
            .and_then(|r| r.get("protocolVersion"))
            .and_then(serde_json::Value::as_str)
        {
            if self.negotiated_version.set(version.to_string()).is_err() {
                debug!(version, "Protocol version already negotiated");
            }
        }

        if self.transition(SessionState::Initializing, SessionState::Active) {
            let _ = self.established_at.set(Instant::now());
            info!(
                session_id = ?self.session_id.get(),
                protocol_version = self.protocol_version(),
                "Session established"
            );
        }
    }

    /// Record the token the server assigned. Only the first one sticks.
    pub fn assign_session_id(&self, token: &str) {
        match self.session_id.get() {
            Some(existing) if existing == token => {}
            Some(existing) => {
                warn!(existing = %existing, offered = %token, "Ignoring second session ID");
            }
            None => {
                if self.session_id.set(token.to_string()).is_ok() {
                    debug!(session_id = %token, "Session ID assigned");
                }
            }
        }
    }

    /// Route one decoded inbound message.
    pub fn route(&self, message: Message, ctx: &TransportContext) {
        self.stats.record_received();
        match message {
            Message::Response(response) => {
                trace!(id = %response.id, "Routing response");
                self.observe_handshake(&response);
                if !self.pending.resolve(response) {
                    self.stats.record_anomaly();
                }
            }
            other => {
                let sink = self.sink.read().unwrap_or_else(PoisonError::into_inner).clone();
                match sink {
                    Some(sink) => {
                        trace!(method = ?other.method(), "Routing to notification sink");
                        sink.on_message(other, ctx);
                    }
                    None => debug!(method = ?other.method(), "No notification sink; dropping message"),
                }
            }
        }
    }

    /// Start closing. Returns `false` if the session was already closing or
    /// closed, in which case the caller has nothing to do.
    pub fn begin_close(&self) -> bool {
        loop {
            let current = self.state();
            if !current.is_open() {
                return false;
            }
            if self.transition(current, SessionState::Closing) {
                return true;
            }
        }
    }

    /// Fail everything still pending and enter `Closed`.
    pub fn finish_close(&self) {
        let failed = self.pending.fail_all(self.session_id());
        if failed > 0 {
            debug!(failed, "Failed outstanding requests on close");
        }
        self.transition(SessionState::Closing, SessionState::Closed);
        info!(session_id = ?self.session_id.get(), "Session closed");
    }
}

impl std::fmt::Debug for SessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionController")
            .field("state", &self.state())
            .field("session_id", &self.session_id.get())
            .field("protocol_version", &self.protocol_version())
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}
