//! Correlation of outstanding requests with their replies.
//!
//! Every request sent with an ID gets an entry in [`PendingRequests`] holding
//! a single-use completion slot. The entry is removed exactly once, by
//! whichever happens first:
//!
//! - a response with the same ID is routed here ([`PendingRequests::resolve`]),
//! - the transport fails it ([`PendingRequests::fail`] and friends),
//! - its deadline passes while the caller awaits the [`PendingResponse`],
//! - the caller drops the [`PendingResponse`].
//!
//! The table lock is a short-held std mutex and is never held across an
//! `.await`. Completion slots are filled while the lock is held, so a waiter
//! that loses the race to remove its own entry always finds its value in the
//! slot.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, ready};
use std::time::Duration;

use futures::FutureExt;
use futures::channel::oneshot;
use mcplink_core::{RequestId, Response};
use tracing::warn;

use crate::error::TransportError;
use crate::runtime::Instant;

type Outcome = Result<Response, TransportError>;

#[derive(Debug)]
struct Slot {
    seq: u64,
    sender: oneshot::Sender<Outcome>,
}

#[derive(Debug, Default)]
struct Table {
    entries: HashMap<RequestId, Slot>,
    next_seq: u64,
    sealed: bool,
    sealed_session: Option<String>,
}

fn lock(table: &Mutex<Table>) -> MutexGuard<'_, Table> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Table of requests awaiting a reply.
#[derive(Debug, Clone, Default)]
pub struct PendingRequests {
    table: Arc<Mutex<Table>>,
}

impl PendingRequests {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `id`, to be answered before `deadline`.
    ///
    /// Fails with [`TransportError::DuplicateRequestId`] if `id` is already
    /// outstanding, and with [`TransportError::SessionClosed`] once the table
    /// has been sealed by [`fail_all`](Self::fail_all).
    pub fn register(&self, id: RequestId, deadline: Instant) -> Result<PendingResponse, TransportError> {
        let (sender, receiver) = oneshot::channel();
        let seq = {
            let mut table = lock(&self.table);
            if table.sealed {
                return Err(TransportError::session_closed(table.sealed_session.clone()));
            }
            let seq = table.next_seq;
            match table.entries.entry(id.clone()) {
                Entry::Occupied(_) => return Err(TransportError::DuplicateRequestId { id }),
                Entry::Vacant(slot) => {
                    slot.insert(Slot { seq, sender });
                }
            }
            table.next_seq += 1;
            seq
        };

        Ok(PendingResponse {
            receiver,
            sleep: tokio::time::sleep_until(deadline),
            timeout: deadline.saturating_duration_since(Instant::now()),
            guard: EntryGuard {
                table: Arc::clone(&self.table),
                id,
                seq,
                armed: true,
            },
        })
    }

    /// Deliver `response` to the request with the same ID.
    ///
    /// Returns `false`, after logging, if no such request is outstanding: the
    /// ID is unknown, already answered, or timed out.
    pub fn resolve(&self, response: Response) -> bool {
        let mut table = lock(&self.table);
        match table.entries.remove(&response.id) {
            Some(slot) => {
                let id = response.id.clone();
                if slot.sender.send(Ok(response)).is_err() {
                    warn!(%id, "Waiter for response went away before delivery");
                    return false;
                }
                true
            }
            None => {
                warn!(id = %response.id, "Dropping response for unknown or completed request");
                false
            }
        }
    }

    /// Fail one outstanding request. Returns `false` if it was not outstanding.
    pub fn fail(&self, id: &RequestId, error: TransportError) -> bool {
        let mut table = lock(&self.table);
        match table.entries.remove(id) {
            Some(slot) => slot.sender.send(Err(error)).is_ok(),
            None => false,
        }
    }

    /// Fail every outstanding request, leaving the table open for new ones.
    ///
    /// Returns how many requests were failed.
    pub fn fail_outstanding<F>(&self, make_error: F) -> usize
    where
        F: Fn() -> TransportError,
    {
        let mut table = lock(&self.table);
        let mut failed = 0;
        for (_, slot) in table.entries.drain() {
            if slot.sender.send(Err(make_error())).is_ok() {
                failed += 1;
            }
        }
        failed
    }

    /// Fail every outstanding request with a session-closed error and refuse
    /// all later registrations.
    ///
    /// Returns how many requests were failed.
    pub fn fail_all(&self, session_id: Option<String>) -> usize {
        let mut table = lock(&self.table);
        table.sealed = true;
        table.sealed_session.clone_from(&session_id);
        let mut failed = 0;
        for (_, slot) in table.entries.drain() {
            let error = TransportError::session_closed(session_id.clone());
            if slot.sender.send(Err(error)).is_ok() {
                failed += 1;
            }
        }
        failed
    }

    /// Whether `id` is outstanding.
    #[must_use]
    pub fn contains(&self, id: &RequestId) -> bool {
        lock(&self.table).entries.contains_key(id)
    }

    /// Number of outstanding requests.
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.table).entries.len()
    }

    /// Whether nothing is outstanding.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether [`fail_all`](Self::fail_all) has run.
    #[must_use]
    pub fn is_sealed(&self) -> bool {
        lock(&self.table).sealed
    }
}

/// Removes the entry it guards unless disarmed.
#[derive(Debug)]
struct EntryGuard {
    table: Arc<Mutex<Table>>,
    id: RequestId,
    seq: u64,
    armed: bool,
}

impl EntryGuard {
    fn disarm(&mut self) {
        self.armed = false;
    }

    /// Remove our own entry. `false` if someone else removed it first.
    fn remove(&mut self) -> bool {
        self.armed = false;
        let mut table = lock(&self.table);
        match table.entries.get(&self.id) {
            Some(slot) if slot.seq == self.seq => table.entries.remove(&self.id).is_some(),
            _ => false,
        }
    }
}

impl Drop for EntryGuard {
    fn drop(&mut self) {
        if self.armed {
            self.remove();
        }
    }
}

pin_project_lite::pin_project! {
    /// The eventual reply to one registered request.
    ///
    /// Resolves with the response, with the error the transport failed the
    /// request with, or with [`TransportError::Timeout`] once the deadline
    /// passes. Dropping it withdraws the request from the table.
    #[derive(Debug)]
    #[must_use = "a pending response does nothing unless awaited"]
    pub struct PendingResponse {
        receiver: oneshot::Receiver<Outcome>,
        #[pin]
        sleep: tokio::time::Sleep,
        timeout: Duration,
        guard: EntryGuard,
    }
}

impl PendingResponse {
    /// The request ID this waits for.
    #[must_use]
    pub const fn id(&self) -> &RequestId {
        &self.guard.id
    }
}

fn abandoned() -> TransportError {
    TransportError::connection("request abandoned without a reply")
}

impl Future for PendingResponse {
    type Output = Outcome;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();

        if let Poll::Ready(outcome) = this.receiver.poll_unpin(cx) {
            this.guard.disarm();
            return Poll::Ready(outcome.unwrap_or_else(|_| Err(abandoned())));
        }

        ready!(this.sleep.poll(cx));

        if this.guard.remove() {
            return Poll::Ready(Err(TransportError::timeout(
                format!("Request {}", this.guard.id),
                *this.timeout,
            )));
        }

        // Someone completed the entry between our two checks.
        match this.receiver.try_recv() {
            Ok(Some(outcome)) => Poll::Ready(outcome),
            Ok(None) => Poll::Pending,
            Err(_) => Poll::Ready(Err(abandoned())),
        }
    }
}
