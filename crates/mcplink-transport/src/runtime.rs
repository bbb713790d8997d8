//! Async primitives used by the transports.
//!
//! The transports run on Tokio: stream readers are spawned tasks and request
//! deadlines are Tokio timers. Locks and notifications come from
//! `async-lock` / `event-listener` so the types that hold them stay
//! independent of the executor.

use std::future::Future;

// =============================================================================
// Locks and notification
// =============================================================================

/// An async mutex, held across `.await` where a std mutex cannot be.
pub use async_lock::Mutex as AsyncMutex;

/// An event notification mechanism.
///
/// Used to wake tasks waiting for a server announcement.
pub use event_listener::Event as Notify;

// =============================================================================
// Time
// =============================================================================

/// Monotonic instant used for request deadlines.
pub use tokio::time::Instant;

/// Run `future` until `deadline`, returning `None` if the deadline passed first.
pub async fn run_until<F: Future>(deadline: Instant, future: F) -> Option<F::Output> {
    tokio::time::timeout_at(deadline, future).await.ok()
}

// =============================================================================
// Tasks
// =============================================================================

/// Handle to a spawned task.
pub type TaskHandle = tokio::task::JoinHandle<()>;

/// Spawn a background task on the current runtime.
pub fn spawn<F>(future: F) -> TaskHandle
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(future)
}
