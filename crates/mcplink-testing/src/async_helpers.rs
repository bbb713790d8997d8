//! Async testing utilities.
//!
//! This module provides helpers for testing code that talks to the mock
//! server: timeout wrappers and polling for conditions that become true in a
//! background task.

use std::future::Future;
use std::time::Duration;

/// Default timeout for async operations in tests.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default polling interval for [`wait_for`].
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(10);

/// Run an async function with a timeout.
///
/// # Panics
///
/// Panics if the future does not complete within the timeout.
///
/// # Example
///
/// ```rust
/// use mcplink_testing::async_helpers::with_timeout;
/// use std::time::Duration;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let result = with_timeout(Duration::from_secs(1), async { "hello" }).await;
/// assert_eq!(result, "hello");
/// # }
/// ```
pub async fn with_timeout<T, F>(timeout: Duration, future: F) -> T
where
    F: Future<Output = T>,
{
    tokio::time::timeout(timeout, future)
        .await
        .expect("Test timed out")
}

/// Run an async function with the default timeout.
pub async fn with_default_timeout<T, F>(future: F) -> T
where
    F: Future<Output = T>,
{
    with_timeout(DEFAULT_TIMEOUT, future).await
}

/// Wait for a condition to become true.
///
/// Polls the condition function at regular intervals until it returns true
/// or the timeout is reached.
///
/// # Panics
///
/// Panics if the condition is not met within the timeout.
pub async fn wait_for<F>(timeout: Duration, interval: Duration, mut condition: F)
where
    F: FnMut() -> bool,
{
    let start = std::time::Instant::now();
    while !condition() {
        assert!(
            start.elapsed() <= timeout,
            "Condition not met within timeout"
        );
        tokio::time::sleep(interval).await;
    }
}

/// [`wait_for`] with the default timeout and interval.
pub async fn eventually<F>(condition: F)
where
    F: FnMut() -> bool,
{
    wait_for(DEFAULT_TIMEOUT, DEFAULT_INTERVAL, condition).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_wait_for_condition() {
        let counter = Arc::new(AtomicUsize::new(0));
        let bumper = counter.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            bumper.store(3, Ordering::SeqCst);
        });

        eventually(|| counter.load(Ordering::SeqCst) == 3).await;
    }

    #[tokio::test]
    #[should_panic(expected = "Test timed out")]
    async fn test_with_timeout_panics() {
        with_timeout(Duration::from_millis(10), std::future::pending::<()>()).await;
    }
}
