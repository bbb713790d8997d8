//! Testing utilities for mcplink.
//!
//! This crate provides what the transport tests run against:
//!
//! - [`MockServer`]: an axum server speaking both MCP HTTP wire variants,
//!   with fault injection (broken bodies, rejected streams, dropped
//!   connections)
//! - [`fixtures`]: ready-made requests and notifications
//! - [`async_helpers`]: timeouts and polling for background effects
//! - [`init_tracing`]: a test subscriber for the crates' `tracing` output
//!
//! # Example
//!
//! ```rust,no_run
//! use mcplink_testing::{MockServer, ReplyMode, init_tracing};
//!
//! # #[tokio::main]
//! # async fn main() {
//! init_tracing();
//! let server = MockServer::start().await;
//! server.set_reply_mode(ReplyMode::Sse);
//! println!("serving on {}", server.base_url());
//! # }
//! ```

#![deny(missing_docs)]

pub mod async_helpers;
pub mod fixtures;
pub mod server;

use tracing_subscriber::EnvFilter;

// Re-export commonly used types
pub use async_helpers::{eventually, wait_for, with_default_timeout, with_timeout};
pub use server::{MockServer, RecordedRequest, ReplyMode};

/// Install a test-friendly `tracing` subscriber.
///
/// Honours `RUST_LOG`, defaulting to `warn`. Safe to call from every test;
/// only the first call installs anything.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
