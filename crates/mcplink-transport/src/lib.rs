//! Client transports for MCP over HTTP.
//!
//! This crate moves JSON-RPC messages between a local caller and a remote
//! MCP server, over either of the two HTTP wire variants:
//!
//! | Transport | Wire |
//! |-----------|------|
//! | [`http::StreamableHttpTransport`] | Streamable HTTP: POST per message, JSON or SSE replies, optional inbound `GET` stream |
//! | [`http::SseTransport`] | HTTP+SSE: one `GET /sse` stream for replies, POST to the announced endpoint |
//!
//! Both share the same session machinery:
//!
//! - [`session::SessionController`]: lifecycle state machine, session token,
//!   and routing of inbound messages
//! - [`pending::PendingRequests`]: correlates replies to waiting callers,
//!   with per-request deadlines
//! - [`multiplexer::StreamMultiplexer`]: one reader task per SSE connection,
//!   with a single resume of the inbound stream after a drop
//! - [`customizer`]: sync and async hooks run before every HTTP call
//! - [`sse::EventStream`]: the SSE reader
//!
//! Every call takes a [`TransportContext`], which reaches the customizers and,
//! for messages arriving on streams opened by that call, the notification
//! sink.
//!
//! # Example
//!
//! ```no_run
//! use mcplink_core::Request;
//! use mcplink_transport::http::HttpTransportBuilder;
//! use mcplink_transport::{Transport, TransportContext};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), mcplink_transport::TransportError> {
//!     let transport = HttpTransportBuilder::new("http://localhost:3001").build()?;
//!     let ctx = TransportContext::empty().with("tenant", "acme");
//!
//!     let init = Request::with_params(
//!         "initialize",
//!         1i64,
//!         json!({"protocolVersion": "2025-06-18", "capabilities": {}}),
//!     );
//!     let outcome = transport.send(init.into(), &ctx).await?;
//!     println!("{:?}", outcome.into_response());
//!
//!     transport.close_gracefully().await
//! }
//! ```

#![deny(missing_docs)]

pub mod context;
pub mod customizer;
pub mod error;
pub mod http;
pub mod multiplexer;
pub mod pending;
pub mod runtime;
pub mod session;
pub mod sse;
pub mod traits;

// Re-export commonly used types
pub use context::TransportContext;
pub use error::{BoxError, TransportError};
pub use http::{HttpTransportBuilder, HttpTransportConfig, SseTransport, StreamableHttpTransport};
pub use pending::{PendingRequests, PendingResponse};
pub use session::SessionController;
pub use traits::{
    ErrorObserver, NotificationSink, SendOutcome, Transport, TransportMetadata, TransportStats,
};
