//! HTTP client transports.
//!
//! Two wire variants share one session core:
//!
//! - [`StreamableHttpTransport`]: POST to a single endpoint; each response is
//!   JSON, an SSE stream, or `202 Accepted`; an optional `GET` stream carries
//!   server-initiated messages.
//! - [`SseTransport`]: the older HTTP+SSE variant; a `GET /sse` stream carries
//!   every reply and announces the endpoint to POST to.
//!
//! Every POST advertises both `application/json` and `text/event-stream`.
//! Once the server hands out a session token in its `initialize` reply, the
//! streamable transport echoes it (with the negotiated protocol version) on
//! each later request until the session is closed.
//!
//! # Example
//!
//! ```rust
//! use mcplink_transport::http::{HttpTransportConfig, InboundStreamMode};
//! use std::time::Duration;
//!
//! let config = HttpTransportConfig::new("http://localhost:8080")
//!     .with_connect_timeout(Duration::from_secs(10))
//!     .with_request_timeout(Duration::from_secs(30))
//!     .with_inbound_mode(InboundStreamMode::Lazy);
//!
//! assert_eq!(config.endpoint_url().unwrap().as_str(), "http://localhost:8080/mcp");
//! assert!(config.validate().is_ok());
//! ```

mod client;
mod config;
mod sse;
mod streamable;

pub use config::{
    DEFAULT_ENDPOINT, DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_SSE_ENDPOINT, HttpTransportBuilder,
    HttpTransportConfig, InboundStreamMode, LAST_EVENT_ID_HEADER, MCP_PROTOCOL_VERSION,
    MCP_PROTOCOL_VERSION_HEADER, MCP_SESSION_ID_HEADER,
};
pub use sse::SseTransport;
pub use streamable::StreamableHttpTransport;
