//! Message fixtures for common test scenarios.

use mcplink_core::{Notification, Request, RequestId};
use serde_json::json;

/// The protocol version the fixtures and the mock server default to.
pub const PROTOCOL_VERSION: &str = "2025-06-18";

/// An `initialize` request with minimal client capabilities.
#[must_use]
pub fn initialize_request(id: impl Into<RequestId>) -> Request {
    Request::with_params(
        "initialize",
        id,
        json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {"name": "mcplink-tests", "version": "0.1.0"}
        }),
    )
}

/// The `notifications/initialized` notification sent after the handshake.
#[must_use]
pub fn initialized_notification() -> Notification {
    Notification::new("notifications/initialized")
}

/// A `ping` request.
#[must_use]
pub fn ping(id: impl Into<RequestId>) -> Request {
    Request::new("ping", id)
}

/// An `echo` request; the mock server answers with `params` as the result.
#[must_use]
pub fn echo(id: impl Into<RequestId>, params: serde_json::Value) -> Request {
    Request::with_params("echo", id, params)
}

/// A request the mock server accepts but never answers.
#[must_use]
pub fn unanswered(id: impl Into<RequestId>) -> Request {
    Request::new("never", id)
}
