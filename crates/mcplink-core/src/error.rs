//! Shared error vocabulary.
//!
//! - [`JsonRpcError`]: the error object carried inside a JSON-RPC response
//! - [`TransportErrorKind`]: the classification every transport error maps to
//!
//! The classification is what callers branch on. In particular
//! [`TransportErrorKind::Connection`] and [`TransportErrorKind::Timeout`] are
//! never conflated: the first means the network failed, the second that
//! nothing came back before the deadline.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Invalid JSON was received.
pub const PARSE_ERROR: i32 = -32700;

/// The JSON sent is not a valid Request object.
pub const INVALID_REQUEST: i32 = -32600;

/// The method does not exist.
pub const METHOD_NOT_FOUND: i32 = -32601;

/// Invalid method parameters.
pub const INVALID_PARAMS: i32 = -32602;

/// Internal JSON-RPC error.
pub const INTERNAL_ERROR: i32 = -32603;

/// A JSON-RPC error response object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    /// Error code.
    pub code: i32,
    /// Error message.
    pub message: String,
    /// Additional error data.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl JsonRpcError {
    /// Create an error with an arbitrary code.
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Create an "invalid params" error (-32602).
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(INVALID_PARAMS, message)
    }

    /// Create an "internal error" (-32603).
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(INTERNAL_ERROR, message)
    }

    /// Create a "method not found" error (-32601).
    pub fn method_not_found(message: impl Into<String>) -> Self {
        Self::new(METHOD_NOT_FOUND, message)
    }

    /// Create a "parse error" (-32700).
    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::new(PARSE_ERROR, message)
    }

    /// Create an "invalid request" error (-32600).
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(INVALID_REQUEST, message)
    }

    /// Attach additional data.
    #[must_use]
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

impl fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JSON-RPC error {}: {}", self.code, self.message)
    }
}

impl std::error::Error for JsonRpcError {}

/// Classification of transport errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportErrorKind {
    /// Transport-level I/O failure: refused, reset, or dropped connection.
    Connection,
    /// A deadline elapsed with no reply.
    Timeout,
    /// Malformed record, undecodable body, or unexpected HTTP exchange.
    Protocol,
    /// The session is closing or closed.
    SessionClosed,
    /// A request customization hook failed.
    Customization,
    /// The caller misused the API (duplicate request ID, invalid configuration).
    Usage,
}

impl TransportErrorKind {
    /// Whether errors of this kind affect the session as a whole rather than
    /// only the operation that observed them.
    #[must_use]
    pub const fn is_session_wide(self) -> bool {
        matches!(self, Self::Connection | Self::SessionClosed)
    }
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection => write!(f, "connection error"),
            Self::Timeout => write!(f, "timeout"),
            Self::Protocol => write!(f, "protocol error"),
            Self::SessionClosed => write!(f, "session closed"),
            Self::Customization => write!(f, "customization error"),
            Self::Usage => write!(f, "usage error"),
        }
    }
}
