//! Transport error types.

use std::time::Duration;

use mcplink_core::{CodecError, RequestId, TransportErrorKind};
use thiserror::Error;

/// Boxed error returned by request customizers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur during transport operations.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The network failed: connection refused, reset, or dropped mid-stream.
    #[error("Connection error: {message}")]
    Connection {
        /// Error message.
        message: String,
    },

    /// No reply arrived before the deadline.
    #[error("{operation} timed out after {duration:?}")]
    Timeout {
        /// The operation that timed out.
        operation: String,
        /// How long the operation waited.
        duration: Duration,
    },

    /// The peer violated the wire protocol.
    #[error("Protocol error: {message}")]
    Protocol {
        /// Description of the protocol violation.
        message: String,
    },

    /// A body or SSE record could not be decoded.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The server answered with a status the exchange does not allow.
    #[error("Unexpected HTTP status {status}: {body}")]
    HttpStatus {
        /// The HTTP status code.
        status: u16,
        /// The response body, if any.
        body: String,
    },

    /// A message exceeded the configured size limit.
    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge {
        /// Actual message size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// The session is closing or closed.
    #[error("MCP session{} has been closed", session_id.as_ref().map(|id| format!(" with ID {id}")).unwrap_or_default())]
    SessionClosed {
        /// The server-assigned session token, if one had been assigned.
        session_id: Option<String>,
    },

    /// A request customizer failed. Displays as the customizer's own error.
    #[error(transparent)]
    Customizer(BoxError),

    /// A request with this ID is already outstanding.
    #[error("Request ID {id} is already pending")]
    DuplicateRequestId {
        /// The duplicated ID.
        id: RequestId,
    },

    /// The transport configuration is invalid.
    #[error("Invalid configuration: {message}")]
    InvalidConfig {
        /// Description of the problem.
        message: String,
    },
}

impl TransportError {
    /// Create a connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    /// Create a session-closed error.
    #[must_use]
    pub const fn session_closed(session_id: Option<String>) -> Self {
        Self::SessionClosed { session_id }
    }

    /// Create an invalid configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Classify a `reqwest` failure.
    ///
    /// The HTTP client only carries a connect timeout, so `is_timeout` can
    /// only mean the connect phase stalled. Everything else is a network
    /// failure.
    pub(crate) fn from_http(operation: &str, err: &reqwest::Error, connect_timeout: Duration) -> Self {
        if err.is_timeout() {
            Self::timeout(operation, connect_timeout)
        } else {
            Self::connection(format!("{operation} failed: {err}"))
        }
    }

    /// Get the transport error kind.
    #[must_use]
    pub const fn kind(&self) -> TransportErrorKind {
        match self {
            Self::Connection { .. } => TransportErrorKind::Connection,
            Self::Timeout { .. } => TransportErrorKind::Timeout,
            Self::Protocol { .. } => TransportErrorKind::Protocol,
            Self::Codec(_) => TransportErrorKind::Protocol,
            Self::HttpStatus { .. } => TransportErrorKind::Protocol,
            Self::MessageTooLarge { .. } => TransportErrorKind::Protocol,
            Self::SessionClosed { .. } => TransportErrorKind::SessionClosed,
            Self::Customizer(_) => TransportErrorKind::Customization,
            Self::DuplicateRequestId { .. } | Self::InvalidConfig { .. } => TransportErrorKind::Usage,
        }
    }

    /// Whether this error affects the whole session rather than one operation.
    #[must_use]
    pub const fn is_session_wide(&self) -> bool {
        self.kind().is_session_wide()
    }

    /// Whether this error is a deadline expiry.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Recover the error raised by a customizer.
    ///
    /// Returns `Err(self)` for every other variant.
    pub fn into_customizer_error(self) -> Result<BoxError, Self> {
        match self {
            Self::Customizer(inner) => Ok(inner),
            other => Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            TransportError::connection("reset").kind(),
            TransportErrorKind::Connection
        );
        assert_eq!(
            TransportError::timeout("request 1", Duration::from_secs(1)).kind(),
            TransportErrorKind::Timeout
        );
        assert_eq!(
            TransportError::HttpStatus {
                status: 500,
                body: String::new()
            }
            .kind(),
            TransportErrorKind::Protocol
        );
        assert_eq!(
            TransportError::DuplicateRequestId {
                id: RequestId::Number(1)
            }
            .kind(),
            TransportErrorKind::Usage
        );
    }

    #[test]
    fn test_session_closed_message() {
        assert_eq!(
            TransportError::session_closed(None).to_string(),
            "MCP session has been closed"
        );
        assert_eq!(
            TransportError::session_closed(Some("abc-123".into())).to_string(),
            "MCP session with ID abc-123 has been closed"
        );
    }

    #[test]
    fn test_customizer_error_is_transparent() {
        let inner: BoxError = "token expired".into();
        let err = TransportError::Customizer(inner);
        assert_eq!(err.to_string(), "token expired");
        assert_eq!(err.kind(), TransportErrorKind::Customization);

        let recovered = err.into_customizer_error().unwrap();
        assert_eq!(recovered.to_string(), "token expired");
    }

    #[test]
    fn test_into_customizer_error_rejects_other_variants() {
        let err = TransportError::protocol("bad").into_customizer_error();
        assert!(matches!(err, Err(TransportError::Protocol { .. })));
    }

    #[test]
    fn test_session_wide() {
        assert!(TransportError::connection("x").is_session_wide());
        assert!(TransportError::session_closed(None).is_session_wide());
        assert!(!TransportError::timeout("x", Duration::ZERO).is_session_wide());
    }
}
