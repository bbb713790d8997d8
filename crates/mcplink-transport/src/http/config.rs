//! Configuration shared by both HTTP transports, and the header names they
//! put on the wire.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Url;
use reqwest::header::{HeaderName, HeaderValue};

use crate::customizer::{AsyncRequestCustomizer, CustomizerPipeline, SyncRequestCustomizer};
use crate::error::TransportError;

/// Protocol version offered until the handshake negotiates one.
pub const MCP_PROTOCOL_VERSION: &str = "2025-06-18";

/// Header advertising the protocol version. Lowercase, as HTTP/2 requires.
pub const MCP_PROTOCOL_VERSION_HEADER: &str = "mcp-protocol-version";

/// Header carrying the server-assigned session token.
pub const MCP_SESSION_ID_HEADER: &str = "mcp-session-id";

/// Header carrying the resume cursor on an inbound `GET`.
pub const LAST_EVENT_ID_HEADER: &str = "last-event-id";

/// Largest body or SSE record accepted or sent by default: 16 MiB.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Default path of the streamable HTTP endpoint.
pub const DEFAULT_ENDPOINT: &str = "/mcp";

/// Default path of the HTTP+SSE event stream.
pub const DEFAULT_SSE_ENDPOINT: &str = "/sse";

/// When the streamable HTTP transport opens its inbound `GET` stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum InboundStreamMode {
    /// Right after the handshake completes.
    #[default]
    Eager,
    /// On the first send after the handshake, and again after a failure.
    Lazy,
    /// Never; replies arrive only on POST responses.
    Disabled,
}

/// Configuration for HTTP transports.
#[derive(Debug, Clone)]
pub struct HttpTransportConfig {
    /// Scheme, host and port of the server, e.g. `http://localhost:8080`.
    pub base_url: String,
    /// Path of the streamable HTTP endpoint, resolved against `base_url`.
    pub endpoint: String,
    /// Path of the HTTP+SSE event stream, resolved against `base_url`.
    pub sse_endpoint: String,
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// How long a request may wait for its response.
    pub request_timeout: Duration,
    /// Custom headers to include in requests.
    pub headers: Vec<(String, String)>,
    /// Protocol version to offer.
    pub protocol_version: String,
    /// Maximum message size in bytes, outbound and per inbound record.
    pub max_message_size: usize,
    /// When to open the inbound stream.
    pub inbound_mode: InboundStreamMode,
    /// Event ID to resume the inbound stream from.
    pub resume_from: Option<String>,
    /// Hooks run before every HTTP call.
    pub customizers: CustomizerPipeline,
}

impl HttpTransportConfig {
    /// Create a new HTTP transport configuration.
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            sse_endpoint: DEFAULT_SSE_ENDPOINT.to_string(),
            connect_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(60),
            headers: Vec::new(),
            protocol_version: MCP_PROTOCOL_VERSION.to_string(),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            inbound_mode: InboundStreamMode::default(),
            resume_from: None,
            customizers: CustomizerPipeline::default(),
        }
    }

    /// Set the streamable HTTP endpoint path.
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Set the HTTP+SSE event stream path.
    #[must_use]
    pub fn with_sse_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.sse_endpoint = endpoint.into();
        self
    }

    /// Set the maximum message size.
    #[must_use]
    pub const fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Set the connection timeout.
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the request timeout.
    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Add a custom header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Set the protocol version.
    #[must_use]
    pub fn with_protocol_version(mut self, version: impl Into<String>) -> Self {
        self.protocol_version = version.into();
        self
    }

    /// Set when the inbound stream is opened.
    #[must_use]
    pub const fn with_inbound_mode(mut self, mode: InboundStreamMode) -> Self {
        self.inbound_mode = mode;
        self
    }

    /// Resume the inbound stream after `event_id`.
    #[must_use]
    pub fn with_resume_from(mut self, event_id: impl Into<String>) -> Self {
        self.resume_from = Some(event_id.into());
        self
    }

    /// Install the synchronous request customizer.
    #[must_use]
    pub fn with_sync_customizer(mut self, hook: impl SyncRequestCustomizer + 'static) -> Self {
        self.customizers.set_sync(Arc::new(hook));
        self
    }

    /// Install the asynchronous request customizer.
    #[must_use]
    pub fn with_async_customizer(mut self, hook: impl AsyncRequestCustomizer + 'static) -> Self {
        self.customizers.set_async(Arc::new(hook));
        self
    }

    fn resolve(&self, path: &str) -> Result<Url, TransportError> {
        let base = Url::parse(&self.base_url).map_err(|e| {
            TransportError::invalid_config(format!("Invalid base URL '{}': {e}", self.base_url))
        })?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(TransportError::invalid_config(format!(
                "Unsupported URL scheme '{}'",
                base.scheme()
            )));
        }
        base.join(path)
            .map_err(|e| TransportError::invalid_config(format!("Invalid endpoint '{path}': {e}")))
    }

    /// The streamable HTTP endpoint URL.
    pub fn endpoint_url(&self) -> Result<Url, TransportError> {
        self.resolve(&self.endpoint)
    }

    /// The HTTP+SSE event stream URL.
    pub fn sse_url(&self) -> Result<Url, TransportError> {
        self.resolve(&self.sse_endpoint)
    }

    /// Check the configuration before a transport is built from it.
    pub fn validate(&self) -> Result<(), TransportError> {
        self.endpoint_url()?;
        self.sse_url()?;
        if self.connect_timeout.is_zero() {
            return Err(TransportError::invalid_config("Connect timeout must be non-zero"));
        }
        if self.request_timeout.is_zero() {
            return Err(TransportError::invalid_config("Request timeout must be non-zero"));
        }
        if self.max_message_size == 0 {
            return Err(TransportError::invalid_config("Max message size must be non-zero"));
        }
        HeaderValue::from_str(&self.protocol_version).map_err(|e| {
            TransportError::invalid_config(format!("Invalid protocol version header: {e}"))
        })?;
        for (name, value) in &self.headers {
            HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                TransportError::invalid_config(format!("Invalid header name '{name}': {e}"))
            })?;
            HeaderValue::from_str(value).map_err(|e| {
                TransportError::invalid_config(format!("Invalid header value for '{name}': {e}"))
            })?;
        }
        Ok(())
    }
}

impl Default for HttpTransportConfig {
    fn default() -> Self {
        Self::new("http://localhost:8080")
    }
}

/// Builder for HTTP transports.
#[derive(Debug, Default)]
pub struct HttpTransportBuilder {
    /// The configuration being built.
    pub(crate) config: HttpTransportConfig,
}

impl HttpTransportBuilder {
    /// Create a new builder with the given base URL.
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            config: HttpTransportConfig::new(base_url),
        }
    }

    /// Set the streamable HTTP endpoint path.
    #[must_use]
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.config.endpoint = endpoint.into();
        self
    }

    /// Set the HTTP+SSE event stream path.
    #[must_use]
    pub fn sse_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.config.sse_endpoint = endpoint.into();
        self
    }

    /// Set the connection timeout.
    #[must_use]
    pub const fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Set the request timeout.
    #[must_use]
    pub const fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// Add a custom header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.headers.push((name.into(), value.into()));
        self
    }

    /// Set when the inbound stream is opened.
    #[must_use]
    pub const fn inbound_mode(mut self, mode: InboundStreamMode) -> Self {
        self.config.inbound_mode = mode;
        self
    }

    /// Resume the inbound stream after `event_id`.
    #[must_use]
    pub fn resume_from(mut self, event_id: impl Into<String>) -> Self {
        self.config.resume_from = Some(event_id.into());
        self
    }

    /// Install the synchronous request customizer.
    #[must_use]
    pub fn sync_customizer(mut self, hook: impl SyncRequestCustomizer + 'static) -> Self {
        self.config.customizers.set_sync(Arc::new(hook));
        self
    }

    /// Install the asynchronous request customizer.
    #[must_use]
    pub fn async_customizer(mut self, hook: impl AsyncRequestCustomizer + 'static) -> Self {
        self.config.customizers.set_async(Arc::new(hook));
        self
    }
}
