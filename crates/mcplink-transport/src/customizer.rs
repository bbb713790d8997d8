//! Request customization hooks.
//!
//! Every outbound HTTP call (handshake and message POSTs, inbound GETs and
//! their reconnects, the closing DELETE) passes through the configured
//! customizers after the body is serialized and before the request is
//! dispatched. The synchronous customizer runs first, then the asynchronous
//! one. A hook may rewrite headers and the URI; the body is read-only.
//!
//! A failing hook aborts the call. Its error is returned to the caller as
//! [`TransportError::Customizer`], which displays as the hook's own error.
//!
//! # Example
//!
//! ```rust
//! use mcplink_transport::customizer::{OutboundRequest, SyncRequestCustomizer};
//! use mcplink_transport::{BoxError, TransportContext};
//! use reqwest::header::HeaderValue;
//!
//! struct Tenant;
//!
//! impl SyncRequestCustomizer for Tenant {
//!     fn customize(
//!         &self,
//!         request: &mut OutboundRequest,
//!         ctx: &TransportContext,
//!     ) -> Result<(), BoxError> {
//!         if let Some(tenant) = ctx.get_str("tenant") {
//!             request.headers_mut().insert("x-tenant", HeaderValue::from_str(tenant)?);
//!         }
//!         Ok(())
//!     }
//! }
//! ```

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use reqwest::header::HeaderMap;
use reqwest::{Method, Url};

use crate::context::TransportContext;
use crate::error::{BoxError, TransportError};

/// An HTTP request about to be dispatched.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    method: Method,
    uri: Url,
    headers: HeaderMap,
    body: Option<String>,
}

impl OutboundRequest {
    pub(crate) const fn new(method: Method, uri: Url, headers: HeaderMap, body: Option<String>) -> Self {
        Self {
            method,
            uri,
            headers,
            body,
        }
    }

    /// The HTTP method.
    #[must_use]
    pub const fn method(&self) -> &Method {
        &self.method
    }

    /// The target URI.
    #[must_use]
    pub const fn uri(&self) -> &Url {
        &self.uri
    }

    /// Redirect the request.
    pub fn set_uri(&mut self, uri: Url) {
        self.uri = uri;
    }

    /// The request headers.
    #[must_use]
    pub const fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Mutable access to the request headers.
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// The serialized body. `None` for GET and DELETE.
    #[must_use]
    pub fn body(&self) -> Option<&str> {
        self.body.as_deref()
    }

    pub(crate) fn into_parts(self) -> (Method, Url, HeaderMap, Option<String>) {
        (self.method, self.uri, self.headers, self.body)
    }
}

/// A hook that runs inline before dispatch.
pub trait SyncRequestCustomizer: Send + Sync {
    /// Adjust `request`. Returning an error aborts the call.
    fn customize(&self, request: &mut OutboundRequest, ctx: &TransportContext) -> Result<(), BoxError>;
}

impl<F> SyncRequestCustomizer for F
where
    F: Fn(&mut OutboundRequest, &TransportContext) -> Result<(), BoxError> + Send + Sync,
{
    fn customize(&self, request: &mut OutboundRequest, ctx: &TransportContext) -> Result<(), BoxError> {
        self(request, ctx)
    }
}

/// A hook that may suspend before dispatch, e.g. to fetch a token.
pub trait AsyncRequestCustomizer: Send + Sync {
    /// Adjust `request`. Returning an error aborts the call.
    fn customize<'a>(
        &'a self,
        request: &'a mut OutboundRequest,
        ctx: &'a TransportContext,
    ) -> BoxFuture<'a, Result<(), BoxError>>;
}

/// The ordered pair of hooks applied to every outbound call.
#[derive(Clone, Default)]
pub struct CustomizerPipeline {
    sync_hook: Option<Arc<dyn SyncRequestCustomizer>>,
    async_hook: Option<Arc<dyn AsyncRequestCustomizer>>,
}

impl CustomizerPipeline {
    /// Set the synchronous hook.
    pub fn set_sync(&mut self, hook: Arc<dyn SyncRequestCustomizer>) {
        self.sync_hook = Some(hook);
    }

    /// Set the asynchronous hook.
    pub fn set_async(&mut self, hook: Arc<dyn AsyncRequestCustomizer>) {
        self.async_hook = Some(hook);
    }

    /// Whether no hook is configured.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.sync_hook.is_none() && self.async_hook.is_none()
    }

    /// Run the hooks, sync first.
    pub async fn apply(
        &self,
        request: &mut OutboundRequest,
        ctx: &TransportContext,
    ) -> Result<(), TransportError> {
        if let Some(hook) = &self.sync_hook {
            hook.customize(request, ctx)
                .map_err(TransportError::Customizer)?;
        }
        if let Some(hook) = &self.async_hook {
            hook.customize(request, ctx)
                .await
                .map_err(TransportError::Customizer)?;
        }
        Ok(())
    }
}

impl fmt::Debug for CustomizerPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomizerPipeline")
            .field("sync", &self.sync_hook.is_some())
            .field("async", &self.async_hook.is_some())
            .finish()
    }
}
