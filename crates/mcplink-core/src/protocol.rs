//! JSON-RPC 2.0 framing.
//!
//! Only the envelope is typed: method names, parameters and results stay
//! opaque [`serde_json::Value`]s. The transport needs no more than that to
//! frame traffic and to pair replies with the calls that caused them.
//!
//! A body on the wire is a [`JsonRpcPayload`]: either one [`Message`] or a
//! batch of them. A message is a [`Request`] (carries an id, wants a reply),
//! a [`Response`] (echoes that id) or a [`Notification`] (no id).
//!
//! ```rust
//! use mcplink_core::protocol::{Message, Request, RequestId};
//!
//! let call = Request::new("tools/list", 1i64);
//! let reply: Message = serde_json::from_str(r#"{"jsonrpc":"2.0","id":1,"result":{}}"#).unwrap();
//! let Message::Response(reply) = reply else { unreachable!() };
//! assert_eq!(reply.id, call.id);
//! assert_eq!(reply.id, RequestId::number(1));
//! ```

use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::JsonRpcError;

/// Value of the `jsonrpc` member on every message.
pub const JSONRPC_VERSION: &str = "2.0";

/// Correlates a request with its response.
///
/// The peer echoes it back unchanged, so it keeps whichever JSON type the
/// caller picked.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// An integer id. JSON-RPC allows negative ones.
    Number(i64),
    /// A string id.
    String(String),
}

impl RequestId {
    /// An integer id.
    #[must_use]
    pub const fn number(id: i64) -> Self {
        Self::Number(id)
    }

    /// A string id.
    #[must_use]
    pub fn string(id: impl Into<String>) -> Self {
        Self::String(id.into())
    }
}

impl From<i64> for RequestId {
    fn from(id: i64) -> Self {
        Self::number(id)
    }
}

impl From<String> for RequestId {
    fn from(id: String) -> Self {
        Self::String(id)
    }
}

impl From<&str> for RequestId {
    fn from(id: &str) -> Self {
        Self::string(id)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => f.write_str(s),
        }
    }
}

/// A call that expects a [`Response`] carrying the same `id`.
///
/// Fields serialize in declaration order, so encoded requests read
/// `jsonrpc`, `method`, `id`, `params`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Always [`JSONRPC_VERSION`] on requests built here.
    pub jsonrpc: Cow<'static, str>,
    /// Method name.
    pub method: Cow<'static, str>,
    /// Unique among the session's outstanding requests.
    pub id: RequestId,
    /// Opaque parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl Request {
    /// A request without parameters.
    pub fn new(method: impl Into<Cow<'static, str>>, id: impl Into<RequestId>) -> Self {
        Self {
            jsonrpc: Cow::Borrowed(JSONRPC_VERSION),
            method: method.into(),
            id: id.into(),
            params: None,
        }
    }

    /// A request carrying `params`.
    pub fn with_params(
        method: impl Into<Cow<'static, str>>,
        id: impl Into<RequestId>,
        params: serde_json::Value,
    ) -> Self {
        Self {
            params: Some(params),
            ..Self::new(method, id)
        }
    }

    /// The method name.
    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }
}

/// The answer to a [`Request`].
///
/// Well-formed responses carry exactly one of `result` and `error`; a
/// response with neither still decodes so that it can be matched to its
/// waiter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Protocol version marker.
    pub jsonrpc: Cow<'static, str>,
    /// The id of the request being answered.
    pub id: RequestId,
    /// Present on success. A `null` result is `Some(Value::Null)`.
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub result: Option<serde_json::Value>,
    /// Present on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

/// Keep a member that is present, even when it is `null`.
fn present<'de, D>(deserializer: D) -> Result<Option<serde_json::Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    serde_json::Value::deserialize(deserializer).map(Some)
}

impl Response {
    /// A success reply.
    #[must_use]
    pub fn success(id: impl Into<RequestId>, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: Cow::Borrowed(JSONRPC_VERSION),
            id: id.into(),
            result: Some(result),
            error: None,
        }
    }

    /// An error reply.
    #[must_use]
    pub fn error(id: impl Into<RequestId>, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: Cow::Borrowed(JSONRPC_VERSION),
            id: id.into(),
            result: None,
            error: Some(error),
        }
    }

    /// `true` if a result came back and no error did.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.result.is_some() && self.error.is_none()
    }

    /// Split into the result or the error.
    ///
    /// A response carrying neither becomes an internal error.
    pub fn into_result(self) -> Result<serde_json::Value, JsonRpcError> {
        match (self.result, self.error) {
            (_, Some(error)) => Err(error),
            (Some(result), None) => Ok(result),
            (None, None) => Err(JsonRpcError::internal_error(
                "Response carries neither result nor error",
            )),
        }
    }
}

/// A one-way message. Nothing answers it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Protocol version marker.
    pub jsonrpc: Cow<'static, str>,
    /// Method name.
    pub method: Cow<'static, str>,
    /// Opaque parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl Notification {
    /// A notification without parameters.
    pub fn new(method: impl Into<Cow<'static, str>>) -> Self {
        Self {
            jsonrpc: Cow::Borrowed(JSONRPC_VERSION),
            method: method.into(),
            params: None,
        }
    }

    /// A notification carrying `params`.
    pub fn with_params(method: impl Into<Cow<'static, str>>, params: serde_json::Value) -> Self {
        Self {
            params: Some(params),
            ..Self::new(method)
        }
    }

    /// The method name.
    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }
}

/// Any single JSON-RPC message.
///
/// Decoding tries the variants in order: a body with both `method` and `id`
/// is a request, one with `id` only a response, one with `method` only a
/// notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    /// A call from either side.
    Request(Request),
    /// A reply from either side.
    Response(Response),
    /// A one-way message from either side.
    Notification(Notification),
}

impl Message {
    /// The method name; `None` for responses.
    #[must_use]
    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request(r) => Some(r.method()),
            Self::Notification(n) => Some(n.method()),
            Self::Response(_) => None,
        }
    }

    /// The `jsonrpc` marker as received.
    #[must_use]
    pub fn jsonrpc(&self) -> &str {
        match self {
            Self::Request(r) => &r.jsonrpc,
            Self::Response(r) => &r.jsonrpc,
            Self::Notification(n) => &n.jsonrpc,
        }
    }

    /// The request inside, if this is one.
    #[must_use]
    pub const fn as_request(&self) -> Option<&Request> {
        match self {
            Self::Request(r) => Some(r),
            _ => None,
        }
    }
}

impl From<Request> for Message {
    fn from(request: Request) -> Self {
        Self::Request(request)
    }
}

impl From<Response> for Message {
    fn from(response: Response) -> Self {
        Self::Response(response)
    }
}

impl From<Notification> for Message {
    fn from(notification: Notification) -> Self {
        Self::Notification(notification)
    }
}

/// A unit of JSON-RPC traffic: one message or an ordered batch.
///
/// This is what travels in one HTTP body or one SSE `data` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcPayload {
    /// A single message.
    Single(Message),
    /// A batch of messages, in order.
    Batch(Vec<Message>),
}

impl JsonRpcPayload {
    /// Iterate over the messages in this payload, in order.
    pub fn messages(&self) -> impl Iterator<Item = &Message> {
        let slice: &[Message] = match self {
            Self::Single(m) => std::slice::from_ref(m),
            Self::Batch(ms) => ms,
        };
        slice.iter()
    }

    /// Consume the payload into its messages, in order.
    #[must_use]
    pub fn into_messages(self) -> Vec<Message> {
        match self {
            Self::Single(m) => vec![m],
            Self::Batch(ms) => ms,
        }
    }

    /// IDs of the requests in this payload, in order.
    ///
    /// These are the messages that expect a reply.
    #[must_use]
    pub fn request_ids(&self) -> Vec<RequestId> {
        self.messages()
            .filter_map(|m| m.as_request().map(|r| r.id.clone()))
            .collect()
    }

    /// Whether this payload is a batch.
    #[must_use]
    pub const fn is_batch(&self) -> bool {
        matches!(self, Self::Batch(_))
    }
}

impl From<Message> for JsonRpcPayload {
    fn from(m: Message) -> Self {
        Self::Single(m)
    }
}

impl From<Request> for JsonRpcPayload {
    fn from(request: Request) -> Self {
        Self::Single(request.into())
    }
}

impl From<Notification> for JsonRpcPayload {
    fn from(notification: Notification) -> Self {
        Self::Single(notification.into())
    }
}

impl From<Response> for JsonRpcPayload {
    fn from(response: Response) -> Self {
        Self::Single(response.into())
    }
}

impl From<Vec<Message>> for JsonRpcPayload {
    fn from(ms: Vec<Message>) -> Self {
        Self::Batch(ms)
    }
}
