//! Caller-supplied context threaded through every outbound call.
//!
//! A [`TransportContext`] is an immutable bag of key/value pairs that the
//! caller attaches to a `send`. The transport never interprets it: it is
//! handed to every request customizer run on behalf of that send, and to the
//! notification sink for messages arriving on a stream the send opened. It has
//! no effect on the wire unless a customizer copies values into headers.
//!
//! An absent context and an empty one are the same thing.
//!
//! # Example
//!
//! ```rust
//! use mcplink_transport::TransportContext;
//!
//! let ctx = TransportContext::empty().with("tenant", "acme");
//! assert_eq!(ctx.get_str("tenant"), Some("acme"));
//!
//! // Contexts are values: deriving a new one leaves the original untouched.
//! let traced = ctx.with("trace-id", "t-1");
//! assert_eq!(ctx.len(), 1);
//! assert_eq!(traced.len(), 2);
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

/// Immutable key/value context, cheap to clone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransportContext {
    entries: Arc<HashMap<String, Value>>,
}

impl TransportContext {
    /// The empty context.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Derive a context with `key` set to `value`.
    #[must_use]
    pub fn with(&self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let mut entries = (*self.entries).clone();
        entries.insert(key.into(), value.into());
        Self {
            entries: Arc::new(entries),
        }
    }

    /// Look up a value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    /// Look up a string value.
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    /// Whether `key` is present.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the context carries nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over the entries in arbitrary order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl<K, V> FromIterator<(K, V)> for TransportContext
where
    K: Into<String>,
    V: Into<Value>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            entries: Arc::new(
                iter.into_iter()
                    .map(|(k, v)| (k.into(), v.into()))
                    .collect(),
            ),
        }
    }
}
