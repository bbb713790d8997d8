//! Text encoding and decoding of JSON-RPC payloads.
//!
//! The transport never builds JSON by hand: every body it sends goes through
//! [`encode`], and every HTTP body or SSE `data` field it receives goes
//! through [`decode`].

use miette::Diagnostic;
use thiserror::Error;

use crate::protocol::{JSONRPC_VERSION, JsonRpcPayload};

/// Errors produced while encoding or decoding a payload.
#[derive(Error, Diagnostic, Debug)]
pub enum CodecError {
    /// The payload could not be serialized.
    #[error("Failed to encode JSON-RPC payload: {source}")]
    #[diagnostic(code(mcplink::codec::encode))]
    Encode {
        /// The underlying serializer error.
        #[source]
        source: serde_json::Error,
    },

    /// The text is not a JSON-RPC message or batch.
    #[error("Failed to decode JSON-RPC payload: {source}")]
    #[diagnostic(
        code(mcplink::codec::decode),
        help("Messages need a `jsonrpc` field plus `method` and/or `id`")
    )]
    Decode {
        /// The underlying deserializer error.
        #[source]
        source: serde_json::Error,
    },

    /// A batch contained no messages.
    #[error("Empty JSON-RPC batch")]
    #[diagnostic(code(mcplink::codec::empty_batch))]
    EmptyBatch,

    /// A message declared a JSON-RPC version other than 2.0.
    #[error("Unsupported JSON-RPC version '{version}'")]
    #[diagnostic(code(mcplink::codec::version))]
    UnsupportedVersion {
        /// The version found in the message.
        version: String,
    },
}

/// Encode a payload to its JSON text form.
pub fn encode(payload: &JsonRpcPayload) -> Result<String, CodecError> {
    if matches!(payload, JsonRpcPayload::Batch(ms) if ms.is_empty()) {
        return Err(CodecError::EmptyBatch);
    }
    serde_json::to_string(payload).map_err(|source| CodecError::Encode { source })
}

/// Decode a payload from JSON text.
pub fn decode(text: &str) -> Result<JsonRpcPayload, CodecError> {
    let payload: JsonRpcPayload =
        serde_json::from_str(text).map_err(|source| CodecError::Decode { source })?;
    validate(payload)
}

/// Decode a payload from raw bytes.
pub fn decode_slice(bytes: &[u8]) -> Result<JsonRpcPayload, CodecError> {
    let payload: JsonRpcPayload =
        serde_json::from_slice(bytes).map_err(|source| CodecError::Decode { source })?;
    validate(payload)
}

fn validate(payload: JsonRpcPayload) -> Result<JsonRpcPayload, CodecError> {
    if matches!(&payload, JsonRpcPayload::Batch(ms) if ms.is_empty()) {
        return Err(CodecError::EmptyBatch);
    }
    if let Some(bad) = payload.messages().find(|m| m.jsonrpc() != JSONRPC_VERSION) {
        return Err(CodecError::UnsupportedVersion {
            version: bad.jsonrpc().to_string(),
        });
    }
    Ok(payload)
}
