//! # mcplink-core
//!
//! Core types for the mcplink client transport.
//!
//! This crate provides the pieces the transport layer consumes but does not
//! own:
//!
//! - **Protocol types**: JSON-RPC 2.0 request/response/notification types and
//!   batches ([`protocol`])
//! - **Codec**: text encoding and decoding of payloads ([`codec`])
//! - **Error vocabulary**: [`JsonRpcError`] and the [`TransportErrorKind`]
//!   classification ([`error`])
//! - **Session lifecycle**: the [`SessionState`] enum ([`state`])
//!
//! This crate is runtime-agnostic and does not depend on any async runtime.
//!
//! # Example
//!
//! ```rust
//! use mcplink_core::{codec, JsonRpcPayload, Request};
//!
//! let payload = JsonRpcPayload::from(Request::new("ping", 1i64));
//! let text = codec::encode(&payload).unwrap();
//! assert_eq!(codec::decode(&text).unwrap(), payload);
//! ```

#![deny(missing_docs)]
#![warn(clippy::unwrap_used)]
#![allow(clippy::module_name_repetitions)]

pub mod codec;
pub mod error;
pub mod protocol;
pub mod state;

// Re-export commonly used types at the crate root
pub use codec::CodecError;
pub use error::{JsonRpcError, TransportErrorKind};
pub use protocol::{JsonRpcPayload, Message, Notification, Request, RequestId, Response};
pub use state::SessionState;
