//! # leafsync protocol
//!
//! Wire types for a remote key-value store that only understands atomic
//! (scalar) addresses.
//!
//! This crate provides:
//! - `LeafRequest` / `LeafResponse` for single atomic operations
//! - `RemoteError` for per-operation failures reported by the store
//! - `RequestBatch` / `ResponseBatch` with JSON-RPC 2.0 encoding
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod messages;
mod operation;
mod remote;

pub use error::{ProtocolError, ProtocolResult};
pub use messages::{RequestBatch, ResponseBatch, JSON_RPC_PATH, JSON_RPC_VERSION};
pub use operation::{Command, LeafOutcome, LeafRequest, LeafResponse};
pub use remote::{RemoteError, RemoteErrorKind};

/// Re-export of the dynamic value type carried by every leaf.
pub use serde_json::Value;
