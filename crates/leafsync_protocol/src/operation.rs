//! Atomic leaf operations.

use crate::remote::RemoteError;
use serde_json::Value;

/// What an atomic operation does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Read one scalar.
    Read,
    /// Write one scalar.
    Write,
    /// Liveness ping, keeps the session alive.
    Ping,
}

impl Command {
    /// JSON-RPC method name for this command.
    pub fn method(&self) -> &'static str {
        match self {
            Command::Read => "Leaf.Read",
            Command::Write => "Leaf.Write",
            Command::Ping => "Api.Ping",
        }
    }

    /// Parses a JSON-RPC method name.
    pub fn from_method(method: &str) -> Option<Self> {
        match method {
            "Leaf.Read" => Some(Command::Read),
            "Leaf.Write" => Some(Command::Write),
            "Api.Ping" => Some(Command::Ping),
            _ => None,
        }
    }

    /// Short label used in human-readable correlation ids.
    pub fn label(&self) -> &'static str {
        match self {
            Command::Read => "READ",
            Command::Write => "WRITE",
            Command::Ping => "PING",
        }
    }
}

/// A single atomic operation the remote store understands.
///
/// The `id` is opaque to the store and is echoed back unchanged on the
/// matching [`LeafResponse`].
#[derive(Debug, Clone, PartialEq)]
pub struct LeafRequest {
    /// Correlation id.
    pub id: String,
    /// Operation kind.
    pub command: Command,
    /// Transport-facing address (absent for pings).
    pub address: Option<String>,
    /// Value to write (writes only).
    pub value: Option<Value>,
}

impl LeafRequest {
    /// Creates a read of one scalar.
    pub fn read(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            command: Command::Read,
            address: Some(address.into()),
            value: None,
        }
    }

    /// Creates a write of one scalar.
    pub fn write(id: impl Into<String>, address: impl Into<String>, value: Value) -> Self {
        Self {
            id: id.into(),
            command: Command::Write,
            address: Some(address.into()),
            value: Some(value),
        }
    }

    /// Creates a liveness ping.
    pub fn ping(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            command: Command::Ping,
            address: None,
            value: None,
        }
    }
}

/// Outcome of one atomic operation.
#[derive(Debug, Clone, PartialEq)]
pub enum LeafOutcome {
    /// The operation succeeded. Reads carry the scalar, writes carry `true`.
    Value(Value),
    /// The store rejected the operation.
    Error(RemoteError),
}

impl LeafOutcome {
    /// Returns true if the operation succeeded.
    pub fn is_ok(&self) -> bool {
        matches!(self, LeafOutcome::Value(_))
    }
}

/// The store's answer to one [`LeafRequest`].
#[derive(Debug, Clone, PartialEq)]
pub struct LeafResponse {
    /// Correlation id copied from the request.
    pub id: String,
    /// Result or error.
    pub outcome: LeafOutcome,
}

impl LeafResponse {
    /// Creates a successful response.
    pub fn value(id: impl Into<String>, value: Value) -> Self {
        Self {
            id: id.into(),
            outcome: LeafOutcome::Value(value),
        }
    }

    /// Creates an error response.
    pub fn error(id: impl Into<String>, error: RemoteError) -> Self {
        Self {
            id: id.into(),
            outcome: LeafOutcome::Error(error),
        }
    }
}
