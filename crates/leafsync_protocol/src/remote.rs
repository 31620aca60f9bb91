//! Per-operation errors reported by the remote store.

use std::fmt;

/// Classification of a remote failure.
///
/// The numeric codes are the ones the store puts in the JSON-RPC `error.code`
/// field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteErrorKind {
    /// The session is not allowed to access the address.
    PermissionDenied,
    /// Parameters were missing or had the wrong type.
    InvalidParams,
    /// The address does not exist in the store.
    AddressNotFound,
    /// The address names a structure; only atomic addresses are accepted.
    UnsupportedAddress,
    /// Any other code.
    Other(i64),
}

impl RemoteErrorKind {
    /// Converts to the numeric wire code.
    pub fn to_code(&self) -> i64 {
        match self {
            RemoteErrorKind::PermissionDenied => 2,
            RemoteErrorKind::InvalidParams => -32602,
            RemoteErrorKind::AddressNotFound => 2104,
            RemoteErrorKind::UnsupportedAddress => 2105,
            RemoteErrorKind::Other(code) => *code,
        }
    }

    /// Converts from a numeric wire code.
    pub fn from_code(code: i64) -> Self {
        match code {
            2 => RemoteErrorKind::PermissionDenied,
            -32602 => RemoteErrorKind::InvalidParams,
            2104 => RemoteErrorKind::AddressNotFound,
            2105 => RemoteErrorKind::UnsupportedAddress,
            other => RemoteErrorKind::Other(other),
        }
    }
}

impl fmt::Display for RemoteErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteErrorKind::PermissionDenied => f.write_str("permission denied"),
            RemoteErrorKind::InvalidParams => f.write_str("invalid params"),
            RemoteErrorKind::AddressNotFound => f.write_str("address not found"),
            RemoteErrorKind::UnsupportedAddress => f.write_str("unsupported address"),
            RemoteErrorKind::Other(code) => write!(f, "error {code}"),
        }
    }
}

/// A failure attached to a single atomic operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    /// Kind of failure.
    pub kind: RemoteErrorKind,
    /// Message from the store.
    pub message: String,
}

impl RemoteError {
    /// Creates a remote error.
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Creates a permission denied error.
    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::PermissionDenied, message)
    }

    /// Creates an address not found error.
    pub fn address_not_found(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::AddressNotFound, message)
    }

    /// Creates an unsupported (non-atomic) address error.
    pub fn unsupported_address(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::UnsupportedAddress, message)
    }

    /// Creates an invalid params error.
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::InvalidParams, message)
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for RemoteError {}
