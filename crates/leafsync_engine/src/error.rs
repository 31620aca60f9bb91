//! Error types for the engine.

use leafsync_protocol::{ProtocolError, RemoteError};
use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that can occur in the engine.
///
/// Configuration errors are raised synchronously by the call that caused
/// them. Remote and transport errors arrive later, through a transaction's
/// handle or the shared error stream.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    /// A logical key could not be parsed.
    #[error("invalid key `{key}`: {reason}")]
    InvalidKey {
        /// The offending key text.
        key: String,
        /// What is wrong with it.
        reason: String,
    },

    /// The key does not exist in the schema.
    #[error("key `{0}` not found in schema")]
    KeyNotFound(String),

    /// The value to write does not fit the schema at the key.
    #[error("value does not match the schema shape at `{key}`: {reason}")]
    ShapeMismatch {
        /// Key where the mismatch was found.
        key: String,
        /// Description of the mismatch.
        reason: String,
    },

    /// A structured value was written while no schema is loaded.
    #[error("cannot write composite value to `{0}` without a schema")]
    CompositeWithoutSchema(String),

    /// Two requested keys end in the same segment, so the merged result
    /// would be ambiguous.
    #[error("requested keys collide on result field `{0}`")]
    KeyCollision(String),

    /// A cache mode that needs exactly one key was given several.
    #[error("cache mode {mode} requires exactly one key, got {count}")]
    MultiKeyMode {
        /// Name of the cache mode.
        mode: &'static str,
        /// Number of keys requested.
        count: usize,
    },

    /// A request named no keys at all.
    #[error("no keys requested")]
    EmptyRequest,

    /// A cache write would change the structural type of an existing node.
    #[error("cache structure conflict at `{key}`: {reason}")]
    CacheConflict {
        /// Key of the write.
        key: String,
        /// What conflicted.
        reason: String,
    },

    /// Invalid engine configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The store rejected an atomic operation.
    #[error("remote error at `{key}`: {error}")]
    Remote {
        /// Leaf key of the failed operation.
        key: String,
        /// Error reported by the store.
        error: RemoteError,
    },

    /// A write this read was waiting for did not succeed.
    #[error("write to `{0}` failed")]
    WriteFailed(String),

    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the batch can be re-sent.
        retryable: bool,
    },

    /// Malformed data on the wire.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Another tick is still in flight.
    #[error("a tick is already in flight")]
    Busy,

    /// Not connected.
    #[error("not connected to store")]
    NotConnected,

    /// The engine went away before the operation resolved.
    #[error("operation cancelled")]
    Cancelled,
}

impl EngineError {
    /// Creates an invalid key error.
    pub fn invalid_key(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidKey {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Creates a shape mismatch error.
    pub fn shape_mismatch(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ShapeMismatch {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Creates a cache conflict error.
    pub fn cache_conflict(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::CacheConflict {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if re-sending the same batch may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Transport { retryable, .. } => *retryable,
            EngineError::NotConnected | EngineError::Busy => true,
            _ => false,
        }
    }

    /// Returns true if this error means the caller and the schema disagree.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            EngineError::InvalidKey { .. }
                | EngineError::KeyNotFound(_)
                | EngineError::ShapeMismatch { .. }
                | EngineError::CompositeWithoutSchema(_)
                | EngineError::KeyCollision(_)
                | EngineError::MultiKeyMode { .. }
                | EngineError::EmptyRequest
                | EngineError::InvalidConfig(_)
        )
    }

    /// Returns true if the batch as a whole failed to round-trip.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            EngineError::Transport { .. } | EngineError::NotConnected | EngineError::Protocol(_)
        )
    }
}

impl From<ProtocolError> for EngineError {
    fn from(err: ProtocolError) -> Self {
        EngineError::Protocol(err.to_string())
    }
}
