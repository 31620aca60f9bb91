//! Error types for the reference store.

use leafsync_protocol::{ProtocolError, RemoteError};
use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that fail a whole request.
///
/// Problems with a single operation are not errors at this level; they are
/// reported inside the response batch as a [`RemoteError`].
#[derive(Error, Debug)]
pub enum StoreError {
    /// The request body could not be decoded.
    #[error("invalid request: {0}")]
    InvalidRequest(#[from] ProtocolError),

    /// The batch exceeds the configured maximum.
    #[error("batch of {size} operations exceeds limit of {max}")]
    BatchTooLarge {
        /// Operations in the batch.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// Request sent to a path the store does not serve.
    #[error("unknown endpoint: {0}")]
    UnknownEndpoint(String),

    /// An out-of-band change was rejected.
    #[error("cannot set `{address}`: {error}")]
    Rejected {
        /// Target address.
        address: String,
        /// Why it was rejected.
        error: RemoteError,
    },

    /// Internal store error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl StoreError {
    /// Returns true if the caller sent something the store cannot serve.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            StoreError::InvalidRequest(_)
                | StoreError::BatchTooLarge { .. }
                | StoreError::UnknownEndpoint(_)
                | StoreError::Rejected { .. }
        )
    }

    /// Returns true if the store itself failed.
    pub fn is_server_error(&self) -> bool {
        matches!(self, StoreError::Internal(_))
    }
}
