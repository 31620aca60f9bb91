//! Error types for the protocol crate.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors that can occur while encoding or decoding batches.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The payload is not valid JSON or does not have the JSON-RPC shape.
    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),

    /// A request named a method this protocol does not know.
    #[error("unknown method: {0}")]
    UnknownMethod(String),

    /// A message is missing a field its command requires.
    #[error("missing field `{field}` in message {id}")]
    MissingField {
        /// Correlation id of the offending message.
        id: String,
        /// Name of the missing field.
        field: &'static str,
    },
}

impl ProtocolError {
    /// Creates a missing field error.
    pub fn missing_field(id: impl Into<String>, field: &'static str) -> Self {
        Self::MissingField {
            id: id.into(),
            field,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = ProtocolError::missing_field("a1b2", "var");
        assert_eq!(err.to_string(), "missing field `var` in message a1b2");

        let err = ProtocolError::UnknownMethod("Files.Browse".into());
        assert!(err.to_string().contains("Files.Browse"));
    }
}
