//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering every way a signaling envelope can be rejected.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The raw text is not a JSON document.
    #[error("malformed signaling message: {0}")]
    Malformed(String),

    /// The envelope is valid JSON but not an object carrying a string `type`.
    #[error("signaling message has no `type` field")]
    MissingType,

    /// The envelope names a message type outside the signaling vocabulary.
    #[error("unrecognized signaling message type: {0}")]
    UnknownType(String),

    /// The envelope has a known type but its payload does not match it.
    #[error("invalid `{kind}` payload: {reason}")]
    InvalidPayload {
        /// The message type that failed to decode.
        kind: String,
        /// Decoder diagnostic.
        reason: String,
    },

    /// Failed to serialize an outbound message.
    #[error("serialization failed: {0}")]
    Serialization(String),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_eof() || err.is_syntax() {
            ProtocolError::Malformed(err.to_string())
        } else {
            ProtocolError::Serialization(err.to_string())
        }
    }
}
