//! Error types for session negotiation.
//!
//! Every failure carries an [`ErrorCategory`] so callers of
//! [`Connection::wait_for_client`](crate::Connection::wait_for_client) can tell
//! a misuse of the API apart from a broken peer or a broken transport.

use std::fmt;

use protocol::ProtocolError;
use thiserror::Error;

use crate::negotiation::NegotiationState;

/// Coarse classification of a [`ConnectionError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// The API was used out of order. The session is unaffected.
    Precondition,
    /// The remote side sent unrecognized or out-of-sequence signaling traffic.
    Protocol,
    /// The signaling channel failed or closed.
    Transport,
    /// The peer engine rejected a call.
    Engine,
    /// A session activity stopped unexpectedly.
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCategory::Precondition => "precondition",
            ErrorCategory::Protocol => "protocol",
            ErrorCategory::Transport => "transport",
            ErrorCategory::Engine => "engine",
            ErrorCategory::Internal => "internal",
        };
        f.write_str(name)
    }
}

/// Connection error type covering all negotiation failure modes.
#[derive(Debug, Clone, Error)]
pub enum ConnectionError {
    /// Operation called before the session allows it.
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// Signaling envelope could not be decoded.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A well-formed message arrived in a state that does not accept it.
    #[error("protocol violation: unexpected `{message}` message while {state}")]
    UnexpectedMessage {
        /// The `type` of the rejected message.
        message: &'static str,
        /// Negotiation state at the time it arrived.
        state: NegotiationState,
    },

    /// Signaling transport I/O failure.
    #[error("signaling transport error: {0}")]
    Transport(String),

    /// The signaling channel is closed.
    #[error("signaling channel closed: {0}")]
    ChannelClosed(String),

    /// The peer engine failed.
    #[error("peer engine error: {0}")]
    Engine(String),

    /// A negotiation activity ended without reporting an outcome.
    #[error("negotiation aborted: {0}")]
    Aborted(String),
}

/// Result type alias for negotiation operations.
pub type Result<T> = std::result::Result<T, ConnectionError>;

impl ConnectionError {
    /// Returns the category this error is surfaced under.
    pub fn category(&self) -> ErrorCategory {
        match self {
            ConnectionError::Precondition(_) => ErrorCategory::Precondition,
            ConnectionError::Protocol(_) | ConnectionError::UnexpectedMessage { .. } => {
                ErrorCategory::Protocol
            }
            ConnectionError::Transport(_) | ConnectionError::ChannelClosed(_) => {
                ErrorCategory::Transport
            }
            ConnectionError::Engine(_) => ErrorCategory::Engine,
            ConnectionError::Aborted(_) => ErrorCategory::Internal,
        }
    }
}

// Conversions from underlying crate errors

impl From<ProtocolError> for ConnectionError {
    fn from(err: ProtocolError) -> Self {
        ConnectionError::Protocol(err.to_string())
    }
}

impl From<webrtc::Error> for ConnectionError {
    fn from(err: webrtc::Error) -> Self {
        ConnectionError::Engine(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ConnectionError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::ConnectionClosed | WsError::AlreadyClosed => {
                ConnectionError::ChannelClosed(err.to_string())
            }
            WsError::Io(io_err) => io_err.into(),
            other => ConnectionError::Transport(other.to_string()),
        }
    }
}

impl From<std::io::Error> for ConnectionError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => ConnectionError::ChannelClosed(err.to_string()),
            _ => ConnectionError::Transport(err.to_string()),
        }
    }
}
