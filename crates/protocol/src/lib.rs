//! # PeerLink Protocol Library
//!
//! Wire-level definitions for the PeerLink signaling exchange.
//!
//! Two endpoints establish a peer connection by trading session descriptions
//! and connectivity candidates through a signaling server. This crate defines
//! the envelopes they trade and how malformed traffic is classified; it does
//! no I/O of its own.
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{ConnectionRole, SessionDescriptor, SignalingMessage};
//!
//! let hello = SignalingMessage::kind(ConnectionRole::Client, "session-1");
//! assert_eq!(
//!     hello.encode().unwrap(),
//!     r#"{"type":"kind","kind":"client","connection_id":"session-1"}"#
//! );
//!
//! let offer = SignalingMessage::description(&SessionDescriptor::offer("v=0"));
//! let decoded = SignalingMessage::decode(&offer.encode().unwrap()).unwrap();
//! assert_eq!(decoded, offer);
//! ```
//!
//! ## Modules
//!
//! - [`messages`]: Signaling envelopes and the opaque records they carry
//! - [`error`]: Error types

pub mod error;
pub mod messages;

pub use error::{ProtocolError, Result};
pub use messages::{
    ConnectionRole, IceCandidate, SdpPayload, SdpType, SessionDescriptor, SignalingMessage,
    MESSAGE_TYPES,
};
