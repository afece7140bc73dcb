//! # PeerLink
//!
//! Signaling-driven peer connection negotiation.
//!
//! A [`Connection`] plays one side (server or client) of a handshake brokered
//! by a signaling server: it announces itself, trades session descriptions
//! and connectivity candidates with the other side, and waits a bounded time
//! for the peer-to-peer data channel to open. Once ready, application text
//! messages flow directly between the peers.
//!
//! ```no_run
//! use peerlink::{Config, Connection};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load_default()?;
//! let connection = Connection::from_config(&config).await?;
//!
//! if connection.wait_for_client().await? {
//!     println!("peer did not show up");
//!     return Ok(());
//! }
//!
//! connection.send("hello").await?;
//! for message in connection.receive().await? {
//!     println!("{}", message);
//! }
//! connection.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`connection`]: The session façade and its two handshake tasks
//! - [`negotiation`]: The offer/answer/candidate state machine
//! - [`watchdog`]: Bounded wait for data channel readiness
//! - [`signaling`]: Signaling channel adapter and transports
//! - [`engine`]: Peer engine contract and the WebRTC implementation
//! - [`config`]: TOML configuration
//! - [`error`]: Error types

pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod negotiation;
pub mod process;
pub mod signaling;
pub mod watchdog;

pub use config::{Config, ConfigError};
pub use connection::{Connection, MediaOptions, SessionOptions};
pub use engine::webrtc::{IceServer, WebRtcConfig, WebRtcPeerEngine};
pub use engine::PeerEngine;
pub use error::{ConnectionError, ErrorCategory, Result};
pub use negotiation::{NegotiationState, NegotiationStateMachine};
pub use signaling::{
    MemoryPeer, MemoryTransport, SignalingChannel, SignalingTransport, TransportEvent,
    TransportHandle, WebSocketTransport,
};
pub use watchdog::{Readiness, ReadinessWatchdog};

pub use protocol::{ConnectionRole, IceCandidate, SessionDescriptor, SignalingMessage};
