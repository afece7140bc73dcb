//! Peer engine abstraction.
//!
//! The peer engine owns the actual peer connection: it produces and consumes
//! session descriptions, gathers and applies connectivity candidates, and
//! moves application messages once the data channel is open. Negotiation code
//! only talks to it through [`PeerEngine`], so the WebRTC stack can be swapped
//! for a scripted double in tests.

pub mod webrtc;

use futures_util::future::BoxFuture;
use protocol::{IceCandidate, SessionDescriptor};

use crate::error::Result;

/// A peer connection engine.
///
/// Every fallible call is fatal to the session when it fails: the negotiation
/// layer never retries an engine call, since the engine's internal state after
/// a partial failure is undefined.
pub trait PeerEngine: Send + Sync {
    /// Creates a fresh local offer, installs it as the local description and
    /// returns it.
    fn local_description(&self) -> BoxFuture<'_, Result<SessionDescriptor>>;

    /// Returns the local description currently installed, if any.
    fn current_local_description(&self) -> BoxFuture<'_, Option<SessionDescriptor>>;

    /// Applies a remote offer and returns the generated local answer.
    fn apply_remote_offer<'a>(&'a self, sdp: &'a str) -> BoxFuture<'a, Result<SessionDescriptor>>;

    /// Applies the remote answer to a previously sent offer.
    fn apply_remote_answer<'a>(&'a self, sdp: &'a str) -> BoxFuture<'a, Result<()>>;

    /// Applies one remote connectivity candidate.
    fn apply_remote_candidate(&self, candidate: IceCandidate) -> BoxFuture<'_, Result<()>>;

    /// Returns every locally gathered candidate, in gathering order.
    fn local_candidates(&self) -> BoxFuture<'_, Result<Vec<IceCandidate>>>;

    /// Whether the data channel is currently open.
    fn is_data_channel_open(&self) -> bool;

    /// Attaches a local media source to the peer connection.
    fn attach_media_source<'a>(&'a self, device_id: &'a str) -> BoxFuture<'a, Result<()>>;

    /// Sends one application message over the data channel.
    fn send_text<'a>(&'a self, message: &'a str) -> BoxFuture<'a, Result<()>>;

    /// Waits for application messages.
    ///
    /// Resolves with every message buffered since the previous call once at
    /// least one is available. Resolves with an empty vector once the data
    /// channel has closed and nothing is left to drain.
    fn receive_text(&self) -> BoxFuture<'_, Result<Vec<String>>>;

    /// Tears down the peer connection.
    fn close(&self) -> BoxFuture<'_, Result<()>>;
}
