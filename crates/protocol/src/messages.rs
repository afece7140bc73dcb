//! Signaling message definitions for PeerLink.
//!
//! Signaling traffic is a sequence of flat, self-describing JSON envelopes of
//! the form `{"type": ..., ...payload}`. Exactly four types exist:
//!
//! - `kind`: announces the sender's role and session identifier (always first)
//! - `offer` / `answer`: carry an opaque session description
//! - `candidate`: carries one opaque connectivity candidate
//!
//! Session descriptions and candidates are produced and consumed by the peer
//! engine; this crate only moves them across the wire unmodified.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ProtocolError, Result};

/// Every `type` tag the signaling vocabulary recognizes.
pub const MESSAGE_TYPES: &[&str] = &["kind", "offer", "answer", "candidate"];

/// Role of a session endpoint. Fixed at session creation.
///
/// The client initiates the description offer; the server answers it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionRole {
    /// Waits for the remote offer and answers it.
    Server,
    /// Sends the initiating offer.
    Client,
}

impl ConnectionRole {
    /// Returns the wire name of the role.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionRole::Server => "server",
            ConnectionRole::Client => "client",
        }
    }

    /// Whether this role creates the initial offer.
    pub fn is_offerer(&self) -> bool {
        matches!(self, ConnectionRole::Client)
    }
}

impl fmt::Display for ConnectionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Type tag of a session description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

impl fmt::Display for SdpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SdpType::Offer => f.write_str("offer"),
            SdpType::Answer => f.write_str("answer"),
        }
    }
}

/// An opaque session description plus its offer/answer tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescriptor {
    /// Whether this description is an offer or an answer.
    pub sdp_type: SdpType,
    /// The description text, passed through untouched.
    pub sdp: String,
}

impl SessionDescriptor {
    /// Creates an offer description.
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    /// Creates an answer description.
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// The `sdp` object carried by `offer` and `answer` envelopes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SdpPayload {
    pub sdp: String,
}

/// An opaque connectivity candidate record.
///
/// The well-known fields are named so engines can consume them; anything else
/// the remote engine attached is kept in `extra` and written back out as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl IceCandidate {
    /// Creates a candidate record from its string form and media section tags.
    pub fn new(
        candidate: impl Into<String>,
        sdp_mid: Option<String>,
        sdp_mline_index: Option<u16>,
    ) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid,
            sdp_mline_index,
            username_fragment: None,
            extra: Map::new(),
        }
    }
}

/// A signaling envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalingMessage {
    /// Identifies the sender's role and session. Sent exactly once, first.
    Kind {
        kind: ConnectionRole,
        connection_id: String,
    },
    /// The initiator's local description.
    Offer { sdp: SdpPayload },
    /// The responder's local description.
    Answer { sdp: SdpPayload },
    /// One locally gathered connectivity candidate.
    Candidate { candidate: IceCandidate },
}

impl SignalingMessage {
    /// Builds the identity message for a session.
    pub fn kind(role: ConnectionRole, connection_id: impl Into<String>) -> Self {
        SignalingMessage::Kind {
            kind: role,
            connection_id: connection_id.into(),
        }
    }

    /// Builds an `offer` or `answer` envelope matching the descriptor's tag.
    pub fn description(desc: &SessionDescriptor) -> Self {
        let sdp = SdpPayload {
            sdp: desc.sdp.clone(),
        };
        match desc.sdp_type {
            SdpType::Offer => SignalingMessage::Offer { sdp },
            SdpType::Answer => SignalingMessage::Answer { sdp },
        }
    }

    /// Builds a `candidate` envelope.
    pub fn candidate(candidate: IceCandidate) -> Self {
        SignalingMessage::Candidate { candidate }
    }

    /// Returns the wire `type` tag of this message.
    pub fn message_type(&self) -> &'static str {
        match self {
            SignalingMessage::Kind { .. } => "kind",
            SignalingMessage::Offer { .. } => "offer",
            SignalingMessage::Answer { .. } => "answer",
            SignalingMessage::Candidate { .. } => "candidate",
        }
    }

    /// Decodes a raw signaling envelope.
    ///
    /// Decoding is strict: non-JSON text, a missing `type`, a `type` outside
    /// [`MESSAGE_TYPES`] and a payload that does not fit its type are all
    /// rejected, each with its own error.
    pub fn decode(raw: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(raw)?;

        let kind = match value.get("type") {
            Some(Value::String(kind)) => kind.clone(),
            _ => return Err(ProtocolError::MissingType),
        };

        if !MESSAGE_TYPES.contains(&kind.as_str()) {
            return Err(ProtocolError::UnknownType(kind));
        }

        serde_json::from_value(value).map_err(|e| ProtocolError::InvalidPayload {
            kind,
            reason: e.to_string(),
        })
    }

    /// Encodes this message as a JSON envelope.
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }
}
