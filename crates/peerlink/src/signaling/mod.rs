//! Signaling channel adapter.
//!
//! A signaling transport is a duplex text-message connection to the signaling
//! server. Transports report what happens on the wire as [`TransportEvent`]s
//! and accept outbound text through a bounded queue; [`SignalingChannel`]
//! sits on top and speaks [`SignalingMessage`]s.
//!
//! Closing the channel cancels the transport's shutdown token, which stops
//! both the transport's I/O tasks and every negotiation activity waiting on
//! [`SignalingChannel::closed`].

pub mod memory;
pub mod websocket;

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::future::BoxFuture;
use protocol::SignalingMessage;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use crate::error::{ConnectionError, Result};

pub use memory::{MemoryPeer, MemoryTransport};
pub use websocket::WebSocketTransport;

/// Capacity of transport message queues.
pub const TRANSPORT_QUEUE_CAPACITY: usize = 256;

/// Something that happened on the signaling transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The connection is established and accepts outbound messages.
    Open,
    /// One inbound text message.
    Message(String),
    /// A transport-level error. Not fatal unless followed by `Closed`.
    Error(String),
    /// The connection is gone.
    Closed,
}

/// The two halves of a connected transport.
pub struct TransportHandle {
    /// Queue of outbound text messages.
    pub outbound: mpsc::Sender<String>,
    /// Stream of transport events, in arrival order.
    pub events: mpsc::Receiver<TransportEvent>,
}

/// Trait for signaling transports.
///
/// Implementations must stop their I/O and release the connection once
/// `shutdown` is cancelled.
pub trait SignalingTransport: Send + Sync {
    /// Connects to the signaling server at `url`.
    fn connect<'a>(
        &'a self,
        url: &'a str,
        shutdown: CancellationToken,
    ) -> BoxFuture<'a, Result<TransportHandle>>;
}

/// Message-level view of a signaling transport for one session.
pub struct SignalingChannel {
    /// Sender for outgoing messages, present once connected.
    outbound: RwLock<Option<mpsc::Sender<String>>>,
    /// Cancelled when the channel closes, for any reason.
    shutdown: CancellationToken,
    /// Whether the identity message went out.
    identity_sent: AtomicBool,
}

impl Default for SignalingChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalingChannel {
    /// Creates an unconnected channel.
    pub fn new() -> Self {
        Self {
            outbound: RwLock::new(None),
            shutdown: CancellationToken::new(),
            identity_sent: AtomicBool::new(false),
        }
    }

    /// Connects the underlying transport and returns its event stream.
    ///
    /// Gives up with a transport error after `connect_timeout`, and with
    /// `ChannelClosed` if the channel is closed while connecting.
    pub async fn open(
        &self,
        transport: &dyn SignalingTransport,
        url: &str,
        connect_timeout: Duration,
    ) -> Result<mpsc::Receiver<TransportEvent>> {
        if self.is_closed() {
            return Err(ConnectionError::ChannelClosed(
                "channel closed before connecting".to_string(),
            ));
        }

        let connect = tokio::time::timeout(
            connect_timeout,
            transport.connect(url, self.shutdown.clone()),
        );
        let handle = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => {
                return Err(ConnectionError::ChannelClosed(
                    "channel closed while connecting".to_string(),
                ));
            }
            connected = connect => connected.map_err(|_| {
                ConnectionError::Transport(format!(
                    "no answer from {} within {:?}",
                    url, connect_timeout
                ))
            })??,
        };
        *self.outbound.write().await = Some(handle.outbound);
        Ok(handle.events)
    }

    /// Sends a signaling message.
    ///
    /// The identity (`kind`) message must go out first and only once; any
    /// other ordering is refused.
    pub async fn send(&self, message: &SignalingMessage) -> Result<()> {
        if self.is_closed() {
            return Err(ConnectionError::ChannelClosed(format!(
                "cannot send `{}`",
                message.message_type()
            )));
        }

        match message {
            SignalingMessage::Kind { .. } => {
                if self.identity_sent.swap(true, Ordering::SeqCst) {
                    return Err(ConnectionError::Precondition(
                        "identity message already sent".to_string(),
                    ));
                }
            }
            _ => {
                if !self.identity_sent.load(Ordering::SeqCst) {
                    return Err(ConnectionError::Precondition(format!(
                        "`{}` cannot precede the identity message",
                        message.message_type()
                    )));
                }
            }
        }

        let text = message.encode()?;
        let tx = self.outbound.read().await.clone().ok_or_else(|| {
            ConnectionError::ChannelClosed("not connected to signaling server".to_string())
        })?;

        tx.send(text).await.map_err(|e| {
            ConnectionError::ChannelClosed(format!("failed to send message: {}", e))
        })?;
        tracing::trace!(message_type = message.message_type(), "signaling message sent");
        Ok(())
    }

    /// Decodes an inbound envelope.
    pub fn decode(raw: &str) -> Result<SignalingMessage> {
        Ok(SignalingMessage::decode(raw)?)
    }

    /// Closes the channel. Idempotent.
    pub fn close(&self) {
        if !self.shutdown.is_cancelled() {
            tracing::debug!("closing signaling channel");
            self.shutdown.cancel();
        }
    }

    /// Whether the channel has been closed.
    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Resolves once the channel is closed.
    pub async fn closed(&self) {
        self.shutdown.cancelled().await
    }

    /// Returns a token that is cancelled when the channel closes.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Whether the identity message has been sent.
    pub fn identity_sent(&self) -> bool {
        self.identity_sent.load(Ordering::SeqCst)
    }
}
