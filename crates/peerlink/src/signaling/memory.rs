//! In-process signaling transport.
//!
//! [`MemoryTransport::pair`] returns the transport together with a
//! [`MemoryPeer`] that plays the signaling server: it reads whatever the
//! session sends and injects inbound traffic, errors and hang-ups.

use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;
use protocol::SignalingMessage;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{SignalingTransport, TransportEvent, TransportHandle, TRANSPORT_QUEUE_CAPACITY};
use crate::error::{ConnectionError, Result};

type SharedToken = Arc<Mutex<Option<CancellationToken>>>;

struct PendingHandle {
    outbound: mpsc::Sender<String>,
    events: mpsc::Receiver<TransportEvent>,
}

/// A transport whose far end is a [`MemoryPeer`] in the same process.
pub struct MemoryTransport {
    pending: Mutex<Option<PendingHandle>>,
    events_tx: mpsc::Sender<TransportEvent>,
    shutdown: SharedToken,
    behavior: ConnectBehavior,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectBehavior {
    Accept,
    Refuse,
    Hang,
}

/// The signaling-server side of a [`MemoryTransport`].
pub struct MemoryPeer {
    outbound: mpsc::Receiver<String>,
    events: mpsc::Sender<TransportEvent>,
    shutdown: SharedToken,
}

impl MemoryTransport {
    /// Creates a connected transport/peer pair.
    pub fn pair() -> (Self, MemoryPeer) {
        let (outbound_tx, outbound_rx) = mpsc::channel(TRANSPORT_QUEUE_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel(TRANSPORT_QUEUE_CAPACITY);
        let shutdown: SharedToken = Arc::new(Mutex::new(None));

        let transport = Self {
            pending: Mutex::new(Some(PendingHandle {
                outbound: outbound_tx,
                events: events_rx,
            })),
            events_tx: events_tx.clone(),
            shutdown: Arc::clone(&shutdown),
            behavior: ConnectBehavior::Accept,
        };
        let peer = MemoryPeer {
            outbound: outbound_rx,
            events: events_tx,
            shutdown,
        };
        (transport, peer)
    }

    /// Creates a transport/peer pair whose `connect` always fails.
    pub fn refusing() -> (Self, MemoryPeer) {
        let (mut transport, peer) = Self::pair();
        transport.behavior = ConnectBehavior::Refuse;
        (transport, peer)
    }

    /// Creates a transport/peer pair whose `connect` never completes, like a
    /// server that accepts the TCP connection and then goes silent.
    pub fn unresponsive() -> (Self, MemoryPeer) {
        let (mut transport, peer) = Self::pair();
        transport.behavior = ConnectBehavior::Hang;
        (transport, peer)
    }
}

impl SignalingTransport for MemoryTransport {
    fn connect<'a>(
        &'a self,
        url: &'a str,
        shutdown: CancellationToken,
    ) -> BoxFuture<'a, Result<TransportHandle>> {
        Box::pin(async move {
            match self.behavior {
                ConnectBehavior::Accept => {}
                ConnectBehavior::Refuse => {
                    return Err(ConnectionError::Transport(format!(
                        "connection to {} refused",
                        url
                    )));
                }
                ConnectBehavior::Hang => std::future::pending::<()>().await,
            }

            let pending = self
                .pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take()
                .ok_or_else(|| {
                    ConnectionError::Transport("memory transport already connected".to_string())
                })?;
            *self.shutdown.lock().unwrap_or_else(|e| e.into_inner()) = Some(shutdown);

            self.events_tx
                .send(TransportEvent::Open)
                .await
                .map_err(|_| ConnectionError::ChannelClosed("memory peer dropped".to_string()))?;

            Ok(TransportHandle {
                outbound: pending.outbound,
                events: pending.events,
            })
        })
    }
}

impl MemoryPeer {
    /// Receives the next raw message the session sent.
    pub async fn recv(&mut self) -> Option<String> {
        self.outbound.recv().await
    }

    /// Receives and decodes the next message the session sent.
    pub async fn recv_message(&mut self) -> Option<SignalingMessage> {
        let raw = self.recv().await?;
        SignalingMessage::decode(&raw).ok()
    }

    /// Returns a message the session already sent, without waiting.
    pub fn try_recv(&mut self) -> Option<String> {
        self.outbound.try_recv().ok()
    }

    /// Delivers raw inbound text to the session.
    pub async fn deliver(&self, raw: impl Into<String>) -> Result<()> {
        self.push(TransportEvent::Message(raw.into())).await
    }

    /// Delivers an encoded signaling message to the session.
    pub async fn deliver_message(&self, message: &SignalingMessage) -> Result<()> {
        self.deliver(message.encode()?).await
    }

    /// Reports a transport error to the session.
    pub async fn fail(&self, error: impl Into<String>) -> Result<()> {
        self.push(TransportEvent::Error(error.into())).await
    }

    /// Hangs up the connection from the server side.
    pub async fn hang_up(&self) -> Result<()> {
        self.push(TransportEvent::Closed).await
    }

    /// Whether the session closed its end.
    pub fn is_closed(&self) -> bool {
        self.token().is_some_and(|token| token.is_cancelled())
    }

    /// Resolves once the session closes its end.
    pub async fn closed(&self) {
        match self.token() {
            Some(token) => token.cancelled().await,
            None => std::future::pending().await,
        }
    }

    fn token(&self) -> Option<CancellationToken> {
        self.shutdown.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    async fn push(&self, event: TransportEvent) -> Result<()> {
        self.events
            .send(event)
            .await
            .map_err(|_| ConnectionError::ChannelClosed("session stopped listening".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_emits_open_and_wires_queues() {
        let (transport, mut peer) = MemoryTransport::pair();
        let token = CancellationToken::new();
        let mut handle = transport.connect("memory://a", token.clone()).await.unwrap();

        assert_eq!(handle.events.recv().await, Some(TransportEvent::Open));

        handle.outbound.send("hello".to_string()).await.unwrap();
        assert_eq!(peer.recv().await.as_deref(), Some("hello"));

        peer.deliver("world").await.unwrap();
        assert_eq!(
            handle.events.recv().await,
            Some(TransportEvent::Message("world".to_string()))
        );

        assert!(!peer.is_closed());
        token.cancel();
        assert!(peer.is_closed());
    }

    #[tokio::test]
    async fn test_connect_twice_fails() {
        let (transport, _peer) = MemoryTransport::pair();
        let _handle = transport
            .connect("memory://a", CancellationToken::new())
            .await
            .unwrap();
        let second = transport.connect("memory://a", CancellationToken::new()).await;
        assert!(matches!(second, Err(ConnectionError::Transport(_))));
    }

    #[tokio::test]
    async fn test_refusing_transport() {
        let (transport, peer) = MemoryTransport::refusing();
        let result = transport.connect("memory://a", CancellationToken::new()).await;
        assert!(matches!(result, Err(ConnectionError::Transport(_))));
        assert!(!peer.is_closed());
    }
}
