//! WebSocket signaling transport.
//!
//! Each connection runs two tasks: a writer draining the outbound queue into
//! the socket, and a reader turning socket frames into [`TransportEvent`]s.
//! Both stop when the shutdown token is cancelled; the writer flushes queued
//! messages and sends a close frame on its way out.

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{SignalingTransport, TransportEvent, TransportHandle, TRANSPORT_QUEUE_CAPACITY};
use crate::error::{ConnectionError, Result};

/// Signaling transport over a WebSocket connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketTransport;

impl WebSocketTransport {
    /// Creates a new WebSocket transport.
    pub fn new() -> Self {
        Self
    }

    /// Parses and checks a signaling server URL.
    pub fn parse_url(url: &str) -> Result<Url> {
        let parsed = Url::parse(url)
            .map_err(|e| ConnectionError::Transport(format!("invalid signaling URL: {}", e)))?;

        match parsed.scheme() {
            "ws" | "wss" => Ok(parsed),
            other => Err(ConnectionError::Transport(format!(
                "unsupported signaling URL scheme '{}', expected ws or wss",
                other
            ))),
        }
    }
}

impl SignalingTransport for WebSocketTransport {
    fn connect<'a>(
        &'a self,
        url: &'a str,
        shutdown: CancellationToken,
    ) -> BoxFuture<'a, Result<TransportHandle>> {
        Box::pin(async move {
            let ws_url = Self::parse_url(url)?;

            tracing::info!("Connecting to signaling server: {}", ws_url);

            let (ws_stream, _) = connect_async(ws_url.as_str()).await?;
            let (mut ws_sink, mut ws_stream) = ws_stream.split();

            let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<String>(TRANSPORT_QUEUE_CAPACITY);
            let (event_tx, event_rx) = mpsc::channel::<TransportEvent>(TRANSPORT_QUEUE_CAPACITY);

            // The handshake is complete once connect_async resolves.
            let _ = event_tx.send(TransportEvent::Open).await;

            let writer_shutdown = shutdown.clone();
            let writer_events = event_tx.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        biased;
                        _ = writer_shutdown.cancelled() => {
                            // Flush what was queued before the close.
                            while let Ok(text) = outgoing_rx.try_recv() {
                                if let Err(e) = ws_sink.send(WsMessage::Text(text)).await {
                                    tracing::debug!("failed to flush WebSocket message: {}", e);
                                    break;
                                }
                            }
                            if let Err(e) = ws_sink.send(WsMessage::Close(None)).await {
                                tracing::debug!("failed to send WebSocket close frame: {}", e);
                            }
                            break;
                        }
                        msg = outgoing_rx.recv() => {
                            let Some(text) = msg else { break };
                            if let Err(e) = ws_sink.send(WsMessage::Text(text)).await {
                                tracing::error!("failed to send WebSocket message: {}", e);
                                let _ = writer_events
                                    .send(TransportEvent::Error(e.to_string()))
                                    .await;
                                break;
                            }
                        }
                    }
                }
            });

            tokio::spawn(async move {
                loop {
                    let next = tokio::select! {
                        _ = shutdown.cancelled() => break,
                        next = ws_stream.next() => next,
                    };

                    match next {
                        Some(Ok(WsMessage::Text(text))) => {
                            if event_tx.send(TransportEvent::Message(text)).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(WsMessage::Close(frame))) => {
                            tracing::debug!(?frame, "signaling server closed connection");
                            let _ = event_tx.send(TransportEvent::Closed).await;
                            break;
                        }
                        Some(Ok(_)) => {
                            // Binary and control frames carry no signaling.
                        }
                        Some(Err(e)) => {
                            let _ = event_tx
                                .send(TransportEvent::Error(format!("WebSocket error: {}", e)))
                                .await;
                            let _ = event_tx.send(TransportEvent::Closed).await;
                            break;
                        }
                        None => {
                            let _ = event_tx.send(TransportEvent::Closed).await;
                            break;
                        }
                    }
                }
            });

            Ok(TransportHandle {
                outbound: outgoing_tx,
                events: event_rx,
            })
        })
    }
}
