//! WebRTC-backed peer engine.
//!
//! This module implements [`PeerEngine`] on top of the `webrtc` crate with:
//! - ICE server configuration (STUN/TURN)
//! - A single data channel, created by the offerer and adopted by the answerer
//! - Local candidate collection in gathering order
//! - Optional video track attachment for a named capture device

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use protocol::{IceCandidate, SessionDescriptor};
use serde_json::Map;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use super::PeerEngine;
use crate::error::{ConnectionError, Result};

/// Default STUN servers for ICE connectivity.
pub const DEFAULT_STUN_SERVERS: &[&str] = &["stun:stun.l.google.com:19302"];

/// Label of the data channel the offerer creates.
pub const DATA_CHANNEL_LABEL: &str = "data_channel";

/// How long `local_candidates` waits for ICE gathering to finish.
pub const DEFAULT_GATHER_TIMEOUT: Duration = Duration::from_secs(10);

/// ICE server configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServer {
    /// STUN/TURN server URLs.
    pub urls: Vec<String>,
    /// Username for TURN authentication (optional for STUN).
    pub username: Option<String>,
    /// Credential for TURN authentication (optional for STUN).
    pub credential: Option<String>,
}

impl IceServer {
    /// Creates a new STUN server configuration.
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    /// Creates a new TURN server configuration with authentication.
    pub fn turn(
        url: impl Into<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            urls: vec![url.into()],
            username: Some(username.into()),
            credential: Some(credential.into()),
        }
    }
}

impl From<IceServer> for RTCIceServer {
    fn from(server: IceServer) -> Self {
        RTCIceServer {
            urls: server.urls,
            username: server.username.unwrap_or_default(),
            credential: server.credential.unwrap_or_default(),
            ..Default::default()
        }
    }
}

/// Configuration for the WebRTC engine.
#[derive(Debug, Clone)]
pub struct WebRtcConfig {
    /// ICE servers for connectivity.
    pub ice_servers: Vec<IceServer>,
    /// Upper bound on waiting for ICE gathering to complete.
    pub gather_timeout: Duration,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: DEFAULT_STUN_SERVERS
                .iter()
                .map(|&url| IceServer::stun(url))
                .collect(),
            gather_timeout: DEFAULT_GATHER_TIMEOUT,
        }
    }
}

impl WebRtcConfig {
    /// Creates a configuration with custom ICE servers.
    pub fn with_ice_servers(ice_servers: Vec<IceServer>) -> Self {
        Self {
            ice_servers,
            ..Default::default()
        }
    }

    /// Sets the ICE gathering timeout.
    pub fn with_gather_timeout(mut self, timeout: Duration) -> Self {
        self.gather_timeout = timeout;
        self
    }

    fn to_rtc_configuration(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: self.ice_servers.iter().cloned().map(Into::into).collect(),
            ..Default::default()
        }
    }
}

/// Handles shared between the engine and its event callbacks.
#[derive(Clone)]
struct ChannelSignals {
    open: Arc<AtomicBool>,
    closed: Arc<watch::Sender<bool>>,
    inbox: mpsc::UnboundedSender<String>,
}

impl ChannelSignals {
    fn mark_closed(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.closed.send_replace(true);
    }
}

/// Peer engine backed by a WebRTC peer connection.
pub struct WebRtcPeerEngine {
    /// The WebRTC peer connection.
    peer_connection: Arc<RTCPeerConnection>,
    /// The data channel, once created or received.
    data_channel: Arc<RwLock<Option<Arc<RTCDataChannel>>>>,
    /// Open/closed flags and the inbound message sink.
    signals: ChannelSignals,
    /// Receiver for application messages from the data channel.
    inbox: Mutex<mpsc::UnboundedReceiver<String>>,
    /// Locally gathered candidates, in gathering order.
    local_candidates: Arc<Mutex<Vec<IceCandidate>>>,
    /// Flips to true when ICE gathering completes.
    gathering_done: watch::Receiver<bool>,
    /// Media tracks attached so far.
    media_tracks: Mutex<Vec<Arc<TrackLocalStaticSample>>>,
    gather_timeout: Duration,
}

impl WebRtcPeerEngine {
    /// Creates a new engine with a fresh peer connection.
    pub async fn new(config: WebRtcConfig) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| ConnectionError::Engine(format!("failed to register codecs: {}", e)))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(|e| {
            ConnectionError::Engine(format!("failed to register interceptors: {}", e))
        })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let peer_connection = api
            .new_peer_connection(config.to_rtc_configuration())
            .await
            .map_err(|e| {
                ConnectionError::Engine(format!("failed to create peer connection: {}", e))
            })?;
        let peer_connection = Arc::new(peer_connection);

        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (closed_tx, _) = watch::channel(false);
        let (gathered_tx, gathered_rx) = watch::channel(false);

        let engine = Self {
            peer_connection,
            data_channel: Arc::new(RwLock::new(None)),
            signals: ChannelSignals {
                open: Arc::new(AtomicBool::new(false)),
                closed: Arc::new(closed_tx),
                inbox: inbox_tx,
            },
            inbox: Mutex::new(inbox_rx),
            local_candidates: Arc::new(Mutex::new(Vec::new())),
            gathering_done: gathered_rx,
            media_tracks: Mutex::new(Vec::new()),
            gather_timeout: config.gather_timeout,
        };

        engine.register_peer_handlers(gathered_tx);
        Ok(engine)
    }

    fn register_peer_handlers(&self, gathered_tx: watch::Sender<bool>) {
        let candidates = Arc::clone(&self.local_candidates);
        let gathered_tx = Arc::new(gathered_tx);
        self.peer_connection
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let candidates = Arc::clone(&candidates);
                let gathered_tx = Arc::clone(&gathered_tx);
                Box::pin(async move {
                    let Some(candidate) = candidate else {
                        tracing::debug!("ICE gathering complete");
                        gathered_tx.send_replace(true);
                        return;
                    };
                    match candidate.to_json() {
                        Ok(init) => candidates.lock().await.push(from_candidate_init(init)),
                        Err(e) => tracing::warn!(error = %e, "failed to serialize local candidate"),
                    }
                })
            }));

        let signals = self.signals.clone();
        self.peer_connection
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let signals = signals.clone();
                Box::pin(async move {
                    tracing::debug!("peer connection state changed: {:?}", state);
                    if matches!(
                        state,
                        RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed
                    ) {
                        signals.mark_closed();
                    }
                })
            }));

        // The answerer adopts whatever channel the offerer created.
        let data_channel = Arc::clone(&self.data_channel);
        let signals = self.signals.clone();
        self.peer_connection
            .on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
                let data_channel = Arc::clone(&data_channel);
                let signals = signals.clone();
                Box::pin(async move {
                    tracing::debug!("remote data channel '{}' received", channel.label());
                    wire_data_channel(&channel, &signals);
                    *data_channel.write().await = Some(channel);
                })
            }));
    }

    async fn ensure_data_channel(&self) -> Result<()> {
        let mut slot = self.data_channel.write().await;
        if slot.is_some() {
            return Ok(());
        }

        let options = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let channel = self
            .peer_connection
            .create_data_channel(DATA_CHANNEL_LABEL, Some(options))
            .await
            .map_err(|e| ConnectionError::Engine(format!("failed to create data channel: {}", e)))?;
        wire_data_channel(&channel, &self.signals);
        *slot = Some(channel);
        Ok(())
    }
}

fn wire_data_channel(channel: &Arc<RTCDataChannel>, signals: &ChannelSignals) {
    let label = channel.label().to_string();

    let open = Arc::clone(&signals.open);
    let open_label = label.clone();
    channel.on_open(Box::new(move || {
        let open = Arc::clone(&open);
        let label = open_label.clone();
        Box::pin(async move {
            open.store(true, Ordering::SeqCst);
            tracing::debug!("data channel '{}' open", label);
        })
    }));

    let close_signals = signals.clone();
    channel.on_close(Box::new(move || {
        let signals = close_signals.clone();
        let label = label.clone();
        Box::pin(async move {
            signals.mark_closed();
            tracing::debug!("data channel '{}' closed", label);
        })
    }));

    let inbox = signals.inbox.clone();
    channel.on_message(Box::new(move |msg: DataChannelMessage| {
        let inbox = inbox.clone();
        Box::pin(async move {
            let text = String::from_utf8_lossy(&msg.data).into_owned();
            if let Err(e) = inbox.send(text) {
                tracing::error!("failed to forward message: {}", e);
            }
        })
    }));
}

fn from_candidate_init(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
        extra: Map::new(),
    }
}

fn to_descriptor(desc: RTCSessionDescription) -> SessionDescriptor {
    match desc.sdp_type {
        RTCSdpType::Answer | RTCSdpType::Pranswer => SessionDescriptor::answer(desc.sdp),
        _ => SessionDescriptor::offer(desc.sdp),
    }
}

impl PeerEngine for WebRtcPeerEngine {
    fn local_description(&self) -> BoxFuture<'_, Result<SessionDescriptor>> {
        Box::pin(async move {
            self.ensure_data_channel().await?;

            let offer = self
                .peer_connection
                .create_offer(None)
                .await
                .map_err(|e| ConnectionError::Engine(format!("failed to create offer: {}", e)))?;
            self.peer_connection
                .set_local_description(offer.clone())
                .await
                .map_err(|e| {
                    ConnectionError::Engine(format!("failed to set local description: {}", e))
                })?;

            Ok(to_descriptor(offer))
        })
    }

    fn current_local_description(&self) -> BoxFuture<'_, Option<SessionDescriptor>> {
        Box::pin(async move {
            self.peer_connection
                .local_description()
                .await
                .map(to_descriptor)
        })
    }

    fn apply_remote_offer<'a>(&'a self, sdp: &'a str) -> BoxFuture<'a, Result<SessionDescriptor>> {
        Box::pin(async move {
            let offer = RTCSessionDescription::offer(sdp.to_string())
                .map_err(|e| ConnectionError::Engine(format!("invalid remote offer: {}", e)))?;
            self.peer_connection
                .set_remote_description(offer)
                .await
                .map_err(|e| {
                    ConnectionError::Engine(format!("failed to set remote description: {}", e))
                })?;

            let answer = self
                .peer_connection
                .create_answer(None)
                .await
                .map_err(|e| ConnectionError::Engine(format!("failed to create answer: {}", e)))?;
            self.peer_connection
                .set_local_description(answer.clone())
                .await
                .map_err(|e| {
                    ConnectionError::Engine(format!("failed to set local description: {}", e))
                })?;

            Ok(to_descriptor(answer))
        })
    }

    fn apply_remote_answer<'a>(&'a self, sdp: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let answer = RTCSessionDescription::answer(sdp.to_string())
                .map_err(|e| ConnectionError::Engine(format!("invalid remote answer: {}", e)))?;
            self.peer_connection
                .set_remote_description(answer)
                .await
                .map_err(|e| {
                    ConnectionError::Engine(format!("failed to set remote description: {}", e))
                })
        })
    }

    fn apply_remote_candidate(&self, candidate: IceCandidate) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let init = RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            };
            self.peer_connection
                .add_ice_candidate(init)
                .await
                .map_err(|e| ConnectionError::Engine(format!("failed to add ICE candidate: {}", e)))
        })
    }

    fn local_candidates(&self) -> BoxFuture<'_, Result<Vec<IceCandidate>>> {
        Box::pin(async move {
            let mut gathered = self.gathering_done.clone();
            let waited = tokio::time::timeout(self.gather_timeout, async move {
                let _ = gathered.wait_for(|done| *done).await;
            })
            .await;
            if waited.is_err() {
                tracing::warn!("ICE gathering timeout, proceeding with current candidates");
            }

            Ok(self.local_candidates.lock().await.clone())
        })
    }

    fn is_data_channel_open(&self) -> bool {
        self.signals.open.load(Ordering::SeqCst)
    }

    fn attach_media_source<'a>(&'a self, device_id: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let track = Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_VP8.to_owned(),
                    ..Default::default()
                },
                "video".to_owned(),
                device_id.to_owned(),
            ));

            self.peer_connection
                .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(|e| ConnectionError::Engine(format!("failed to add media track: {}", e)))?;

            tracing::debug!(device_id, "media source attached");
            self.media_tracks.lock().await.push(track);
            Ok(())
        })
    }

    fn send_text<'a>(&'a self, message: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let channel = self
                .data_channel
                .read()
                .await
                .clone()
                .ok_or_else(|| ConnectionError::Engine("data channel not established".into()))?;

            channel
                .send_text(message.to_string())
                .await
                .map_err(|e| ConnectionError::Engine(format!("failed to send: {}", e)))?;
            Ok(())
        })
    }

    fn receive_text(&self) -> BoxFuture<'_, Result<Vec<String>>> {
        Box::pin(async move {
            let mut inbox = self.inbox.lock().await;
            let mut messages = Vec::new();

            while let Ok(message) = inbox.try_recv() {
                messages.push(message);
            }
            if !messages.is_empty() {
                return Ok(messages);
            }

            let mut closed = self.signals.closed.subscribe();
            tokio::select! {
                message = inbox.recv() => {
                    if let Some(message) = message {
                        messages.push(message);
                    }
                }
                _ = async move {
                    let _ = closed.wait_for(|closed| *closed).await;
                } => {}
            }

            while let Ok(message) = inbox.try_recv() {
                messages.push(message);
            }
            Ok(messages)
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.signals.mark_closed();
            self.peer_connection.close().await.map_err(|e| {
                ConnectionError::Engine(format!("failed to close peer connection: {}", e))
            })
        })
    }
}
