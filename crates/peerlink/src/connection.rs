//! Connection façade.
//!
//! A [`Connection`] owns one negotiation session: the signaling channel, the
//! state machine and the peer engine. [`Connection::wait_for_client`] runs
//! two cooperating tasks and blocks until both have finished:
//!
//! - the inbound listener feeds transport events to the state machine in
//!   arrival order;
//! - the handshake driver sends the identity (and, for a client, the offer),
//!   then waits for the data channel with the readiness watchdog.
//!
//! The listener tells the driver when the transport is open; the driver tells
//! the listener when initiation is complete, and inbound processing is held
//! until then. Closing the signaling channel stops both.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use protocol::ConnectionRole;
use tokio::sync::{mpsc, oneshot};

use crate::config::Config;
use crate::engine::webrtc::{IceServer, WebRtcConfig, WebRtcPeerEngine, DEFAULT_GATHER_TIMEOUT};
use crate::engine::PeerEngine;
use crate::error::{ConnectionError, Result};
use crate::negotiation::{NegotiationState, NegotiationStateMachine};
use crate::process;
use crate::signaling::{SignalingChannel, SignalingTransport, TransportEvent, WebSocketTransport};
use crate::watchdog::{Readiness, ReadinessWatchdog, DEFAULT_POLL_INTERVAL, DEFAULT_TIMEOUT};

/// Default pause between readiness and closing the signaling channel.
pub const DEFAULT_CLOSE_GRACE: Duration = Duration::from_millis(500);

/// Local media settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaOptions {
    /// Attach a media source once the session is ready.
    pub enabled: bool,
    /// Identifier of the media source to attach.
    pub device_id: String,
}

impl Default for MediaOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            device_id: "default".to_string(),
        }
    }
}

/// Settings fixed at session creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    pub role: ConnectionRole,
    pub session_id: String,
    pub signaling_url: String,
    /// Handshake timeout.
    pub timeout: Duration,
    /// Readiness poll interval.
    pub poll_interval: Duration,
    /// Pause between readiness and closing the signaling channel.
    pub close_grace: Duration,
    pub media: MediaOptions,
    /// Log negotiation state transitions at info level.
    pub debug: bool,
}

impl SessionOptions {
    /// Creates options with defaults and a random session id.
    pub fn new(role: ConnectionRole, signaling_url: impl Into<String>) -> Self {
        Self {
            role,
            session_id: uuid::Uuid::new_v4().to_string(),
            signaling_url: signaling_url.into(),
            timeout: DEFAULT_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            close_grace: DEFAULT_CLOSE_GRACE,
            media: MediaOptions::default(),
            debug: false,
        }
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_close_grace(mut self, close_grace: Duration) -> Self {
        self.close_grace = close_grace;
        self
    }

    /// Enables media with the given source.
    pub fn with_media(mut self, device_id: impl Into<String>) -> Self {
        self.media = MediaOptions {
            enabled: true,
            device_id: device_id.into(),
        };
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }
}

/// One negotiation session between a server and a client.
pub struct Connection {
    options: SessionOptions,
    engine: Arc<dyn PeerEngine>,
    transport: Arc<dyn SignalingTransport>,
    channel: Arc<SignalingChannel>,
    machine: Arc<NegotiationStateMachine>,
    started: AtomicBool,
}

impl Connection {
    /// Creates a session. No I/O happens until
    /// [`wait_for_client`](Self::wait_for_client).
    ///
    /// The first session created in a process also runs [`process::init`].
    pub fn new(
        options: SessionOptions,
        engine: Arc<dyn PeerEngine>,
        transport: Arc<dyn SignalingTransport>,
    ) -> Self {
        process::init();

        let channel = Arc::new(SignalingChannel::new());
        let machine = Arc::new(
            NegotiationStateMachine::new(
                options.role,
                options.session_id.clone(),
                Arc::clone(&engine),
                Arc::clone(&channel),
            )
            .with_verbose(options.debug),
        );

        tracing::debug!(
            session_id = %options.session_id,
            role = %options.role,
            "session created"
        );

        Self {
            options,
            engine,
            transport,
            channel,
            machine,
            started: AtomicBool::new(false),
        }
    }

    /// Creates a session over WebSocket signaling and a WebRTC engine.
    ///
    /// Candidate gathering never waits longer than the handshake timeout.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let options = config.session_options();
        let ice_servers = config
            .network
            .stun_servers
            .iter()
            .map(IceServer::stun)
            .collect();
        let engine_config = WebRtcConfig::with_ice_servers(ice_servers)
            .with_gather_timeout(gather_timeout_for(options.timeout));
        let engine = WebRtcPeerEngine::new(engine_config).await?;

        Ok(Self::new(
            options,
            Arc::new(engine),
            Arc::new(WebSocketTransport::new()),
        ))
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn role(&self) -> ConnectionRole {
        self.options.role
    }

    pub fn session_id(&self) -> &str {
        &self.options.session_id
    }

    /// Runs the handshake with the configured timeout.
    ///
    /// Returns `Ok(true)` if the data channel did not open in time and
    /// `Ok(false)` once it did.
    pub async fn wait_for_client(&self) -> Result<bool> {
        self.wait_for_client_within(self.options.timeout).await
    }

    /// Runs the handshake with an explicit timeout. Can be called once.
    pub async fn wait_for_client_within(&self, timeout: Duration) -> Result<bool> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ConnectionError::Precondition(
                "handshake already ran for this session".to_string(),
            ));
        }

        tracing::info!(
            session_id = %self.options.session_id,
            role = %self.options.role,
            url = %self.options.signaling_url,
            timeout = ?timeout,
            "waiting for peer"
        );

        let events = match self
            .channel
            .open(self.transport.as_ref(), &self.options.signaling_url, timeout)
            .await
        {
            Ok(events) => events,
            Err(err) => {
                self.machine.fail(err.clone()).await;
                return Err(err);
            }
        };

        let (open_tx, open_rx) = oneshot::channel();
        let (initiated_tx, initiated_rx) = oneshot::channel();

        let listener = InboundListener {
            machine: Arc::clone(&self.machine),
            channel: Arc::clone(&self.channel),
            events,
            open_tx: Some(open_tx),
            initiated_rx: Some(initiated_rx),
        };
        let driver = HandshakeDriver {
            machine: Arc::clone(&self.machine),
            channel: Arc::clone(&self.channel),
            engine: Arc::clone(&self.engine),
            watchdog: ReadinessWatchdog::new(timeout, self.options.poll_interval),
            media: self.options.media.clone(),
            close_grace: self.options.close_grace,
            open_rx,
            initiated_tx,
        };

        let (listener_result, driver_result) =
            tokio::join!(tokio::spawn(listener.run()), tokio::spawn(driver.run()));

        if let Err(e) = listener_result {
            tracing::warn!(session_id = %self.options.session_id, "inbound listener stopped: {}", e);
        }
        let outcome = driver_result
            .map_err(|e| ConnectionError::Aborted(format!("handshake driver stopped: {}", e)))
            .and_then(|outcome| outcome);

        if let Some(failure) = self.machine.failure().await {
            return Err(failure);
        }

        match outcome {
            Ok(Readiness::Ready) => Ok(false),
            Ok(Readiness::TimedOut) => Ok(true),
            Ok(Readiness::Cancelled) => {
                if self.machine.state().await == NegotiationState::Closed {
                    return Err(ConnectionError::ChannelClosed(
                        "session closed while waiting for peer".to_string(),
                    ));
                }
                let err = ConnectionError::Transport(
                    "signaling channel closed before the data channel opened".to_string(),
                );
                self.machine.fail(err.clone()).await;
                Err(err)
            }
            Err(err) => {
                self.machine.fail(err.clone()).await;
                Err(err)
            }
        }
    }

    /// Sends one application message over the data channel.
    pub async fn send(&self, message: &str) -> Result<()> {
        self.ensure_ready("send")?;
        self.engine.send_text(message).await
    }

    /// Waits for application messages.
    ///
    /// Returns every message buffered since the previous call, or an empty
    /// vector once the data channel has closed.
    pub async fn receive(&self) -> Result<Vec<String>> {
        self.ensure_ready("receive")?;
        self.engine.receive_text().await
    }

    pub fn is_data_channel_open(&self) -> bool {
        self.engine.is_data_channel_open()
    }

    /// Returns the local session description.
    pub async fn local_description(&self) -> Result<String> {
        self.engine
            .current_local_description()
            .await
            .map(|desc| desc.sdp)
            .ok_or_else(|| {
                ConnectionError::Precondition("no local description has been created".to_string())
            })
    }

    /// Whether the data channel opened during the handshake. Never reverts.
    pub fn is_ready(&self) -> bool {
        self.machine.is_ready()
    }

    pub async fn state(&self) -> NegotiationState {
        self.machine.state().await
    }

    /// Tears the session down: closes signaling and the peer connection.
    pub async fn close(&self) -> Result<()> {
        self.machine.close().await;
        self.engine.close().await
    }

    fn ensure_ready(&self, operation: &str) -> Result<()> {
        if self.machine.is_ready() {
            Ok(())
        } else {
            Err(ConnectionError::Precondition(format!(
                "{} called before the session is ready",
                operation
            )))
        }
    }
}

fn gather_timeout_for(handshake_timeout: Duration) -> Duration {
    DEFAULT_GATHER_TIMEOUT.min(handshake_timeout)
}

/// Feeds transport events to the state machine.
struct InboundListener {
    machine: Arc<NegotiationStateMachine>,
    channel: Arc<SignalingChannel>,
    events: mpsc::Receiver<TransportEvent>,
    open_tx: Option<oneshot::Sender<()>>,
    initiated_rx: Option<oneshot::Receiver<bool>>,
}

impl InboundListener {
    async fn run(mut self) {
        loop {
            let event = tokio::select! {
                biased;
                _ = self.channel.closed() => break,
                event = self.events.recv() => event,
            };

            match event {
                Some(TransportEvent::Open) => {
                    if let Some(open_tx) = self.open_tx.take() {
                        let _ = open_tx.send(());
                    }
                    if !self.wait_for_initiation().await {
                        break;
                    }
                }
                Some(TransportEvent::Message(raw)) => {
                    // Closing abandons a handler stuck in a slow engine call.
                    let handled = tokio::select! {
                        biased;
                        _ = self.channel.closed() => break,
                        result = self.machine.on_raw_message(&raw) => result,
                    };
                    if handled.is_err() {
                        break;
                    }
                }
                Some(TransportEvent::Error(err)) => {
                    tracing::warn!(
                        session_id = %self.machine.session_id(),
                        error = %err,
                        "signaling transport error"
                    );
                }
                Some(TransportEvent::Closed) | None => {
                    tracing::debug!(session_id = %self.machine.session_id(), "signaling transport closed");
                    self.channel.close();
                    break;
                }
            }
        }
        tracing::debug!(session_id = %self.machine.session_id(), "inbound listener finished");
    }

    /// Holds inbound processing until the driver has sent its opening
    /// messages. Returns `false` if initiation did not complete.
    async fn wait_for_initiation(&mut self) -> bool {
        let Some(initiated_rx) = self.initiated_rx.take() else {
            return true;
        };
        tokio::select! {
            biased;
            _ = self.channel.closed() => false,
            initiated = initiated_rx => initiated.unwrap_or(false),
        }
    }
}

/// Sends the opening messages and waits for the data channel.
struct HandshakeDriver {
    machine: Arc<NegotiationStateMachine>,
    channel: Arc<SignalingChannel>,
    engine: Arc<dyn PeerEngine>,
    watchdog: ReadinessWatchdog,
    media: MediaOptions,
    close_grace: Duration,
    open_rx: oneshot::Receiver<()>,
    initiated_tx: oneshot::Sender<bool>,
}

impl HandshakeDriver {
    async fn run(self) -> Result<Readiness> {
        let HandshakeDriver {
            machine,
            channel,
            engine,
            watchdog,
            media,
            close_grace,
            open_rx,
            initiated_tx,
        } = self;

        let opened = tokio::select! {
            biased;
            _ = channel.closed() => false,
            opened = open_rx => opened.is_ok(),
        };
        if !opened {
            return Ok(Readiness::Cancelled);
        }

        let initiation = Self::initiate(&machine).await;
        let _ = initiated_tx.send(initiation.is_ok());
        if let Err(err) = initiation {
            machine.fail(err.clone()).await;
            return Err(err);
        }

        let cancel = channel.shutdown_token();
        let readiness = watchdog
            .wait(|| engine.is_data_channel_open(), &cancel)
            .await;

        match readiness {
            Readiness::Ready => {
                if !machine.mark_ready().await {
                    return Ok(Readiness::Cancelled);
                }

                if media.enabled {
                    if let Err(err) = machine.renegotiate_media(&media.device_id).await {
                        machine.fail(err.clone()).await;
                        return Err(err);
                    }
                }

                tokio::select! {
                    _ = channel.closed() => {}
                    _ = tokio::time::sleep(close_grace) => {}
                }
                channel.close();
                Ok(Readiness::Ready)
            }
            Readiness::TimedOut => {
                machine.time_out().await;
                Ok(Readiness::TimedOut)
            }
            Readiness::Cancelled => Ok(Readiness::Cancelled),
        }
    }

    async fn initiate(machine: &NegotiationStateMachine) -> Result<()> {
        machine.on_identity().await?;
        if machine.role().is_offerer() {
            machine.initiate_offer().await?;
        }
        Ok(())
    }
}
