//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use peerlink::{
    Connection, ConnectionError, ConnectionRole, IceCandidate, MemoryPeer, MemoryTransport,
    PeerEngine, Result, SessionDescriptor, SessionOptions,
};
use tokio::sync::mpsc;

/// A peer engine that answers from a script and records every call.
pub struct ScriptedEngine {
    offer: String,
    answer: String,
    candidates: Vec<IceCandidate>,
    fail_remote_offer: bool,
    candidate_delay: Duration,
    open: AtomicBool,
    calls: Mutex<Vec<String>>,
    local: Mutex<Option<SessionDescriptor>>,
    sent: Mutex<Vec<String>>,
    inbox_tx: mpsc::UnboundedSender<String>,
    inbox_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
}

impl Default for ScriptedEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedEngine {
    pub fn new() -> Self {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        Self {
            offer: "O1".to_string(),
            answer: "S2".to_string(),
            candidates: Vec::new(),
            fail_remote_offer: false,
            candidate_delay: Duration::ZERO,
            open: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
            local: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            inbox_tx,
            inbox_rx: tokio::sync::Mutex::new(inbox_rx),
        }
    }

    pub fn with_offer(mut self, sdp: &str) -> Self {
        self.offer = sdp.to_string();
        self
    }

    pub fn with_answer(mut self, sdp: &str) -> Self {
        self.answer = sdp.to_string();
        self
    }

    pub fn with_candidates(mut self, candidates: Vec<IceCandidate>) -> Self {
        self.candidates = candidates;
        self
    }

    /// Makes candidate gathering take `delay`.
    pub fn with_candidate_delay(mut self, delay: Duration) -> Self {
        self.candidate_delay = delay;
        self
    }

    pub fn failing_remote_offer(mut self) -> Self {
        self.fail_remote_offer = true;
        self
    }

    /// Reports the data channel as open from now on.
    pub fn open_data_channel(&self) {
        self.open.store(true, Ordering::SeqCst);
    }

    /// Queues an application message from the remote peer.
    pub fn push_incoming(&self, message: &str) {
        self.inbox_tx.send(message.to_string()).unwrap();
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

impl PeerEngine for ScriptedEngine {
    fn local_description(&self) -> BoxFuture<'_, Result<SessionDescriptor>> {
        self.record("local_description".to_string());
        let offer = SessionDescriptor::offer(self.offer.clone());
        *self.local.lock().unwrap() = Some(offer.clone());
        Box::pin(async move { Ok(offer) })
    }

    fn current_local_description(&self) -> BoxFuture<'_, Option<SessionDescriptor>> {
        let local = self.local.lock().unwrap().clone();
        Box::pin(async move { local })
    }

    fn apply_remote_offer<'a>(&'a self, sdp: &'a str) -> BoxFuture<'a, Result<SessionDescriptor>> {
        self.record(format!("offer:{}", sdp));
        Box::pin(async move {
            if self.fail_remote_offer {
                return Err(ConnectionError::Engine("remote offer rejected".to_string()));
            }
            let answer = SessionDescriptor::answer(self.answer.clone());
            *self.local.lock().unwrap() = Some(answer.clone());
            Ok(answer)
        })
    }

    fn apply_remote_answer<'a>(&'a self, sdp: &'a str) -> BoxFuture<'a, Result<()>> {
        self.record(format!("answer:{}", sdp));
        Box::pin(async { Ok(()) })
    }

    fn apply_remote_candidate(&self, candidate: IceCandidate) -> BoxFuture<'_, Result<()>> {
        self.record(format!("candidate:{}", candidate.candidate));
        Box::pin(async { Ok(()) })
    }

    fn local_candidates(&self) -> BoxFuture<'_, Result<Vec<IceCandidate>>> {
        let candidates = self.candidates.clone();
        let delay = self.candidate_delay;
        Box::pin(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            Ok(candidates)
        })
    }

    fn is_data_channel_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn attach_media_source<'a>(&'a self, device_id: &'a str) -> BoxFuture<'a, Result<()>> {
        self.record(format!("media:{}", device_id));
        Box::pin(async { Ok(()) })
    }

    fn send_text<'a>(&'a self, message: &'a str) -> BoxFuture<'a, Result<()>> {
        self.sent.lock().unwrap().push(message.to_string());
        Box::pin(async { Ok(()) })
    }

    fn receive_text(&self) -> BoxFuture<'_, Result<Vec<String>>> {
        Box::pin(async move {
            let mut inbox = self.inbox_rx.lock().await;
            let Some(first) = inbox.recv().await else {
                return Ok(Vec::new());
            };
            let mut messages = vec![first];
            while let Ok(next) = inbox.try_recv() {
                messages.push(next);
            }
            Ok(messages)
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        self.record("close".to_string());
        self.open.store(false, Ordering::SeqCst);
        Box::pin(async { Ok(()) })
    }
}

/// Options with short timings suitable for tests.
pub fn test_options(role: ConnectionRole) -> SessionOptions {
    SessionOptions::new(role, "memory://signal")
        .with_session_id("test-session")
        .with_timeout(Duration::from_secs(5))
        .with_poll_interval(Duration::from_millis(10))
        .with_close_grace(Duration::from_millis(20))
}

/// Creates a session over an in-memory transport.
pub fn session(
    options: SessionOptions,
    engine: Arc<ScriptedEngine>,
) -> (Arc<Connection>, MemoryPeer) {
    let (transport, peer) = MemoryTransport::pair();
    let connection = Connection::new(options, engine, Arc::new(transport));
    (Arc::new(connection), peer)
}

pub fn candidate(name: &str) -> IceCandidate {
    IceCandidate::new(format!("candidate:{}", name), Some("0".to_string()), Some(0))
}

/// Waits for the next outbound message, failing the test after a while.
pub async fn next_raw(peer: &mut MemoryPeer) -> String {
    tokio::time::timeout(Duration::from_secs(5), peer.recv())
        .await
        .expect("timed out waiting for outbound signaling")
        .expect("signaling channel dropped")
}
