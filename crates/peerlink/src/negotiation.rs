//! Negotiation state machine.
//!
//! [`NegotiationStateMachine`] is the single authority over a session's
//! handshake. It interprets inbound signaling traffic, calls into the
//! [`PeerEngine`] to apply remote descriptions and candidates, and emits the
//! next outbound message through the [`SignalingChannel`].
//!
//! State only moves forward. `TimedOut`, `Failed` and `Closed` are terminal;
//! `Closed` is reachable from any state through explicit teardown.
//!
//! Candidates that arrive before the remote description has been applied are
//! held back and flushed, in arrival order, right after it has been.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use protocol::{ConnectionRole, IceCandidate, SessionDescriptor, SignalingMessage};
use tokio::sync::Mutex;

use crate::engine::PeerEngine;
use crate::error::{ConnectionError, Result};
use crate::signaling::SignalingChannel;

/// Handshake progress of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NegotiationState {
    Idle,
    IdentitySent,
    AwaitingRemoteOffer,
    OfferReceived,
    AwaitingAnswer,
    AnswerReceived,
    ExchangingCandidates,
    AwaitingDataChannel,
    Ready,
    TimedOut,
    Failed,
    Closed,
}

impl NegotiationState {
    /// Returns the kebab-case name of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            NegotiationState::Idle => "idle",
            NegotiationState::IdentitySent => "identity-sent",
            NegotiationState::AwaitingRemoteOffer => "awaiting-remote-offer",
            NegotiationState::OfferReceived => "offer-received",
            NegotiationState::AwaitingAnswer => "awaiting-answer",
            NegotiationState::AnswerReceived => "answer-received",
            NegotiationState::ExchangingCandidates => "exchanging-candidates",
            NegotiationState::AwaitingDataChannel => "awaiting-data-channel",
            NegotiationState::Ready => "ready",
            NegotiationState::TimedOut => "timed-out",
            NegotiationState::Failed => "failed",
            NegotiationState::Closed => "closed",
        }
    }

    /// Whether no further handshake progress is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NegotiationState::TimedOut | NegotiationState::Failed | NegotiationState::Closed
        )
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutable session state, guarded by a single lock.
#[derive(Debug)]
struct Inner {
    state: NegotiationState,
    remote_description_applied: bool,
    pending_candidates: Vec<IceCandidate>,
    renegotiating: bool,
    failure: Option<ConnectionError>,
}

/// Drives the role-specific offer/answer/candidate exchange.
pub struct NegotiationStateMachine {
    role: ConnectionRole,
    session_id: String,
    engine: Arc<dyn PeerEngine>,
    channel: Arc<SignalingChannel>,
    inner: Mutex<Inner>,
    ready: AtomicBool,
    /// Log every transition at info level.
    verbose: bool,
}

impl NegotiationStateMachine {
    /// Creates a state machine in `Idle`.
    pub fn new(
        role: ConnectionRole,
        session_id: impl Into<String>,
        engine: Arc<dyn PeerEngine>,
        channel: Arc<SignalingChannel>,
    ) -> Self {
        Self {
            role,
            session_id: session_id.into(),
            engine,
            channel,
            inner: Mutex::new(Inner {
                state: NegotiationState::Idle,
                remote_description_applied: false,
                pending_candidates: Vec::new(),
                renegotiating: false,
                failure: None,
            }),
            ready: AtomicBool::new(false),
            verbose: false,
        }
    }

    /// Reports state transitions at info level instead of debug.
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    pub fn role(&self) -> ConnectionRole {
        self.role
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Returns the current state.
    pub async fn state(&self) -> NegotiationState {
        self.inner.lock().await.state
    }

    /// Whether the data channel has been reported open. Never reverts.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Returns the error that failed the session, if any.
    pub async fn failure(&self) -> Option<ConnectionError> {
        self.inner.lock().await.failure.clone()
    }

    /// Number of remote candidates held back until the remote description
    /// is applied.
    pub async fn pending_candidates(&self) -> usize {
        self.inner.lock().await.pending_candidates.len()
    }

    /// Moves forward to `next`.
    ///
    /// Moving to a state at or behind the current one is a no-op, which lets
    /// the listener finish its exchange after the driver has already
    /// observed readiness. Fails once the session is terminal.
    pub async fn advance(&self, next: NegotiationState) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let current = inner.state;

        if current.is_terminal() {
            return Err(ConnectionError::Aborted(format!(
                "session is {} and cannot move to {}",
                current, next
            )));
        }
        if next <= current {
            tracing::trace!(
                session_id = %self.session_id,
                state = %current,
                "ignoring transition to {}",
                next
            );
            return Ok(());
        }

        inner.state = next;
        self.log_transition(current, next);
        Ok(())
    }

    fn log_transition(&self, from: NegotiationState, to: NegotiationState) {
        if self.verbose {
            tracing::info!(session_id = %self.session_id, role = %self.role, "state {} -> {}", from, to);
        } else {
            tracing::debug!(session_id = %self.session_id, role = %self.role, "state {} -> {}", from, to);
        }
    }

    /// Checks that `message` is acceptable in the current state and moves
    /// to `next` under the same lock.
    async fn accept(
        &self,
        message: &'static str,
        allowed: impl Fn(NegotiationState) -> bool,
        next: NegotiationState,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let current = inner.state;
        if !allowed(current) {
            return Err(ConnectionError::UnexpectedMessage {
                message,
                state: current,
            });
        }

        inner.state = next;
        self.log_transition(current, next);
        Ok(())
    }

    /// Sends the identity message. Must be the first thing a session does.
    ///
    /// A server then waits for the remote offer; a client goes on with
    /// [`initiate_offer`](Self::initiate_offer).
    pub async fn on_identity(&self) -> Result<()> {
        let state = self.state().await;
        if state != NegotiationState::Idle {
            return Err(ConnectionError::Precondition(format!(
                "identity can only be sent from idle, session is {}",
                state
            )));
        }

        self.channel
            .send(&SignalingMessage::kind(self.role, self.session_id.clone()))
            .await?;
        self.advance(NegotiationState::IdentitySent).await?;
        tracing::info!(session_id = %self.session_id, role = %self.role, "identity sent");

        if self.role == ConnectionRole::Server {
            self.advance(NegotiationState::AwaitingRemoteOffer).await?;
        }
        Ok(())
    }

    /// Creates the local offer and sends it. Client role only.
    pub async fn initiate_offer(&self) -> Result<SessionDescriptor> {
        if !self.role.is_offerer() {
            return Err(ConnectionError::Precondition(format!(
                "{} role does not initiate the offer",
                self.role
            )));
        }
        let state = self.state().await;
        if state != NegotiationState::IdentitySent {
            return Err(ConnectionError::Precondition(format!(
                "offer can only follow the identity message, session is {}",
                state
            )));
        }

        let offer = self.engine.local_description().await?;
        self.advance(NegotiationState::AwaitingAnswer).await?;
        self.channel.send(&SignalingMessage::description(&offer)).await?;
        tracing::info!(session_id = %self.session_id, "offer sent");
        Ok(offer)
    }

    /// Handles one raw inbound envelope.
    ///
    /// Every error is fatal: the session is failed and the signaling channel
    /// closed before the error is returned.
    pub async fn on_raw_message(&self, raw: &str) -> Result<()> {
        let result = match SignalingChannel::decode(raw) {
            Ok(message) => self.dispatch(message).await,
            Err(err) => {
                tracing::warn!(session_id = %self.session_id, raw, "unrecognized signaling message");
                Err(err)
            }
        };

        if let Err(err) = &result {
            self.fail(err.clone()).await;
        }
        result
    }

    /// Routes a decoded message to its handler.
    pub async fn dispatch(&self, message: SignalingMessage) -> Result<()> {
        tracing::trace!(
            session_id = %self.session_id,
            message_type = message.message_type(),
            "signaling message received"
        );
        match message {
            SignalingMessage::Offer { sdp } => self.on_offer(&sdp.sdp).await,
            SignalingMessage::Answer { sdp } => self.on_answer(&sdp.sdp).await,
            SignalingMessage::Candidate { candidate } => self.on_candidate(candidate).await,
            SignalingMessage::Kind {
                kind,
                connection_id,
            } => {
                tracing::debug!(
                    session_id = %self.session_id,
                    peer_kind = %kind,
                    peer_session = %connection_id,
                    "peer announced itself"
                );
                Ok(())
            }
        }
    }

    /// Handles a remote offer.
    ///
    /// Applies it, sends the generated answer, flushes held-back candidates
    /// and emits the local candidates. An offer while `Ready` is a media
    /// renegotiation from the peer and is answered without a state change.
    pub async fn on_offer(&self, sdp: &str) -> Result<()> {
        if self.state().await == NegotiationState::Ready {
            let answer = self.engine.apply_remote_offer(sdp).await?;
            self.channel.send(&SignalingMessage::description(&answer)).await?;
            tracing::info!(session_id = %self.session_id, "renegotiation answer sent");
            return Ok(());
        }

        self.accept(
            "offer",
            |state| {
                matches!(
                    state,
                    NegotiationState::Idle | NegotiationState::AwaitingRemoteOffer
                )
            },
            NegotiationState::OfferReceived,
        )
        .await?;

        let answer = self.engine.apply_remote_offer(sdp).await?;
        let pending = self.take_pending_candidates().await;
        self.advance(NegotiationState::AnswerReceived).await?;

        self.channel.send(&SignalingMessage::description(&answer)).await?;
        tracing::info!(session_id = %self.session_id, "answer sent");

        self.apply_candidates(pending).await?;
        self.emit_local_candidates().await?;
        self.advance(NegotiationState::AwaitingDataChannel).await
    }

    /// Handles the remote answer to our offer.
    pub async fn on_answer(&self, sdp: &str) -> Result<()> {
        {
            let mut inner = self.inner.lock().await;
            if inner.state == NegotiationState::Ready && inner.renegotiating {
                inner.renegotiating = false;
                drop(inner);
                self.engine.apply_remote_answer(sdp).await?;
                tracing::info!(session_id = %self.session_id, "renegotiation answer applied");
                return Ok(());
            }
        }

        self.accept(
            "answer",
            |state| state == NegotiationState::AwaitingAnswer,
            NegotiationState::AnswerReceived,
        )
        .await?;

        self.engine.apply_remote_answer(sdp).await?;
        let pending = self.take_pending_candidates().await;
        tracing::info!(session_id = %self.session_id, "answer applied");

        self.apply_candidates(pending).await?;
        self.emit_local_candidates().await?;
        self.advance(NegotiationState::AwaitingDataChannel).await
    }

    /// Handles one remote candidate.
    ///
    /// Applied immediately once the remote description is in place,
    /// otherwise held back. Ignored after the session has ended.
    pub async fn on_candidate(&self, candidate: IceCandidate) -> Result<()> {
        {
            let mut inner = self.inner.lock().await;
            if inner.state.is_terminal() {
                tracing::debug!(
                    session_id = %self.session_id,
                    state = %inner.state,
                    "dropping candidate for finished session"
                );
                return Ok(());
            }
            if !inner.remote_description_applied {
                inner.pending_candidates.push(candidate);
                tracing::debug!(
                    session_id = %self.session_id,
                    state = %inner.state,
                    pending = inner.pending_candidates.len(),
                    "holding candidate until remote description is applied"
                );
                return Ok(());
            }
        }

        self.engine.apply_remote_candidate(candidate).await
    }

    /// Marks the remote description applied and takes the held-back
    /// candidates.
    async fn take_pending_candidates(&self) -> Vec<IceCandidate> {
        let mut inner = self.inner.lock().await;
        inner.remote_description_applied = true;
        std::mem::take(&mut inner.pending_candidates)
    }

    async fn apply_candidates(&self, candidates: Vec<IceCandidate>) -> Result<()> {
        if !candidates.is_empty() {
            tracing::debug!(
                session_id = %self.session_id,
                count = candidates.len(),
                "applying held-back candidates"
            );
        }
        for candidate in candidates {
            self.engine.apply_remote_candidate(candidate).await?;
        }
        Ok(())
    }

    /// Sends one `candidate` message per locally gathered candidate, in the
    /// engine's order. Returns how many were sent.
    pub async fn emit_local_candidates(&self) -> Result<usize> {
        self.advance(NegotiationState::ExchangingCandidates).await?;

        let candidates = self.engine.local_candidates().await?;
        let count = candidates.len();
        for candidate in candidates {
            self.channel.send(&SignalingMessage::candidate(candidate)).await?;
        }

        tracing::debug!(session_id = %self.session_id, count, "local candidates sent");
        Ok(count)
    }

    /// Records that the data channel opened.
    ///
    /// Returns `false` if the session already ended, in which case the
    /// session does not become ready.
    pub async fn mark_ready(&self) -> bool {
        if self.advance(NegotiationState::Ready).await.is_err() {
            return false;
        }
        if !self.ready.swap(true, Ordering::SeqCst) {
            tracing::info!(session_id = %self.session_id, role = %self.role, "data channel ready");
        }
        true
    }

    /// Attaches a local media source and offers the updated description.
    pub async fn renegotiate_media(&self, device_id: &str) -> Result<()> {
        if !self.is_ready() {
            return Err(ConnectionError::Precondition(
                "media can only be attached once the session is ready".to_string(),
            ));
        }

        self.engine.attach_media_source(device_id).await?;
        self.inner.lock().await.renegotiating = true;

        let offer = self.engine.local_description().await?;
        self.channel.send(&SignalingMessage::description(&offer)).await?;
        tracing::info!(session_id = %self.session_id, device_id, "media offer sent");
        Ok(())
    }

    /// Ends the handshake with a timeout and closes the signaling channel.
    pub async fn time_out(&self) {
        {
            let mut inner = self.inner.lock().await;
            if inner.state.is_terminal() {
                return;
            }
            inner.state = NegotiationState::TimedOut;
        }
        tracing::info!(session_id = %self.session_id, "timed out waiting for data channel");
        self.channel.close();
    }

    /// Fails the session with `err` and closes the signaling channel.
    ///
    /// Has no effect once the session is terminal, or when `err` is only the
    /// echo of a channel closed locally.
    pub async fn fail(&self, err: ConnectionError) {
        if self.channel.is_closed() && matches!(err, ConnectionError::ChannelClosed(_)) {
            tracing::debug!(session_id = %self.session_id, error = %err, "ignoring error on closed channel");
            return;
        }

        {
            let mut inner = self.inner.lock().await;
            if inner.state.is_terminal() {
                tracing::debug!(
                    session_id = %self.session_id,
                    state = %inner.state,
                    error = %err,
                    "ignoring error for finished session"
                );
                return;
            }
            tracing::error!(
                session_id = %self.session_id,
                state = %inner.state,
                category = %err.category(),
                error = %err,
                "negotiation failed"
            );
            inner.state = NegotiationState::Failed;
            inner.failure = Some(err);
        }
        self.channel.close();
    }

    /// Moves to `Closed` from any state and closes the signaling channel.
    pub async fn close(&self) {
        {
            let mut inner = self.inner.lock().await;
            if inner.state != NegotiationState::Closed {
                tracing::debug!(session_id = %self.session_id, "state {} -> closed", inner.state);
                inner.state = NegotiationState::Closed;
            }
        }
        self.channel.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::{MemoryPeer, MemoryTransport};
    use futures_util::future::BoxFuture;
    use std::sync::Mutex as StdMutex;

    /// Engine double that records calls and answers from a script.
    #[derive(Default)]
    struct StubEngine {
        calls: StdMutex<Vec<String>>,
        candidates: Vec<IceCandidate>,
        fail_remote_offer: bool,
    }

    impl StubEngine {
        fn with_candidates(candidates: Vec<IceCandidate>) -> Self {
            Self {
                candidates,
                ..Default::default()
            }
        }

        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl PeerEngine for StubEngine {
        fn local_description(&self) -> BoxFuture<'_, Result<SessionDescriptor>> {
            self.record("local_description".to_string());
            Box::pin(async { Ok(SessionDescriptor::offer("OFFER")) })
        }

        fn current_local_description(&self) -> BoxFuture<'_, Option<SessionDescriptor>> {
            Box::pin(async { None })
        }

        fn apply_remote_offer<'a>(
            &'a self,
            sdp: &'a str,
        ) -> BoxFuture<'a, Result<SessionDescriptor>> {
            self.record(format!("offer:{}", sdp));
            Box::pin(async move {
                if self.fail_remote_offer {
                    return Err(ConnectionError::Engine("bad offer".to_string()));
                }
                Ok(SessionDescriptor::answer(format!("answer-to-{}", sdp)))
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
            Box::pin(async move { Ok(self.candidates.clone()) })
        }

        fn is_data_channel_open(&self) -> bool {
            false
        }

        fn attach_media_source<'a>(&'a self, device_id: &'a str) -> BoxFuture<'a, Result<()>> {
            self.record(format!("media:{}", device_id));
            Box::pin(async { Ok(()) })
        }

        fn send_text<'a>(&'a self, _message: &'a str) -> BoxFuture<'a, Result<()>> {
            Box::pin(async { Ok(()) })
        }

        fn receive_text(&self) -> BoxFuture<'_, Result<Vec<String>>> {
            Box::pin(async { Ok(Vec::new()) })
        }

        fn close(&self) -> BoxFuture<'_, Result<()>> {
            Box::pin(async { Ok(()) })
        }
    }

    fn candidate(name: &str) -> IceCandidate {
        IceCandidate::new(format!("candidate:{}", name), Some("0".to_string()), Some(0))
    }

    async fn machine(
        role: ConnectionRole,
        engine: Arc<StubEngine>,
    ) -> (NegotiationStateMachine, MemoryPeer) {
        let (transport, peer) = MemoryTransport::pair();
        let channel = Arc::new(SignalingChannel::new());
        let _events = channel
            .open(&transport, "memory://test", std::time::Duration::from_secs(5))
            .await
            .unwrap();
        let machine = NegotiationStateMachine::new(role, "session-1", engine, channel);
        (machine, peer)
    }

    #[test]
    fn test_state_display_and_order() {
        assert_eq!(NegotiationState::AwaitingDataChannel.to_string(), "awaiting-data-channel");
        assert!(NegotiationState::Idle < NegotiationState::IdentitySent);
        assert!(NegotiationState::AwaitingDataChannel < NegotiationState::Ready);
        assert!(NegotiationState::TimedOut.is_terminal());
        assert!(!NegotiationState::Ready.is_terminal());
    }

    #[tokio::test]
    async fn test_server_identity_then_awaits_offer() {
        let (machine, mut peer) = machine(ConnectionRole::Server, Arc::default()).await;

        machine.on_identity().await.unwrap();

        assert_eq!(machine.state().await, NegotiationState::AwaitingRemoteOffer);
        assert_eq!(
            peer.recv_message().await,
            Some(SignalingMessage::kind(ConnectionRole::Server, "session-1"))
        );
        assert!(peer.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_verbose_flag_does_not_change_transitions() {
        let (machine, _peer) = machine(ConnectionRole::Server, Arc::default()).await;
        assert!(!machine.is_verbose());

        let machine = machine.with_verbose(true);
        assert!(machine.is_verbose());
        machine.on_identity().await.unwrap();
        assert_eq!(machine.state().await, NegotiationState::AwaitingRemoteOffer);
    }

    #[tokio::test]
    async fn test_identity_twice_is_precondition_error() {
        let (machine, _peer) = machine(ConnectionRole::Server, Arc::default()).await;
        machine.on_identity().await.unwrap();

        let err = machine.on_identity().await.unwrap_err();
        assert!(matches!(err, ConnectionError::Precondition(_)));
    }

    #[tokio::test]
    async fn test_server_answers_offer_then_sends_candidates() {
        let engine = Arc::new(StubEngine::with_candidates(vec![candidate("a"), candidate("b")]));
        let (machine, mut peer) = machine(ConnectionRole::Server, engine.clone()).await;
        machine.on_identity().await.unwrap();
        peer.recv().await.unwrap();

        machine
            .on_raw_message(r#"{"type":"offer","sdp":{"sdp":"S1"}}"#)
            .await
            .unwrap();

        assert_eq!(
            peer.recv().await.unwrap(),
            r#"{"type":"answer","sdp":{"sdp":"answer-to-S1"}}"#
        );
        assert_eq!(
            peer.recv_message().await,
            Some(SignalingMessage::candidate(candidate("a")))
        );
        assert_eq!(
            peer.recv_message().await,
            Some(SignalingMessage::candidate(candidate("b")))
        );
        assert!(peer.try_recv().is_none());
        assert_eq!(machine.state().await, NegotiationState::AwaitingDataChannel);
        assert_eq!(engine.calls(), vec!["offer:S1".to_string()]);
    }

    #[tokio::test]
    async fn test_client_offer_then_answer() {
        let engine = Arc::new(StubEngine::with_candidates(vec![candidate("c")]));
        let (machine, mut peer) = machine(ConnectionRole::Client, engine.clone()).await;

        machine.on_identity().await.unwrap();
        assert_eq!(machine.state().await, NegotiationState::IdentitySent);
        let offer = machine.initiate_offer().await.unwrap();
        assert_eq!(offer.sdp, "OFFER");
        assert_eq!(machine.state().await, NegotiationState::AwaitingAnswer);

        assert_eq!(
            peer.recv_message().await,
            Some(SignalingMessage::kind(ConnectionRole::Client, "session-1"))
        );
        assert_eq!(
            peer.recv_message().await,
            Some(SignalingMessage::description(&SessionDescriptor::offer("OFFER")))
        );

        machine
            .on_raw_message(r#"{"type":"answer","sdp":{"sdp":"A1"}}"#)
            .await
            .unwrap();
        assert_eq!(
            peer.recv_message().await,
            Some(SignalingMessage::candidate(candidate("c")))
        );
        assert_eq!(machine.state().await, NegotiationState::AwaitingDataChannel);
        assert_eq!(
            engine.calls(),
            vec!["local_description".to_string(), "answer:A1".to_string()]
        );
    }

    #[tokio::test]
    async fn test_server_does_not_initiate_offer() {
        let (machine, _peer) = machine(ConnectionRole::Server, Arc::default()).await;
        machine.on_identity().await.unwrap();

        let err = machine.initiate_offer().await.unwrap_err();
        assert!(matches!(err, ConnectionError::Precondition(_)));
    }

    #[tokio::test]
    async fn test_answer_while_awaiting_offer_fails_session() {
        let (machine, peer) = machine(ConnectionRole::Server, Arc::default()).await;
        machine.on_identity().await.unwrap();

        let err = machine
            .on_raw_message(r#"{"type":"answer","sdp":{"sdp":"A"}}"#)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ConnectionError::UnexpectedMessage {
                message: "answer",
                state: NegotiationState::AwaitingRemoteOffer
            }
        ));
        assert_eq!(machine.state().await, NegotiationState::Failed);
        assert!(peer.is_closed());
    }

    #[tokio::test]
    async fn test_unknown_type_fails_session_from_ready() {
        let (machine, peer) = machine(ConnectionRole::Server, Arc::default()).await;
        machine.on_identity().await.unwrap();
        assert!(machine.mark_ready().await);

        let err = machine
            .on_raw_message(r#"{"type":"bye"}"#)
            .await
            .unwrap_err();

        assert_eq!(err.category(), crate::error::ErrorCategory::Protocol);
        assert_eq!(machine.state().await, NegotiationState::Failed);
        assert!(machine.failure().await.is_some());
        assert!(machine.is_ready());
        assert!(peer.is_closed());
    }

    #[tokio::test]
    async fn test_missing_type_fails_session() {
        let (machine, peer) = machine(ConnectionRole::Client, Arc::default()).await;

        assert!(machine.on_raw_message(r#"{"sdp":"x"}"#).await.is_err());
        assert_eq!(machine.state().await, NegotiationState::Failed);
        assert!(peer.is_closed());
    }

    #[tokio::test]
    async fn test_early_candidates_are_held_then_flushed_in_order() {
        let engine = Arc::new(StubEngine::default());
        let (machine, _peer) = machine(ConnectionRole::Server, engine.clone()).await;
        machine.on_identity().await.unwrap();

        machine.on_candidate(candidate("early-1")).await.unwrap();
        machine.on_candidate(candidate("early-2")).await.unwrap();
        assert_eq!(machine.pending_candidates().await, 2);
        assert_eq!(machine.state().await, NegotiationState::AwaitingRemoteOffer);
        assert!(engine.calls().is_empty());

        machine.on_offer("S1").await.unwrap();
        machine.on_candidate(candidate("late")).await.unwrap();

        assert_eq!(machine.pending_candidates().await, 0);
        assert_eq!(
            engine.calls(),
            vec![
                "offer:S1".to_string(),
                "candidate:candidate:early-1".to_string(),
                "candidate:candidate:early-2".to_string(),
                "candidate:candidate:late".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_client_holds_candidates_while_awaiting_answer() {
        let engine = Arc::new(StubEngine::default());
        let (machine, _peer) = machine(ConnectionRole::Client, engine.clone()).await;
        machine.on_identity().await.unwrap();
        machine.initiate_offer().await.unwrap();

        machine.on_candidate(candidate("x")).await.unwrap();
        assert_eq!(machine.pending_candidates().await, 1);

        machine.on_answer("A").await.unwrap();
        assert_eq!(
            engine.calls().last().map(String::as_str),
            Some("candidate:candidate:x")
        );
    }

    #[tokio::test]
    async fn test_engine_error_fails_session() {
        let engine = Arc::new(StubEngine {
            fail_remote_offer: true,
            ..Default::default()
        });
        let (machine, peer) = machine(ConnectionRole::Server, engine).await;
        machine.on_identity().await.unwrap();

        let err = machine
            .on_raw_message(r#"{"type":"offer","sdp":{"sdp":"S1"}}"#)
            .await
            .unwrap_err();

        assert!(matches!(err, ConnectionError::Engine(_)));
        assert!(matches!(
            machine.failure().await,
            Some(ConnectionError::Engine(_))
        ));
        assert!(peer.is_closed());
    }

    #[tokio::test]
    async fn test_advance_is_forward_only() {
        let (machine, _peer) = machine(ConnectionRole::Server, Arc::default()).await;

        machine.advance(NegotiationState::ExchangingCandidates).await.unwrap();
        machine.advance(NegotiationState::IdentitySent).await.unwrap();
        assert_eq!(machine.state().await, NegotiationState::ExchangingCandidates);

        machine.time_out().await;
        assert!(machine.advance(NegotiationState::Ready).await.is_err());
        assert!(!machine.mark_ready().await);
        assert!(!machine.is_ready());
    }

    #[tokio::test]
    async fn test_time_out_closes_channel_and_is_final() {
        let (machine, peer) = machine(ConnectionRole::Server, Arc::default()).await;

        machine.time_out().await;
        assert_eq!(machine.state().await, NegotiationState::TimedOut);
        assert!(peer.is_closed());

        machine
            .fail(ConnectionError::Transport("late".to_string()))
            .await;
        assert_eq!(machine.state().await, NegotiationState::TimedOut);
        assert!(machine.failure().await.is_none());
    }

    #[tokio::test]
    async fn test_close_from_any_state() {
        let (machine, peer) = machine(ConnectionRole::Client, Arc::default()).await;
        machine.time_out().await;

        machine.close().await;
        assert_eq!(machine.state().await, NegotiationState::Closed);
        assert!(peer.is_closed());
    }

    #[tokio::test]
    async fn test_media_renegotiation_accepts_answer_while_ready() {
        let engine = Arc::new(StubEngine::default());
        let (machine, mut peer) = machine(ConnectionRole::Client, engine.clone()).await;

        let err = machine.renegotiate_media("cam0").await.unwrap_err();
        assert!(matches!(err, ConnectionError::Precondition(_)));

        machine.on_identity().await.unwrap();
        peer.recv().await.unwrap();
        assert!(machine.mark_ready().await);

        machine.renegotiate_media("cam0").await.unwrap();
        assert_eq!(
            peer.recv_message().await,
            Some(SignalingMessage::description(&SessionDescriptor::offer("OFFER")))
        );

        machine.on_answer("A2").await.unwrap();
        assert_eq!(machine.state().await, NegotiationState::Ready);
        assert_eq!(
            engine.calls(),
            vec![
                "media:cam0".to_string(),
                "local_description".to_string(),
                "answer:A2".to_string(),
            ]
        );

        // A second answer has nothing to answer.
        assert!(machine.on_answer("A3").await.is_err());
    }

    #[tokio::test]
    async fn test_offer_while_ready_is_answered() {
        let engine = Arc::new(StubEngine::default());
        let (machine, mut peer) = machine(ConnectionRole::Server, engine).await;
        machine.on_identity().await.unwrap();
        peer.recv().await.unwrap();
        assert!(machine.mark_ready().await);

        machine.on_offer("S9").await.unwrap();
        assert_eq!(
            peer.recv_message().await,
            Some(SignalingMessage::description(&SessionDescriptor::answer(
                "answer-to-S9"
            )))
        );
        assert_eq!(machine.state().await, NegotiationState::Ready);
    }
}
