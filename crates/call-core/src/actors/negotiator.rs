//! `NegotiatorActor` - one offer/answer exchange with one remote peer.
//!
//! Each `NegotiatorActor`:
//! - Owns exactly one peer connection for one `(remote_id, stream_class)` key
//! - Plays the caller or the callee role, never both
//! - Holds remote candidates until a remote description is set, then applies
//!   them in arrival order
//! - Reports its output (local descriptions, local candidates, remote tracks,
//!   termination) to the session as `NegotiatorEvent`s
//!
//! # Lifecycle
//!
//! 1. Spawned by the `PeerConnectionRegistry`; the peer connection is created
//!    lazily on the first negotiation step
//! 2. Runs until the transport reports Disconnected/Failed, a negotiation
//!    step fails, the negotiation deadline passes, or the handle closes it
//! 3. A closed negotiator emits nothing further; a negotiator that stops on
//!    its own emits exactly one `Terminated`

use super::messages::{
    NegotiatorEvent, NegotiatorKey, NegotiatorMessage, NegotiatorOutput, NegotiatorSnapshot,
    NegotiatorState, Role, TerminationReason,
};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use crate::errors::NegotiationError;
use crate::media::LocalTrack;
use crate::observability::metrics as call_metrics;
use crate::peer::{
    IceCandidate, PeerConnection, PeerConnectionFactory, PeerError, PeerEvent, SessionDescription,
    TransportState,
};

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Upper bound on waiting for a peer connection to close.
const PEER_CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Per-negotiator limits, taken from `Config`.
#[derive(Debug, Clone, Copy)]
pub struct NegotiatorSettings {
    pub timeout: Duration,
    pub max_pending_candidates: usize,
    pub mailbox_size: usize,
}

/// Handle to a `NegotiatorActor`.
///
/// Commands are delivered with `try_send`: a full mailbox is reported as
/// `NegotiationError::Backpressure` instead of stalling the session.
#[derive(Clone, Debug)]
pub struct NegotiatorHandle {
    sender: mpsc::Sender<NegotiatorMessage>,
    cancel_token: CancellationToken,
    key: NegotiatorKey,
    generation: u64,
    mailbox: Arc<MailboxMonitor>,
}

impl NegotiatorHandle {
    #[must_use]
    pub fn key(&self) -> &NegotiatorKey {
        &self.key
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Attach `tracks` and start an offer. The offer arrives as a
    /// `LocalDescription` output.
    pub fn initiate_as_caller(&self, tracks: Vec<LocalTrack>) -> Result<(), NegotiationError> {
        self.dispatch(NegotiatorMessage::InitiateAsCaller { tracks })
    }

    /// Answer `offer`. The answer arrives as a `LocalDescription` output.
    pub fn accept_offer(
        &self,
        offer: SessionDescription,
        tracks: Vec<LocalTrack>,
    ) -> Result<(), NegotiationError> {
        self.dispatch(NegotiatorMessage::AcceptOffer { offer, tracks })
    }

    pub fn complete_as_caller(&self, answer: SessionDescription) -> Result<(), NegotiationError> {
        self.dispatch(NegotiatorMessage::CompleteAsCaller { answer })
    }

    pub fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        self.dispatch(NegotiatorMessage::AddRemoteCandidate { candidate })
    }

    /// Get current negotiator state.
    pub async fn get_state(&self) -> Result<NegotiatorSnapshot, NegotiationError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(NegotiatorMessage::GetState { respond_to: tx })
            .await
            .map_err(|_| NegotiationError::Closed)?;

        rx.await.map_err(|_| NegotiationError::Closed)
    }

    /// Close the negotiator: release its tracks and tear down its peer
    /// connection. Idempotent; never blocks.
    pub fn close(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.cancel_token.is_cancelled() || self.sender.is_closed()
    }

    fn dispatch(&self, message: NegotiatorMessage) -> Result<(), NegotiationError> {
        self.sender.try_send(message).map_err(|e| match e {
            TrySendError::Full(_) => {
                self.mailbox.record_drop();
                NegotiationError::Backpressure
            }
            TrySendError::Closed(_) => NegotiationError::Closed,
        })
    }
}

/// The `NegotiatorActor` implementation.
pub struct NegotiatorActor {
    key: NegotiatorKey,
    /// Registry-assigned, increases with every replacement of this key.
    generation: u64,
    role: Option<Role>,
    state: NegotiatorState,
    receiver: mpsc::Receiver<NegotiatorMessage>,
    cancel_token: CancellationToken,
    factory: Arc<dyn PeerConnectionFactory>,
    peer: Option<Arc<dyn PeerConnection>>,
    peer_events_tx: mpsc::UnboundedSender<PeerEvent>,
    peer_events_rx: mpsc::UnboundedReceiver<PeerEvent>,
    output: mpsc::UnboundedSender<NegotiatorEvent>,
    has_local_description: bool,
    has_remote_description: bool,
    /// Remote candidates that arrived before the remote description.
    pending_candidates: VecDeque<IceCandidate>,
    applied_candidates: usize,
    /// Local tracks attached to the peer connection.
    attached: Vec<LocalTrack>,
    settings: NegotiatorSettings,
    started_at: Option<Instant>,
    deadline: Option<Instant>,
    metrics: Arc<ActorMetrics>,
    mailbox: Arc<MailboxMonitor>,
}

impl NegotiatorActor {
    /// Spawn a new negotiator actor.
    ///
    /// Returns a handle and the task join handle.
    pub fn spawn(
        key: NegotiatorKey,
        generation: u64,
        factory: Arc<dyn PeerConnectionFactory>,
        output: mpsc::UnboundedSender<NegotiatorEvent>,
        settings: NegotiatorSettings,
        cancel_token: CancellationToken,
        metrics: Arc<ActorMetrics>,
    ) -> (NegotiatorHandle, JoinHandle<()>) {
        let capacity = settings.mailbox_size.max(1);
        let (sender, receiver) = mpsc::channel(capacity);
        let (peer_events_tx, peer_events_rx) = mpsc::unbounded_channel();
        let mailbox = Arc::new(MailboxMonitor::new(
            ActorType::Negotiator,
            key.to_string(),
            capacity,
        ));

        let actor = Self {
            key: key.clone(),
            generation,
            role: None,
            state: NegotiatorState::New,
            receiver,
            cancel_token: cancel_token.clone(),
            factory,
            peer: None,
            peer_events_tx,
            peer_events_rx,
            output,
            has_local_description: false,
            has_remote_description: false,
            pending_candidates: VecDeque::new(),
            applied_candidates: 0,
            attached: Vec::new(),
            settings,
            started_at: None,
            deadline: None,
            metrics,
            mailbox: Arc::clone(&mailbox),
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = NegotiatorHandle {
            sender,
            cancel_token,
            key,
            generation,
            mailbox,
        };

        (handle, task_handle)
    }

    /// Run the actor message loop.
    #[instrument(
        skip_all,
        name = "call.actor.negotiator",
        fields(
            remote_id = %self.key.remote_id,
            class = %self.key.class,
            generation = self.generation
        )
    )]
    async fn run(mut self) {
        self.metrics.negotiator_started();
        debug!(
            target: "call.actor.negotiator",
            key = %self.key,
            generation = self.generation,
            "NegotiatorActor started"
        );

        loop {
            let deadline = self.deadline;
            tokio::select! {
                biased;

                () = self.cancel_token.cancelled() => {
                    debug!(
                        target: "call.actor.negotiator",
                        key = %self.key,
                        "NegotiatorActor received cancellation signal"
                    );
                    break;
                }

                () = sleep_until(deadline) => {
                    self.terminate(TerminationReason::Error(NegotiationError::Timeout(
                        self.settings.timeout,
                    )));
                    break;
                }

                event = self.peer_events_rx.recv() => {
                    // The actor holds a sender, so the channel never closes.
                    if let Some(event) = event {
                        if self.handle_peer_event(event) {
                            break;
                        }
                    }
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            let should_exit = self.handle_message(message).await;
                            self.mailbox.record_processed(self.receiver.len());

                            if should_exit {
                                break;
                            }
                        }
                        None => {
                            debug!(
                                target: "call.actor.negotiator",
                                key = %self.key,
                                "NegotiatorActor channel closed, exiting"
                            );
                            break;
                        }
                    }
                }
            }
        }

        self.shutdown().await;
        self.metrics.negotiator_stopped();

        info!(
            target: "call.actor.negotiator",
            key = %self.key,
            generation = self.generation,
            state = self.state.as_str(),
            applied_candidates = self.applied_candidates,
            messages_processed = self.mailbox.messages_processed(),
            "NegotiatorActor stopped"
        );
    }

    /// Handle a single message. Returns true if the actor should exit.
    async fn handle_message(&mut self, message: NegotiatorMessage) -> bool {
        let result = match message {
            NegotiatorMessage::InitiateAsCaller { tracks } => self.initiate(tracks).await,
            NegotiatorMessage::AcceptOffer { offer, tracks } => self.accept(offer, tracks).await,
            NegotiatorMessage::CompleteAsCaller { answer } => self.complete(answer).await,
            NegotiatorMessage::AddRemoteCandidate { candidate } => {
                self.add_candidate(candidate).await;
                Ok(())
            }
            NegotiatorMessage::GetState { respond_to } => {
                let _ = respond_to.send(self.snapshot());
                Ok(())
            }
        };

        match result {
            Ok(()) => false,
            Err(error) => {
                self.terminate(TerminationReason::Error(error));
                true
            }
        }
    }

    async fn initiate(&mut self, tracks: Vec<LocalTrack>) -> Result<(), NegotiationError> {
        self.expect_state("initiate_as_caller", NegotiatorState::New)?;
        self.role = Some(Role::Caller);
        self.start_clock();

        let peer = self.ensure_peer().await?;
        self.attach(&peer, tracks).await?;

        let offer = self.guarded(peer.create_offer()).await?;
        self.guarded(peer.set_local_description(offer.clone()))
            .await?;
        self.has_local_description = true;
        self.state = NegotiatorState::LocalDescriptionSet;

        debug!(
            target: "call.actor.negotiator",
            key = %self.key,
            sdp_len = offer.sdp.len(),
            "Local offer set"
        );
        self.emit(NegotiatorOutput::LocalDescription(offer));
        Ok(())
    }

    async fn accept(
        &mut self,
        offer: SessionDescription,
        tracks: Vec<LocalTrack>,
    ) -> Result<(), NegotiationError> {
        self.expect_state("accept_offer", NegotiatorState::New)?;
        self.role = Some(Role::Callee);
        self.start_clock();

        let peer = self.ensure_peer().await?;
        self.guarded(peer.set_remote_description(offer)).await?;
        self.has_remote_description = true;
        self.state = NegotiatorState::RemoteDescriptionSet;
        self.flush_pending(&peer).await;

        self.attach(&peer, tracks).await?;

        let answer = self.guarded(peer.create_answer()).await?;
        self.guarded(peer.set_local_description(answer.clone()))
            .await?;
        self.has_local_description = true;
        self.state = NegotiatorState::LocalDescriptionSet;

        debug!(
            target: "call.actor.negotiator",
            key = %self.key,
            sdp_len = answer.sdp.len(),
            "Local answer set"
        );
        self.emit(NegotiatorOutput::LocalDescription(answer));
        Ok(())
    }

    async fn complete(&mut self, answer: SessionDescription) -> Result<(), NegotiationError> {
        if self.role != Some(Role::Caller) || self.has_remote_description {
            return Err(NegotiationError::OutOfOrder {
                operation: "complete_as_caller",
                state: self.state,
            });
        }
        self.expect_state("complete_as_caller", NegotiatorState::LocalDescriptionSet)?;

        let peer = self.ensure_peer().await?;
        self.guarded(peer.set_remote_description(answer)).await?;
        self.has_remote_description = true;
        self.state = NegotiatorState::RemoteDescriptionSet;
        self.flush_pending(&peer).await;
        Ok(())
    }

    async fn add_candidate(&mut self, candidate: IceCandidate) {
        let peer = match (&self.peer, self.has_remote_description) {
            (Some(peer), true) => Arc::clone(peer),
            _ => {
                if self.pending_candidates.len() >= self.settings.max_pending_candidates {
                    self.pending_candidates.pop_front();
                    warn!(
                        target: "call.actor.negotiator",
                        key = %self.key,
                        limit = self.settings.max_pending_candidates,
                        "Pending candidate limit reached, dropping oldest"
                    );
                }
                if self.settings.max_pending_candidates > 0 {
                    self.pending_candidates.push_back(candidate);
                    call_metrics::record_candidate_queued(self.key.class.as_str());
                }
                debug!(
                    target: "call.actor.negotiator",
                    key = %self.key,
                    pending = self.pending_candidates.len(),
                    "Remote candidate queued until remote description"
                );
                return;
            }
        };

        self.apply_candidate(&peer, candidate).await;
    }

    async fn flush_pending(&mut self, peer: &Arc<dyn PeerConnection>) {
        while let Some(candidate) = self.pending_candidates.pop_front() {
            self.apply_candidate(peer, candidate).await;
        }
    }

    async fn apply_candidate(&mut self, peer: &Arc<dyn PeerConnection>, candidate: IceCandidate) {
        let candidate_len = candidate.candidate.len();
        match self.guarded(peer.add_ice_candidate(candidate)).await {
            Ok(()) => self.applied_candidates += 1,
            Err(e) => {
                // A single unusable candidate does not fail the negotiation.
                warn!(
                    target: "call.actor.negotiator",
                    key = %self.key,
                    candidate_len,
                    error = %e,
                    "Remote candidate rejected"
                );
            }
        }
    }

    async fn attach(
        &mut self,
        peer: &Arc<dyn PeerConnection>,
        tracks: Vec<LocalTrack>,
    ) -> Result<(), NegotiationError> {
        if tracks.is_empty() {
            return Ok(());
        }
        self.guarded(peer.attach_tracks(&tracks)).await?;
        self.attached.extend(tracks);
        Ok(())
    }

    async fn ensure_peer(&mut self) -> Result<Arc<dyn PeerConnection>, NegotiationError> {
        if let Some(peer) = &self.peer {
            return Ok(Arc::clone(peer));
        }
        let created = self
            .guarded(self.factory.create(&self.key, self.peer_events_tx.clone()))
            .await?;
        self.peer = Some(Arc::clone(&created));
        Ok(created)
    }

    /// Run one peer operation, abandoning it on close or deadline.
    async fn guarded<T>(
        &self,
        operation: impl Future<Output = Result<T, PeerError>>,
    ) -> Result<T, NegotiationError> {
        let deadline = self.deadline;
        tokio::select! {
            biased;
            () = self.cancel_token.cancelled() => Err(NegotiationError::Closed),
            () = sleep_until(deadline) => Err(NegotiationError::Timeout(self.settings.timeout)),
            result = operation => result.map_err(NegotiationError::from),
        }
    }

    /// Handle one peer callback. Returns true if the actor should exit.
    fn handle_peer_event(&mut self, event: PeerEvent) -> bool {
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                self.emit(NegotiatorOutput::LocalCandidate(candidate));
                false
            }
            PeerEvent::RemoteTrack(track) => {
                debug!(
                    target: "call.actor.negotiator",
                    key = %self.key,
                    kind = track.kind.as_str(),
                    "Remote track received"
                );
                self.emit(NegotiatorOutput::RemoteTrack(track));
                false
            }
            PeerEvent::StateChanged(TransportState::Connected) => {
                if self.state != NegotiatorState::Connected {
                    self.state = NegotiatorState::Connected;
                    self.deadline = None;
                    if let Some(started) = self.started_at {
                        call_metrics::record_negotiation_duration(
                            self.key.class.as_str(),
                            started.elapsed(),
                        );
                    }
                    call_metrics::record_negotiation_outcome(self.key.class.as_str(), "connected");
                    info!(
                        target: "call.actor.negotiator",
                        key = %self.key,
                        "Peer connection established"
                    );
                    self.emit(NegotiatorOutput::Connected);
                }
                false
            }
            PeerEvent::StateChanged(state) => match TerminationReason::from_transport(state) {
                Some(reason) => {
                    self.terminate(reason);
                    true
                }
                None => {
                    debug!(
                        target: "call.actor.negotiator",
                        key = %self.key,
                        transport_state = ?state,
                        "Transport state changed"
                    );
                    false
                }
            },
        }
    }

    /// Stop on our own and tell the session why. A closed negotiator stays silent.
    fn terminate(&mut self, reason: TerminationReason) {
        if self.cancel_token.is_cancelled() {
            return;
        }

        self.state = match reason {
            TerminationReason::Disconnected => NegotiatorState::Disconnected,
            TerminationReason::Failed | TerminationReason::Error(_) => NegotiatorState::Failed,
        };
        call_metrics::record_negotiation_outcome(self.key.class.as_str(), reason.as_str());
        warn!(
            target: "call.actor.negotiator",
            key = %self.key,
            reason = reason.as_str(),
            "Negotiator terminated"
        );
        self.emit(NegotiatorOutput::Terminated(reason));
    }

    async fn shutdown(&mut self) {
        if !self.state.is_terminal() {
            self.state = NegotiatorState::Closed;
            call_metrics::record_negotiation_outcome(self.key.class.as_str(), "closed");
        }

        if let Some(peer) = self.peer.take() {
            match tokio::time::timeout(PEER_CLOSE_TIMEOUT, peer.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!(
                        target: "call.actor.negotiator",
                        key = %self.key,
                        error = %e,
                        "Peer connection close reported an error"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "call.actor.negotiator",
                        key = %self.key,
                        "Peer connection close timed out"
                    );
                }
            }
        }

        self.attached.clear();
        self.pending_candidates.clear();
    }

    fn expect_state(
        &self,
        operation: &'static str,
        expected: NegotiatorState,
    ) -> Result<(), NegotiationError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(NegotiationError::OutOfOrder {
                operation,
                state: self.state,
            })
        }
    }

    fn start_clock(&mut self) {
        let now = Instant::now();
        self.started_at = Some(now);
        self.deadline = Some(now + self.settings.timeout);
    }

    fn emit(&self, output: NegotiatorOutput) {
        // The session may already be gone during shutdown.
        let _ = self.output.send(NegotiatorEvent {
            key: self.key.clone(),
            generation: self.generation,
            output,
        });
    }

    fn snapshot(&self) -> NegotiatorSnapshot {
        NegotiatorSnapshot {
            key: self.key.clone(),
            generation: self.generation,
            role: self.role,
            state: self.state,
            has_local_description: self.has_local_description,
            has_remote_description: self.has_remote_description,
            pending_candidates: self.pending_candidates.len(),
            applied_candidates: self.applied_candidates,
            attached_tracks: self.attached.len(),
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
