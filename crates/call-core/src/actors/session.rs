//! `SessionActor` - per-call orchestrator.
//!
//! Each `SessionActor`:
//! - Owns the call phase, the local flags and the call duration
//! - Owns the local camera/microphone stream and the local screen stream
//! - Owns the Participant Registry and both Peer Connection Registries
//! - Consumes the conversation's signaling subscription and applies the
//!   router's decisions
//! - Publishes every outbound signaling event
//!
//! # Phases
//!
//! `Idle → Connecting → Active → Ended`. A join that fails at any step rolls
//! back to `Ended` and releases whatever it acquired. `Ended` is terminal.
//!
//! # Teardown order
//!
//! Leave runs, in order: the `leave` broadcast, screen negotiators, media
//! negotiators, participants, screen capture, local capture.

use super::messages::{
    LocalFlags, NegotiatorEvent, NegotiatorKey, NegotiatorOutput, Role, SessionEvent,
    SessionMessage, SessionPhase, SessionSnapshot, SessionWarning, StreamClass,
};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use super::negotiator::{NegotiatorHandle, NegotiatorSettings};
use super::participants::ParticipantRegistry;
use super::registry::{NegotiatorSpawner, PeerConnectionRegistry};
use crate::config::Config;
use crate::errors::{CallError, DeviceError, TransportError};
use crate::media::{LocalStream, LocalTrack, MediaCaptureController, TrackKind};
use crate::observability::metrics as call_metrics;
use crate::peer::{IceCandidate, PeerConnectionFactory, SessionDescription};
use crate::signaling::{
    RouteAction, SignalingEvent, SignalingRouter, SignalingSubscription, SignalingTransport,
};

use chrono::{DateTime, Utc};
use common::types::{ConversationId, UserId};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Unacknowledged warnings kept for the UI. The oldest is dropped first.
const MAX_WARNINGS: usize = 16;

/// Collaborators and settings for one session.
pub struct SessionContext {
    pub user_id: UserId,
    pub conversation_id: ConversationId,
    pub config: Config,
    pub transport: Arc<dyn SignalingTransport>,
    pub capture: MediaCaptureController,
    pub peers: Arc<dyn PeerConnectionFactory>,
}

/// Handle to a `SessionActor`.
#[derive(Clone)]
pub struct SessionHandle {
    sender: mpsc::Sender<SessionMessage>,
    cancel_token: CancellationToken,
    user_id: UserId,
    conversation_id: ConversationId,
    state: watch::Receiver<SessionSnapshot>,
}

impl SessionHandle {
    #[must_use]
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    #[must_use]
    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    /// Acquire local media, subscribe and announce presence.
    ///
    /// Resolves once the join is announced, or with the error that rolled
    /// the session back to `Ended`.
    pub async fn join(&self, with_video: bool) -> Result<(), CallError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SessionMessage::Join {
                with_video,
                respond_to: tx,
            })
            .await
            .map_err(|e| CallError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| CallError::Internal(format!("response receive failed: {e}")))?
    }

    /// Leave the call. Idempotent.
    pub async fn leave(&self) -> Result<(), CallError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SessionMessage::Leave { respond_to: tx })
            .await
            .map_err(|e| CallError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| CallError::Internal(format!("response receive failed: {e}")))?
    }

    /// Flip the microphone. Returns the new muted flag.
    pub async fn toggle_mute(&self) -> Result<bool, CallError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SessionMessage::ToggleMute { respond_to: tx })
            .await
            .map_err(|e| CallError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| CallError::Internal(format!("response receive failed: {e}")))?
    }

    /// Flip the camera. Returns the new video-enabled flag.
    pub async fn toggle_video(&self) -> Result<bool, CallError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SessionMessage::ToggleVideo { respond_to: tx })
            .await
            .map_err(|e| CallError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| CallError::Internal(format!("response receive failed: {e}")))?
    }

    /// Start or stop sharing the screen.
    pub async fn toggle_screen_share(&self, on: bool) -> Result<(), CallError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SessionMessage::ToggleScreenShare { on, respond_to: tx })
            .await
            .map_err(|e| CallError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| CallError::Internal(format!("response receive failed: {e}")))?
    }

    /// Get current session state.
    pub async fn get_state(&self) -> Result<SessionSnapshot, CallError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SessionMessage::GetState { respond_to: tx })
            .await
            .map_err(|e| CallError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| CallError::Internal(format!("response receive failed: {e}")))
    }

    /// Acknowledge every warning in the current snapshot.
    pub async fn clear_warnings(&self) -> Result<(), CallError> {
        self.sender
            .send(SessionMessage::ClearWarnings)
            .await
            .map_err(|e| CallError::Internal(format!("channel send failed: {e}")))
    }

    /// Live negotiator for `key`, if any.
    pub async fn negotiator(
        &self,
        key: NegotiatorKey,
    ) -> Result<Option<NegotiatorHandle>, CallError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SessionMessage::GetNegotiator {
                key,
                respond_to: tx,
            })
            .await
            .map_err(|e| CallError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| CallError::Internal(format!("response receive failed: {e}")))
    }

    /// Observe state changes. The receiver always holds the latest snapshot.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.state.clone()
    }

    /// Cancel the session actor. The actor leaves the call before exiting.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// Check if the actor is cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

struct PendingJoin {
    with_video: bool,
    respond_to: oneshot::Sender<Result<(), CallError>>,
}

/// The `SessionActor` implementation.
pub struct SessionActor {
    user_id: UserId,
    conversation_id: ConversationId,
    receiver: mpsc::Receiver<SessionMessage>,
    cancel_token: CancellationToken,
    transport: Arc<dyn SignalingTransport>,
    capture: MediaCaptureController,
    router: SignalingRouter,
    subscription: Option<SignalingSubscription>,
    phase: SessionPhase,
    flags: LocalFlags,
    local_stream: Option<LocalStream>,
    screen_stream: Option<LocalStream>,
    media_peers: PeerConnectionRegistry,
    screen_peers: PeerConnectionRegistry,
    participants: ParticipantRegistry,
    negotiator_events: mpsc::UnboundedReceiver<NegotiatorEvent>,
    /// Results of acquisition tasks and capture watchers.
    internal_tx: mpsc::UnboundedSender<SessionEvent>,
    internal_rx: mpsc::UnboundedReceiver<SessionEvent>,
    pending_join: Option<PendingJoin>,
    pending_screen: Option<oneshot::Sender<Result<(), CallError>>>,
    started_at: Option<DateTime<Utc>>,
    active_since: Option<Instant>,
    duration_seconds: u64,
    tick_period: Duration,
    ticker: Option<Interval>,
    warnings: VecDeque<SessionWarning>,
    state_tx: watch::Sender<SessionSnapshot>,
    metrics: Arc<ActorMetrics>,
    mailbox: MailboxMonitor,
}

impl SessionActor {
    /// Spawn a new session actor in the `Idle` phase.
    ///
    /// Returns a handle and the task join handle.
    pub fn spawn(
        context: SessionContext,
        cancel_token: CancellationToken,
        metrics: Arc<ActorMetrics>,
    ) -> (SessionHandle, JoinHandle<()>) {
        let SessionContext {
            user_id,
            conversation_id,
            config,
            transport,
            capture,
            peers,
        } = context;

        let capacity = config.session_mailbox_size.max(1);
        let (sender, receiver) = mpsc::channel(capacity);
        let (negotiator_tx, negotiator_events) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionSnapshot::idle(
            user_id.clone(),
            conversation_id.clone(),
        ));

        let spawner = NegotiatorSpawner::new(
            peers,
            negotiator_tx,
            NegotiatorSettings {
                timeout: config.negotiation_timeout,
                max_pending_candidates: config.max_pending_candidates,
                mailbox_size: config.negotiator_mailbox_size,
            },
            cancel_token.clone(),
            Arc::clone(&metrics),
        );

        let actor = Self {
            user_id: user_id.clone(),
            conversation_id: conversation_id.clone(),
            receiver,
            cancel_token: cancel_token.clone(),
            transport,
            capture,
            router: SignalingRouter::new(user_id.clone(), conversation_id.clone()),
            subscription: None,
            phase: SessionPhase::Idle,
            flags: LocalFlags::default(),
            local_stream: None,
            screen_stream: None,
            media_peers: PeerConnectionRegistry::new(StreamClass::Media, spawner.clone()),
            screen_peers: PeerConnectionRegistry::new(StreamClass::Screen, spawner),
            participants: ParticipantRegistry::new(),
            negotiator_events,
            internal_tx,
            internal_rx,
            pending_join: None,
            pending_screen: None,
            started_at: None,
            active_since: None,
            duration_seconds: 0,
            tick_period: config.duration_tick,
            ticker: None,
            warnings: VecDeque::new(),
            state_tx,
            metrics,
            mailbox: MailboxMonitor::new(ActorType::Session, user_id.to_string(), capacity),
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = SessionHandle {
            sender,
            cancel_token,
            user_id,
            conversation_id,
            state: state_rx,
        };

        (handle, task_handle)
    }

    /// Run the actor message loop.
    #[instrument(
        skip_all,
        name = "call.actor.session",
        fields(user_id = %self.user_id, conversation_id = %self.conversation_id)
    )]
    async fn run(mut self) {
        self.metrics.session_started();
        info!(
            target: "call.actor.session",
            user_id = %self.user_id,
            conversation_id = %self.conversation_id,
            "SessionActor started"
        );

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "call.actor.session",
                        user_id = %self.user_id,
                        "SessionActor received cancellation signal"
                    );
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.handle_message(message).await;
                            self.mailbox.record_processed(self.receiver.len());
                        }
                        None => {
                            info!(
                                target: "call.actor.session",
                                user_id = %self.user_id,
                                "SessionActor channel closed, exiting"
                            );
                            break;
                        }
                    }
                }

                Some(event) = self.internal_rx.recv() => {
                    self.handle_internal(event).await;
                }

                Some(event) = self.negotiator_events.recv() => {
                    self.handle_negotiator_event(event).await;
                }

                inbound = next_inbound(&mut self.subscription) => {
                    self.handle_inbound(inbound).await;
                }

                () = next_tick(&mut self.ticker) => {
                    self.on_tick().await;
                }
            }

            self.publish_state();
        }

        self.graceful_shutdown().await;
        self.publish_state();
        self.metrics.session_stopped();

        info!(
            target: "call.actor.session",
            user_id = %self.user_id,
            conversation_id = %self.conversation_id,
            messages_processed = self.mailbox.messages_processed(),
            "SessionActor stopped"
        );
    }

    /// Handle a single message.
    async fn handle_message(&mut self, message: SessionMessage) {
        match message {
            SessionMessage::Join {
                with_video,
                respond_to,
            } => self.handle_join(with_video, respond_to),

            SessionMessage::Leave { respond_to } => {
                self.handle_leave().await;
                let _ = respond_to.send(Ok(()));
            }

            SessionMessage::ToggleMute { respond_to } => {
                let _ = respond_to.send(self.toggle_mute());
            }

            SessionMessage::ToggleVideo { respond_to } => {
                let _ = respond_to.send(self.toggle_video());
            }

            SessionMessage::ToggleScreenShare { on, respond_to } => {
                if on {
                    self.start_screen_share(respond_to);
                } else {
                    self.stop_screen_share().await;
                    let _ = respond_to.send(Ok(()));
                }
            }

            SessionMessage::GetState { respond_to } => {
                let _ = respond_to.send(self.snapshot());
            }

            SessionMessage::ClearWarnings => self.warnings.clear(),

            SessionMessage::GetNegotiator { key, respond_to } => {
                let handle = self.registry(key.class).get(&key.remote_id).cloned();
                let _ = respond_to.send(handle);
            }
        }
    }

    async fn handle_internal(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::MediaAcquired(result) => self.finish_join(result).await,
            SessionEvent::ScreenAcquired(result) => self.finish_screen_share(result).await,
            SessionEvent::ScreenCaptureEnded { stream_id } => {
                let current = self.screen_stream.as_ref().map(LocalStream::id);
                if current == Some(stream_id) {
                    info!(
                        target: "call.actor.session",
                        user_id = %self.user_id,
                        "Screen capture ended by the platform"
                    );
                    self.stop_screen_share().await;
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Join / leave
    // ------------------------------------------------------------------------

    fn handle_join(
        &mut self,
        with_video: bool,
        respond_to: oneshot::Sender<Result<(), CallError>>,
    ) {
        match self.phase {
            SessionPhase::Idle => {}
            SessionPhase::Connecting | SessionPhase::Active => {
                let _ = respond_to.send(Err(CallError::AlreadyJoined));
                return;
            }
            SessionPhase::Ended => {
                let _ = respond_to.send(Err(CallError::InvalidPhase(SessionPhase::Ended)));
                return;
            }
        }

        self.phase = SessionPhase::Connecting;
        self.pending_join = Some(PendingJoin {
            with_video,
            respond_to,
        });

        info!(
            target: "call.actor.session",
            user_id = %self.user_id,
            conversation_id = %self.conversation_id,
            with_video,
            "Joining call"
        );

        // Device prompts may take arbitrarily long; keep the mailbox moving.
        let capture = self.capture.clone();
        let events = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = capture.acquire(with_video).await;
            let _ = events.send(SessionEvent::MediaAcquired(result));
        });
    }

    async fn finish_join(&mut self, result: Result<LocalStream, DeviceError>) {
        let Some(pending) = self.pending_join.take() else {
            // The join was aborted while acquisition was in flight.
            if let Ok(stream) = result {
                self.capture.release(&stream);
            }
            return;
        };

        let outcome = match result {
            Ok(stream) => self.activate(stream, pending.with_video).await,
            Err(e) => Err(CallError::Device(e)),
        };

        if let Err(e) = &outcome {
            warn!(
                target: "call.actor.session",
                user_id = %self.user_id,
                error = %e,
                category = e.category(),
                "Join failed, session ended"
            );
            self.rollback_join();
        }

        let _ = pending.respond_to.send(outcome);
    }

    /// Subscribe and announce presence with the acquired stream.
    async fn activate(&mut self, stream: LocalStream, with_video: bool) -> Result<(), CallError> {
        let subscription = match self.transport.subscribe(&self.conversation_id).await {
            Ok(subscription) => subscription,
            Err(e) => {
                call_metrics::record_transport_error("subscribe");
                self.capture.release(&stream);
                return Err(e.into());
            }
        };

        self.flags = LocalFlags {
            is_muted: false,
            is_video_enabled: stream.has_video(),
            is_screen_sharing: false,
        };
        self.local_stream = Some(stream);
        self.subscription = Some(subscription);

        let announce = SignalingEvent::join(
            self.user_id.clone(),
            self.conversation_id.clone(),
            with_video && self.flags.is_video_enabled,
        );
        self.transport
            .publish(&self.conversation_id, &announce)
            .await
            .inspect_err(|_| call_metrics::record_transport_error("publish"))?;

        let now = Instant::now();
        let mut ticker = tokio::time::interval_at(now + self.tick_period, self.tick_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.ticker = Some(ticker);
        self.active_since = Some(now);
        self.started_at = Some(Utc::now());
        self.duration_seconds = 0;
        self.phase = SessionPhase::Active;

        info!(
            target: "call.actor.session",
            user_id = %self.user_id,
            conversation_id = %self.conversation_id,
            video = self.flags.is_video_enabled,
            "Call active"
        );
        Ok(())
    }

    fn rollback_join(&mut self) {
        self.subscription = None;
        if let Some(stream) = self.local_stream.take() {
            self.capture.release(&stream);
        }
        self.flags = LocalFlags::default();
        self.phase = SessionPhase::Ended;
    }

    async fn handle_leave(&mut self) {
        match self.phase {
            SessionPhase::Ended => {
                debug!(
                    target: "call.actor.session",
                    user_id = %self.user_id,
                    "Leave on ended session ignored"
                );
            }
            SessionPhase::Idle => {
                self.phase = SessionPhase::Ended;
            }
            SessionPhase::Connecting => {
                if let Some(pending) = self.pending_join.take() {
                    let _ = pending.respond_to.send(Err(CallError::JoinAborted));
                }
                self.phase = SessionPhase::Ended;
                info!(
                    target: "call.actor.session",
                    user_id = %self.user_id,
                    "Join aborted by leave"
                );
            }
            SessionPhase::Active => self.teardown().await,
        }
    }

    async fn teardown(&mut self) {
        self.publish(SignalingEvent::leave(
            self.user_id.clone(),
            self.conversation_id.clone(),
        ))
        .await;

        self.subscription = None;
        self.ticker = None;
        self.active_since = None;
        self.started_at = None;
        self.duration_seconds = 0;

        self.screen_peers.remove_all().await;
        self.media_peers.remove_all().await;
        self.participants.clear();

        if let Some(respond_to) = self.pending_screen.take() {
            let _ = respond_to.send(Err(CallError::NotInCall));
        }
        if let Some(stream) = self.screen_stream.take() {
            self.capture.release(&stream);
        }
        if let Some(stream) = self.local_stream.take() {
            self.capture.release(&stream);
        }

        self.flags = LocalFlags::default();
        self.phase = SessionPhase::Ended;

        info!(
            target: "call.actor.session",
            user_id = %self.user_id,
            conversation_id = %self.conversation_id,
            "Left call"
        );
    }

    /// Leave the call if still in it.
    async fn graceful_shutdown(&mut self) {
        debug!(
            target: "call.actor.session",
            user_id = %self.user_id,
            phase = %self.phase,
            "Performing graceful shutdown"
        );
        self.handle_leave().await;
    }

    // ------------------------------------------------------------------------
    // Local media controls
    // ------------------------------------------------------------------------

    fn active_stream(&self) -> Result<&LocalStream, CallError> {
        match (&self.phase, &self.local_stream) {
            (SessionPhase::Active, Some(stream)) => Ok(stream),
            _ => Err(CallError::NotInCall),
        }
    }

    fn toggle_mute(&mut self) -> Result<bool, CallError> {
        let muted = !self.flags.is_muted;
        let stream = self.active_stream()?;
        if !self.capture.set_track_enabled(stream, TrackKind::Audio, !muted) {
            return Err(DeviceError::NotFound(TrackKind::Audio).into());
        }
        self.flags.is_muted = muted;
        Ok(muted)
    }

    fn toggle_video(&mut self) -> Result<bool, CallError> {
        let enabled = !self.flags.is_video_enabled;
        let stream = self.active_stream()?;
        if !self.capture.set_track_enabled(stream, TrackKind::Video, enabled) {
            return Err(DeviceError::NotFound(TrackKind::Video).into());
        }
        self.flags.is_video_enabled = enabled;
        Ok(enabled)
    }

    fn start_screen_share(&mut self, respond_to: oneshot::Sender<Result<(), CallError>>) {
        if self.phase != SessionPhase::Active {
            let _ = respond_to.send(Err(CallError::NotInCall));
            return;
        }
        if self.screen_stream.is_some() || self.pending_screen.is_some() {
            let _ = respond_to.send(Ok(()));
            return;
        }

        self.pending_screen = Some(respond_to);

        let capture = self.capture.clone();
        let events = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = capture.acquire_screen().await;
            let _ = events.send(SessionEvent::ScreenAcquired(result));
        });
    }

    async fn finish_screen_share(&mut self, result: Result<LocalStream, DeviceError>) {
        let respond_to = self.pending_screen.take();

        let outcome = match result {
            Ok(stream) if self.phase != SessionPhase::Active || respond_to.is_none() => {
                self.capture.release(&stream);
                Err(CallError::NotInCall)
            }
            Ok(stream) => {
                self.watch_screen_capture(&stream);
                self.screen_stream = Some(stream);
                self.flags.is_screen_sharing = true;

                let remotes = self.media_peers.remote_ids();
                info!(
                    target: "call.actor.session",
                    user_id = %self.user_id,
                    peers = remotes.len(),
                    "Screen share started"
                );
                for remote in &remotes {
                    self.offer_screen(remote);
                }
                Ok(())
            }
            Err(e) => {
                // Not fatal: the call continues without a screen share.
                warn!(
                    target: "call.actor.session",
                    user_id = %self.user_id,
                    error = %e,
                    "Screen capture failed"
                );
                Err(CallError::Device(e))
            }
        };

        if let Some(respond_to) = respond_to {
            let _ = respond_to.send(outcome);
        }
    }

    /// Report when the platform ends the screen capture on its own.
    fn watch_screen_capture(&self, stream: &LocalStream) {
        let Some(track) = stream.track(TrackKind::Video) else {
            return;
        };
        let ended = track.ended_token();
        let stream_id = stream.id();
        let events = self.internal_tx.clone();
        let cancel_token = self.cancel_token.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = ended.cancelled() => {
                    let _ = events.send(SessionEvent::ScreenCaptureEnded { stream_id });
                }
                () = cancel_token.cancelled() => {}
            }
        });
    }

    async fn stop_screen_share(&mut self) {
        if let Some(respond_to) = self.pending_screen.take() {
            let _ = respond_to.send(Err(CallError::NotInCall));
        }
        let Some(stream) = self.screen_stream.take() else {
            return;
        };

        self.flags.is_screen_sharing = false;
        self.publish(SignalingEvent::screen_stop(
            self.user_id.clone(),
            self.conversation_id.clone(),
        ))
        .await;

        // Each pair shares one screen connection; sharers re-offer after
        // receiving our screen-stop.
        self.screen_peers.remove_all().await;
        self.participants.clear_all_screens();
        self.capture.release(&stream);

        info!(
            target: "call.actor.session",
            user_id = %self.user_id,
            "Screen share stopped"
        );
    }

    fn local_tracks(&self) -> Vec<LocalTrack> {
        self.local_stream
            .as_ref()
            .map(|stream| stream.tracks().to_vec())
            .unwrap_or_default()
    }

    fn screen_tracks(&self) -> Vec<LocalTrack> {
        self.screen_stream
            .as_ref()
            .map(|stream| stream.tracks().to_vec())
            .unwrap_or_default()
    }

    fn offer_screen(&mut self, remote_id: &UserId) {
        let tracks = self.screen_tracks();
        let handle = self.screen_peers.replace(remote_id, Role::Caller);
        if let Err(e) = handle.initiate_as_caller(tracks) {
            warn!(
                target: "call.actor.session",
                remote_id = %remote_id,
                error = %e,
                "Failed to start screen offer"
            );
            self.screen_peers.remove(remote_id);
        }
    }

    // ------------------------------------------------------------------------
    // Inbound signaling
    // ------------------------------------------------------------------------

    async fn handle_inbound(&mut self, inbound: Option<SignalingEvent>) {
        let Some(event) = inbound else {
            self.subscription = None;
            if self.phase == SessionPhase::Active {
                call_metrics::record_transport_error("subscription");
                warn!(
                    target: "call.actor.session",
                    user_id = %self.user_id,
                    conversation_id = %self.conversation_id,
                    "Signaling subscription ended"
                );
                self.push_warning(SessionWarning::SignalingLost);
            }
            return;
        };

        if self.phase != SessionPhase::Active {
            return;
        }

        match self.router.route(&event) {
            RouteAction::Ignore(_) => {}
            RouteAction::PeerJoined { remote, video } => self.on_peer_joined(&remote, video),
            RouteAction::AcceptOffer { key, offer } => self.on_offer(&key, offer),
            RouteAction::CompleteAnswer { key, answer } => self.on_answer(&key, answer),
            RouteAction::RemoteCandidate { key, candidate } => self.on_candidate(&key, candidate),
            RouteAction::PeerLeft { remote } => self.on_peer_left(&remote),
            RouteAction::ScreenStopped { remote } => self.on_screen_stopped(&remote),
            RouteAction::Malformed { key, error } => {
                warn!(
                    target: "call.actor.session",
                    key = %key,
                    error = %error,
                    "Malformed negotiation payload"
                );
                self.drop_peer(&key, "malformed payload");
            }
        }
    }

    fn on_peer_joined(&mut self, remote_id: &UserId, video: bool) {
        info!(
            target: "call.actor.session",
            remote_id = %remote_id,
            video,
            "Peer joined, sending offer"
        );
        self.participants.upsert_from_join(remote_id, video);

        let tracks = self.local_tracks();
        let handle = self.media_peers.replace(remote_id, Role::Caller);
        if let Err(e) = handle.initiate_as_caller(tracks) {
            self.drop_peer(&NegotiatorKey::media(remote_id.clone()), &e.to_string());
            return;
        }

        if self.screen_stream.is_some() {
            self.offer_screen(remote_id);
        }
    }

    fn on_offer(&mut self, key: &NegotiatorKey, offer: SessionDescription) {
        let tracks = match key.class {
            StreamClass::Media => self.local_tracks(),
            StreamClass::Screen => self.screen_tracks(),
        };
        let keep_own_offer = self.user_id < key.remote_id;
        let registry = match key.class {
            StreamClass::Media => &mut self.media_peers,
            StreamClass::Screen => &mut self.screen_peers,
        };

        if registry.awaiting_answer(&key.remote_id) && keep_own_offer {
            warn!(
                target: "call.actor.session",
                key = %key,
                "Offer collision, keeping local offer"
            );
            return;
        }

        let handle = registry.replace(&key.remote_id, Role::Callee);
        if let Err(e) = handle.accept_offer(offer, tracks) {
            self.drop_peer(key, &e.to_string());
        }
    }

    fn on_answer(&mut self, key: &NegotiatorKey, answer: SessionDescription) {
        let registry = match key.class {
            StreamClass::Media => &mut self.media_peers,
            StreamClass::Screen => &mut self.screen_peers,
        };

        let handle = match registry.get(&key.remote_id) {
            Some(handle) if registry.awaiting_answer(&key.remote_id) => handle.clone(),
            _ => {
                warn!(
                    target: "call.actor.session",
                    key = %key,
                    "Answer with no pending offer ignored"
                );
                return;
            }
        };

        registry.mark_answered(&key.remote_id);
        if let Err(e) = handle.complete_as_caller(answer) {
            self.drop_peer(key, &e.to_string());
        }
    }

    fn on_candidate(&mut self, key: &NegotiatorKey, candidate: IceCandidate) {
        let registry = match key.class {
            StreamClass::Media => &mut self.media_peers,
            StreamClass::Screen => &mut self.screen_peers,
        };
        registry.deliver_candidate(&key.remote_id, candidate);
    }

    fn on_peer_left(&mut self, remote_id: &UserId) {
        self.participants.remove(remote_id);
        self.screen_peers.remove(remote_id);
        self.media_peers.remove(remote_id);
        info!(
            target: "call.actor.session",
            remote_id = %remote_id,
            remaining = self.participants.len(),
            "Peer left"
        );
    }

    fn on_screen_stopped(&mut self, remote_id: &UserId) {
        self.screen_peers.remove(remote_id);
        self.participants.clear_screen(remote_id);

        if self.screen_stream.is_some() && self.media_peers.get(remote_id).is_some() {
            debug!(
                target: "call.actor.session",
                remote_id = %remote_id,
                "Re-offering local screen share"
            );
            self.offer_screen(remote_id);
        }
    }

    /// Remove one failed negotiator and whatever depended on it.
    fn drop_peer(&mut self, key: &NegotiatorKey, reason: &str) {
        match key.class {
            StreamClass::Media => {
                self.media_peers.remove(&key.remote_id);
                self.screen_peers.remove(&key.remote_id);
                self.participants.remove(&key.remote_id);
                self.push_warning(SessionWarning::PeerDropped {
                    remote_id: key.remote_id.clone(),
                    reason: reason.to_string(),
                });
            }
            StreamClass::Screen => {
                self.screen_peers.remove(&key.remote_id);
                self.participants.clear_screen(&key.remote_id);
            }
        }

        warn!(
            target: "call.actor.session",
            key = %key,
            reason,
            "Peer connection dropped"
        );
    }

    // ------------------------------------------------------------------------
    // Negotiator output
    // ------------------------------------------------------------------------

    async fn handle_negotiator_event(&mut self, event: NegotiatorEvent) {
        let NegotiatorEvent {
            key,
            generation,
            output,
        } = event;

        if !self.registry(key.class).is_current(&key.remote_id, generation) {
            debug!(
                target: "call.actor.session",
                key = %key,
                generation,
                "Output from replaced negotiator dropped"
            );
            return;
        }

        match output {
            NegotiatorOutput::LocalDescription(description) => {
                let event = SignalingEvent::description(
                    key.class,
                    self.user_id.clone(),
                    key.remote_id.clone(),
                    self.conversation_id.clone(),
                    description,
                );
                self.publish(event).await;
            }
            NegotiatorOutput::LocalCandidate(candidate) => {
                let event = SignalingEvent::candidate(
                    key.class,
                    self.user_id.clone(),
                    key.remote_id.clone(),
                    self.conversation_id.clone(),
                    candidate,
                );
                self.publish(event).await;
            }
            NegotiatorOutput::RemoteTrack(track) => {
                self.participants.attach_track(&key.remote_id, key.class, track);
            }
            NegotiatorOutput::Connected => {
                info!(
                    target: "call.actor.session",
                    key = %key,
                    "Peer connected"
                );
            }
            NegotiatorOutput::Terminated(reason) => {
                self.drop_peer(&key, reason.as_str());
            }
        }
    }

    async fn on_tick(&mut self) {
        if let Some(since) = self.active_since {
            self.duration_seconds = since.elapsed().as_secs();
        }

        // Terminated is sent before the task ends; apply it before reaping.
        while let Ok(event) = self.negotiator_events.try_recv() {
            self.handle_negotiator_event(event).await;
        }

        for remote_id in self.media_peers.reap_finished().await {
            self.drop_peer(&NegotiatorKey::media(remote_id), "negotiator exited");
        }
        for remote_id in self.screen_peers.reap_finished().await {
            self.drop_peer(&NegotiatorKey::screen(remote_id), "negotiator exited");
        }

        self.media_peers.expire_stash();
        self.screen_peers.expire_stash();
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    /// Publish an event. Failures become a session warning.
    async fn publish(&mut self, event: SignalingEvent) {
        if let Err(e) = self.transport.publish(&self.conversation_id, &event).await {
            self.record_publish_failure(&event, &e);
        }
    }

    fn record_publish_failure(&mut self, event: &SignalingEvent, error: &TransportError) {
        call_metrics::record_transport_error("publish");
        warn!(
            target: "call.actor.session",
            user_id = %self.user_id,
            event_type = event.event_type.as_str(),
            error = %error,
            "Failed to publish signaling event"
        );
        self.push_warning(SessionWarning::PublishFailed {
            event_type: event.event_type.as_str().to_string(),
            reason: error.to_string(),
        });
    }

    fn push_warning(&mut self, warning: SessionWarning) {
        if self.warnings.len() >= MAX_WARNINGS {
            self.warnings.pop_front();
        }
        self.warnings.push_back(warning);
    }

    fn registry(&self, class: StreamClass) -> &PeerConnectionRegistry {
        match class {
            StreamClass::Media => &self.media_peers,
            StreamClass::Screen => &self.screen_peers,
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            user_id: self.user_id.clone(),
            conversation_id: self.conversation_id.clone(),
            phase: self.phase,
            flags: self.flags,
            duration_seconds: self.duration_seconds,
            started_at: self.started_at,
            participants: self.participants.snapshot(),
            media_peers: self.media_peers.remote_ids(),
            screen_peers: self.screen_peers.remote_ids(),
            warnings: self.warnings.iter().cloned().collect(),
        }
    }

    fn publish_state(&self) {
        self.state_tx.send_replace(self.snapshot());
    }
}

async fn next_inbound(subscription: &mut Option<SignalingSubscription>) -> Option<SignalingEvent> {
    match subscription {
        Some(subscription) => subscription.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("user_id", &self.user_id)
            .field("conversation_id", &self.conversation_id)
            .finish_non_exhaustive()
    }
}
