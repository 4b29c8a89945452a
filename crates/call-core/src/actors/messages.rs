//! Message types for actor communication.
//!
//! The session actor receives `SessionMessage` from its handle and
//! `NegotiatorEvent` from its negotiators. Negotiators receive
//! `NegotiatorMessage` from the session. Request-reply uses
//! `tokio::sync::oneshot`.

use chrono::{DateTime, Utc};
use common::types::{ConversationId, StreamId, UserId};
use std::fmt;
use tokio::sync::oneshot;

use super::negotiator::NegotiatorHandle;
use super::participants::Participant;
use crate::errors::{CallError, DeviceError, NegotiationError};
use crate::media::{LocalStream, LocalTrack};
use crate::peer::{IceCandidate, RemoteTrack, SessionDescription, TransportState};

/// Messages sent to `SessionActor` by its handle.
#[derive(Debug)]
pub enum SessionMessage {
    /// Acquire local media and announce presence.
    Join {
        with_video: bool,
        respond_to: oneshot::Sender<Result<(), CallError>>,
    },

    /// Announce departure and tear everything down.
    Leave {
        respond_to: oneshot::Sender<Result<(), CallError>>,
    },

    /// Flip the local audio track. Responds with the new muted flag.
    ToggleMute {
        respond_to: oneshot::Sender<Result<bool, CallError>>,
    },

    /// Flip the local video track. Responds with the new enabled flag.
    ToggleVideo {
        respond_to: oneshot::Sender<Result<bool, CallError>>,
    },

    /// Start or stop sharing the screen with every media peer.
    ToggleScreenShare {
        on: bool,
        respond_to: oneshot::Sender<Result<(), CallError>>,
    },

    /// Get current session state.
    GetState {
        respond_to: oneshot::Sender<SessionSnapshot>,
    },

    /// Acknowledge every warning shown so far.
    ClearWarnings,

    /// Look up the live negotiator for a key.
    GetNegotiator {
        key: NegotiatorKey,
        respond_to: oneshot::Sender<Option<NegotiatorHandle>>,
    },
}

/// Results of work the session actor started off its own task.
#[derive(Debug)]
pub(crate) enum SessionEvent {
    MediaAcquired(Result<LocalStream, DeviceError>),
    ScreenAcquired(Result<LocalStream, DeviceError>),
    ScreenCaptureEnded { stream_id: StreamId },
}

/// Messages sent to a `NegotiatorActor`.
#[derive(Debug)]
pub enum NegotiatorMessage {
    /// Attach `tracks`, create an offer and set it locally.
    InitiateAsCaller { tracks: Vec<LocalTrack> },

    /// Set `offer` remotely, attach `tracks`, create and set an answer.
    AcceptOffer {
        offer: SessionDescription,
        tracks: Vec<LocalTrack>,
    },

    /// Set the callee's answer remotely.
    CompleteAsCaller { answer: SessionDescription },

    /// Apply a remote candidate, or hold it until a remote description exists.
    AddRemoteCandidate { candidate: IceCandidate },

    /// Get current negotiator state.
    GetState {
        respond_to: oneshot::Sender<NegotiatorSnapshot>,
    },
}

/// Output of a negotiator, tagged with its key and generation.
#[derive(Debug)]
pub struct NegotiatorEvent {
    pub key: NegotiatorKey,
    /// Distinguishes a replaced negotiator's late output from its successor's.
    pub generation: u64,
    pub output: NegotiatorOutput,
}

#[derive(Debug)]
pub enum NegotiatorOutput {
    /// A local description was set and must be sent to the remote.
    LocalDescription(SessionDescription),
    /// A local candidate was gathered and must be sent to the remote.
    LocalCandidate(IceCandidate),
    /// A remote media track arrived.
    RemoteTrack(RemoteTrack),
    /// Transport reached Connected.
    Connected,
    /// The negotiator stopped on its own. It will produce no further output.
    Terminated(TerminationReason),
}

/// Why a negotiator stopped without being closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    /// Transport reported Disconnected or Closed.
    Disconnected,
    /// Transport reported Failed.
    Failed,
    /// A negotiation step failed or timed out.
    Error(NegotiationError),
}

impl TerminationReason {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            TerminationReason::Disconnected => "disconnected",
            TerminationReason::Failed => "failed",
            TerminationReason::Error(NegotiationError::Timeout(_)) => "timeout",
            TerminationReason::Error(_) => "error",
        }
    }

    /// The termination a transport state implies, if any.
    #[must_use]
    pub const fn from_transport(state: TransportState) -> Option<Self> {
        match state {
            TransportState::Disconnected | TransportState::Closed => {
                Some(TerminationReason::Disconnected)
            }
            TransportState::Failed => Some(TerminationReason::Failed),
            TransportState::New | TransportState::Connecting | TransportState::Connected => None,
        }
    }
}

// ----------------------------------------------------------------------------
// Supporting Types
// ----------------------------------------------------------------------------

/// Lifecycle phase of a call session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Constructed, not joined.
    Idle,
    /// Acquiring local media and subscribing.
    Connecting,
    /// Join announced.
    Active,
    /// Left, or the join failed. Terminal.
    Ended,
}

impl SessionPhase {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            SessionPhase::Idle => "idle",
            SessionPhase::Connecting => "connecting",
            SessionPhase::Active => "active",
            SessionPhase::Ended => "ended",
        }
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which of the two parallel connections to a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StreamClass {
    /// Camera and microphone.
    Media,
    /// Display capture.
    Screen,
}

impl StreamClass {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            StreamClass::Media => "media",
            StreamClass::Screen => "screen",
        }
    }
}

impl fmt::Display for StreamClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a negotiator: at most one exists per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NegotiatorKey {
    pub remote_id: UserId,
    pub class: StreamClass,
}

impl NegotiatorKey {
    #[must_use]
    pub fn new(remote_id: UserId, class: StreamClass) -> Self {
        Self { remote_id, class }
    }

    #[must_use]
    pub fn media(remote_id: UserId) -> Self {
        Self::new(remote_id, StreamClass::Media)
    }

    #[must_use]
    pub fn screen(remote_id: UserId) -> Self {
        Self::new(remote_id, StreamClass::Screen)
    }
}

impl fmt::Display for NegotiatorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.remote_id, self.class)
    }
}

/// Which side of the offer/answer exchange a negotiator is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Caller,
    Callee,
}

/// Negotiator state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiatorState {
    New,
    LocalDescriptionSet,
    RemoteDescriptionSet,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl NegotiatorState {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            NegotiatorState::New => "new",
            NegotiatorState::LocalDescriptionSet => "local_description_set",
            NegotiatorState::RemoteDescriptionSet => "remote_description_set",
            NegotiatorState::Connected => "connected",
            NegotiatorState::Disconnected => "disconnected",
            NegotiatorState::Failed => "failed",
            NegotiatorState::Closed => "closed",
        }
    }

    /// No further transitions happen from a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            NegotiatorState::Disconnected | NegotiatorState::Failed | NegotiatorState::Closed
        )
    }
}

impl fmt::Display for NegotiatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Negotiator state (for debugging and tests).
#[derive(Debug, Clone)]
pub struct NegotiatorSnapshot {
    pub key: NegotiatorKey,
    pub generation: u64,
    pub role: Option<Role>,
    pub state: NegotiatorState,
    pub has_local_description: bool,
    pub has_remote_description: bool,
    /// Remote candidates waiting for a remote description.
    pub pending_candidates: usize,
    /// Remote candidates handed to the peer connection.
    pub applied_candidates: usize,
    pub attached_tracks: usize,
}

/// Local media flags, as shown by the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LocalFlags {
    pub is_muted: bool,
    pub is_video_enabled: bool,
    pub is_screen_sharing: bool,
}

/// Non-fatal problem surfaced to the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionWarning {
    /// An outbound signaling event could not be published.
    PublishFailed { event_type: String, reason: String },
    /// The signaling subscription ended. No automatic reconnect happens.
    SignalingLost,
    /// A peer's connection was dropped.
    PeerDropped { remote_id: UserId, reason: String },
}

impl fmt::Display for SessionWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionWarning::PublishFailed { event_type, reason } => {
                write!(f, "failed to send {event_type}: {reason}")
            }
            SessionWarning::SignalingLost => f.write_str("signaling connection lost"),
            SessionWarning::PeerDropped { remote_id, reason } => {
                write!(f, "connection to {remote_id} dropped: {reason}")
            }
        }
    }
}

/// Observable session state.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub user_id: UserId,
    pub conversation_id: ConversationId,
    pub phase: SessionPhase,
    pub flags: LocalFlags,
    /// Whole seconds since the call became active. Zero when not active.
    pub duration_seconds: u64,
    pub started_at: Option<DateTime<Utc>>,
    /// Sorted by user id.
    pub participants: Vec<Participant>,
    /// Remotes with a live media negotiator, sorted.
    pub media_peers: Vec<UserId>,
    /// Remotes with a live screen negotiator, sorted.
    pub screen_peers: Vec<UserId>,
    /// Unacknowledged warnings, oldest first.
    pub warnings: Vec<SessionWarning>,
}

impl SessionSnapshot {
    pub(crate) fn idle(user_id: UserId, conversation_id: ConversationId) -> Self {
        Self {
            user_id,
            conversation_id,
            phase: SessionPhase::Idle,
            flags: LocalFlags::default(),
            duration_seconds: 0,
            started_at: None,
            participants: Vec::new(),
            media_peers: Vec::new(),
            screen_peers: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Participant entry for `user_id`, if present.
    #[must_use]
    pub fn participant(&self, user_id: &UserId) -> Option<&Participant> {
        self.participants.iter().find(|p| &p.user_id == user_id)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_negotiator_key_display() {
        let key = NegotiatorKey::screen(UserId::from("bob"));
        assert_eq!(key.to_string(), "bob/screen");
        assert_eq!(key.class, StreamClass::Screen);
    }

    #[test]
    fn test_terminal_states() {
        assert!(NegotiatorState::Failed.is_terminal());
        assert!(NegotiatorState::Closed.is_terminal());
        assert!(!NegotiatorState::Connected.is_terminal());
        assert!(!NegotiatorState::LocalDescriptionSet.is_terminal());
    }

    #[test]
    fn test_transport_state_to_termination() {
        assert_eq!(
            TerminationReason::from_transport(TransportState::Failed),
            Some(TerminationReason::Failed)
        );
        assert_eq!(
            TerminationReason::from_transport(TransportState::Closed),
            Some(TerminationReason::Disconnected)
        );
        assert_eq!(
            TerminationReason::from_transport(TransportState::Connecting),
            None
        );
    }

    #[test]
    fn test_termination_labels() {
        assert_eq!(
            TerminationReason::Error(NegotiationError::Timeout(Duration::from_secs(1))).as_str(),
            "timeout"
        );
        assert_eq!(TerminationReason::Failed.as_str(), "failed");
    }

    #[test]
    fn test_warning_display() {
        let warning = SessionWarning::PublishFailed {
            event_type: "offer".to_string(),
            reason: "offline".to_string(),
        };
        assert_eq!(warning.to_string(), "failed to send offer: offline");
    }
}
