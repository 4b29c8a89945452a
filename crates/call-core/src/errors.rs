//! Call core error types.
//!
//! Errors are grouped by where they are contained:
//! - `DeviceError`: capture failures, fatal to `join`, surfaced to the UI
//! - `NegotiationError`: one peer's negotiation failed, that negotiator is removed
//! - `TransportError`: signaling publish/subscribe failures, surfaced as a session warning
//!
//! `CallError` is what every `SessionHandle` command returns.

use crate::actors::messages::{NegotiatorState, SessionPhase};
use crate::media::TrackKind;
use std::time::Duration;
use thiserror::Error;

/// Top-level error returned by session commands.
#[derive(Debug, Error)]
pub enum CallError {
    /// Local capture failed.
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    /// A negotiation step failed.
    #[error("Negotiation error: {0}")]
    Negotiation(#[from] NegotiationError),

    /// The signaling transport failed.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Command not allowed in the current phase.
    #[error("Operation not allowed while session is {0}")]
    InvalidPhase(SessionPhase),

    /// `join` called on a session that is already connecting or active.
    #[error("Session already joined")]
    AlreadyJoined,

    /// Command needs an active call (local media present).
    #[error("Not in a call")]
    NotInCall,

    /// `leave` arrived while the join was still acquiring devices.
    #[error("Join aborted by leave")]
    JoinAborted,

    /// Actor channel failure.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CallError {
    /// Bounded category name, used as a metric label.
    #[must_use]
    pub const fn category(&self) -> &'static str {
        match self {
            CallError::Device(_) => "device",
            CallError::Negotiation(_) => "negotiation",
            CallError::Transport(_) => "transport",
            CallError::InvalidPhase(_) | CallError::AlreadyJoined | CallError::NotInCall => {
                "state"
            }
            CallError::JoinAborted => "aborted",
            CallError::Internal(_) => "internal",
        }
    }
}

/// Capture acquisition or permission failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    /// The user (or OS policy) denied access.
    #[error("Permission denied")]
    PermissionDenied,

    /// No device of this kind is present.
    #[error("No {0} device found")]
    NotFound(TrackKind),

    /// The device is in use by another application.
    #[error("{0} device is busy")]
    Busy(TrackKind),

    /// The platform cannot provide this kind of capture.
    #[error("Unsupported capture: {0}")]
    Unsupported(String),

    /// Any other backend failure.
    #[error("Capture backend error: {0}")]
    Backend(String),
}

/// Failure of a single `(remote_id, stream_class)` negotiation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NegotiationError {
    /// The signaling payload could not be decoded or has the wrong shape.
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    /// The operation does not apply in the negotiator's current state.
    #[error("{operation} not allowed in state {state}")]
    OutOfOrder {
        operation: &'static str,
        state: NegotiatorState,
    },

    /// The underlying peer connection rejected an operation.
    #[error("Peer connection error: {0}")]
    Peer(String),

    /// The negotiation did not reach Connected in time.
    #[error("Negotiation timed out after {0:?}")]
    Timeout(Duration),

    /// The negotiator was closed.
    #[error("Negotiator closed")]
    Closed,

    /// The negotiator mailbox is full.
    #[error("Negotiator mailbox full")]
    Backpressure,
}

/// Signaling transport failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Subscribing to the conversation channel failed.
    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    /// Publishing an event failed.
    #[error("Publish failed: {0}")]
    Publish(String),

    /// The transport has shut down.
    #[error("Transport closed")]
    Closed,

    /// An event could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        TransportError::Serialization(err.to_string())
    }
}
