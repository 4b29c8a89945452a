//! Signaling Router.
//!
//! Pure dispatch of inbound events to [`RouteAction`]s. The session actor
//! applies the actions; the router owns no state besides the local identity.
//!
//! | Inbound type | Precondition | Action |
//! |--------------|--------------|--------|
//! | `join` | sender is not self | [`RouteAction::PeerJoined`] |
//! | `offer`, `screen-offer` | targeted at self | [`RouteAction::AcceptOffer`] |
//! | `answer`, `screen-answer` | targeted at self | [`RouteAction::CompleteAnswer`] |
//! | `ice-candidate`, `ice-candidate-screen` | targeted at self | [`RouteAction::RemoteCandidate`] |
//! | `leave` | sender is not self | [`RouteAction::PeerLeft`] |
//! | `screen-stop` | sender is not self | [`RouteAction::ScreenStopped`] |
//!
//! Everything else, including every event this client sent itself, is
//! [`RouteAction::Ignore`].

use common::types::{ConversationId, UserId};
use tracing::debug;

use super::event::{EventType, SignalingEvent};
use crate::actors::messages::{NegotiatorKey, StreamClass};
use crate::errors::NegotiationError;
use crate::observability::metrics;
use crate::peer::{IceCandidate, SessionDescription};

/// Why an event was ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Broadcast echo of this client's own event.
    SelfEcho,
    /// Negotiation event addressed to another participant, or to nobody.
    NotAddressed,
    /// Event for a different conversation on a shared transport.
    OtherConversation,
}

impl IgnoreReason {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            IgnoreReason::SelfEcho => "self",
            IgnoreReason::NotAddressed => "not_addressed",
            IgnoreReason::OtherConversation => "other_conversation",
        }
    }
}

/// What the session must do with an inbound event.
#[derive(Debug, Clone, PartialEq)]
pub enum RouteAction {
    Ignore(IgnoreReason),
    /// Become caller towards `remote`.
    PeerJoined { remote: UserId, video: bool },
    /// Become callee for `key`.
    AcceptOffer {
        key: NegotiatorKey,
        offer: SessionDescription,
    },
    CompleteAnswer {
        key: NegotiatorKey,
        answer: SessionDescription,
    },
    RemoteCandidate {
        key: NegotiatorKey,
        candidate: IceCandidate,
    },
    PeerLeft { remote: UserId },
    ScreenStopped { remote: UserId },
    /// The event was addressed to us but its payload is unusable.
    Malformed {
        key: NegotiatorKey,
        error: NegotiationError,
    },
}

impl RouteAction {
    fn disposition(&self) -> &'static str {
        match self {
            RouteAction::Ignore(reason) => reason.as_str(),
            RouteAction::Malformed { .. } => "malformed",
            _ => "routed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SignalingRouter {
    self_id: UserId,
    conversation_id: ConversationId,
}

impl SignalingRouter {
    #[must_use]
    pub fn new(self_id: UserId, conversation_id: ConversationId) -> Self {
        Self {
            self_id,
            conversation_id,
        }
    }

    /// Classify one inbound event.
    #[must_use]
    pub fn route(&self, event: &SignalingEvent) -> RouteAction {
        let action = self.classify(event);

        metrics::record_signaling_event(event.event_type.as_str(), action.disposition());
        debug!(
            target: "call.signaling.router",
            event_type = event.event_type.as_str(),
            sender_id = %event.sender_id,
            disposition = action.disposition(),
            "Routed signaling event"
        );

        action
    }

    fn classify(&self, event: &SignalingEvent) -> RouteAction {
        if event.conversation_id != self.conversation_id {
            return RouteAction::Ignore(IgnoreReason::OtherConversation);
        }
        if event.sender_id == self.self_id {
            return RouteAction::Ignore(IgnoreReason::SelfEcho);
        }
        if event.event_type.is_targeted() && event.target_id.as_ref() != Some(&self.self_id) {
            return RouteAction::Ignore(IgnoreReason::NotAddressed);
        }

        let remote = event.sender_id.clone();

        match event.event_type {
            EventType::Join => RouteAction::PeerJoined {
                remote,
                video: event.join_payload().video,
            },
            EventType::Leave => RouteAction::PeerLeft { remote },
            EventType::ScreenStop => RouteAction::ScreenStopped { remote },
            EventType::Offer
            | EventType::ScreenOffer
            | EventType::Answer
            | EventType::ScreenAnswer => {
                let key = Self::key_for(event, remote);
                let is_offer =
                    matches!(event.event_type, EventType::Offer | EventType::ScreenOffer);
                match event.session_description() {
                    Ok(description) if is_offer => RouteAction::AcceptOffer {
                        key,
                        offer: description,
                    },
                    Ok(description) => RouteAction::CompleteAnswer {
                        key,
                        answer: description,
                    },
                    Err(error) => RouteAction::Malformed { key, error },
                }
            }
            EventType::IceCandidate | EventType::IceCandidateScreen => {
                let key = Self::key_for(event, remote);
                match event.ice_candidate() {
                    Ok(candidate) => RouteAction::RemoteCandidate { key, candidate },
                    Err(error) => RouteAction::Malformed { key, error },
                }
            }
        }
    }

    fn key_for(event: &SignalingEvent, remote: UserId) -> NegotiatorKey {
        // Targeted types always carry a class.
        let class = event
            .event_type
            .stream_class()
            .unwrap_or(StreamClass::Media);
        NegotiatorKey::new(remote, class)
    }
}
