//! Signaling event wire format.
//!
//! Every event is a JSON object broadcast on the conversation channel:
//!
//! ```json
//! {"type":"offer","sender_id":"alice","target_id":"bob","conversation_id":"c1",
//!  "payload":{"sdp":{"type":"offer","sdp":"v=0..."}}}
//! ```
//!
//! | type | payload |
//! |------|---------|
//! | `join` | `{"video": bool}` |
//! | `leave`, `screen-stop` | `{}` |
//! | `offer`, `answer`, `screen-offer`, `screen-answer` | `{"sdp": SessionDescription}` |
//! | `ice-candidate`, `ice-candidate-screen` | `{"candidate": IceCandidate}` |

use common::types::{ConversationId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

use crate::actors::messages::StreamClass;
use crate::errors::{NegotiationError, TransportError};
use crate::peer::{IceCandidate, SdpType, SessionDescription};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventType {
    Join,
    Leave,
    Offer,
    Answer,
    IceCandidate,
    ScreenOffer,
    ScreenAnswer,
    IceCandidateScreen,
    ScreenStop,
}

impl EventType {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            EventType::Join => "join",
            EventType::Leave => "leave",
            EventType::Offer => "offer",
            EventType::Answer => "answer",
            EventType::IceCandidate => "ice-candidate",
            EventType::ScreenOffer => "screen-offer",
            EventType::ScreenAnswer => "screen-answer",
            EventType::IceCandidateScreen => "ice-candidate-screen",
            EventType::ScreenStop => "screen-stop",
        }
    }

    /// Negotiation events are addressed to one recipient; the rest are broadcast.
    #[must_use]
    pub const fn is_targeted(&self) -> bool {
        matches!(
            self,
            EventType::Offer
                | EventType::Answer
                | EventType::IceCandidate
                | EventType::ScreenOffer
                | EventType::ScreenAnswer
                | EventType::IceCandidateScreen
        )
    }

    /// Stream class a negotiation event belongs to.
    #[must_use]
    pub const fn stream_class(&self) -> Option<StreamClass> {
        match self {
            EventType::Offer | EventType::Answer | EventType::IceCandidate => {
                Some(StreamClass::Media)
            }
            EventType::ScreenOffer | EventType::ScreenAnswer | EventType::IceCandidateScreen => {
                Some(StreamClass::Screen)
            }
            EventType::Join | EventType::Leave | EventType::ScreenStop => None,
        }
    }

    #[must_use]
    pub const fn description(class: StreamClass, sdp_type: SdpType) -> Self {
        match (class, sdp_type) {
            (StreamClass::Media, SdpType::Offer) => EventType::Offer,
            (StreamClass::Media, SdpType::Answer) => EventType::Answer,
            (StreamClass::Screen, SdpType::Offer) => EventType::ScreenOffer,
            (StreamClass::Screen, SdpType::Answer) => EventType::ScreenAnswer,
        }
    }

    #[must_use]
    pub const fn candidate(class: StreamClass) -> Self {
        match class {
            StreamClass::Media => EventType::IceCandidate,
            StreamClass::Screen => EventType::IceCandidateScreen,
        }
    }

    /// SDP type an offer/answer event must carry.
    const fn expected_sdp_type(&self) -> Option<SdpType> {
        match self {
            EventType::Offer | EventType::ScreenOffer => Some(SdpType::Offer),
            EventType::Answer | EventType::ScreenAnswer => Some(SdpType::Answer),
            _ => None,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct JoinPayload {
    #[serde(default)]
    pub video: bool,
}

#[derive(Serialize, Deserialize)]
struct DescriptionPayload {
    sdp: SessionDescription,
}

#[derive(Serialize, Deserialize)]
struct CandidatePayload {
    candidate: IceCandidate,
}

/// A signaling message. Relayed, never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalingEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub sender_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<UserId>,
    pub conversation_id: ConversationId,
    #[serde(default)]
    pub payload: Value,
}

impl SignalingEvent {
    #[must_use]
    pub fn join(sender_id: UserId, conversation_id: ConversationId, video: bool) -> Self {
        Self {
            event_type: EventType::Join,
            sender_id,
            target_id: None,
            conversation_id,
            payload: json!({ "video": video }),
        }
    }

    #[must_use]
    pub fn leave(sender_id: UserId, conversation_id: ConversationId) -> Self {
        Self {
            event_type: EventType::Leave,
            sender_id,
            target_id: None,
            conversation_id,
            payload: json!({}),
        }
    }

    #[must_use]
    pub fn screen_stop(sender_id: UserId, conversation_id: ConversationId) -> Self {
        Self {
            event_type: EventType::ScreenStop,
            sender_id,
            target_id: None,
            conversation_id,
            payload: json!({}),
        }
    }

    /// Offer or answer for `class`, addressed to `target_id`.
    #[must_use]
    pub fn description(
        class: StreamClass,
        sender_id: UserId,
        target_id: UserId,
        conversation_id: ConversationId,
        description: SessionDescription,
    ) -> Self {
        Self {
            event_type: EventType::description(class, description.sdp_type),
            sender_id,
            target_id: Some(target_id),
            conversation_id,
            payload: json!({ "sdp": description }),
        }
    }

    /// Candidate for `class`, addressed to `target_id`.
    #[must_use]
    pub fn candidate(
        class: StreamClass,
        sender_id: UserId,
        target_id: UserId,
        conversation_id: ConversationId,
        candidate: IceCandidate,
    ) -> Self {
        Self {
            event_type: EventType::candidate(class),
            sender_id,
            target_id: Some(target_id),
            conversation_id,
            payload: json!({ "candidate": candidate }),
        }
    }

    /// Decode the session description of an offer/answer event. The
    /// description's own type must agree with the event type.
    pub fn session_description(&self) -> Result<SessionDescription, NegotiationError> {
        let expected = self.event_type.expected_sdp_type().ok_or_else(|| {
            NegotiationError::MalformedPayload(format!(
                "{} carries no session description",
                self.event_type
            ))
        })?;

        let decoded: DescriptionPayload = serde_json::from_value(self.payload.clone())
            .map_err(|e| NegotiationError::MalformedPayload(e.to_string()))?;

        if decoded.sdp.sdp_type != expected {
            return Err(NegotiationError::MalformedPayload(format!(
                "{} carries a {:?} description",
                self.event_type, decoded.sdp.sdp_type
            )));
        }
        if decoded.sdp.sdp.trim().is_empty() {
            return Err(NegotiationError::MalformedPayload("empty sdp".to_string()));
        }
        Ok(decoded.sdp)
    }

    pub fn ice_candidate(&self) -> Result<IceCandidate, NegotiationError> {
        let decoded: CandidatePayload = serde_json::from_value(self.payload.clone())
            .map_err(|e| NegotiationError::MalformedPayload(e.to_string()))?;
        Ok(decoded.candidate)
    }

    /// Join payload. Older clients send none; that reads as audio-only.
    #[must_use]
    pub fn join_payload(&self) -> JoinPayload {
        serde_json::from_value(self.payload.clone()).unwrap_or_default()
    }

    pub fn to_json(&self) -> Result<String, TransportError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self, TransportError> {
        Ok(serde_json::from_str(raw)?)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn conv() -> ConversationId {
        ConversationId::from("conv-1")
    }

    #[test]
    fn test_wire_type_names() {
        let names: Vec<String> = [
            EventType::Join,
            EventType::Leave,
            EventType::Offer,
            EventType::Answer,
            EventType::IceCandidate,
            EventType::ScreenOffer,
            EventType::ScreenAnswer,
            EventType::IceCandidateScreen,
            EventType::ScreenStop,
        ]
        .iter()
        .map(|t| serde_json::to_value(t).unwrap().as_str().unwrap().to_string())
        .collect();

        assert_eq!(
            names,
            vec![
                "join",
                "leave",
                "offer",
                "answer",
                "ice-candidate",
                "screen-offer",
                "screen-answer",
                "ice-candidate-screen",
                "screen-stop"
            ]
        );
    }

    #[test]
    fn test_offer_event_json_shape() {
        let event = SignalingEvent::description(
            StreamClass::Media,
            UserId::from("alice"),
            UserId::from("bob"),
            conv(),
            SessionDescription::offer("v=0"),
        );

        let value: Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "offer",
                "sender_id": "alice",
                "target_id": "bob",
                "conversation_id": "conv-1",
                "payload": {"sdp": {"type": "offer", "sdp": "v=0"}}
            })
        );
    }

    #[test]
    fn test_broadcast_event_omits_target() {
        let event = SignalingEvent::leave(UserId::from("alice"), conv());
        let value: Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();

        assert!(value.get("target_id").is_none());
        assert_eq!(value.get("type").unwrap(), "leave");
    }

    #[test]
    fn test_screen_answer_maps_from_class() {
        let event = SignalingEvent::description(
            StreamClass::Screen,
            UserId::from("bob"),
            UserId::from("alice"),
            conv(),
            SessionDescription::answer("v=0"),
        );
        assert_eq!(event.event_type, EventType::ScreenAnswer);
        assert_eq!(event.event_type.stream_class(), Some(StreamClass::Screen));
        assert_eq!(event.session_description().unwrap().sdp, "v=0");
    }

    #[test]
    fn test_description_type_mismatch_is_malformed() {
        let mut event = SignalingEvent::description(
            StreamClass::Media,
            UserId::from("alice"),
            UserId::from("bob"),
            conv(),
            SessionDescription::answer("v=0"),
        );
        event.event_type = EventType::Offer;

        assert!(matches!(
            event.session_description(),
            Err(NegotiationError::MalformedPayload(_))
        ));
    }

    #[test]
    fn test_garbage_payload_is_malformed() {
        let event: SignalingEvent = serde_json::from_value(json!({
            "type": "ice-candidate",
            "sender_id": "alice",
            "target_id": "bob",
            "conversation_id": "conv-1",
            "payload": {"candidate": 42}
        }))
        .unwrap();

        assert!(matches!(
            event.ice_candidate(),
            Err(NegotiationError::MalformedPayload(_))
        ));
    }

    #[test]
    fn test_join_payload_defaults_to_audio_only() {
        let event: SignalingEvent = serde_json::from_value(json!({
            "type": "join",
            "sender_id": "carol",
            "conversation_id": "conv-1"
        }))
        .unwrap();

        assert!(!event.join_payload().video);

        let with_video = SignalingEvent::join(UserId::from("carol"), conv(), true);
        assert!(with_video.join_payload().video);
    }

    #[test]
    fn test_unknown_type_fails_to_decode() {
        let result = SignalingEvent::from_json(
            r#"{"type":"renegotiate","sender_id":"a","conversation_id":"c"}"#,
        );
        assert!(matches!(result, Err(TransportError::Serialization(_))));
    }
}
