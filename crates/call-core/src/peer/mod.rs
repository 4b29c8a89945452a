//! Peer connection seam.
//!
//! `PeerConnection` is the slice of a WebRTC peer connection the negotiator
//! drives. [`rtc::WebRtcPeerFactory`] backs it with webrtc-rs; tests use
//! an in-memory loopback.
//!
//! Asynchronous peer callbacks (gathered candidates, transport state, remote
//! tracks) are delivered as [`PeerEvent`]s on the channel handed to
//! [`PeerConnectionFactory::create`].

pub mod rtc;

#[cfg(test)]
pub(crate) mod testing;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use webrtc::track::track_remote::TrackRemote;

use crate::actors::messages::NegotiatorKey;
use crate::errors::NegotiationError;
use crate::media::{LocalTrack, TrackKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// An SDP offer or answer, in the browser's `RTCSessionDescriptionInit` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    #[must_use]
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    #[must_use]
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// An ICE candidate, in the browser's `RTCIceCandidateInit` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default)]
    pub username_fragment: Option<String>,
}

/// Transport-level connection state reported by the peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// A media track received from a remote peer.
#[derive(Clone)]
pub struct RemoteTrack {
    pub track_id: String,
    /// The remote's stream id; tracks of one remote stream share it.
    pub stream_id: String,
    pub kind: TrackKind,
    /// RTP source, when backed by a real peer connection.
    pub rtp: Option<Arc<TrackRemote>>,
}

impl fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("track_id", &self.track_id)
            .field("stream_id", &self.stream_id)
            .field("kind", &self.kind)
            .field("rtp", &self.rtp.is_some())
            .finish()
    }
}

/// Callback output of a peer connection.
#[derive(Debug)]
pub enum PeerEvent {
    LocalCandidate(IceCandidate),
    StateChanged(TransportState),
    RemoteTrack(RemoteTrack),
}

pub type PeerEventSender = mpsc::UnboundedSender<PeerEvent>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PeerError {
    /// The peer connection refused the operation.
    #[error("{0}")]
    Rejected(String),

    #[error("peer connection closed")]
    Closed,
}

impl From<PeerError> for NegotiationError {
    fn from(err: PeerError) -> Self {
        match err {
            PeerError::Rejected(reason) => NegotiationError::Peer(reason),
            PeerError::Closed => NegotiationError::Closed,
        }
    }
}

/// One WebRTC peer connection.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Add local tracks to be sent to the remote.
    async fn attach_tracks(&self, tracks: &[LocalTrack]) -> Result<(), PeerError>;

    async fn create_offer(&self) -> Result<SessionDescription, PeerError>;

    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;

    async fn set_local_description(&self, description: SessionDescription)
        -> Result<(), PeerError>;

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError>;

    /// Close the connection and release attached tracks. Idempotent.
    async fn close(&self) -> Result<(), PeerError>;
}

/// Creates peer connections for negotiators.
#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(
        &self,
        key: &NegotiatorKey,
        events: PeerEventSender,
    ) -> Result<Arc<dyn PeerConnection>, PeerError>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_description_wire_shape() {
        let value = serde_json::to_value(SessionDescription::offer("v=0")).unwrap();
        assert_eq!(value, json!({"type": "offer", "sdp": "v=0"}));
    }

    #[test]
    fn test_candidate_accepts_browser_json() {
        let candidate: IceCandidate = serde_json::from_value(json!({
            "candidate": "candidate:1 1 udp 2122260223 192.168.1.2 54321 typ host",
            "sdpMid": "0",
            "sdpMLineIndex": 0,
            "usernameFragment": "abcd"
        }))
        .unwrap();

        assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
        assert_eq!(candidate.sdp_mline_index, Some(0));
        assert_eq!(candidate.username_fragment.as_deref(), Some("abcd"));
    }

    #[test]
    fn test_candidate_optional_fields_default() {
        let candidate: IceCandidate =
            serde_json::from_value(json!({"candidate": "candidate:2 1 udp 1 10.0.0.1 9 typ host"}))
                .unwrap();
        assert!(candidate.sdp_mid.is_none());
        assert!(candidate.sdp_mline_index.is_none());
    }

    #[test]
    fn test_peer_error_maps_to_negotiation_error() {
        assert_eq!(
            NegotiationError::from(PeerError::Rejected("bad sdp".to_string())),
            NegotiationError::Peer("bad sdp".to_string())
        );
        assert_eq!(
            NegotiationError::from(PeerError::Closed),
            NegotiationError::Closed
        );
    }
}
