//! webrtc-rs backed peer connections.

use async_trait::async_trait;
use common::secret::ExposeSecret;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;

use super::{
    IceCandidate, PeerConnection, PeerConnectionFactory, PeerError, PeerEvent, PeerEventSender,
    RemoteTrack, SdpType, SessionDescription, TransportState,
};
use crate::actors::messages::NegotiatorKey;
use crate::config::{Config, IceServer};
use crate::media::{LocalTrack, TrackKind};

/// Builds one webrtc-rs API with default codecs and interceptors, shared by
/// every peer connection it creates.
pub struct WebRtcPeerFactory {
    api: API,
    ice_servers: Vec<RTCIceServer>,
}

impl WebRtcPeerFactory {
    pub fn new(config: &Config) -> Result<Self, PeerError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| PeerError::Rejected(format!("codec registration: {e}")))?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| PeerError::Rejected(format!("interceptor registration: {e}")))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self {
            api,
            ice_servers: config.ice_servers.iter().map(rtc_ice_server).collect(),
        })
    }
}

fn rtc_ice_server(server: &IceServer) -> RTCIceServer {
    RTCIceServer {
        urls: server.urls.clone(),
        username: server.username.clone().unwrap_or_default(),
        credential: server
            .credential
            .as_ref()
            .map(|c| c.expose_secret().to_string())
            .unwrap_or_default(),
        ..Default::default()
    }
}

#[async_trait]
impl PeerConnectionFactory for WebRtcPeerFactory {
    async fn create(
        &self,
        key: &NegotiatorKey,
        events: PeerEventSender,
    ) -> Result<Arc<dyn PeerConnection>, PeerError> {
        let configuration = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };

        let pc = Arc::new(
            self.api
                .new_peer_connection(configuration)
                .await
                .map_err(|e| PeerError::Rejected(e.to_string()))?,
        );

        wire_callbacks(&pc, key, events);

        debug!(target: "call.peer.webrtc", key = %key, "Peer connection created");

        Ok(Arc::new(WebRtcPeer {
            pc,
            senders: Mutex::new(Vec::new()),
        }))
    }
}

fn wire_callbacks(pc: &Arc<RTCPeerConnection>, key: &NegotiatorKey, events: PeerEventSender) {
    let candidate_events = events.clone();
    let candidate_key = key.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        // None marks the end of gathering.
        if let Some(candidate) = candidate {
            match candidate.to_json() {
                Ok(init) => {
                    let _ = candidate_events.send(PeerEvent::LocalCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    }));
                }
                Err(e) => {
                    warn!(
                        target: "call.peer.webrtc",
                        key = %candidate_key,
                        error = %e,
                        "Failed to serialize local candidate"
                    );
                }
            }
        }
        Box::pin(async {})
    }));

    let state_events = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let mapped = match state {
            RTCPeerConnectionState::New => Some(TransportState::New),
            RTCPeerConnectionState::Connecting => Some(TransportState::Connecting),
            RTCPeerConnectionState::Connected => Some(TransportState::Connected),
            RTCPeerConnectionState::Disconnected => Some(TransportState::Disconnected),
            RTCPeerConnectionState::Failed => Some(TransportState::Failed),
            RTCPeerConnectionState::Closed => Some(TransportState::Closed),
            RTCPeerConnectionState::Unspecified => None,
        };
        if let Some(mapped) = mapped {
            let _ = state_events.send(PeerEvent::StateChanged(mapped));
        }
        Box::pin(async {})
    }));

    pc.on_track(Box::new(move |track, _receiver, _transceiver| {
        let kind = match track.kind() {
            RTPCodecType::Audio => Some(TrackKind::Audio),
            RTPCodecType::Video => Some(TrackKind::Video),
            RTPCodecType::Unspecified => None,
        };
        if let Some(kind) = kind {
            let _ = events.send(PeerEvent::RemoteTrack(RemoteTrack {
                track_id: track.id(),
                stream_id: track.stream_id(),
                kind,
                rtp: Some(track),
            }));
        }
        Box::pin(async {})
    }));
}

/// One webrtc-rs peer connection.
pub struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
    senders: Mutex<Vec<Arc<RTCRtpSender>>>,
}

impl WebRtcPeer {
    fn to_rtc(description: SessionDescription) -> Result<RTCSessionDescription, PeerError> {
        let converted = match description.sdp_type {
            SdpType::Offer => RTCSessionDescription::offer(description.sdp),
            SdpType::Answer => RTCSessionDescription::answer(description.sdp),
        };
        converted.map_err(|e| PeerError::Rejected(format!("invalid sdp: {e}")))
    }
}

#[async_trait]
impl PeerConnection for WebRtcPeer {
    async fn attach_tracks(&self, tracks: &[LocalTrack]) -> Result<(), PeerError> {
        let mut senders = self.senders.lock().await;
        for track in tracks {
            let rtp: Arc<dyn TrackLocal + Send + Sync> = track.rtp_track();
            let sender = self
                .pc
                .add_track(rtp)
                .await
                .map_err(|e| PeerError::Rejected(e.to_string()))?;
            senders.push(sender);
        }
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| PeerError::Rejected(e.to_string()))?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| PeerError::Rejected(e.to_string()))?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        let description = Self::to_rtc(description)?;
        self.pc
            .set_local_description(description)
            .await
            .map_err(|e| PeerError::Rejected(e.to_string()))
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        let description = Self::to_rtc(description)?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(|e| PeerError::Rejected(e.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(|e| PeerError::Rejected(e.to_string()))
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.senders.lock().await.clear();
        self.pc
            .close()
            .await
            .map_err(|e| PeerError::Rejected(e.to_string()))
    }
}
