//! Loopback peer connections.
//!
//! Every `MockPeer` is an endpoint on a shared `LoopbackNetwork`. The fake
//! SDP it produces names its endpoint id, so two endpoints that have
//! exchanged descriptions know each other. Once both sides hold a local and
//! a remote description pointing at each other, the network reports
//! `Connecting` then `Connected` to both and delivers each side's attached
//! tracks to the other as remote tracks.
//!
//! Closing an endpoint does not notify the other side, as with a real peer
//! connection whose remote just goes quiet until ICE gives up.

use async_trait::async_trait;
use call_core::actors::NegotiatorKey;
use call_core::media::{LocalTrack, TrackKind};
use call_core::peer::{
    IceCandidate, PeerConnection, PeerConnectionFactory, PeerError, PeerEvent, PeerEventSender,
    RemoteTrack, SessionDescription, TransportState,
};
use common::types::UserId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

const SDP_PREFIX: &str = "mock-sdp endpoint=";

/// Shared fabric that pairs up `MockPeer`s.
#[derive(Debug, Clone)]
pub struct LoopbackNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}

#[derive(Debug)]
struct NetworkInner {
    endpoints: HashMap<u64, Endpoint>,
    next_id: u64,
    auto_connect: bool,
}

#[derive(Debug)]
struct Endpoint {
    owner: UserId,
    key: NegotiatorKey,
    events: PeerEventSender,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    remote_endpoint: Option<u64>,
    tracks: Vec<(String, String, TrackKind)>,
    candidates: usize,
    state: TransportState,
    closed: bool,
}

impl Endpoint {
    fn ready(&self) -> bool {
        !self.closed && self.local.is_some() && self.remote.is_some()
    }

    fn emit(&mut self, state: TransportState) {
        self.state = state;
        let _ = self.events.send(PeerEvent::StateChanged(state));
    }

    fn deliver_tracks(&self, tracks: &[(String, String, TrackKind)]) {
        for (track_id, stream_id, kind) in tracks {
            let _ = self.events.send(PeerEvent::RemoteTrack(RemoteTrack {
                track_id: track_id.clone(),
                stream_id: stream_id.clone(),
                kind: *kind,
                rtp: None,
            }));
        }
    }
}

impl Default for LoopbackNetwork {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(NetworkInner {
                endpoints: HashMap::new(),
                next_id: 1,
                auto_connect: true,
            })),
        }
    }
}

impl LoopbackNetwork {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory that creates endpoints owned by `owner`.
    #[must_use]
    pub fn factory_for(&self, owner: &UserId) -> MockPeerFactory {
        MockPeerFactory {
            network: self.clone(),
            owner: owner.clone(),
        }
    }

    /// When off, descriptions are exchanged but no pair ever connects.
    pub fn set_auto_connect(&self, enabled: bool) {
        self.inner.lock().unwrap().auto_connect = enabled;
    }

    /// Report `state` on `owner`'s newest open endpoint for `key`.
    ///
    /// Returns `false` when there is no such endpoint.
    pub fn force_state(&self, owner: &UserId, key: &NegotiatorKey, state: TransportState) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Some(id) = newest_open(&inner, owner, key) else {
            return false;
        };
        if let Some(endpoint) = inner.endpoints.get_mut(&id) {
            endpoint.emit(state);
        }
        true
    }

    /// Remote candidates applied on `owner`'s newest open endpoint for `key`.
    #[must_use]
    pub fn applied_candidates(&self, owner: &UserId, key: &NegotiatorKey) -> usize {
        let inner = self.inner.lock().unwrap();
        newest_open(&inner, owner, key)
            .and_then(|id| inner.endpoints.get(&id))
            .map_or(0, |e| e.candidates)
    }

    /// Keys of `owner`'s endpoints that are not closed, sorted.
    #[must_use]
    pub fn live_endpoints(&self, owner: &UserId) -> Vec<NegotiatorKey> {
        let inner = self.inner.lock().unwrap();
        let mut keys: Vec<NegotiatorKey> = inner
            .endpoints
            .values()
            .filter(|e| &e.owner == owner && !e.closed)
            .map(|e| e.key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Keys of `owner`'s endpoints that reached `Connected` and are open.
    #[must_use]
    pub fn connected_endpoints(&self, owner: &UserId) -> Vec<NegotiatorKey> {
        let inner = self.inner.lock().unwrap();
        let mut keys: Vec<NegotiatorKey> = inner
            .endpoints
            .values()
            .filter(|e| &e.owner == owner && !e.closed && e.state == TransportState::Connected)
            .map(|e| e.key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Total endpoints ever created.
    #[must_use]
    pub fn created_count(&self) -> usize {
        self.inner.lock().unwrap().endpoints.len()
    }

    fn register(&self, owner: UserId, key: NegotiatorKey, events: PeerEventSender) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.endpoints.insert(
            id,
            Endpoint {
                owner,
                key,
                events,
                local: None,
                remote: None,
                remote_endpoint: None,
                tracks: Vec::new(),
                candidates: 0,
                state: TransportState::New,
                closed: false,
            },
        );
        id
    }

    fn with_endpoint<T>(
        &self,
        id: u64,
        f: impl FnOnce(&mut Endpoint) -> Result<T, PeerError>,
    ) -> Result<T, PeerError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.endpoints.get_mut(&id) {
            Some(endpoint) if !endpoint.closed => f(endpoint),
            _ => Err(PeerError::Closed),
        }
    }

    /// Connect `id` with its remote if both sides are ready.
    fn try_connect(&self, id: u64) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.auto_connect {
            return;
        }

        let Some(other_id) = inner
            .endpoints
            .get(&id)
            .filter(|e| e.ready() && e.state == TransportState::New)
            .and_then(|e| e.remote_endpoint)
        else {
            return;
        };

        let paired = inner.endpoints.get(&other_id).is_some_and(|other| {
            other.ready() && other.state == TransportState::New && other.remote_endpoint == Some(id)
        });
        if !paired {
            return;
        }

        let local_tracks = inner
            .endpoints
            .get(&id)
            .map(|e| e.tracks.clone())
            .unwrap_or_default();
        let other_tracks = inner
            .endpoints
            .get(&other_id)
            .map(|e| e.tracks.clone())
            .unwrap_or_default();

        for (endpoint_id, remote_tracks) in [(id, other_tracks), (other_id, local_tracks)] {
            if let Some(endpoint) = inner.endpoints.get_mut(&endpoint_id) {
                endpoint.emit(TransportState::Connecting);
                endpoint.emit(TransportState::Connected);
                endpoint.deliver_tracks(&remote_tracks);
            }
        }
    }
}

fn newest_open(inner: &NetworkInner, owner: &UserId, key: &NegotiatorKey) -> Option<u64> {
    inner
        .endpoints
        .iter()
        .filter(|(_, e)| &e.owner == owner && &e.key == key && !e.closed)
        .map(|(id, _)| *id)
        .max()
}

fn sdp_for(id: u64) -> String {
    format!("{SDP_PREFIX}{id}")
}

fn parse_endpoint(sdp: &str) -> Option<u64> {
    sdp.strip_prefix(SDP_PREFIX)?.trim().parse().ok()
}

/// One endpoint on a `LoopbackNetwork`.
#[derive(Debug)]
pub struct MockPeer {
    id: u64,
    network: LoopbackNetwork,
}

#[async_trait]
impl PeerConnection for MockPeer {
    async fn attach_tracks(&self, tracks: &[LocalTrack]) -> Result<(), PeerError> {
        self.network.with_endpoint(self.id, |endpoint| {
            endpoint.tracks.extend(
                tracks
                    .iter()
                    .map(|t| (t.id().to_string(), t.stream_id().to_string(), t.kind())),
            );
            Ok(())
        })
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        self.network
            .with_endpoint(self.id, |_| Ok(SessionDescription::offer(sdp_for(self.id))))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        self.network.with_endpoint(self.id, |endpoint| {
            if endpoint.remote.is_none() {
                return Err(PeerError::Rejected("no remote offer".to_string()));
            }
            Ok(SessionDescription::answer(sdp_for(self.id)))
        })
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        let id = self.id;
        self.network.with_endpoint(id, |endpoint| {
            endpoint.local = Some(description);
            let _ = endpoint.events.send(PeerEvent::LocalCandidate(IceCandidate {
                candidate: format!("candidate:{id} 1 udp 2122260223 127.0.0.1 {id} typ host"),
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: Some(0),
                username_fragment: None,
            }));
            Ok(())
        })?;
        self.network.try_connect(id);
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        let Some(remote_endpoint) = parse_endpoint(&description.sdp) else {
            return Err(PeerError::Rejected(format!(
                "unparseable sdp: {}",
                description.sdp
            )));
        };
        self.network.with_endpoint(self.id, |endpoint| {
            endpoint.remote = Some(description);
            endpoint.remote_endpoint = Some(remote_endpoint);
            Ok(())
        })?;
        self.network.try_connect(self.id);
        Ok(())
    }

    async fn add_ice_candidate(&self, _candidate: IceCandidate) -> Result<(), PeerError> {
        self.network.with_endpoint(self.id, |endpoint| {
            if endpoint.remote.is_none() {
                return Err(PeerError::Rejected(
                    "remote description not set".to_string(),
                ));
            }
            endpoint.candidates += 1;
            Ok(())
        })
    }

    async fn close(&self) -> Result<(), PeerError> {
        let mut inner = self.network.inner.lock().unwrap();
        if let Some(endpoint) = inner.endpoints.get_mut(&self.id) {
            endpoint.closed = true;
            endpoint.tracks.clear();
        }
        Ok(())
    }
}

/// Creates `MockPeer`s for one client.
#[derive(Debug, Clone)]
pub struct MockPeerFactory {
    network: LoopbackNetwork,
    owner: UserId,
}

#[async_trait]
impl PeerConnectionFactory for MockPeerFactory {
    async fn create(
        &self,
        key: &NegotiatorKey,
        events: PeerEventSender,
    ) -> Result<Arc<dyn PeerConnection>, PeerError> {
        let id = self
            .network
            .register(self.owner.clone(), key.clone(), events);
        Ok(Arc::new(MockPeer {
            id,
            network: self.network.clone(),
        }))
    }
}
