//! In-crate scripted peer connection for actor unit tests.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use super::{
    IceCandidate, PeerConnection, PeerConnectionFactory, PeerError, PeerEvent, PeerEventSender,
    SessionDescription, TransportState,
};
use crate::actors::messages::NegotiatorKey;
use crate::media::LocalTrack;

#[derive(Default)]
pub(crate) struct ScriptedPeer {
    pub local: Mutex<Option<SessionDescription>>,
    pub remote: Mutex<Option<SessionDescription>>,
    pub candidates: Mutex<Vec<IceCandidate>>,
    pub tracks: Mutex<Vec<LocalTrack>>,
    pub closed: AtomicBool,
    pub reject_remote: AtomicBool,
    pub events: Mutex<Option<PeerEventSender>>,
}

impl ScriptedPeer {
    pub fn emit(&self, event: PeerEvent) {
        if let Some(tx) = self.events.lock().unwrap().as_ref() {
            let _ = tx.send(event);
        }
    }

    pub fn set_state(&self, state: TransportState) {
        self.emit(PeerEvent::StateChanged(state));
    }

    pub fn applied_candidates(&self) -> usize {
        self.candidates.lock().unwrap().len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerConnection for ScriptedPeer {
    async fn attach_tracks(&self, tracks: &[LocalTrack]) -> Result<(), PeerError> {
        self.tracks.lock().unwrap().extend(tracks.iter().cloned());
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        Ok(SessionDescription::offer("v=0 scripted-offer"))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        if self.remote.lock().unwrap().is_none() {
            return Err(PeerError::Rejected("no remote offer".to_string()));
        }
        Ok(SessionDescription::answer("v=0 scripted-answer"))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        *self.local.lock().unwrap() = Some(description);
        self.emit(PeerEvent::LocalCandidate(IceCandidate {
            candidate: "candidate:1 1 udp 2122260223 127.0.0.1 50000 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }));
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        if self.reject_remote.load(Ordering::SeqCst) {
            return Err(PeerError::Rejected("unparseable sdp".to_string()));
        }
        *self.remote.lock().unwrap() = Some(description);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        if self.remote.lock().unwrap().is_none() {
            return Err(PeerError::Rejected(
                "remote description not set".to_string(),
            ));
        }
        self.candidates.lock().unwrap().push(candidate);
        Ok(())
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.closed.store(true, Ordering::SeqCst);
        self.tracks.lock().unwrap().clear();
        Ok(())
    }
}

/// Hands out `ScriptedPeer`s and keeps them for inspection.
#[derive(Default)]
pub(crate) struct ScriptedFactory {
    pub created: Mutex<Vec<(NegotiatorKey, Arc<ScriptedPeer>)>>,
    pub reject_remote: AtomicBool,
}

impl ScriptedFactory {
    pub fn last(&self) -> Arc<ScriptedPeer> {
        Arc::clone(&self.created.lock().unwrap().last().unwrap().1)
    }

    pub fn count(&self) -> usize {
        self.created.lock().unwrap().len()
    }
}

#[async_trait]
impl PeerConnectionFactory for ScriptedFactory {
    async fn create(
        &self,
        key: &NegotiatorKey,
        events: PeerEventSender,
    ) -> Result<Arc<dyn PeerConnection>, PeerError> {
        let peer = Arc::new(ScriptedPeer::default());
        *peer.events.lock().unwrap() = Some(events);
        peer.reject_remote
            .store(self.reject_remote.load(Ordering::SeqCst), Ordering::SeqCst);
        self.created
            .lock()
            .unwrap()
            .push((key.clone(), Arc::clone(&peer)));
        Ok(peer)
    }
}
