//! Participant Registry: what this client knows about every other member of
//! the call.
//!
//! Mutated only by the session actor. Entries are created by a join
//! announcement or by the first inbound track, whichever comes first.

use super::messages::StreamClass;
use crate::media::TrackKind;
use crate::peer::RemoteTrack;

use common::types::UserId;
use std::collections::BTreeMap;

/// Remote tracks that share one remote stream id.
#[derive(Debug, Clone)]
pub struct RemoteStream {
    pub stream_id: String,
    pub tracks: Vec<RemoteTrack>,
}

impl RemoteStream {
    fn new(track: RemoteTrack) -> Self {
        Self {
            stream_id: track.stream_id.clone(),
            tracks: vec![track],
        }
    }

    /// Add a track, replacing any earlier track with the same id.
    fn push(&mut self, track: RemoteTrack) {
        self.tracks.retain(|t| t.track_id != track.track_id);
        self.tracks.push(track);
    }

    #[must_use]
    pub fn has_kind(&self, kind: TrackKind) -> bool {
        self.tracks.iter().any(|t| t.kind == kind)
    }
}

/// One other user in the call.
#[derive(Debug, Clone)]
pub struct Participant {
    pub user_id: UserId,
    pub main_stream: Option<RemoteStream>,
    pub screen_stream: Option<RemoteStream>,
    pub is_muted: bool,
    pub is_video_enabled: bool,
    pub is_screen_sharing: bool,
}

impl Participant {
    fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            main_stream: None,
            screen_stream: None,
            is_muted: false,
            is_video_enabled: false,
            is_screen_sharing: false,
        }
    }
}

#[derive(Debug, Default)]
pub struct ParticipantRegistry {
    participants: BTreeMap<UserId, Participant>,
}

impl ParticipantRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a join announcement. An existing entry keeps its streams.
    pub fn upsert_from_join(&mut self, user_id: &UserId, video: bool) {
        let participant = self
            .participants
            .entry(user_id.clone())
            .or_insert_with(|| Participant::new(user_id.clone()));
        participant.is_video_enabled = video;
    }

    /// Attach an inbound track to the stream of `class`.
    ///
    /// A track from a different remote stream id replaces the whole stream.
    pub fn attach_track(&mut self, user_id: &UserId, class: StreamClass, track: RemoteTrack) {
        let participant = self
            .participants
            .entry(user_id.clone())
            .or_insert_with(|| Participant::new(user_id.clone()));

        let is_video = track.kind == TrackKind::Video;
        let slot = match class {
            StreamClass::Media => &mut participant.main_stream,
            StreamClass::Screen => &mut participant.screen_stream,
        };
        let same_stream = slot
            .as_ref()
            .is_some_and(|stream| stream.stream_id == track.stream_id);
        match slot {
            Some(stream) if same_stream => stream.push(track),
            other => *other = Some(RemoteStream::new(track)),
        }

        match class {
            StreamClass::Media if is_video => participant.is_video_enabled = true,
            StreamClass::Media => {}
            StreamClass::Screen => participant.is_screen_sharing = true,
        }
    }

    /// Forget the screen stream of `user_id`.
    pub fn clear_screen(&mut self, user_id: &UserId) {
        if let Some(participant) = self.participants.get_mut(user_id) {
            participant.screen_stream = None;
            participant.is_screen_sharing = false;
        }
    }

    /// Forget every screen stream.
    pub fn clear_all_screens(&mut self) {
        for participant in self.participants.values_mut() {
            participant.screen_stream = None;
            participant.is_screen_sharing = false;
        }
    }

    pub fn remove(&mut self, user_id: &UserId) -> Option<Participant> {
        self.participants.remove(user_id)
    }

    pub fn clear(&mut self) {
        self.participants.clear();
    }

    #[must_use]
    pub fn get(&self, user_id: &UserId) -> Option<&Participant> {
        self.participants.get(user_id)
    }

    #[must_use]
    pub fn contains(&self, user_id: &UserId) -> bool {
        self.participants.contains_key(user_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.participants.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    /// All participants, sorted by user id.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Participant> {
        self.participants.values().cloned().collect()
    }
}
