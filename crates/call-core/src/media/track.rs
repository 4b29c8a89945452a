//! Local media tracks and streams.
//!
//! A `LocalTrack` is a cheap clone over shared state. The capture controller
//! owns the stream; negotiators hold clones while the track is attached to
//! their peer connection. Stopping a track is observable by every clone.

use common::types::StreamId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::errors::DeviceError;

/// Kind of media carried by a track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        }
    }
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a local stream comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureSource {
    /// Microphone plus optional camera.
    Camera,
    /// Display capture.
    Screen,
}

struct TrackInner {
    id: String,
    kind: TrackKind,
    label: String,
    stream_id: StreamId,
    enabled: AtomicBool,
    ended: CancellationToken,
    rtp: Arc<TrackLocalStaticSample>,
}

/// A captured local track.
#[derive(Clone)]
pub struct LocalTrack {
    inner: Arc<TrackInner>,
}

impl LocalTrack {
    /// Create an enabled track that belongs to `stream_id`.
    #[must_use]
    pub fn new(kind: TrackKind, label: impl Into<String>, stream_id: StreamId) -> Self {
        let id = Uuid::new_v4().to_string();
        let codec = match kind {
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
        };
        let rtp = Arc::new(TrackLocalStaticSample::new(
            codec,
            id.clone(),
            stream_id.to_string(),
        ));

        Self {
            inner: Arc::new(TrackInner {
                id,
                kind,
                label: label.into(),
                stream_id,
                enabled: AtomicBool::new(true),
                ended: CancellationToken::new(),
                rtp,
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    #[must_use]
    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    /// Human-readable device label.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    #[must_use]
    pub fn stream_id(&self) -> StreamId {
        self.inner.stream_id
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    /// Disabled tracks stay attached but send no media.
    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_ended(&self) -> bool {
        self.inner.ended.is_cancelled()
    }

    /// Stop the track. Idempotent.
    pub fn stop(&self) {
        self.inner.ended.cancel();
    }

    /// Token cancelled when the track stops, whether by `stop()` or by the
    /// platform (for example the OS "stop sharing" control).
    #[must_use]
    pub fn ended_token(&self) -> CancellationToken {
        self.inner.ended.clone()
    }

    /// RTP track to attach to a peer connection.
    #[must_use]
    pub fn rtp_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.inner.rtp)
    }

    /// Number of live handles to this track, including this one.
    #[must_use]
    pub fn handle_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Feed one captured media sample. Dropped while the track is disabled.
    pub async fn write_sample(&self, sample: &Sample) -> Result<(), DeviceError> {
        if self.is_ended() {
            return Err(DeviceError::Backend(format!(
                "{} track {} has ended",
                self.kind(),
                self.id()
            )));
        }
        if !self.is_enabled() {
            return Ok(());
        }
        self.inner
            .rtp
            .write_sample(sample)
            .await
            .map_err(|e| DeviceError::Backend(e.to_string()))
    }
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("label", &self.inner.label)
            .field("enabled", &self.is_enabled())
            .field("ended", &self.is_ended())
            .finish()
    }
}

/// A set of local tracks captured together.
#[derive(Debug, Clone)]
pub struct LocalStream {
    id: StreamId,
    source: CaptureSource,
    tracks: Vec<LocalTrack>,
}

impl LocalStream {
    #[must_use]
    pub fn new(id: StreamId, source: CaptureSource, tracks: Vec<LocalTrack>) -> Self {
        Self { id, source, tracks }
    }

    #[must_use]
    pub fn id(&self) -> StreamId {
        self.id
    }

    #[must_use]
    pub fn source(&self) -> CaptureSource {
        self.source
    }

    #[must_use]
    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    /// First track of the given kind.
    #[must_use]
    pub fn track(&self, kind: TrackKind) -> Option<&LocalTrack> {
        self.tracks.iter().find(|t| t.kind() == kind)
    }

    #[must_use]
    pub fn has_video(&self) -> bool {
        self.track(TrackKind::Video).is_some()
    }

    /// True once every track has stopped.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.tracks.iter().all(LocalTrack::is_ended)
    }

    pub(crate) fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_track_defaults() {
        let stream_id = StreamId::new();
        let track = LocalTrack::new(TrackKind::Audio, "Built-in Microphone", stream_id);

        assert_eq!(track.kind(), TrackKind::Audio);
        assert_eq!(track.label(), "Built-in Microphone");
        assert_eq!(track.stream_id(), stream_id);
        assert!(track.is_enabled());
        assert!(!track.is_ended());
    }

    #[test]
    fn test_enable_is_shared_between_clones() {
        let track = LocalTrack::new(TrackKind::Video, "camera", StreamId::new());
        let attached = track.clone();

        track.set_enabled(false);
        assert!(!attached.is_enabled());
        assert_eq!(track.handle_count(), 2);

        drop(attached);
        assert_eq!(track.handle_count(), 1);
    }

    #[test]
    fn test_stop_is_idempotent_and_cancels_token() {
        let track = LocalTrack::new(TrackKind::Audio, "mic", StreamId::new());
        let token = track.ended_token();

        track.stop();
        track.stop();

        assert!(track.is_ended());
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_write_sample_after_stop_fails() {
        let track = LocalTrack::new(TrackKind::Audio, "mic", StreamId::new());
        let sample = Sample {
            duration: Duration::from_millis(20),
            ..Default::default()
        };

        track.set_enabled(false);
        assert!(track.write_sample(&sample).await.is_ok());

        track.stop();
        assert!(track.write_sample(&sample).await.is_err());
    }

    #[test]
    fn test_stream_lookup_and_release() {
        let id = StreamId::new();
        let stream = LocalStream::new(
            id,
            CaptureSource::Camera,
            vec![
                LocalTrack::new(TrackKind::Audio, "mic", id),
                LocalTrack::new(TrackKind::Video, "camera", id),
            ],
        );

        assert!(stream.has_video());
        assert_eq!(stream.track(TrackKind::Audio).unwrap().label(), "mic");
        assert!(!stream.is_released());

        stream.stop_all();
        assert!(stream.is_released());
    }

    #[test]
    fn test_kind_wire_names() {
        assert_eq!(serde_json::to_string(&TrackKind::Audio).unwrap(), "\"audio\"");
        assert_eq!(TrackKind::Video.to_string(), "video");
    }
}
