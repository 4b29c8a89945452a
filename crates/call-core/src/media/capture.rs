//! Media Capture Controller.
//!
//! Acquires microphone, camera and screen streams from a platform
//! `CaptureBackend` and owns their lifetime. Acquisition is all-or-nothing:
//! if the camera fails after the microphone opened, the microphone is
//! stopped before the error is returned.

use async_trait::async_trait;
use common::types::StreamId;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::track::{CaptureSource, LocalStream, LocalTrack, TrackKind};
use crate::errors::DeviceError;

/// Microphone processing constraints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl Default for AudioConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FacingMode {
    User,
    Environment,
}

/// Camera constraints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoConstraints {
    pub width: u32,
    pub height: u32,
    pub facing_mode: FacingMode,
}

impl Default for VideoConstraints {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            facing_mode: FacingMode::User,
        }
    }
}

/// Display capture constraints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScreenConstraints {
    pub frame_rate: u32,
    /// Capture system audio alongside the display when the platform allows it.
    pub capture_audio: bool,
}

/// Platform capture seam.
///
/// Implementations create tracks with [`LocalTrack::new`] and feed samples
/// through [`LocalTrack::write_sample`]. When the platform ends a track on
/// its own (device unplugged, OS "stop sharing"), the backend calls
/// [`LocalTrack::stop`].
#[async_trait]
pub trait CaptureBackend: Send + Sync {
    async fn open_microphone(
        &self,
        constraints: &AudioConstraints,
        stream_id: StreamId,
    ) -> Result<LocalTrack, DeviceError>;

    async fn open_camera(
        &self,
        constraints: &VideoConstraints,
        stream_id: StreamId,
    ) -> Result<LocalTrack, DeviceError>;

    /// Returns the display video track plus an audio track when
    /// `capture_audio` was requested and granted.
    async fn open_screen(
        &self,
        constraints: &ScreenConstraints,
        stream_id: StreamId,
    ) -> Result<Vec<LocalTrack>, DeviceError>;
}

/// Owner of local capture streams.
#[derive(Clone)]
pub struct MediaCaptureController {
    backend: Arc<dyn CaptureBackend>,
    audio: AudioConstraints,
    video: VideoConstraints,
    screen: ScreenConstraints,
}

impl MediaCaptureController {
    /// Controller with the default audio and camera constraints.
    pub fn new(backend: Arc<dyn CaptureBackend>, screen_frame_rate: u32) -> Self {
        Self {
            backend,
            audio: AudioConstraints::default(),
            video: VideoConstraints::default(),
            screen: ScreenConstraints {
                frame_rate: screen_frame_rate,
                capture_audio: false,
            },
        }
    }

    #[must_use]
    pub fn with_constraints(mut self, audio: AudioConstraints, video: VideoConstraints) -> Self {
        self.audio = audio;
        self.video = video;
        self
    }

    /// Acquire a microphone track, plus a camera track when `with_video`.
    pub async fn acquire(&self, with_video: bool) -> Result<LocalStream, DeviceError> {
        let stream_id = StreamId::new();

        let mic = self
            .backend
            .open_microphone(&self.audio, stream_id)
            .await
            .inspect_err(|e| {
                warn!(target: "call.media.capture", error = %e, "Microphone acquisition failed");
            })?;

        let mut tracks = vec![mic];

        if with_video {
            match self.backend.open_camera(&self.video, stream_id).await {
                Ok(camera) => tracks.push(camera),
                Err(e) => {
                    warn!(
                        target: "call.media.capture",
                        error = %e,
                        "Camera acquisition failed, releasing microphone"
                    );
                    for track in &tracks {
                        track.stop();
                    }
                    return Err(e);
                }
            }
        }

        info!(
            target: "call.media.capture",
            stream_id = %stream_id,
            with_video,
            "Local media acquired"
        );

        Ok(LocalStream::new(stream_id, CaptureSource::Camera, tracks))
    }

    /// Acquire a display capture stream.
    pub async fn acquire_screen(&self) -> Result<LocalStream, DeviceError> {
        let stream_id = StreamId::new();

        let tracks = self
            .backend
            .open_screen(&self.screen, stream_id)
            .await
            .inspect_err(|e| {
                warn!(target: "call.media.capture", error = %e, "Screen acquisition failed");
            })?;

        if !tracks.iter().any(|t| t.kind() == TrackKind::Video) {
            for track in &tracks {
                track.stop();
            }
            return Err(DeviceError::Unsupported(
                "display capture returned no video track".to_string(),
            ));
        }

        info!(
            target: "call.media.capture",
            stream_id = %stream_id,
            tracks = tracks.len(),
            "Screen capture acquired"
        );

        Ok(LocalStream::new(stream_id, CaptureSource::Screen, tracks))
    }

    /// Enable or disable every track of `kind` in `stream`.
    ///
    /// Returns `false` when the stream has no such track.
    pub fn set_track_enabled(&self, stream: &LocalStream, kind: TrackKind, enabled: bool) -> bool {
        let mut found = false;
        for track in stream.tracks().iter().filter(|t| t.kind() == kind) {
            track.set_enabled(enabled);
            found = true;
        }
        if found {
            debug!(
                target: "call.media.capture",
                stream_id = %stream.id(),
                kind = kind.as_str(),
                enabled,
                "Track enabled state changed"
            );
        }
        found
    }

    /// Stop every track of `stream`. Idempotent.
    pub fn release(&self, stream: &LocalStream) {
        if stream.is_released() {
            return;
        }
        stream.stop_all();
        debug!(
            target: "call.media.capture",
            stream_id = %stream.id(),
            "Local stream released"
        );
    }
}
