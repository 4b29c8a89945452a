//! Scriptable capture devices.
//!
//! `MockCaptureBackend` hands out real `LocalTrack`s without touching any
//! hardware, and remembers every track it opened so tests can assert that
//! all of them were released.

use async_trait::async_trait;
use call_core::errors::DeviceError;
use call_core::media::{
    AudioConstraints, CaptureBackend, LocalTrack, ScreenConstraints, TrackKind, VideoConstraints,
};
use common::types::StreamId;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Mock capture backend. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MockCaptureBackend {
    inner: Arc<Mutex<CaptureInner>>,
}

#[derive(Debug, Default)]
struct CaptureInner {
    microphone_error: Option<DeviceError>,
    camera_error: Option<DeviceError>,
    screen_error: Option<DeviceError>,
    /// When set, microphone acquisition waits here, like a pending
    /// permission prompt.
    permission_gate: Option<Arc<Notify>>,
    opened: Vec<LocalTrack>,
}

impl MockCaptureBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_microphone(&self, error: DeviceError) {
        self.inner.lock().unwrap().microphone_error = Some(error);
    }

    pub fn fail_camera(&self, error: DeviceError) {
        self.inner.lock().unwrap().camera_error = Some(error);
    }

    pub fn fail_screen(&self, error: DeviceError) {
        self.inner.lock().unwrap().screen_error = Some(error);
    }

    /// Clear every scripted failure.
    pub fn heal(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.microphone_error = None;
        inner.camera_error = None;
        inner.screen_error = None;
    }

    /// Make the next microphone acquisition wait for `grant_permission`.
    pub fn hold_permission(&self) {
        self.inner.lock().unwrap().permission_gate = Some(Arc::new(Notify::new()));
    }

    /// Let a held acquisition continue.
    pub fn grant_permission(&self) {
        if let Some(gate) = self.inner.lock().unwrap().permission_gate.take() {
            gate.notify_one();
        }
    }

    /// Every track opened so far.
    #[must_use]
    pub fn opened_tracks(&self) -> Vec<LocalTrack> {
        self.inner.lock().unwrap().opened.clone()
    }

    /// Opened tracks that are still live.
    #[must_use]
    pub fn live_tracks(&self) -> Vec<LocalTrack> {
        self.opened_tracks()
            .into_iter()
            .filter(|t| !t.is_ended())
            .collect()
    }

    /// Whether every opened track has been stopped.
    #[must_use]
    pub fn all_released(&self) -> bool {
        self.live_tracks().is_empty()
    }

    /// End every live display track, as the OS "stop sharing" control does.
    pub fn stop_screen_from_os(&self) {
        for track in self.live_tracks() {
            if track.label().starts_with("display") {
                track.stop();
            }
        }
    }

    fn open(&self, kind: TrackKind, label: &str, stream_id: StreamId) -> LocalTrack {
        let track = LocalTrack::new(kind, label, stream_id);
        self.inner.lock().unwrap().opened.push(track.clone());
        track
    }
}

#[async_trait]
impl CaptureBackend for MockCaptureBackend {
    async fn open_microphone(
        &self,
        _constraints: &AudioConstraints,
        stream_id: StreamId,
    ) -> Result<LocalTrack, DeviceError> {
        let gate = self.inner.lock().unwrap().permission_gate.clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        if let Some(error) = self.inner.lock().unwrap().microphone_error.clone() {
            return Err(error);
        }
        Ok(self.open(TrackKind::Audio, "mock microphone", stream_id))
    }

    async fn open_camera(
        &self,
        _constraints: &VideoConstraints,
        stream_id: StreamId,
    ) -> Result<LocalTrack, DeviceError> {
        if let Some(error) = self.inner.lock().unwrap().camera_error.clone() {
            return Err(error);
        }
        Ok(self.open(TrackKind::Video, "mock camera", stream_id))
    }

    async fn open_screen(
        &self,
        constraints: &ScreenConstraints,
        stream_id: StreamId,
    ) -> Result<Vec<LocalTrack>, DeviceError> {
        if let Some(error) = self.inner.lock().unwrap().screen_error.clone() {
            return Err(error);
        }

        let mut tracks = vec![self.open(TrackKind::Video, "display video", stream_id)];
        if constraints.capture_audio {
            tracks.push(self.open(TrackKind::Audio, "display audio", stream_id));
        }
        Ok(tracks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use call_core::media::MediaCaptureController;
    use std::time::Duration;

    #[tokio::test]
    async fn test_release_is_tracked() {
        let backend = MockCaptureBackend::new();
        let controller = MediaCaptureController::new(Arc::new(backend.clone()), 30);

        let stream = controller.acquire(true).await.unwrap();
        assert_eq!(backend.opened_tracks().len(), 2);
        assert!(!backend.all_released());

        controller.release(&stream);
        assert!(backend.all_released());
    }

    #[tokio::test]
    async fn test_os_stop_ends_display_only() {
        let backend = MockCaptureBackend::new();
        let controller = MediaCaptureController::new(Arc::new(backend.clone()), 30);

        let camera = controller.acquire(false).await.unwrap();
        let screen = controller.acquire_screen().await.unwrap();

        backend.stop_screen_from_os();
        assert!(screen.tracks().iter().all(LocalTrack::is_ended));
        assert!(camera.tracks().iter().all(|t| !t.is_ended()));
    }

    #[tokio::test]
    async fn test_held_permission_waits_for_grant() {
        let backend = MockCaptureBackend::new();
        backend.hold_permission();
        let controller = MediaCaptureController::new(Arc::new(backend.clone()), 30);

        let task = tokio::spawn(async move { controller.acquire(false).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!task.is_finished());

        backend.grant_permission();
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_scripted_failure() {
        let backend = MockCaptureBackend::new();
        backend.fail_camera(DeviceError::Busy(TrackKind::Video));
        let controller = MediaCaptureController::new(Arc::new(backend.clone()), 30);

        let result = controller.acquire(true).await;
        assert_eq!(result.unwrap_err(), DeviceError::Busy(TrackKind::Video));
        assert!(backend.all_released());
    }
}
