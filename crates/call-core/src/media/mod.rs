//! Local media capture.

pub mod capture;
pub mod track;

pub use capture::{
    AudioConstraints, CaptureBackend, FacingMode, MediaCaptureController, ScreenConstraints,
    VideoConstraints,
};
pub use track::{CaptureSource, LocalStream, LocalTrack, TrackKind};
