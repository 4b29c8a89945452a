//! Mesh Call Core Library
//!
//! Signaling and session orchestration for full-mesh voice/video calls:
//!
//! - Local capture of microphone, camera and screen streams
//! - One offer/answer/ICE negotiation per remote participant and stream class
//! - Routing of broadcast signaling events to the right negotiation
//! - A per-call session state machine the UI observes and commands
//!
//! # Architecture
//!
//! ```text
//! UI ── SessionHandle ──> SessionActor ──> SignalingTransport (publish)
//!                           │   ▲
//!                           │   └── SignalingSubscription ── SignalingRouter
//!                           ├── MediaCaptureController ── CaptureBackend
//!                           └── PeerConnectionRegistry ×2
//!                                 └── NegotiatorActor ── PeerConnection
//! ```
//!
//! # Key Design Decisions
//!
//! - **Full mesh**: every participant negotiates directly with every other one
//! - **Two connections per pair**: camera/microphone and screen are negotiated
//!   independently and fail independently
//! - **Per-key serialization**: each negotiator is its own actor; early
//!   candidates are queued until the remote description is set
//! - **No auto-reconnect**: transport failures surface as session warnings
//!
//! # Modules
//!
//! - [`actors`] - Session and negotiator actors, registries
//! - [`config`] - Configuration from environment
//! - [`errors`] - Error types
//! - [`media`] - Local capture
//! - [`peer`] - Peer connection seam and the webrtc-rs adapter
//! - [`signaling`] - Wire events, routing, transport seam

pub mod actors;
pub mod config;
pub mod errors;
pub mod media;
pub mod observability;
pub mod peer;
pub mod signaling;

pub use actors::{SessionActor, SessionContext, SessionHandle};
pub use config::Config;
pub use errors::CallError;
