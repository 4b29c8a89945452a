//! Signaling: wire events, the transport seam and inbound routing.

pub mod event;
pub mod router;
pub mod transport;

pub use event::{EventType, JoinPayload, SignalingEvent};
pub use router::{IgnoreReason, RouteAction, SignalingRouter};
pub use transport::{SignalingSubscription, SignalingTransport};
