//! Actor model for one call.
//!
//! ```text
//! SessionActor (one per joined call)
//! ├── owns ParticipantRegistry
//! ├── owns PeerConnectionRegistry (media)
//! │   └── NegotiatorActor (one per remote participant)
//! └── owns PeerConnectionRegistry (screen)
//!     └── NegotiatorActor (one per remote participant sharing with us or
//!         receiving our share)
//! ```
//!
//! Negotiators are cancelled through child tokens of the session token, so
//! cancelling a session tears down every negotiator it spawned.

pub mod messages;
pub mod metrics;
pub mod negotiator;
pub mod participants;
pub mod registry;
pub mod session;

pub use messages::{
    LocalFlags, NegotiatorKey, NegotiatorSnapshot, NegotiatorState, Role, SessionPhase,
    SessionSnapshot, SessionWarning, StreamClass, TerminationReason,
};
pub use metrics::{ActorMetrics, ActorType, MailboxMonitor};
pub use negotiator::{NegotiatorActor, NegotiatorHandle, NegotiatorSettings};
pub use participants::{Participant, ParticipantRegistry, RemoteStream};
pub use registry::{NegotiatorSpawner, PeerConnectionRegistry};
pub use session::{SessionActor, SessionContext, SessionHandle};
