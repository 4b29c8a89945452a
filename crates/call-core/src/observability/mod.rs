//! Observability for the call core.
//!
//! Tracing uses `#[instrument(skip_all)]` on actor loops with explicit field
//! allow-listing. SDP bodies and candidate strings never appear in spans or
//! events, only their lengths.
//!
//! # Metrics
//!
//! | Metric | Type | Labels | Purpose |
//! |--------|------|--------|---------|
//! | `call_signaling_events_total` | Counter | `event_type`, `disposition` | Inbound routing outcomes |
//! | `call_negotiations_total` | Counter | `class`, `outcome` | How negotiations end |
//! | `call_negotiators_active` | Gauge | `class` | Live negotiators |
//! | `call_negotiation_duration_seconds` | Histogram | `class` | Time to Connected |
//! | `call_candidates_queued_total` | Counter | `class` | Early candidates held back |
//! | `call_actor_mailbox_depth` | Gauge | `actor_type` | Backpressure indicator |
//! | `call_transport_errors_total` | Counter | `operation` | Signaling transport failures |

pub mod metrics;
