//! Metrics definitions for the call core.
//!
//! All metrics follow Prometheus naming conventions:
//! - `call_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded:
//! - `event_type`: 9 signaling event types
//! - `disposition`: routed, self, not_addressed, other_conversation, malformed
//! - `class`: media, screen
//! - `outcome`: connected, failed, disconnected, timeout, error, closed
//! - `actor_type`: session, negotiator
//! - `operation`: subscribe, publish
//!
//! The library records through the `metrics` facade only. Installing an
//! exporter is up to the embedding application.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// ============================================================================
// Signaling Metrics (Counters)
// ============================================================================

/// Record one inbound signaling event and what the router did with it.
///
/// Metric: `call_signaling_events_total`
/// Labels: `event_type`, `disposition`
pub fn record_signaling_event(event_type: &'static str, disposition: &'static str) {
    counter!(
        "call_signaling_events_total",
        "event_type" => event_type,
        "disposition" => disposition
    )
    .increment(1);
}

/// Record a signaling transport failure.
///
/// Metric: `call_transport_errors_total`
/// Labels: `operation` (subscribe, publish)
pub fn record_transport_error(operation: &'static str) {
    counter!("call_transport_errors_total", "operation" => operation).increment(1);
}

// ============================================================================
// Negotiation Metrics
// ============================================================================

/// Record how a negotiation ended.
///
/// Metric: `call_negotiations_total`
/// Labels: `class`, `outcome`
pub fn record_negotiation_outcome(class: &'static str, outcome: &'static str) {
    counter!(
        "call_negotiations_total",
        "class" => class,
        "outcome" => outcome
    )
    .increment(1);
}

/// Record time from first negotiation step to Connected.
///
/// Metric: `call_negotiation_duration_seconds`
/// Labels: `class`
pub fn record_negotiation_duration(class: &'static str, duration: Duration) {
    histogram!("call_negotiation_duration_seconds", "class" => class)
        .record(duration.as_secs_f64());
}

/// Set the number of live negotiators.
///
/// Metric: `call_negotiators_active`
/// Labels: `class`
pub fn set_negotiators_active(class: &'static str, count: usize) {
    // usize to f64 conversion is safe for realistic negotiator counts
    #[allow(clippy::cast_precision_loss)]
    gauge!("call_negotiators_active", "class" => class).set(count as f64);
}

/// Record a remote candidate held back until a remote description exists.
///
/// Metric: `call_candidates_queued_total`
/// Labels: `class`
pub fn record_candidate_queued(class: &'static str) {
    counter!("call_candidates_queued_total", "class" => class).increment(1);
}

// ============================================================================
// Actor Metrics
// ============================================================================

/// Set the mailbox depth for an actor type.
///
/// Metric: `call_actor_mailbox_depth`
/// Labels: `actor_type` (session, negotiator)
pub fn set_actor_mailbox_depth(actor_type: &'static str, depth: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("call_actor_mailbox_depth", "actor_type" => actor_type).set(depth as f64);
}
