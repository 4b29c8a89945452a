//! Actor metrics and mailbox monitoring.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::observability::metrics as call_metrics;

/// Depth, in percent of capacity, at which a mailbox counts as backed up.
const HIGH_WATER_PERCENT: usize = 80;

/// Actor type for metrics labeling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorType {
    Session,
    Negotiator,
}

impl ActorType {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            ActorType::Session => "session",
            ActorType::Negotiator => "negotiator",
        }
    }
}

/// Watches one actor's bounded mailbox.
///
/// The actor reports the depth left behind each processed message. Crossing
/// the high-water mark logs once; the flag clears when the backlog falls
/// below half of it.
#[derive(Debug)]
pub struct MailboxMonitor {
    actor_type: ActorType,
    /// Session user id or negotiator key.
    actor_id: String,
    high_water: usize,
    backed_up: AtomicBool,
    messages_processed: AtomicU64,
    messages_dropped: AtomicU64,
}

impl MailboxMonitor {
    #[must_use]
    pub fn new(actor_type: ActorType, actor_id: impl Into<String>, capacity: usize) -> Self {
        Self {
            actor_type,
            actor_id: actor_id.into(),
            high_water: (capacity.saturating_mul(HIGH_WATER_PERCENT) / 100).max(1),
            backed_up: AtomicBool::new(false),
            messages_processed: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }

    /// Record one processed message and the number still queued behind it.
    pub fn record_processed(&self, depth: usize) {
        self.messages_processed.fetch_add(1, Ordering::Relaxed);
        call_metrics::set_actor_mailbox_depth(self.actor_type.as_str(), depth);

        if depth >= self.high_water {
            if !self.backed_up.swap(true, Ordering::Relaxed) {
                warn!(
                    target: "call.actor.mailbox",
                    actor_type = self.actor_type.as_str(),
                    actor_id = %self.actor_id,
                    depth,
                    high_water = self.high_water,
                    "Mailbox backed up"
                );
            }
        } else if depth < self.high_water / 2 && self.backed_up.swap(false, Ordering::Relaxed) {
            debug!(
                target: "call.actor.mailbox",
                actor_type = self.actor_type.as_str(),
                actor_id = %self.actor_id,
                depth,
                "Mailbox drained"
            );
        }
    }

    /// Record a message rejected because the mailbox was full.
    pub fn record_drop(&self) {
        let dropped = self.messages_dropped.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(
            target: "call.actor.mailbox",
            actor_type = self.actor_type.as_str(),
            actor_id = %self.actor_id,
            dropped,
            "Message dropped due to backpressure"
        );
    }

    #[must_use]
    pub fn is_backed_up(&self) -> bool {
        self.backed_up.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn messages_processed(&self) -> u64 {
        self.messages_processed.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn messages_dropped(&self) -> u64 {
        self.messages_dropped.load(Ordering::Relaxed)
    }
}

/// Live actor counts shared by a session and its negotiators.
#[derive(Debug, Default)]
pub struct ActorMetrics {
    active_sessions: AtomicUsize,
    active_negotiators: AtomicUsize,
    actor_panics: AtomicU64,
}

impl ActorMetrics {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn session_started(&self) {
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_stopped(&self) {
        decrement(&self.active_sessions);
    }

    pub fn negotiator_started(&self) {
        self.active_negotiators.fetch_add(1, Ordering::Relaxed);
    }

    pub fn negotiator_stopped(&self) {
        decrement(&self.active_negotiators);
    }

    /// A task ended by panicking instead of through its run loop.
    pub fn record_panic(&self, actor_type: ActorType) {
        let total = self.actor_panics.fetch_add(1, Ordering::Relaxed) + 1;
        error!(
            target: "call.actor.panic",
            actor_type = actor_type.as_str(),
            total_panics = total,
            "Actor panic detected"
        );
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.active_sessions.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn negotiator_count(&self) -> usize {
        self.active_negotiators.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn panic_count(&self) -> u64 {
        self.actor_panics.load(Ordering::Relaxed)
    }
}

fn decrement(counter: &AtomicUsize) {
    let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
        Some(n.saturating_sub(1))
    });
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_backed_up_flag_has_hysteresis() {
        let monitor = MailboxMonitor::new(ActorType::Negotiator, "bob/media", 10);

        monitor.record_processed(3);
        assert!(!monitor.is_backed_up());

        monitor.record_processed(8);
        assert!(monitor.is_backed_up());

        // Between half and the mark the flag stays set.
        monitor.record_processed(5);
        assert!(monitor.is_backed_up());

        monitor.record_processed(3);
        assert!(!monitor.is_backed_up());
        assert_eq!(monitor.messages_processed(), 4);
    }

    #[test]
    fn test_tiny_mailbox_still_has_a_mark() {
        let monitor = MailboxMonitor::new(ActorType::Session, "alice", 1);
        monitor.record_processed(0);
        assert!(!monitor.is_backed_up());
        monitor.record_processed(1);
        assert!(monitor.is_backed_up());
    }

    #[test]
    fn test_drop_counter() {
        let monitor = MailboxMonitor::new(ActorType::Negotiator, "bob/screen", 16);
        monitor.record_drop();
        monitor.record_drop();
        assert_eq!(monitor.messages_dropped(), 2);
    }

    #[test]
    fn test_actor_counts_never_underflow() {
        let metrics = ActorMetrics::new();

        metrics.session_started();
        metrics.negotiator_started();
        metrics.negotiator_started();
        assert_eq!(metrics.session_count(), 1);
        assert_eq!(metrics.negotiator_count(), 2);

        metrics.negotiator_stopped();
        metrics.negotiator_stopped();
        metrics.negotiator_stopped();
        assert_eq!(metrics.negotiator_count(), 0);

        metrics.record_panic(ActorType::Negotiator);
        assert_eq!(metrics.panic_count(), 1);
    }
}
