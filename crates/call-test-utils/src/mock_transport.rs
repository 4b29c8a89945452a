//! In-memory signaling bus.
//!
//! Behaves like a broadcast pub/sub channel per conversation:
//! - Every subscriber receives every event, including its own
//! - Every event goes through JSON on the way, like the real wire
//! - Delivery is at-most-once; a full subscriber queue drops the event
//!
//! Events of selected types can be held back and released later to force
//! cross-sender reordering.
//!
//! # Example
//!
//! ```rust,ignore
//! use call_test_utils::MockSignalingBus;
//!
//! let bus = MockSignalingBus::new();
//! bus.hold(EventType::Answer);
//! // ... candidates overtake the answer ...
//! bus.release_held();
//! ```

use async_trait::async_trait;
use call_core::errors::TransportError;
use call_core::signaling::{EventType, SignalingEvent, SignalingSubscription, SignalingTransport};
use common::types::{ConversationId, UserId};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Per-subscriber queue capacity.
const SUBSCRIBER_BUFFER: usize = 1024;

/// Mock broadcast transport shared by every client of a test call.
#[derive(Debug, Clone, Default)]
pub struct MockSignalingBus {
    inner: Arc<Mutex<BusInner>>,
}

#[derive(Debug, Default)]
struct BusInner {
    subscribers: HashMap<ConversationId, Vec<mpsc::Sender<SignalingEvent>>>,
    /// Every accepted publish, in order.
    published: Vec<SignalingEvent>,
    subscribe_count: usize,
    fail_subscribe: bool,
    fail_publish_from: HashSet<UserId>,
    held_types: HashSet<EventType>,
    held: Vec<(ConversationId, SignalingEvent)>,
}

impl BusInner {
    fn deliver(&mut self, conversation_id: &ConversationId, event: &SignalingEvent) {
        if let Some(subscribers) = self.subscribers.get_mut(conversation_id) {
            subscribers.retain(|tx| !tx.is_closed());
            for tx in subscribers.iter() {
                let _ = tx.try_send(event.clone());
            }
        }
    }
}

impl MockSignalingBus {
    /// Create a bus with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subscribe fail.
    pub fn fail_subscribe(&self, fail: bool) {
        self.inner.lock().unwrap().fail_subscribe = fail;
    }

    /// Make every publish by `user_id` fail.
    pub fn fail_publish_from(&self, user_id: &UserId) {
        self.inner
            .lock()
            .unwrap()
            .fail_publish_from
            .insert(user_id.clone());
    }

    /// Let `user_id` publish again.
    pub fn restore_publish_from(&self, user_id: &UserId) {
        self.inner.lock().unwrap().fail_publish_from.remove(user_id);
    }

    /// Hold back published events of `event_type` until `release_held`.
    pub fn hold(&self, event_type: EventType) {
        self.inner.lock().unwrap().held_types.insert(event_type);
    }

    /// Deliver every held event in publish order and stop holding.
    pub fn release_held(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.held_types.clear();
        let held = std::mem::take(&mut inner.held);
        for (conversation_id, event) in held {
            inner.deliver(&conversation_id, &event);
        }
    }

    /// Number of events currently held back.
    #[must_use]
    pub fn held_count(&self) -> usize {
        self.inner.lock().unwrap().held.len()
    }

    /// Deliver `event` to every subscriber as if someone published it.
    pub fn inject(&self, conversation_id: &ConversationId, event: SignalingEvent) {
        let wire = round_trip(&event);
        let mut inner = self.inner.lock().unwrap();
        inner.published.push(wire.clone());
        inner.deliver(conversation_id, &wire);
    }

    /// Drop every subscription; subscribers see their stream end.
    pub fn disconnect_all(&self) {
        self.inner.lock().unwrap().subscribers.clear();
    }

    /// All accepted publishes, in order.
    #[must_use]
    pub fn published(&self) -> Vec<SignalingEvent> {
        self.inner.lock().unwrap().published.clone()
    }

    /// Accepted publishes of one type.
    #[must_use]
    pub fn published_of_type(&self, event_type: EventType) -> Vec<SignalingEvent> {
        self.inner
            .lock()
            .unwrap()
            .published
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }

    /// Count of accepted publishes of one type.
    #[must_use]
    pub fn count_of(&self, event_type: EventType) -> usize {
        self.published_of_type(event_type).len()
    }

    /// Accepted publishes of one type sent by `sender_id`.
    #[must_use]
    pub fn published_by(&self, sender_id: &UserId, event_type: EventType) -> Vec<SignalingEvent> {
        self.published_of_type(event_type)
            .into_iter()
            .filter(|e| &e.sender_id == sender_id)
            .collect()
    }

    /// Number of successful subscribe calls.
    #[must_use]
    pub fn subscribe_count(&self) -> usize {
        self.inner.lock().unwrap().subscribe_count
    }
}

/// Serialize and parse an event, as the real wire does.
fn round_trip(event: &SignalingEvent) -> SignalingEvent {
    let json = event.to_json().unwrap();
    SignalingEvent::from_json(&json).unwrap()
}

#[async_trait]
impl SignalingTransport for MockSignalingBus {
    async fn subscribe(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<SignalingSubscription, TransportError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_subscribe {
            return Err(TransportError::Subscribe(
                "mock subscribe failure".to_string(),
            ));
        }

        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        inner
            .subscribers
            .entry(conversation_id.clone())
            .or_default()
            .push(tx);
        inner.subscribe_count += 1;
        Ok(SignalingSubscription::new(rx))
    }

    async fn publish(
        &self,
        conversation_id: &ConversationId,
        event: &SignalingEvent,
    ) -> Result<(), TransportError> {
        let wire = round_trip(event);

        let mut inner = self.inner.lock().unwrap();
        if inner.fail_publish_from.contains(&wire.sender_id) {
            return Err(TransportError::Publish("mock publish failure".to_string()));
        }

        inner.published.push(wire.clone());
        if inner.held_types.contains(&wire.event_type) {
            inner.held.push((conversation_id.clone(), wire));
        } else {
            inner.deliver(conversation_id, &wire);
        }
        Ok(())
    }
}
