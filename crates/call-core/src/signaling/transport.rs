//! Signaling transport seam.
//!
//! The transport is a broadcast channel per conversation (for example a
//! realtime pub/sub channel named `group-call:{conversation_id}`). It gives
//! no ordering guarantee across different senders and no delivery receipts.

use async_trait::async_trait;
use common::types::ConversationId;
use tokio::sync::mpsc;

use super::event::SignalingEvent;
use crate::errors::TransportError;

/// Stream of inbound events for one conversation. `recv` returns `None`
/// once the transport drops the subscription.
#[derive(Debug)]
pub struct SignalingSubscription {
    receiver: mpsc::Receiver<SignalingEvent>,
}

impl SignalingSubscription {
    #[must_use]
    pub fn new(receiver: mpsc::Receiver<SignalingEvent>) -> Self {
        Self { receiver }
    }

    pub async fn recv(&mut self) -> Option<SignalingEvent> {
        self.receiver.recv().await
    }
}

#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Subscribe to every event broadcast on the conversation channel,
    /// including this client's own.
    async fn subscribe(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<SignalingSubscription, TransportError>;

    /// Broadcast `event` on the conversation channel.
    async fn publish(
        &self,
        conversation_id: &ConversationId,
        event: &SignalingEvent,
    ) -> Result<(), TransportError>;
}
