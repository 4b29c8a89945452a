//! Identifier types shared by the call crates.
//!
//! User and conversation identifiers are opaque strings supplied by the
//! identity layer and the chat backend respectively. They travel on the wire
//! as plain JSON strings (`#[serde(transparent)]`).

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Stable identifier of a call participant, as supplied by authentication.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Wrap an identity-provider user id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for UserId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Identifier of the conversation a call belongs to. Also keys the
/// signaling channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(String);

impl ConversationId {
    /// Wrap a conversation id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name of the broadcast channel carrying this conversation's call signaling.
    #[must_use]
    pub fn channel_name(&self) -> String {
        format!("group-call:{}", self.0)
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConversationId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Unique identifier for a locally captured media stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamId(pub Uuid);

impl StreamId {
    /// Create a new random stream ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for StreamId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_user_id_serializes_as_plain_string() {
        let id = UserId::new("alice");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"alice\"");

        let back: UserId = serde_json::from_str("\"bob\"").unwrap();
        assert_eq!(back.as_str(), "bob");
    }

    #[test]
    fn test_user_id_ordering_is_lexicographic() {
        assert!(UserId::from("alice") < UserId::from("bob"));
        assert!(UserId::from("bob") > UserId::from("Bob"));
    }

    #[test]
    fn test_conversation_channel_name() {
        let id = ConversationId::from("conv-42");
        assert_eq!(id.channel_name(), "group-call:conv-42");
        assert_eq!(id.to_string(), "conv-42");
    }

    #[test]
    fn test_stream_ids_are_unique() {
        assert_ne!(StreamId::new(), StreamId::new());
    }
}
