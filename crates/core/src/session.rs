//! Session domain types.
//!
//! A session is one conversation thread. The whole collection of sessions
//! is published as an immutable [`SessionSnapshot`]; every change produces
//! a new snapshot with a higher version.

use crate::message::{Message, Sender};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub const DEFAULT_SESSION_NAME: &str = "New Conversation";

/// One conversation: ordered messages plus metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,

    /// Display name
    pub name: String,

    /// Ordered messages; insertion order is conversation order
    #[serde(default)]
    pub messages: Vec<Message>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Session {
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: SessionId::new(),
            name: name.into(),
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
            metadata: serde_json::Map::new(),
        }
    }

    /// Look a message up by sender and trimmed text.
    pub fn find_message(&self, sender: Sender, text: &str) -> Option<&Message> {
        self.messages.iter().find(|m| m.matches(sender, text))
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_NAME)
    }
}

/// An immutable, versioned view of every session and the active pointer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionSnapshot {
    /// Bumped on every published change
    pub version: u64,

    /// Sessions in creation order
    pub sessions: Vec<Session>,

    /// Always references an entry of `sessions` when that list is non-empty
    pub active: Option<SessionId>,
}

impl SessionSnapshot {
    pub fn get(&self, id: &SessionId) -> Option<&Session> {
        self.sessions.iter().find(|s| &s.id == id)
    }

    pub fn active_session(&self) -> Option<&Session> {
        self.active.as_ref().and_then(|id| self.get(id))
    }

    /// Messages of the active session, empty if there is none.
    pub fn active_messages(&self) -> &[Message] {
        self.active_session()
            .map(|s| s.messages.as_slice())
            .unwrap_or_default()
    }
}
