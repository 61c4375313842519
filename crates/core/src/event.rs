//! Chat event bus: lets a UI follow a turn without polling.
//!
//! The session snapshot is the source of truth; events are a convenience
//! stream for live token rendering and status lines.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

/// All events published by the conversation pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ChatEvent {
    /// A fragment streamed out of the engine
    Fragment {
        session_id: String,
        message_id: String,
        text: String,
    },

    /// A turn was answered from the response cache
    CacheHit {
        session_id: String,
        query: String,
        timestamp: DateTime<Utc>,
    },

    /// A turn finished and its reply was appended
    TurnCompleted {
        session_id: String,
        message_id: String,
        fragments: usize,
        timestamp: DateTime<Utc>,
    },

    /// An in-flight turn was abandoned and retracted
    TurnCancelled {
        session_id: String,
        timestamp: DateTime<Utc>,
    },

    /// The engine transitioned between Idle and Loaded
    EngineStateChanged {
        loaded: bool,
        model_path: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// An error occurred
    ErrorOccurred {
        context: String,
        error_message: String,
        timestamp: DateTime<Utc>,
    },
}

/// A broadcast-based event bus for chat events.
///
/// Uses `tokio::sync::broadcast` for multi-consumer pub/sub.
pub struct EventBus {
    sender: broadcast::Sender<Arc<ChatEvent>>,
}

impl EventBus {
    /// Create a new event bus with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: ChatEvent) {
        // No subscribers is fine
        let _ = self.sender.send(Arc::new(event));
    }

    /// Subscribe to receive events.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<ChatEvent>> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
