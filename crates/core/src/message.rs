//! Message domain types.
//!
//! A message is immutable once created. Streaming replies are shown by
//! replacing a placeholder message with a new value, never by editing
//! the text in place.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Who produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    /// The end user
    User,
    /// The on-device model
    Ai,
    /// Application notices (load results, bench reports, errors)
    System,
}

/// Sampling parameters a reply was generated with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelParams {
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: u32,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.9,
            max_tokens: 2048,
        }
    }
}

/// Timing measured while a reply streamed out of the engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub prompt_token_count: usize,
    pub response_token_count: usize,
    pub time_to_first_token_ms: u64,
    pub average_time_per_token_ms: f32,
    pub total_generation_time_ms: u64,
}

/// Per-message metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageMetadata {
    /// Approximate token count of the text
    #[serde(default)]
    pub tokens: usize,

    /// Ids of messages / memories this message was built from
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub context_references: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_params: Option<ModelParams>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub performance: Option<PerformanceMetrics>,
}

/// A single message in a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message ID
    pub id: String,

    /// The text content
    pub text: String,

    /// Who sent this message
    pub sender: Sender,

    /// Creation time
    pub timestamp: DateTime<Utc>,

    #[serde(default)]
    pub metadata: MessageMetadata,
}

impl Message {
    /// Create a message with a fresh id and the given approximate token count.
    pub fn new(sender: Sender, text: impl Into<String>, tokens: usize) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            text: text.into(),
            sender,
            timestamp: Utc::now(),
            metadata: MessageMetadata {
                tokens,
                ..MessageMetadata::default()
            },
        }
    }

    /// Create a new user message.
    pub fn user(text: impl Into<String>, tokens: usize) -> Self {
        Self::new(Sender::User, text, tokens)
    }

    /// Create a new AI message.
    pub fn ai(text: impl Into<String>, tokens: usize) -> Self {
        Self::new(Sender::Ai, text, tokens)
    }

    /// Create a new system notice.
    pub fn system(text: impl Into<String>, tokens: usize) -> Self {
        Self::new(Sender::System, text, tokens)
    }

    /// A new message that takes over this message's id and position.
    ///
    /// Used to finalize a streaming placeholder.
    pub fn successor(&self, text: impl Into<String>, metadata: MessageMetadata) -> Self {
        Self {
            id: self.id.clone(),
            text: text.into(),
            sender: self.sender,
            timestamp: Utc::now(),
            metadata,
        }
    }

    pub fn with_model_params(mut self, params: ModelParams) -> Self {
        self.metadata.model_params = Some(params);
        self
    }

    /// Sender + trimmed-text equality, used to look messages up from UI text.
    pub fn matches(&self, sender: Sender, text: &str) -> bool {
        self.sender == sender && self.text.trim() == text.trim()
    }
}
