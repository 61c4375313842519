//! Memory record: a session-scoped fact with an importance weight.
//!
//! Relevance is keyword scoring, not embeddings: a record is related to a
//! query when its content contains one of the query's keywords.

use crate::session::SessionId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Words of this length or shorter are ignored when matching.
pub const MIN_KEYWORD_LEN: usize = 3;

/// A single memory record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: String,

    /// Caller-chosen key, unique within a session
    pub key: String,

    pub content: String,

    /// Owning session; records never cross sessions
    pub session_id: SessionId,

    pub timestamp: DateTime<Utc>,

    /// Relevance multiplier
    #[serde(default = "default_importance")]
    pub importance: f32,

    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

pub fn default_importance() -> f32 {
    1.0
}

impl MemoryRecord {
    pub fn new(
        key: impl Into<String>,
        content: impl Into<String>,
        session_id: SessionId,
        importance: f32,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            key: key.into(),
            content: content.into(),
            session_id,
            timestamp: Utc::now(),
            importance,
            metadata: serde_json::Map::new(),
        }
    }

    /// Number of `keywords` contained in this record's content.
    pub fn keyword_hits(&self, keywords: &[String]) -> usize {
        let content = self.content.to_lowercase();
        keywords.iter().filter(|k| content.contains(k.as_str())).count()
    }
}

/// Lowercased query words longer than [`MIN_KEYWORD_LEN`], deduplicated.
pub fn extract_keywords(query: &str) -> Vec<String> {
    let mut keywords: Vec<String> = Vec::new();
    for word in query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() > MIN_KEYWORD_LEN)
    {
        let word = word.to_lowercase();
        if !keywords.contains(&word) {
            keywords.push(word);
        }
    }
    keywords
}
