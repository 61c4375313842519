//! Storage trait: the optional durable key/value collaborator.
//!
//! Session and memory stores work entirely in process. When a `Storage`
//! is attached they write through to it, using key prefixes to scope data:
//! `session_<id>` for sessions and `memory_<sessionId>_<key>` for memories.

use crate::error::StorageError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// One stored value with its write time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageEntry {
    pub key: String,

    /// JSON-encoded payload
    pub value: String,

    pub timestamp: DateTime<Utc>,
}

impl StorageEntry {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            timestamp: Utc::now(),
        }
    }

    /// Decode the JSON payload.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, StorageError> {
        serde_json::from_str(&self.value).map_err(|e| StorageError::Serialization {
            key: self.key.clone(),
            reason: e.to_string(),
        })
    }
}

/// The core Storage trait.
///
/// Implementations: in-memory, JSONL file, SQLite.
#[async_trait]
pub trait Storage: Send + Sync {
    /// The backend name (e.g., "memory", "file", "sqlite").
    fn name(&self) -> &str;

    /// Insert or overwrite a value.
    async fn store(&self, key: &str, value: String) -> Result<(), StorageError>;

    /// Fetch a value by exact key.
    async fn retrieve(&self, key: &str) -> Result<Option<StorageEntry>, StorageError>;

    /// Delete a single key. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool, StorageError>;

    /// Delete every key starting with `prefix`. Returns how many were removed.
    async fn delete_by_prefix(&self, prefix: &str) -> Result<usize, StorageError>;

    /// Every entry whose key starts with `prefix`, ordered by key.
    async fn search_by_prefix(&self, prefix: &str) -> Result<Vec<StorageEntry>, StorageError>;
}

/// Serialize `value` as JSON and store it under `key`.
pub async fn store_json<T: Serialize + Sync>(
    storage: &dyn Storage,
    key: &str,
    value: &T,
) -> Result<(), StorageError> {
    let json = serde_json::to_string(value).map_err(|e| StorageError::Serialization {
        key: key.to_string(),
        reason: e.to_string(),
    })?;
    storage.store(key, json).await
}

/// Fetch `key` and decode it from JSON.
pub async fn retrieve_json<T: DeserializeOwned>(
    storage: &dyn Storage,
    key: &str,
) -> Result<Option<T>, StorageError> {
    match storage.retrieve(key).await? {
        Some(entry) => entry.decode().map(Some),
        None => Ok(None),
    }
}

pub fn session_key(session_id: &str) -> String {
    format!("{SESSION_PREFIX}{session_id}")
}

/// Prefix of every memory key of `session_id`. The id is escaped so that
/// no session's prefix is a prefix of another's.
pub fn memory_prefix(session_id: &str) -> String {
    let escaped = session_id.replace('%', "%25").replace('_', "%5F");
    format!("memory_{escaped}_")
}

pub fn memory_key(session_id: &str, key: &str) -> String {
    format!("{}{key}", memory_prefix(session_id))
}

pub const SESSION_PREFIX: &str = "session_";
