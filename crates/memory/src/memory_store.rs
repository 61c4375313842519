//! Memory store: session-scoped facts ranked by keyword relevance.
//!
//! Records are keyed by `(session, key)`. With a [`Storage`] attached they
//! are written through as `memory_<sessionId>_<key>`.

use llamachat_core::error::StorageError;
use llamachat_core::memory::{MemoryRecord, extract_keywords};
use llamachat_core::session::SessionId;
use llamachat_core::storage::{self, Storage};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

pub struct MemoryStore {
    records: RwLock<HashMap<(SessionId, String), MemoryRecord>>,
    storage: Option<Arc<dyn Storage>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            storage: None,
        }
    }

    pub fn with_storage(storage: Arc<dyn Storage>) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            storage: Some(storage),
        }
    }

    /// Load every stored record of `session_id` into memory.
    pub async fn load_session(&self, session_id: &SessionId) -> Result<usize, StorageError> {
        let Some(storage) = &self.storage else {
            return Ok(0);
        };
        let entries = storage
            .search_by_prefix(&storage::memory_prefix(session_id.as_str()))
            .await?;
        let mut records = self.records.write().await;
        let mut loaded = 0;
        for entry in entries {
            match entry.decode::<MemoryRecord>() {
                Ok(record) => {
                    records.insert((record.session_id.clone(), record.key.clone()), record);
                    loaded += 1;
                }
                Err(e) => warn!(error = %e, "Skipping unreadable memory"),
            }
        }
        debug!(session_id = %session_id, loaded, "Memories loaded");
        Ok(loaded)
    }

    /// Create or overwrite the record `key` of `session_id`.
    pub async fn set_memory(
        &self,
        key: &str,
        content: &str,
        session_id: &SessionId,
        importance: f32,
    ) -> Result<(), StorageError> {
        let record = MemoryRecord::new(key, content, session_id.clone(), importance);
        if let Some(storage) = &self.storage {
            storage::store_json(
                storage.as_ref(),
                &storage::memory_key(session_id.as_str(), key),
                &record,
            )
            .await?;
        }
        self.records
            .write()
            .await
            .insert((session_id.clone(), key.to_string()), record);
        Ok(())
    }

    pub async fn get_memory(&self, key: &str, session_id: &SessionId) -> Option<MemoryRecord> {
        self.records
            .read()
            .await
            .get(&(session_id.clone(), key.to_string()))
            .cloned()
    }

    /// Returns whether the record existed.
    pub async fn delete_memory(&self, key: &str, session_id: &SessionId) -> Result<bool, StorageError> {
        if let Some(storage) = &self.storage {
            storage
                .delete(&storage::memory_key(session_id.as_str(), key))
                .await?;
        }
        Ok(self
            .records
            .write()
            .await
            .remove(&(session_id.clone(), key.to_string()))
            .is_some())
    }

    /// The contents of the `limit` records of `session_id` most related to `query`.
    ///
    /// Records must contain at least one query keyword (words longer than
    /// three characters); a query with no keywords matches every record.
    /// Ranking is keyword hits × importance, newest first on ties.
    pub async fn get_related_memories(
        &self,
        query: &str,
        session_id: &SessionId,
        limit: usize,
    ) -> Vec<String> {
        let keywords = extract_keywords(query);
        let records = self.records.read().await;

        let mut scored: Vec<(f32, &MemoryRecord)> = records
            .values()
            .filter(|r| &r.session_id == session_id)
            .filter_map(|r| {
                if keywords.is_empty() {
                    return Some((r.importance, r));
                }
                let hits = r.keyword_hits(&keywords);
                (hits > 0).then(|| (hits as f32 * r.importance, r))
            })
            .collect();

        scored.sort_by(|(sa, ra), (sb, rb)| {
            sb.partial_cmp(sa)
                .unwrap_or(Ordering::Equal)
                .then_with(|| rb.timestamp.cmp(&ra.timestamp))
        });
        scored
            .into_iter()
            .take(limit)
            .map(|(_, r)| r.content.clone())
            .collect()
    }

    /// Remove every record of `session_id`. Returns how many were removed.
    pub async fn clear_session_memories(&self, session_id: &SessionId) -> Result<usize, StorageError> {
        if let Some(storage) = &self.storage {
            storage
                .delete_by_prefix(&storage::memory_prefix(session_id.as_str()))
                .await?;
        }
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|(sid, _), _| sid != session_id);
        Ok(before - records.len())
    }

    pub async fn count(&self, session_id: &SessionId) -> usize {
        self.records
            .read()
            .await
            .keys()
            .filter(|(sid, _)| sid == session_id)
            .count()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::in_memory::InMemoryStorage;

    fn sid(s: &str) -> SessionId {
        SessionId::from(s)
    }

    #[tokio::test]
    async fn ranks_by_hits_times_importance() {
        let store = MemoryStore::new();
        let s = sid("s1");
        store
            .set_memory("a", "Paris is the capital of France", &s, 1.0)
            .await
            .unwrap();
        store
            .set_memory("b", "France exports wine", &s, 3.0)
            .await
            .unwrap();
        store
            .set_memory("c", "Unrelated note about cats", &s, 10.0)
            .await
            .unwrap();

        // a: 2 hits x 1.0, b: 1 hit x 3.0
        let related = store
            .get_related_memories("capital of France?", &s, 5)
            .await;
        assert_eq!(
            related,
            vec!["France exports wine", "Paris is the capital of France"]
        );
    }

    #[tokio::test]
    async fn respects_limit_and_session() {
        let store = MemoryStore::new();
        for i in 0..5 {
            store
                .set_memory(&format!("k{i}"), &format!("rust fact {i}"), &sid("s1"), 1.0)
                .await
                .unwrap();
        }
        store
            .set_memory("k", "rust in another session", &sid("s2"), 100.0)
            .await
            .unwrap();

        let related = store.get_related_memories("tell me about rust", &sid("s1"), 2).await;
        assert_eq!(related.len(), 2);
        assert!(related.iter().all(|c| c.starts_with("rust fact")));
    }

    #[tokio::test]
    async fn query_without_keywords_returns_everything() {
        let store = MemoryStore::new();
        let s = sid("s1");
        store.set_memory("a", "one", &s, 1.0).await.unwrap();
        store.set_memory("b", "two", &s, 2.0).await.unwrap();
        let related = store.get_related_memories("hi", &s, 10).await;
        assert_eq!(related, vec!["two", "one"]);
    }

    #[tokio::test]
    async fn set_overwrites_by_key() {
        let store = MemoryStore::new();
        let s = sid("s1");
        store.set_memory("k", "old", &s, 1.0).await.unwrap();
        store.set_memory("k", "new", &s, 1.0).await.unwrap();
        assert_eq!(store.count(&s).await, 1);
        assert_eq!(store.get_memory("k", &s).await.unwrap().content, "new");
    }

    #[tokio::test]
    async fn delete_and_clear() {
        let store = MemoryStore::new();
        store.set_memory("a", "x", &sid("s1"), 1.0).await.unwrap();
        store.set_memory("b", "y", &sid("s1"), 1.0).await.unwrap();
        store.set_memory("c", "z", &sid("s2"), 1.0).await.unwrap();

        assert!(store.delete_memory("a", &sid("s1")).await.unwrap());
        assert!(!store.delete_memory("a", &sid("s1")).await.unwrap());
        assert_eq!(store.clear_session_memories(&sid("s1")).await.unwrap(), 1);
        assert_eq!(store.count(&sid("s1")).await, 0);
        assert_eq!(store.count(&sid("s2")).await, 1);
    }

    #[tokio::test]
    async fn write_through_and_reload() {
        let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
        let s = sid("s1");
        {
            let store = MemoryStore::with_storage(storage.clone());
            store
                .set_memory("fact_1", "The user likes Rust", &s, 1.0)
                .await
                .unwrap();
            store.set_memory("fact_2", "other", &sid("s2"), 1.0).await.unwrap();
        }
        assert!(storage.retrieve("memory_s1_fact_1").await.unwrap().is_some());

        let store = MemoryStore::with_storage(storage.clone());
        assert_eq!(store.load_session(&s).await.unwrap(), 1);
        assert_eq!(
            store.get_related_memories("python", &s, 5).await,
            Vec::<String>::new()
        );
        assert_eq!(
            store.get_related_memories("likes", &s, 5).await,
            vec!["The user likes Rust"]
        );

        store.clear_session_memories(&s).await.unwrap();
        assert!(storage.search_by_prefix("memory_s1_").await.unwrap().is_empty());
        assert_eq!(storage.search_by_prefix("memory_s2_").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn underscore_in_session_id_does_not_leak_across_sessions() {
        let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
        let store = MemoryStore::with_storage(storage.clone());
        let short = sid("a");
        let long = sid("a_b");
        store.set_memory("k", "short fact", &short, 1.0).await.unwrap();
        store.set_memory("k", "long fact", &long, 1.0).await.unwrap();

        let fresh = MemoryStore::with_storage(storage.clone());
        assert_eq!(fresh.load_session(&short).await.unwrap(), 1);

        assert_eq!(store.clear_session_memories(&short).await.unwrap(), 1);
        let reloaded = MemoryStore::with_storage(storage);
        assert_eq!(reloaded.load_session(&long).await.unwrap(), 1);
        assert_eq!(reloaded.get_memory("k", &long).await.unwrap().content, "long fact");
    }
}
