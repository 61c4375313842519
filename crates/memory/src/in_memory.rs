//! In-memory storage backend: fast, volatile, useful for tests and
//! for running without persistence.

use async_trait::async_trait;
use llamachat_core::error::StorageError;
use llamachat_core::storage::{Storage, StorageEntry};
use std::collections::BTreeMap;
use tokio::sync::RwLock;

/// Keys are kept ordered so prefix scans come back sorted.
pub struct InMemoryStorage {
    entries: RwLock<BTreeMap<String, StorageEntry>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    fn name(&self) -> &str {
        "memory"
    }

    async fn store(&self, key: &str, value: String) -> Result<(), StorageError> {
        self.entries
            .write()
            .await
            .insert(key.to_string(), StorageEntry::new(key, value));
        Ok(())
    }

    async fn retrieve(&self, key: &str) -> Result<Option<StorageEntry>, StorageError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.entries.write().await.remove(key).is_some())
    }

    async fn delete_by_prefix(&self, prefix: &str) -> Result<usize, StorageError> {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|k, _| !k.starts_with(prefix));
        Ok(before - entries.len())
    }

    async fn search_by_prefix(&self, prefix: &str) -> Result<Vec<StorageEntry>, StorageError> {
        let entries = self.entries.read().await;
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(_, v)| v.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn store_and_retrieve() {
        let s = InMemoryStorage::new();
        s.store("session_a", "{}".into()).await.unwrap();
        let e = s.retrieve("session_a").await.unwrap().unwrap();
        assert_eq!(e.value, "{}");
        assert!(s.retrieve("session_b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn overwrite_replaces_value() {
        let s = InMemoryStorage::new();
        s.store("k", "1".into()).await.unwrap();
        s.store("k", "2".into()).await.unwrap();
        assert_eq!(s.len().await, 1);
        assert_eq!(s.retrieve("k").await.unwrap().unwrap().value, "2");
    }

    #[tokio::test]
    async fn prefix_scan_is_ordered_and_scoped() {
        let s = InMemoryStorage::new();
        for k in ["memory_s1_b", "memory_s1_a", "memory_s2_a", "session_s1"] {
            s.store(k, "0".into()).await.unwrap();
        }
        let keys: Vec<String> = s
            .search_by_prefix("memory_s1_")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.key)
            .collect();
        assert_eq!(keys, vec!["memory_s1_a", "memory_s1_b"]);
    }

    #[tokio::test]
    async fn delete_by_prefix_counts() {
        let s = InMemoryStorage::new();
        for k in ["memory_s1_a", "memory_s1_b", "memory_s2_a"] {
            s.store(k, "0".into()).await.unwrap();
        }
        assert_eq!(s.delete_by_prefix("memory_s1_").await.unwrap(), 2);
        assert_eq!(s.len().await, 1);
        assert!(s.delete("memory_s2_a").await.unwrap());
        assert!(!s.delete("memory_s2_a").await.unwrap());
        assert!(s.is_empty().await);
    }
}
