//! File-based storage backend: persistent JSON-lines storage.
//!
//! Each line is a JSON-encoded [`StorageEntry`]. Entries are loaded into
//! memory on creation and the whole file is rewritten on every mutation.
//!
//! Default location: `~/.llamachat/storage.jsonl`

use async_trait::async_trait;
use llamachat_core::error::StorageError;
use llamachat_core::storage::{Storage, StorageEntry};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, warn};

pub struct FileStorage {
    path: PathBuf,
    entries: RwLock<BTreeMap<String, StorageEntry>>,
}

impl FileStorage {
    /// Open the file at `path`, starting empty if it does not exist yet.
    pub fn new(path: PathBuf) -> Self {
        let entries = Self::load_from_disk(&path);
        debug!(path = %path.display(), count = entries.len(), "File storage loaded");
        Self {
            path,
            entries: RwLock::new(entries),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load_from_disk(path: &Path) -> BTreeMap<String, StorageEntry> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(_) => return BTreeMap::new(),
        };

        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str::<StorageEntry>(line) {
                Ok(entry) => Some((entry.key.clone(), entry)),
                Err(e) => {
                    warn!(error = %e, "Skipping corrupted storage entry");
                    None
                }
            })
            .collect()
    }

    async fn flush(&self, entries: &BTreeMap<String, StorageEntry>) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                StorageError::Io(format!("Failed to create storage directory: {e}"))
            })?;
        }

        let mut content = String::new();
        for entry in entries.values() {
            let line = serde_json::to_string(entry).map_err(|e| StorageError::Serialization {
                key: entry.key.clone(),
                reason: e.to_string(),
            })?;
            content.push_str(&line);
            content.push('\n');
        }

        tokio::fs::write(&self.path, content)
            .await
            .map_err(|e| StorageError::Io(format!("Failed to write storage file: {e}")))
    }
}

#[async_trait]
impl Storage for FileStorage {
    fn name(&self) -> &str {
        "file"
    }

    async fn store(&self, key: &str, value: String) -> Result<(), StorageError> {
        let mut entries = self.entries.write().await;
        entries.insert(key.to_string(), StorageEntry::new(key, value));
        self.flush(&entries).await
    }

    async fn retrieve(&self, key: &str) -> Result<Option<StorageEntry>, StorageError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let mut entries = self.entries.write().await;
        let deleted = entries.remove(key).is_some();
        if deleted {
            self.flush(&entries).await?;
        }
        Ok(deleted)
    }

    async fn delete_by_prefix(&self, prefix: &str) -> Result<usize, StorageError> {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|k, _| !k.starts_with(prefix));
        let removed = before - entries.len();
        if removed > 0 {
            self.flush(&entries).await?;
        }
        Ok(removed)
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
