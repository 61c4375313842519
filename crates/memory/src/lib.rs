//! Conversation state for llamachat.
//!
//! - [`SessionStore`]: versioned copy-on-write snapshot of all sessions
//! - [`MemoryStore`]: session-scoped facts ranked by keyword relevance
//! - [`ResponseCache`]: exact and fuzzy answers for repeated questions
//! - storage backends implementing [`llamachat_core::Storage`]

pub mod file_backend;
pub mod in_memory;
pub mod memory_store;
pub mod response_cache;
pub mod session_store;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use file_backend::FileStorage;
pub use in_memory::InMemoryStorage;
pub use memory_store::MemoryStore;
pub use response_cache::ResponseCache;
pub use session_store::SessionStore;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStorage;

use llamachat_config::{StorageBackendKind, StorageConfig};
use llamachat_core::error::StorageError;
use llamachat_core::storage::Storage;
use std::sync::Arc;

/// Open the backend selected by `config`.
pub async fn open_storage(config: &StorageConfig) -> Result<Arc<dyn Storage>, StorageError> {
    match config.backend {
        StorageBackendKind::Memory => Ok(Arc::new(InMemoryStorage::new())),
        StorageBackendKind::File => Ok(Arc::new(FileStorage::new(config.resolved_path()))),
        #[cfg(feature = "sqlite")]
        StorageBackendKind::Sqlite => {
            let path = config.resolved_path();
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| StorageError::Io(e.to_string()))?;
            }
            Ok(Arc::new(SqliteStorage::new(&path.to_string_lossy()).await?))
        }
        #[cfg(not(feature = "sqlite"))]
        StorageBackendKind::Sqlite => Err(StorageError::Backend(
            "built without the `sqlite` feature".into(),
        )),
    }
}
