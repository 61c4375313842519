//! Session store: the canonical, observable conversation state.
//!
//! The whole session collection lives in one immutable [`SessionSnapshot`]
//! published through a `tokio::sync::watch` channel. Every mutation is a
//! transform over the full collection: clone, modify, bump the version,
//! publish. Readers hold an `Arc` to a complete snapshot and never see a
//! half-applied change.
//!
//! When a [`Storage`] is attached, changed sessions are written through
//! under `session_<id>`. Storage failures are logged; the in-process
//! snapshot stays authoritative.

use chrono::Utc;
use llamachat_core::error::{SessionError, StorageError};
use llamachat_core::message::{Message, Sender};
use llamachat_core::session::{DEFAULT_SESSION_NAME, Session, SessionId, SessionSnapshot};
use llamachat_core::storage::{self, SESSION_PREFIX, Storage};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub struct SessionStore {
    state: watch::Sender<Arc<SessionSnapshot>>,
    storage: Option<Arc<dyn Storage>>,
}

impl SessionStore {
    /// An empty store with no active session.
    pub fn new() -> Self {
        Self::with_snapshot(SessionSnapshot::default(), None)
    }

    /// An empty store that writes changed sessions through to `storage`.
    pub fn with_storage(storage: Arc<dyn Storage>) -> Self {
        Self::with_snapshot(SessionSnapshot::default(), Some(storage))
    }

    /// Rebuild the store from every `session_*` entry in `storage`.
    ///
    /// Sessions come back in creation order; the most recently updated
    /// one becomes active. Undecodable entries are skipped.
    pub async fn restore(storage: Arc<dyn Storage>) -> Result<Self, StorageError> {
        let mut sessions = Vec::new();
        for entry in storage.search_by_prefix(SESSION_PREFIX).await? {
            match entry.decode::<Session>() {
                Ok(session) => sessions.push(session),
                Err(e) => warn!(error = %e, "Skipping unreadable session"),
            }
        }
        sessions.sort_by_key(|s| s.created_at);
        let active = sessions
            .iter()
            .max_by_key(|s| s.updated_at)
            .map(|s| s.id.clone());

        info!(count = sessions.len(), backend = storage.name(), "Sessions restored");
        Ok(Self::with_snapshot(
            SessionSnapshot {
                version: 0,
                sessions,
                active,
            },
            Some(storage),
        ))
    }

    fn with_snapshot(snapshot: SessionSnapshot, storage: Option<Arc<dyn Storage>>) -> Self {
        let (state, _) = watch::channel(Arc::new(snapshot));
        Self { state, storage }
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> Arc<SessionSnapshot> {
        self.state.borrow().clone()
    }

    /// Follow every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<Arc<SessionSnapshot>> {
        self.state.subscribe()
    }

    pub fn active_id(&self) -> Option<SessionId> {
        self.state.borrow().active.clone()
    }

    /// Apply `f` to a copy of the collection and publish it if `f` succeeds.
    ///
    /// The watch channel's write lock is held for the whole transform, so
    /// concurrent transforms are applied one after another.
    fn transform<T>(
        &self,
        f: impl FnOnce(&mut SessionSnapshot) -> Result<T, SessionError>,
    ) -> Result<T, SessionError> {
        let mut outcome = None;
        self.state.send_if_modified(|current| {
            let mut next = SessionSnapshot::clone(current);
            match f(&mut next) {
                Ok(value) => {
                    next.version += 1;
                    *current = Arc::new(next);
                    outcome = Some(Ok(value));
                    true
                }
                Err(e) => {
                    outcome = Some(Err(e));
                    false
                }
            }
        });
        outcome.unwrap_or_else(|| unreachable!("send_if_modified always runs its closure"))
    }

    async fn persist(&self, id: &SessionId) {
        let Some(storage) = &self.storage else {
            return;
        };
        let Some(session) = self.state.borrow().get(id).cloned() else {
            return;
        };
        if let Err(e) = storage::store_json(storage.as_ref(), &storage::session_key(id.as_str()), &session).await {
            warn!(session_id = %id, error = %e, "Failed to persist session");
        }
    }

    /// Create a session and make it active.
    pub async fn create_session(&self, name: Option<&str>) -> SessionId {
        let session = Session::new(name.unwrap_or(DEFAULT_SESSION_NAME));
        let id = session.id.clone();
        let created = self.transform(|snap| {
            snap.sessions.push(session);
            snap.active = Some(id.clone());
            Ok(())
        });
        if created.is_ok() {
            debug!(session_id = %id, "Session created");
            self.persist(&id).await;
        }
        id
    }

    /// Make `id` the active session.
    pub fn set_active(&self, id: &SessionId) -> Result<(), SessionError> {
        self.transform(|snap| {
            if snap.get(id).is_none() {
                return Err(SessionError::NotFound(id.to_string()));
            }
            snap.active = Some(id.clone());
            Ok(())
        })
    }

    /// Append to the active session. Returns the session it landed in.
    pub async fn append_message(&self, message: Message) -> Result<SessionId, SessionError> {
        let id = self.active_id().ok_or(SessionError::NoActiveSession)?;
        self.append_message_to(&id, message).await?;
        Ok(id)
    }

    /// Append to a specific session and bump its `updated_at`.
    pub async fn append_message_to(&self, id: &SessionId, message: Message) -> Result<(), SessionError> {
        self.transform(|snap| {
            let session = session_mut(snap, id)?;
            session.messages.push(message);
            session.updated_at = Utc::now();
            Ok(())
        })?;
        self.persist(id).await;
        Ok(())
    }

    /// Remove a message from the active session.
    pub async fn remove_message(&self, message_id: &str) -> Result<(), SessionError> {
        let id = self.active_id().ok_or(SessionError::NoActiveSession)?;
        self.remove_message_from(&id, message_id).await
    }

    pub async fn remove_message_from(&self, id: &SessionId, message_id: &str) -> Result<(), SessionError> {
        self.transform(|snap| {
            let session = session_mut(snap, id)?;
            let before = session.messages.len();
            session.messages.retain(|m| m.id != message_id);
            if session.messages.len() == before {
                return Err(SessionError::MessageNotFound(message_id.to_string()));
            }
            Ok(())
        })?;
        self.persist(id).await;
        Ok(())
    }

    /// Swap the message with `message.id` in place and persist the session.
    pub async fn replace_message(&self, id: &SessionId, message: Message) -> Result<(), SessionError> {
        self.update_in_place(id, message)?;
        self.persist(id).await;
        Ok(())
    }

    /// Swap a message in place without writing through.
    ///
    /// For transient updates such as a streaming placeholder.
    pub fn update_in_place(&self, id: &SessionId, message: Message) -> Result<(), SessionError> {
        self.transform(|snap| {
            let session = session_mut(snap, id)?;
            let slot = session
                .messages
                .iter_mut()
                .find(|m| m.id == message.id)
                .ok_or_else(|| SessionError::MessageNotFound(message.id.clone()))?;
            *slot = message;
            Ok(())
        })
    }

    pub async fn clear_messages(&self, id: &SessionId) -> Result<(), SessionError> {
        self.transform(|snap| {
            let session = session_mut(snap, id)?;
            session.messages.clear();
            session.updated_at = Utc::now();
            Ok(())
        })?;
        self.persist(id).await;
        Ok(())
    }

    pub async fn rename(&self, id: &SessionId, name: &str) -> Result<(), SessionError> {
        self.transform(|snap| {
            session_mut(snap, id)?.name = name.to_string();
            Ok(())
        })?;
        self.persist(id).await;
        Ok(())
    }

    pub async fn set_metadata(
        &self,
        id: &SessionId,
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), SessionError> {
        self.transform(|snap| {
            session_mut(snap, id)?.metadata.insert(key.to_string(), value);
            Ok(())
        })?;
        self.persist(id).await;
        Ok(())
    }

    /// Delete a session. If it was active, the first remaining session
    /// becomes active, or none when the store is empty.
    pub async fn delete_session(&self, id: &SessionId) -> Result<(), SessionError> {
        self.transform(|snap| {
            let before = snap.sessions.len();
            snap.sessions.retain(|s| &s.id != id);
            if snap.sessions.len() == before {
                return Err(SessionError::NotFound(id.to_string()));
            }
            if snap.active.as_ref() == Some(id) {
                snap.active = snap.sessions.first().map(|s| s.id.clone());
            }
            Ok(())
        })?;

        if let Some(storage) = &self.storage {
            if let Err(e) = storage.delete(&storage::session_key(id.as_str())).await {
                warn!(session_id = %id, error = %e, "Failed to delete stored session");
            }
        }
        debug!(session_id = %id, "Session deleted");
        Ok(())
    }

    /// Look a message up in the active session by sender and trimmed text.
    pub fn find_message(&self, sender: Sender, text: &str) -> Option<Message> {
        self.state
            .borrow()
            .active_session()
            .and_then(|s| s.find_message(sender, text))
            .cloned()
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

fn session_mut<'a>(snap: &'a mut SessionSnapshot, id: &SessionId) -> Result<&'a mut Session, SessionError> {
    snap.sessions
        .iter_mut()
        .find(|s| &s.id == id)
        .ok_or_else(|| SessionError::NotFound(id.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::in_memory::InMemoryStorage;

    #[tokio::test]
    async fn create_makes_session_active() {
        let store = SessionStore::new();
        assert!(store.active_id().is_none());

        let a = store.create_session(None).await;
        let b = store.create_session(Some("Second")).await;
        let snap = store.snapshot();
        assert_eq!(snap.sessions.len(), 2);
        assert_eq!(snap.active.as_ref(), Some(&b));
        assert_eq!(snap.get(&a).unwrap().name, DEFAULT_SESSION_NAME);
        assert_eq!(snap.get(&b).unwrap().name, "Second");
    }

    #[tokio::test]
    async fn set_active_unknown_is_not_found() {
        let store = SessionStore::new();
        store.create_session(None).await;
        let err = store.set_active(&SessionId::from("nope")).unwrap_err();
        assert_eq!(err, SessionError::NotFound("nope".into()));
    }

    #[tokio::test]
    async fn append_without_active_session_fails() {
        let store = SessionStore::new();
        let err = store.append_message(Message::user("hi", 1)).await.unwrap_err();
        assert_eq!(err, SessionError::NoActiveSession);
    }

    #[tokio::test]
    async fn append_bumps_updated_at_and_version() {
        let store = SessionStore::new();
        let id = store.create_session(None).await;
        let before = store.snapshot();

        store.append_message(Message::user("hi", 1)).await.unwrap();
        let after = store.snapshot();
        assert!(after.version > before.version);
        assert!(after.get(&id).unwrap().updated_at >= before.get(&id).unwrap().updated_at);
        assert_eq!(after.active_messages().len(), 1);
        // The old snapshot is untouched
        assert!(before.active_messages().is_empty());
    }

    #[tokio::test]
    async fn remove_and_replace_messages() {
        let store = SessionStore::new();
        let id = store.create_session(None).await;
        let placeholder = Message::ai("...", 0);
        let pid = placeholder.id.clone();
        store.append_message(Message::user("q", 1)).await.unwrap();
        store.append_message(placeholder.clone()).await.unwrap();

        let filled = placeholder.successor("answer", Default::default());
        store.replace_message(&id, filled).await.unwrap();
        let snap = store.snapshot();
        assert_eq!(snap.active_messages()[1].text, "answer");
        assert_eq!(snap.active_messages()[1].id, pid);

        store.remove_message(&pid).await.unwrap();
        assert_eq!(store.snapshot().active_messages().len(), 1);
        assert_eq!(
            store.remove_message(&pid).await.unwrap_err(),
            SessionError::MessageNotFound(pid)
        );
    }

    #[tokio::test]
    async fn delete_active_moves_pointer() {
        let store = SessionStore::new();
        let a = store.create_session(Some("A")).await;
        let b = store.create_session(Some("B")).await;

        store.delete_session(&b).await.unwrap();
        assert_eq!(store.active_id(), Some(a.clone()));

        store.delete_session(&a).await.unwrap();
        assert_eq!(store.active_id(), None);
        assert!(store.snapshot().sessions.is_empty());
    }

    #[tokio::test]
    async fn delete_inactive_keeps_pointer() {
        let store = SessionStore::new();
        let a = store.create_session(Some("A")).await;
        let b = store.create_session(Some("B")).await;
        store.delete_session(&a).await.unwrap();
        assert_eq!(store.active_id(), Some(b));
    }

    #[tokio::test]
    async fn rename_metadata_and_clear() {
        let store = SessionStore::new();
        let id = store.create_session(None).await;
        store.append_message(Message::user("x", 1)).await.unwrap();
        store.rename(&id, "Renamed").await.unwrap();
        store
            .set_metadata(&id, "pinned", serde_json::json!(true))
            .await
            .unwrap();
        store.clear_messages(&id).await.unwrap();

        let snap = store.snapshot();
        let s = snap.get(&id).unwrap();
        assert_eq!(s.name, "Renamed");
        assert_eq!(s.metadata["pinned"], serde_json::json!(true));
        assert!(s.messages.is_empty());
    }

    #[tokio::test]
    async fn find_message_by_trimmed_text() {
        let store = SessionStore::new();
        store.create_session(None).await;
        store.append_message(Message::ai("  Paris.  ", 2)).await.unwrap();
        assert!(store.find_message(Sender::Ai, "Paris.").is_some());
        assert!(store.find_message(Sender::User, "Paris.").is_none());
    }

    #[tokio::test]
    async fn subscribers_see_complete_snapshots() {
        let store = Arc::new(SessionStore::new());
        let id = store.create_session(None).await;
        let mut rx = store.subscribe();

        let writer = {
            let store = store.clone();
            tokio::spawn(async move {
                for i in 0..50 {
                    store.append_message(Message::user(format!("m{i}"), 1)).await.unwrap();
                }
            })
        };

        let mut last_len = 0;
        let mut last_version = 0;
        while rx.changed().await.is_ok() {
            let snap = rx.borrow_and_update().clone();
            let len = snap.get(&id).unwrap().messages.len();
            assert!(len >= last_len);
            assert!(snap.version > last_version);
            last_len = len;
            last_version = snap.version;
            if len == 50 {
                break;
            }
        }
        writer.await.unwrap();
        assert_eq!(store.snapshot().active_messages().len(), 50);
    }

    #[tokio::test]
    async fn concurrent_appends_are_not_lost() {
        let store = Arc::new(SessionStore::new());
        store.create_session(None).await;
        let mut tasks = Vec::new();
        for t in 0..8 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                for i in 0..25 {
                    store
                        .append_message(Message::user(format!("{t}-{i}"), 1))
                        .await
                        .unwrap();
                }
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(store.snapshot().active_messages().len(), 200);
    }

    #[tokio::test]
    async fn write_through_and_restore() {
        let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
        let store = SessionStore::with_storage(storage.clone());
        let a = store.create_session(Some("A")).await;
        let b = store.create_session(Some("B")).await;
        store.append_message(Message::user("in b", 1)).await.unwrap();
        store.set_active(&a).unwrap();
        store.append_message(Message::user("in a", 1)).await.unwrap();

        let restored = SessionStore::restore(storage.clone()).await.unwrap();
        let snap = restored.snapshot();
        assert_eq!(snap.sessions.len(), 2);
        assert_eq!(snap.sessions[0].id, a);
        assert_eq!(snap.sessions[1].id, b);
        // A was written last
        assert_eq!(snap.active.as_ref(), Some(&a));
        assert_eq!(snap.active_messages()[0].text, "in a");

        restored.delete_session(&b).await.unwrap();
        assert!(storage.retrieve(&storage::session_key(b.as_str())).await.unwrap().is_none());
        assert_eq!(storage.search_by_prefix(SESSION_PREFIX).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn transient_updates_are_not_persisted() {
        let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
        let store = SessionStore::with_storage(storage.clone());
        let id = store.create_session(None).await;
        let placeholder = Message::ai("", 0);
        store.append_message(placeholder.clone()).await.unwrap();
        store
            .update_in_place(&id, placeholder.successor("partial", Default::default()))
            .unwrap();

        let stored: Session = storage::retrieve_json(storage.as_ref(), &storage::session_key(id.as_str()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.messages[0].text, "");
        assert_eq!(store.snapshot().active_messages()[0].text, "partial");
    }
}
