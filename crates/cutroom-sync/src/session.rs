//! The signed-in identity.
//!
//! The session is persisted to local storage so it survives restarts, and
//! published through a watch channel: anything holding per-user state follows
//! the channel and rebuilds when the session id changes.

use std::sync::Arc;
use std::time::Duration;

use cutroom_store::{DocumentStore, Query, Session, UserProfile};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::error::timed;
use crate::storage::{LocalStorage, SESSION_KEY};
use crate::{SyncConfig, SyncError};

/// Holder of the current session.
pub struct SessionStore {
    storage: Arc<LocalStorage>,
    store: Arc<dyn DocumentStore>,
    tx: watch::Sender<Option<Session>>,
    timeout: Duration,
}

impl SessionStore {
    /// Build the store, restoring any session persisted by a previous run.
    pub async fn restore(
        storage: Arc<LocalStorage>,
        store: Arc<dyn DocumentStore>,
        config: &SyncConfig,
    ) -> Self {
        let session: Option<Session> = storage.get(SESSION_KEY).await;
        if let Some(session) = &session {
            debug!(user = %session.id, "restored session");
        }
        let (tx, _) = watch::channel(session);
        Self {
            storage,
            store,
            tx,
            timeout: config.request_timeout,
        }
    }

    pub fn current(&self) -> Option<Session> {
        self.tx.borrow().clone()
    }

    /// Id of the signed-in user.
    pub fn user_id(&self) -> Option<String> {
        self.tx.borrow().as_ref().map(|s| s.id.clone())
    }

    /// Follow session changes. The receiver starts at the current value.
    pub fn subscribe(&self) -> watch::Receiver<Option<Session>> {
        self.tx.subscribe()
    }

    /// Sign in by looking up the team member with `email`.
    #[instrument(skip(self))]
    pub async fn login(&self, email: &str) -> Result<Session, SyncError> {
        let email = email.trim();
        if email.is_empty() {
            return Err(SyncError::Validation("email is required".to_string()));
        }

        let query = Query::collection(UserProfile::COLLECTION)
            .where_eq("email", email)
            .limit(1);
        let docs = timed(self.timeout, self.store.get_all(&query)).await?;
        let profile: UserProfile = match docs.first() {
            Some(doc) => doc.decode()?,
            None => return Err(SyncError::UnknownUser(email.to_string())),
        };

        let session = profile.to_session();
        self.set(session.clone()).await?;
        info!(user = %session.id, "logged in");
        Ok(session)
    }

    /// Persist and publish `session`. Subscribers are only woken when it differs.
    pub async fn set(&self, session: Session) -> Result<(), SyncError> {
        self.storage.set(SESSION_KEY, &session).await?;
        self.tx.send_if_modified(|current| {
            if current.as_ref() == Some(&session) {
                return false;
            }
            *current = Some(session);
            true
        });
        Ok(())
    }

    /// Forget the session, locally and on disk.
    pub async fn logout(&self) -> Result<(), SyncError> {
        let had_session = self.tx.send_replace(None).is_some();
        if let Err(e) = self.storage.remove(SESSION_KEY).await {
            warn!(error = %e, "failed to remove persisted session");
            return Err(e.into());
        }
        if had_session {
            info!("logged out");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cutroom_store::MemoryStore;
    use serde_json::json;
    use tempfile::tempdir;

    fn seed_user(memory: &MemoryStore) {
        let data = json!({ "name": "Ali", "email": "ali@studio.test", "role": "editor" });
        if let serde_json::Value::Object(map) = data {
            memory.seed("users", "u1", map);
        }
    }

    #[tokio::test]
    async fn login_persists_across_restore() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("storage.json");
        let memory = MemoryStore::new();
        seed_user(&memory);

        let storage = Arc::new(LocalStorage::open(&path).await.unwrap());
        let sessions =
            SessionStore::restore(storage, Arc::new(memory.clone()), &SyncConfig::default()).await;
        let session = sessions.login(" ali@studio.test ").await.unwrap();
        assert_eq!(session.name, "Ali");
        assert_eq!(session.role, "editor");

        let storage = Arc::new(LocalStorage::open(&path).await.unwrap());
        let restored =
            SessionStore::restore(storage, Arc::new(memory), &SyncConfig::default()).await;
        assert_eq!(restored.current(), Some(session));
    }

    #[tokio::test]
    async fn unknown_email_is_rejected() {
        let sessions = SessionStore::restore(
            Arc::new(LocalStorage::in_memory()),
            Arc::new(MemoryStore::new()),
            &SyncConfig::default(),
        )
        .await;
        let err = sessions.login("nobody@studio.test").await.unwrap_err();
        assert!(matches!(err, SyncError::UnknownUser(_)));
        assert!(sessions.current().is_none());
    }

    #[tokio::test]
    async fn subscribers_see_login_and_logout() {
        let memory = MemoryStore::new();
        seed_user(&memory);
        let sessions = SessionStore::restore(
            Arc::new(LocalStorage::in_memory()),
            Arc::new(memory),
            &SyncConfig::default(),
        )
        .await;
        let mut rx = sessions.subscribe();

        sessions.login("ali@studio.test").await.unwrap();
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().as_ref().map(|s| s.id.as_str()), Some("u1"));

        // Same session again is not a change.
        sessions.set(sessions.current().unwrap()).await.unwrap();
        assert!(!rx.has_changed().unwrap());

        sessions.logout().await.unwrap();
        rx.changed().await.unwrap();
        assert!(rx.borrow().is_none());
    }
}
