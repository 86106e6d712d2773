//! Service container.
//!
//! [`Studio`] builds every service once and hands out shared references, and
//! drives the per-user lifecycle: when the session changes, the engines are
//! torn down and rebuilt for the new user.

use std::sync::Arc;

use cutroom_store::{DocumentStore, Session};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::cache::CacheStore;
use crate::chat::ChatEngine;
use crate::notifications::{NativeNotifier, NotificationEngine};
use crate::session::SessionStore;
use crate::storage::LocalStorage;
use crate::SyncConfig;

/// All sync services, wired together.
pub struct Studio {
    store: Arc<dyn DocumentStore>,
    storage: Arc<LocalStorage>,
    config: SyncConfig,
    sessions: Arc<SessionStore>,
    caches: Arc<CacheStore>,
    notifications: Arc<NotificationEngine>,
    chat: Arc<ChatEngine>,
}

impl Studio {
    /// Build the services, restoring any persisted session.
    ///
    /// Engines stay unsubscribed until [`Studio::start`] runs.
    pub async fn new(
        store: Arc<dyn DocumentStore>,
        storage: Arc<LocalStorage>,
        notifier: Arc<dyn NativeNotifier>,
        config: SyncConfig,
    ) -> Self {
        let sessions = Arc::new(
            SessionStore::restore(Arc::clone(&storage), Arc::clone(&store), &config).await,
        );
        let caches = Arc::new(CacheStore::new(Arc::clone(&store), &config));
        let notifications = Arc::new(NotificationEngine::new(
            Arc::clone(&store),
            notifier,
            &config,
        ));
        let chat = Arc::new(ChatEngine::new(
            Arc::clone(&store),
            Arc::clone(&storage),
            Arc::clone(&caches),
            &config,
        ));

        Self {
            store,
            storage,
            config,
            sessions,
            caches,
            notifications,
            chat,
        }
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub fn storage(&self) -> &Arc<LocalStorage> {
        &self.storage
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn caches(&self) -> &Arc<CacheStore> {
        &self.caches
    }

    pub fn notifications(&self) -> &Arc<NotificationEngine> {
        &self.notifications
    }

    pub fn chat(&self) -> &Arc<ChatEngine> {
        &self.chat
    }

    /// Follow session changes until `shutdown_rx` flips to true.
    ///
    /// The current session (if any) is applied before the task is returned,
    /// so the engines are subscribed once this resolves.
    pub async fn start(self: &Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        let mut session_rx = self.sessions.subscribe();
        let initial = session_rx.borrow_and_update().clone();
        let mut active = None;
        self.apply(initial, &mut active).await;

        let studio = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }

                    changed = session_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let session = session_rx.borrow_and_update().clone();
                        studio.apply(session, &mut active).await;
                    }
                }
            }

            studio.notifications.stop();
            studio.chat.stop();
            info!("studio stopped");
        })
    }

    /// Rebuild per-user state for `session`. `active` is the user currently
    /// subscribed.
    async fn apply(&self, session: Option<Session>, active: &mut Option<String>) {
        let next = session.as_ref().map(|s| s.id.clone());
        if next == *active {
            debug!("session unchanged");
            return;
        }

        if active.is_some() {
            self.caches.invalidate_all();
        }
        self.notifications.stop();
        self.chat.stop();

        if let Some(session) = &session {
            self.notifications.start(&session.id);
            self.chat.start(session).await;
            info!(user = %session.id, "session active");
        }
        *active = next;
    }
}
