//! Live per-user notification feed.
//!
//! The engine subscribes to the signed-in user's notifications and treats
//! every pushed snapshot as the full authoritative list. Derived values (the
//! sorted feed, the unread count) are recomputed from scratch on each push, and
//! a toast is raised when the list grows past a non-empty previous size.
//!
//! Writes (mark read, delete) go straight to the store with no local edits;
//! the next snapshot reflects them.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use cutroom_store::{
    Document, DocumentStore, NotificationRecord, Query, SnapshotEvent, Subscription, WriteBatch,
};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::timed;
use crate::{SyncConfig, SyncError};

/// Capacity of the toast channel.
const TOAST_CHANNEL_CAPACITY: usize = 64;

/// An in-app popup for a newly arrived notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toast {
    pub notification_id: String,
    pub title: String,
    pub body: String,
    pub kind: String,
    pub link: Option<String>,
}

impl From<&NotificationRecord> for Toast {
    fn from(record: &NotificationRecord) -> Self {
        Self {
            notification_id: record.id.clone(),
            title: record.title.clone(),
            body: record.body.clone(),
            kind: record.kind.clone(),
            link: record.link.clone(),
        }
    }
}

/// Reducer over notification snapshots.
#[derive(Debug, Clone, Default)]
pub struct NotificationFeed {
    notifications: Arc<Vec<NotificationRecord>>,
    previous_len: usize,
}

impl NotificationFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the feed with `snapshot`. Returns a toast for the newest item
    /// when the list grew and was not empty before.
    pub fn apply_snapshot(&mut self, mut snapshot: Vec<NotificationRecord>) -> Option<Toast> {
        // Pending timestamps are the newest writes.
        snapshot.sort_by(|a, b| match (a.created_at, b.created_at) {
            (None, None) => a.id.cmp(&b.id),
            (None, Some(_)) => std::cmp::Ordering::Less,
            (Some(_), None) => std::cmp::Ordering::Greater,
            (Some(x), Some(y)) => y.cmp(&x),
        });

        let new_len = snapshot.len();
        let toast = if new_len > self.previous_len && self.previous_len > 0 {
            snapshot.first().map(Toast::from)
        } else {
            None
        };

        self.previous_len = new_len;
        self.notifications = Arc::new(snapshot);
        toast
    }

    /// Newest first.
    pub fn notifications(&self) -> Arc<Vec<NotificationRecord>> {
        Arc::clone(&self.notifications)
    }

    pub fn unread_count(&self) -> usize {
        self.notifications.iter().filter(|n| !n.read).count()
    }

    pub fn unread_ids(&self) -> Vec<String> {
        self.notifications
            .iter()
            .filter(|n| !n.read)
            .map(|n| n.id.clone())
            .collect()
    }

    pub fn ids(&self) -> Vec<String> {
        self.notifications.iter().map(|n| n.id.clone()).collect()
    }
}

/// Platform notification popups.
pub trait NativeNotifier: Send + Sync {
    /// Ask for permission to show popups. Called at most once per engine;
    /// returning false is not an error.
    fn request_permission(&self) -> bool;

    fn show(&self, toast: &Toast);
}

/// Notifier that writes popups to the log.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl NativeNotifier for LogNotifier {
    fn request_permission(&self) -> bool {
        true
    }

    fn show(&self, toast: &Toast) {
        info!(title = %toast.title, body = %toast.body, "notification");
    }
}

/// Lifecycle of the engine's subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnginePhase {
    /// No signed-in user.
    Unsubscribed,
    /// Subscribed, waiting for the first snapshot.
    Subscribing,
    /// At least one snapshot received.
    Live,
}

/// Observable state of the notification engine.
#[derive(Debug, Clone)]
pub struct NotificationSummary {
    pub phase: EnginePhase,
    pub user_id: Option<String>,
    /// Newest first.
    pub notifications: Arc<Vec<NotificationRecord>>,
    pub unread: usize,
}

impl NotificationSummary {
    fn unsubscribed() -> Self {
        Self {
            phase: EnginePhase::Unsubscribed,
            user_id: None,
            notifications: Arc::new(Vec::new()),
            unread: 0,
        }
    }
}

struct EngineState {
    generation: u64,
    phase: EnginePhase,
    user_id: Option<String>,
    feed: NotificationFeed,
    listener: Option<JoinHandle<()>>,
}

impl EngineState {
    fn summary(&self) -> NotificationSummary {
        NotificationSummary {
            phase: self.phase,
            user_id: self.user_id.clone(),
            notifications: self.feed.notifications(),
            unread: self.feed.unread_count(),
        }
    }
}

struct Shared {
    state: Mutex<EngineState>,
    summary: watch::Sender<NotificationSummary>,
    toasts: broadcast::Sender<Toast>,
    notifier: Arc<dyn NativeNotifier>,
    native_enabled: bool,
    permission: OnceLock<bool>,
}

impl Shared {
    fn publish(&self, state: &EngineState) {
        self.summary.send_replace(state.summary());
    }

    fn deliver(&self, toast: Toast) {
        debug!(id = %toast.notification_id, "new notification");
        if self.native_enabled && *self.permission.get_or_init(|| self.notifier.request_permission())
        {
            self.notifier.show(&toast);
        }
        let _ = self.toasts.send(toast);
    }
}

/// Live notification feed for the signed-in user.
pub struct NotificationEngine {
    store: Arc<dyn DocumentStore>,
    shared: Arc<Shared>,
    timeout: Duration,
}

impl NotificationEngine {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        notifier: Arc<dyn NativeNotifier>,
        config: &SyncConfig,
    ) -> Self {
        let (summary, _) = watch::channel(NotificationSummary::unsubscribed());
        let (toasts, _) = broadcast::channel(TOAST_CHANNEL_CAPACITY);
        Self {
            store,
            shared: Arc::new(Shared {
                state: Mutex::new(EngineState {
                    generation: 0,
                    phase: EnginePhase::Unsubscribed,
                    user_id: None,
                    feed: NotificationFeed::new(),
                    listener: None,
                }),
                summary,
                toasts,
                notifier,
                native_enabled: config.native_notifications,
                permission: OnceLock::new(),
            }),
            timeout: config.request_timeout,
        }
    }

    /// Subscribe to `user_id`'s notifications, replacing any previous subscription.
    pub fn start(&self, user_id: &str) {
        let query = Query::collection(NotificationRecord::COLLECTION).where_eq("userId", user_id);
        let subscription = self.store.subscribe(query);

        let mut state = self.shared.state.lock();
        if let Some(listener) = state.listener.take() {
            listener.abort();
        }
        state.generation += 1;
        state.phase = EnginePhase::Subscribing;
        state.user_id = Some(user_id.to_string());
        state.feed = NotificationFeed::new();
        self.shared.publish(&state);

        let generation = state.generation;
        let shared = Arc::clone(&self.shared);
        state.listener = Some(tokio::spawn(listen(shared, subscription, generation)));
        info!(user = %user_id, "notification feed subscribed");
    }

    /// Detach the listener and drop all per-user state.
    pub fn stop(&self) {
        let mut state = self.shared.state.lock();
        if let Some(listener) = state.listener.take() {
            listener.abort();
        }
        state.generation += 1;
        state.phase = EnginePhase::Unsubscribed;
        let user = state.user_id.take();
        state.feed = NotificationFeed::new();
        self.shared.publish(&state);
        if let Some(user) = user {
            info!(user = %user, "notification feed unsubscribed");
        }
    }

    pub fn phase(&self) -> EnginePhase {
        self.shared.state.lock().phase
    }

    pub fn notifications(&self) -> Arc<Vec<NotificationRecord>> {
        self.shared.state.lock().feed.notifications()
    }

    pub fn unread_count(&self) -> usize {
        self.shared.state.lock().feed.unread_count()
    }

    /// Follow the feed's derived state.
    pub fn watch(&self) -> watch::Receiver<NotificationSummary> {
        self.shared.summary.subscribe()
    }

    /// Receive a toast for each newly arrived notification.
    pub fn toasts(&self) -> broadcast::Receiver<Toast> {
        self.shared.toasts.subscribe()
    }

    fn require_session(&self) -> Result<(), SyncError> {
        if self.shared.state.lock().user_id.is_none() {
            return Err(SyncError::NoSession);
        }
        Ok(())
    }

    pub async fn mark_read(&self, id: &str) -> Result<(), SyncError> {
        self.require_session()?;
        let result = timed(
            self.timeout,
            self.store
                .update(NotificationRecord::COLLECTION, id, read_patch()),
        )
        .await;
        if let Err(e) = &result {
            warn!(id = %id, error = %e, "failed to mark notification read");
        }
        result
    }

    /// Mark every currently unread notification read in one batch.
    /// Returns how many were marked.
    pub async fn mark_all_read(&self) -> Result<usize, SyncError> {
        self.require_session()?;
        let ids = self.shared.state.lock().feed.unread_ids();
        if ids.is_empty() {
            return Ok(0);
        }

        let mut batch = WriteBatch::new();
        for id in &ids {
            batch.update(NotificationRecord::COLLECTION, id.as_str(), read_patch());
        }
        match timed(self.timeout, self.store.commit(batch)).await {
            Ok(()) => Ok(ids.len()),
            Err(e) => {
                warn!(count = ids.len(), error = %e, "failed to mark notifications read");
                Err(e)
            }
        }
    }

    pub async fn delete(&self, id: &str) -> Result<(), SyncError> {
        self.require_session()?;
        let result = timed(
            self.timeout,
            self.store.delete(NotificationRecord::COLLECTION, id),
        )
        .await;
        if let Err(e) = &result {
            warn!(id = %id, error = %e, "failed to delete notification");
        }
        result
    }

    /// Delete every notification in the feed in one batch.
    /// Returns how many were deleted.
    pub async fn delete_all(&self) -> Result<usize, SyncError> {
        self.require_session()?;
        let ids = self.shared.state.lock().feed.ids();
        if ids.is_empty() {
            return Ok(0);
        }

        let mut batch = WriteBatch::new();
        for id in &ids {
            batch.delete(NotificationRecord::COLLECTION, id.as_str());
        }
        match timed(self.timeout, self.store.commit(batch)).await {
            Ok(()) => Ok(ids.len()),
            Err(e) => {
                warn!(count = ids.len(), error = %e, "failed to delete notifications");
                Err(e)
            }
        }
    }
}

impl Drop for NotificationEngine {
    fn drop(&mut self) {
        if let Some(listener) = self.shared.state.lock().listener.take() {
            listener.abort();
        }
    }
}

fn read_patch() -> Map<String, Value> {
    let mut patch = Map::new();
    patch.insert("read".to_string(), Value::Bool(true));
    patch
}

/// Apply snapshots until the subscription ends or a newer one supersedes it.
async fn listen(shared: Arc<Shared>, mut subscription: Subscription, generation: u64) {
    while let Some(event) = subscription.next().await {
        let docs = match event {
            SnapshotEvent::Snapshot(docs) => docs,
            SnapshotEvent::Error(e) => {
                warn!(error = %e, "notification subscription error");
                continue;
            }
        };
        let records = Document::decode_all::<NotificationRecord>(&docs);

        let toast = {
            let mut state = shared.state.lock();
            if state.generation != generation {
                debug!("dropping notification snapshot for a previous session");
                return;
            }
            let toast = state.feed.apply_snapshot(records);
            state.phase = EnginePhase::Live;
            shared.publish(&state);
            toast
        };

        if let Some(toast) = toast {
            shared.deliver(toast);
        }
    }
    debug!("notification subscription closed");
}
