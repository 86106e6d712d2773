//! Live team chat.
//!
//! The engine keeps a window of the newest messages, pushed in full on every
//! change, and derives the unread badge from a per-user watermark held in
//! local storage. Lookup catalogs for the compose pickers are loaded once per
//! session and not kept live.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cutroom_store::{
    CREATED_AT_FIELD, ChatMessage, Direction, Document, DocumentStore, EntityReference, Fields,
    NotificationRecord, PostProduction, Project, Query, ReferenceKind, Script, Session,
    SnapshotEvent, Subscription, UserProfile, Video, server_timestamp,
};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::compose::{Draft, Lookups};
use super::render::route_for;
use crate::cache::CacheStore;
use crate::entity::EntityKind;
use crate::error::timed;
use crate::notifications::EnginePhase;
use crate::storage::{LocalStorage, chat_watermark_key};
use crate::{SyncConfig, SyncError};

/// Route notifications created by chat mentions point at.
const CHAT_ROUTE: &str = "/chat";

/// Number of messages counted as unread.
///
/// A message is unread when someone else sent it after the watermark. With no
/// watermark, everything from the last `fallback` counts. Messages whose
/// server timestamp has not resolved yet are the newest there are.
pub fn unread_count(
    messages: &[ChatMessage],
    self_id: &str,
    watermark: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    fallback: Duration,
) -> usize {
    let threshold = watermark.unwrap_or_else(|| {
        now - chrono::Duration::from_std(fallback).unwrap_or(chrono::Duration::zero())
    });
    messages
        .iter()
        .filter(|m| m.sender_id != self_id)
        .filter(|m| m.created_at.is_none_or(|t| t > threshold))
        .count()
}

/// Observable state of the chat engine.
#[derive(Debug, Clone)]
pub struct ChatSummary {
    pub phase: EnginePhase,
    pub user_id: Option<String>,
    /// Whether the chat panel is showing.
    pub open: bool,
    /// Oldest first.
    pub messages: Arc<Vec<ChatMessage>>,
    pub unread: usize,
}

impl ChatSummary {
    fn unsubscribed() -> Self {
        Self {
            phase: EnginePhase::Unsubscribed,
            user_id: None,
            open: false,
            messages: Arc::new(Vec::new()),
            unread: 0,
        }
    }
}

struct ChatState {
    generation: u64,
    phase: EnginePhase,
    user: Option<Session>,
    open: bool,
    messages: Arc<Vec<ChatMessage>>,
    watermark: Option<DateTime<Utc>>,
    unread: usize,
    lookups: Arc<Lookups>,
    listener: Option<JoinHandle<()>>,
}

impl ChatState {
    fn new() -> Self {
        Self {
            generation: 0,
            phase: EnginePhase::Unsubscribed,
            user: None,
            open: false,
            messages: Arc::new(Vec::new()),
            watermark: None,
            unread: 0,
            lookups: Arc::new(Lookups::default()),
            listener: None,
        }
    }

    fn summary(&self) -> ChatSummary {
        ChatSummary {
            phase: self.phase,
            user_id: self.user.as_ref().map(|u| u.id.clone()),
            open: self.open,
            messages: Arc::clone(&self.messages),
            unread: self.unread,
        }
    }
}

struct Shared {
    state: Mutex<ChatState>,
    summary: watch::Sender<ChatSummary>,
    storage: Arc<LocalStorage>,
    unread_fallback: Duration,
}

impl Shared {
    fn publish(&self, state: &ChatState) {
        self.summary.send_replace(state.summary());
    }

    async fn persist_watermark(&self, user_id: &str, at: DateTime<Utc>) {
        if let Err(e) = self.storage.set(&chat_watermark_key(user_id), &at).await {
            warn!(user = %user_id, error = %e, "failed to persist chat watermark");
        }
    }
}

/// Team chat for the signed-in user.
pub struct ChatEngine {
    store: Arc<dyn DocumentStore>,
    caches: Arc<CacheStore>,
    shared: Arc<Shared>,
    window: usize,
    lookup_limit: usize,
    timeout: Duration,
}

impl ChatEngine {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        storage: Arc<LocalStorage>,
        caches: Arc<CacheStore>,
        config: &SyncConfig,
    ) -> Self {
        let (summary, _) = watch::channel(ChatSummary::unsubscribed());
        Self {
            store,
            caches,
            shared: Arc::new(Shared {
                state: Mutex::new(ChatState::new()),
                summary,
                storage,
                unread_fallback: config.unread_fallback,
            }),
            window: config.chat_window,
            lookup_limit: config.lookup_limit,
            timeout: config.request_timeout,
        }
    }

    /// Subscribe to the message window for `session` and load lookups,
    /// replacing any previous session's state.
    pub async fn start(&self, session: &Session) {
        let watermark: Option<DateTime<Utc>> = self
            .shared
            .storage
            .get(&chat_watermark_key(&session.id))
            .await;

        let query = Query::collection(ChatMessage::COLLECTION)
            .order_by(CREATED_AT_FIELD, Direction::Desc)
            .limit(self.window);
        let subscription = self.store.subscribe(query);

        let generation = {
            let mut state = self.shared.state.lock();
            if let Some(listener) = state.listener.take() {
                listener.abort();
            }
            let generation = state.generation + 1;
            *state = ChatState::new();
            state.generation = generation;
            state.phase = EnginePhase::Subscribing;
            state.user = Some(session.clone());
            state.watermark = watermark;
            self.shared.publish(&state);

            let shared = Arc::clone(&self.shared);
            state.listener = Some(tokio::spawn(listen(shared, subscription, generation)));
            generation
        };
        info!(user = %session.id, "chat subscribed");

        let lookups = self.load_lookups().await;
        let mut state = self.shared.state.lock();
        if state.generation == generation {
            state.lookups = Arc::new(lookups);
        } else {
            debug!("dropping chat lookups for a previous session");
        }
    }

    /// Detach the listener and drop all per-user state.
    pub fn stop(&self) {
        let mut state = self.shared.state.lock();
        if let Some(listener) = state.listener.take() {
            listener.abort();
        }
        let generation = state.generation + 1;
        let user = state.user.take();
        *state = ChatState::new();
        state.generation = generation;
        self.shared.publish(&state);
        if let Some(user) = user {
            info!(user = %user.id, "chat unsubscribed");
        }
    }

    async fn load_lookups(&self) -> Lookups {
        let (users, projects, videos, scripts, post_productions) = tokio::join!(
            self.lookup::<UserProfile>(UserProfile::COLLECTION),
            self.lookup::<Project>(Project::COLLECTION),
            self.lookup::<Video>(Video::COLLECTION),
            self.lookup::<Script>(Script::COLLECTION),
            self.lookup::<PostProduction>(PostProduction::COLLECTION),
        );
        Lookups {
            users,
            projects,
            videos,
            scripts,
            post_productions,
        }
    }

    async fn lookup<T: DeserializeOwned>(&self, collection: &str) -> Vec<T> {
        let query = Query::collection(collection).limit(self.lookup_limit);
        match timed(self.timeout, self.store.get_all(&query)).await {
            Ok(docs) => Document::decode_all(&docs),
            Err(e) => {
                warn!(collection = %collection, error = %e, "failed to load chat lookup");
                Vec::new()
            }
        }
    }

    pub fn messages(&self) -> Arc<Vec<ChatMessage>> {
        Arc::clone(&self.shared.state.lock().messages)
    }

    pub fn unread_count(&self) -> usize {
        self.shared.state.lock().unread
    }

    pub fn is_open(&self) -> bool {
        self.shared.state.lock().open
    }

    pub fn lookups(&self) -> Arc<Lookups> {
        Arc::clone(&self.shared.state.lock().lookups)
    }

    pub fn watermark(&self) -> Option<DateTime<Utc>> {
        self.shared.state.lock().watermark
    }

    /// Follow the engine's derived state.
    pub fn watch(&self) -> watch::Receiver<ChatSummary> {
        self.shared.summary.subscribe()
    }

    /// Show the chat panel, marking everything up to now as read.
    pub async fn open(&self) -> Result<(), SyncError> {
        let now = Utc::now();
        let user_id = {
            let mut state = self.shared.state.lock();
            let user_id = state
                .user
                .as_ref()
                .map(|u| u.id.clone())
                .ok_or(SyncError::NoSession)?;
            state.open = true;
            state.watermark = Some(now);
            state.unread = 0;
            self.shared.publish(&state);
            user_id
        };
        self.shared
            .storage
            .set(&chat_watermark_key(&user_id), &now)
            .await?;
        Ok(())
    }

    /// Hide the chat panel. The watermark stays where it is.
    pub fn close(&self) {
        let mut state = self.shared.state.lock();
        if state.open {
            state.open = false;
            self.shared.publish(&state);
        }
    }

    /// Send `draft` as the signed-in user and notify everyone it mentions.
    ///
    /// Returns the new message id. Failed mention notifications are logged and
    /// do not fail the send.
    #[instrument(skip(self, draft))]
    pub async fn send(&self, draft: Draft) -> Result<String, SyncError> {
        let content = draft.content.trim();
        if content.is_empty() {
            return Err(SyncError::Validation("message is empty".to_string()));
        }
        let sender = self
            .shared
            .state
            .lock()
            .user
            .clone()
            .ok_or(SyncError::NoSession)?;

        let message = fields(json!({
            "content": content,
            "senderId": sender.id,
            "senderName": sender.name,
            "mentions": draft.mentions,
            "references": draft.references,
            "createdAt": server_timestamp(),
        }));
        let id = timed(
            self.timeout,
            self.store.create(ChatMessage::COLLECTION, message),
        )
        .await
        .inspect_err(|e| warn!(error = %e, "failed to send chat message"))?;
        debug!(id = %id, "chat message sent");

        let mut notified = HashSet::new();
        for mention in &draft.mentions {
            if mention.user_id == sender.id || !notified.insert(mention.user_id.as_str()) {
                continue;
            }
            let notification = fields(json!({
                "userId": mention.user_id,
                "title": format!("{} mentioned you", sender.name),
                "body": content,
                "type": "mention",
                "link": CHAT_ROUTE,
                "read": false,
                "createdAt": server_timestamp(),
            }));
            if let Err(e) = timed(
                self.timeout,
                self.store
                    .create(NotificationRecord::COLLECTION, notification),
            )
            .await
            {
                warn!(user = %mention.user_id, error = %e, "failed to notify mentioned user");
            }
        }

        Ok(id)
    }

    /// Resolve a clicked reference to its route, closing the chat panel.
    ///
    /// Targets deleted since the message was sent are `NotFound`.
    pub async fn follow_reference(
        &self,
        reference: &EntityReference,
    ) -> Result<String, SyncError> {
        let (kind, exists) = match reference.kind {
            ReferenceKind::Project => (
                EntityKind::Project,
                self.caches.find::<Project>(&reference.id).await.is_some(),
            ),
            ReferenceKind::Video => (
                EntityKind::Video,
                self.caches.find::<Video>(&reference.id).await.is_some(),
            ),
            ReferenceKind::Script => (
                EntityKind::Script,
                self.caches.find::<Script>(&reference.id).await.is_some(),
            ),
            ReferenceKind::PostProduction => (
                EntityKind::PostProduction,
                self.caches
                    .find::<PostProduction>(&reference.id)
                    .await
                    .is_some(),
            ),
        };
        if !exists {
            return Err(SyncError::NotFound {
                kind,
                id: reference.id.clone(),
            });
        }
        self.close();
        Ok(route_for(reference))
    }
}

impl Drop for ChatEngine {
    fn drop(&mut self) {
        if let Some(listener) = self.shared.state.lock().listener.take() {
            listener.abort();
        }
    }
}

fn fields(value: Value) -> Fields {
    match value {
        Value::Object(map) => map,
        _ => Fields::new(),
    }
}

/// Replace the window on every push until superseded.
async fn listen(shared: Arc<Shared>, mut subscription: Subscription, generation: u64) {
    while let Some(event) = subscription.next().await {
        let docs = match event {
            SnapshotEvent::Snapshot(docs) => docs,
            SnapshotEvent::Error(e) => {
                warn!(error = %e, "chat subscription error");
                continue;
            }
        };
        let mut messages = Document::decode_all::<ChatMessage>(&docs);
        messages.reverse();

        let advanced = {
            let mut state = shared.state.lock();
            if state.generation != generation {
                debug!("dropping chat snapshot for a previous session");
                return;
            }
            let Some(user_id) = state.user.as_ref().map(|u| u.id.clone()) else {
                return;
            };
            let now = Utc::now();
            state.messages = Arc::new(messages);
            state.phase = EnginePhase::Live;
            let advanced = if state.open {
                state.watermark = Some(now);
                state.unread = 0;
                Some((user_id, now))
            } else {
                state.unread = unread_count(
                    &state.messages,
                    &user_id,
                    state.watermark,
                    now,
                    shared.unread_fallback,
                );
                None
            };
            shared.publish(&state);
            advanced
        };

        if let Some((user_id, at)) = advanced {
            shared.persist_watermark(&user_id, at).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cutroom_store::{Mention, MemoryStore};
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn message(id: &str, sender: &str, created_at: Option<DateTime<Utc>>) -> ChatMessage {
        ChatMessage {
            id: id.to_string(),
            content: "hi".to_string(),
            sender_id: sender.to_string(),
            sender_name: sender.to_string(),
            mentions: Vec::new(),
            references: Vec::new(),
            created_at,
        }
    }

    fn session(id: &str, name: &str) -> Session {
        Session {
            id: id.to_string(),
            email: format!("{id}@studio.test"),
            name: name.to_string(),
            role: "editor".to_string(),
        }
    }

    fn seed(memory: &MemoryStore, collection: &str, id: &str, value: Value) {
        memory.seed(collection, id, fields(value));
    }

    fn engine(memory: &MemoryStore, storage: Arc<LocalStorage>) -> ChatEngine {
        let store: Arc<dyn DocumentStore> = Arc::new(memory.clone());
        let config = SyncConfig {
            request_timeout: Duration::from_secs(5),
            ..SyncConfig::default()
        };
        let caches = Arc::new(CacheStore::new(Arc::clone(&store), &config));
        ChatEngine::new(store, storage, caches, &config)
    }

    async fn wait_for(engine: &ChatEngine, pred: impl FnMut(&ChatSummary) -> bool) -> ChatSummary {
        let mut rx = engine.watch();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(pred))
            .await
            .expect("timed out waiting for chat state")
            .expect("summary channel closed")
            .clone()
    }

    #[test]
    fn unread_counts_others_after_watermark() {
        let messages = vec![
            message("m1", "u2", Some(at(10))),
            message("m2", "u1", Some(at(20))),
            message("m3", "u2", Some(at(30))),
            message("m4", "u2", None),
        ];
        let fallback = Duration::from_secs(60);
        assert_eq!(unread_count(&messages, "u1", Some(at(15)), at(40), fallback), 2);
        assert_eq!(unread_count(&messages, "u1", Some(at(30)), at(40), fallback), 1);
    }

    #[test]
    fn unread_without_watermark_uses_fallback_window() {
        let messages = vec![
            message("old", "u2", Some(at(0))),
            message("recent", "u2", Some(at(100))),
        ];
        let count = unread_count(&messages, "u1", None, at(120), Duration::from_secs(60));
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn window_is_oldest_first_and_opening_clears_unread() {
        let memory = MemoryStore::new();
        for (id, secs) in [("m1", 10), ("m2", 20), ("m3", 30)] {
            seed(
                &memory,
                "chatMessages",
                id,
                json!({ "content": id, "senderId": "u2", "senderName": "Sam",
                        "createdAt": at(secs).to_rfc3339() }),
            );
        }
        let storage = Arc::new(LocalStorage::in_memory());
        let chat = engine(&memory, Arc::clone(&storage));
        chat.start(&session("u1", "Ali")).await;

        let summary = wait_for(&chat, |s| s.phase == EnginePhase::Live).await;
        let ids: Vec<_> = summary.messages.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "m2", "m3"]);

        let before = Utc::now();
        chat.open().await.unwrap();
        assert_eq!(chat.unread_count(), 0);
        assert!(chat.is_open());
        let stored: DateTime<Utc> = storage.get(&chat_watermark_key("u1")).await.unwrap();
        assert!(stored >= before);

        chat.close();
        assert!(!chat.is_open());
        assert_eq!(chat.watermark(), Some(stored));
    }

    #[tokio::test]
    async fn restored_watermark_limits_unread() {
        let memory = MemoryStore::new();
        seed(
            &memory,
            "chatMessages",
            "m1",
            json!({ "content": "old", "senderId": "u2", "createdAt": at(10).to_rfc3339() }),
        );
        seed(
            &memory,
            "chatMessages",
            "m2",
            json!({ "content": "new", "senderId": "u2", "createdAt": at(30).to_rfc3339() }),
        );
        let storage = Arc::new(LocalStorage::in_memory());
        storage.set(&chat_watermark_key("u1"), &at(20)).await.unwrap();

        let chat = engine(&memory, storage);
        chat.start(&session("u1", "Ali")).await;
        let summary = wait_for(&chat, |s| s.phase == EnginePhase::Live).await;
        assert_eq!(summary.unread, 1);
    }

    #[tokio::test]
    async fn send_rejects_blank_content_without_writing() {
        let memory = MemoryStore::new();
        let chat = engine(&memory, Arc::new(LocalStorage::in_memory()));
        chat.start(&session("u1", "Ali")).await;

        let draft = Draft {
            content: "   ".to_string(),
            ..Default::default()
        };
        let err = chat.send(draft).await.unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
        assert_eq!(memory.write_count(), 0);
    }

    #[tokio::test]
    async fn send_requires_session() {
        let memory = MemoryStore::new();
        let chat = engine(&memory, Arc::new(LocalStorage::in_memory()));
        let draft = Draft {
            content: "hello".to_string(),
            ..Default::default()
        };
        assert!(matches!(chat.send(draft).await, Err(SyncError::NoSession)));
    }

    #[tokio::test]
    async fn send_notifies_each_mentioned_user_once_except_sender() {
        let memory = MemoryStore::new();
        let chat = engine(&memory, Arc::new(LocalStorage::in_memory()));
        chat.start(&session("u1", "Ali")).await;

        let sam = Mention {
            user_id: "u2".to_string(),
            user_name: "Sam".to_string(),
        };
        let me = Mention {
            user_id: "u1".to_string(),
            user_name: "Ali".to_string(),
        };
        let draft = Draft {
            content: " @Sam @Ali @Sam look ".to_string(),
            mentions: vec![sam.clone(), me, sam],
            references: Vec::new(),
        };
        let id = chat.send(draft).await.unwrap();

        let stored = memory.peek("chatMessages", &id).unwrap();
        assert_eq!(stored.data["content"], "@Sam @Ali @Sam look");
        assert_eq!(stored.data["senderId"], "u1");

        assert_eq!(memory.len("notifications"), 1);
        let notifications = memory
            .get_all(&Query::collection("notifications"))
            .await
            .unwrap();
        let record: NotificationRecord = notifications[0].decode().unwrap();
        assert_eq!(record.user_id, "u2");
        assert_eq!(record.title, "Ali mentioned you");
        assert_eq!(record.kind, "mention");
        assert_eq!(record.link.as_deref(), Some("/chat"));
        assert!(!record.read);
    }

    #[tokio::test]
    async fn lookups_load_on_start() {
        let memory = MemoryStore::new();
        seed(&memory, "users", "u2", json!({ "name": "Sam" }));
        seed(&memory, "projects", "p1", json!({ "name": "Launch" }));
        let chat = engine(&memory, Arc::new(LocalStorage::in_memory()));
        chat.start(&session("u1", "Ali")).await;

        let lookups = chat.lookups();
        assert_eq!(lookups.users.len(), 1);
        assert_eq!(lookups.projects[0].display_name(), "Launch");
    }

    #[tokio::test]
    async fn following_a_reference_checks_existence() {
        let memory = MemoryStore::new();
        seed(&memory, "projects", "p1", json!({ "name": "Launch" }));
        let chat = engine(&memory, Arc::new(LocalStorage::in_memory()));
        chat.start(&session("u1", "Ali")).await;
        chat.open().await.unwrap();

        let launch = EntityReference {
            kind: ReferenceKind::Project,
            id: "p1".to_string(),
            name: "Launch".to_string(),
        };
        assert_eq!(chat.follow_reference(&launch).await.unwrap(), "/projects/p1");
        assert!(!chat.is_open());

        let gone = EntityReference {
            id: "p9".to_string(),
            ..launch
        };
        assert!(matches!(
            chat.follow_reference(&gone).await,
            Err(SyncError::NotFound { kind: EntityKind::Project, .. })
        ));
    }

    #[tokio::test]
    async fn stop_clears_per_user_state() {
        let memory = MemoryStore::new();
        seed(
            &memory,
            "chatMessages",
            "m1",
            json!({ "content": "hi", "senderId": "u2" }),
        );
        let chat = engine(&memory, Arc::new(LocalStorage::in_memory()));
        chat.start(&session("u1", "Ali")).await;
        wait_for(&chat, |s| s.phase == EnginePhase::Live).await;

        chat.stop();
        let summary = chat.watch().borrow().clone();
        assert_eq!(summary.phase, EnginePhase::Unsubscribed);
        assert!(summary.messages.is_empty());
        assert!(summary.user_id.is_none());
    }
}
