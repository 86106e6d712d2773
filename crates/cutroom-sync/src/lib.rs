//! Client-side sync layer for Cutroom.
//!
//! This crate keeps per-type entity caches in front of the document store,
//! follows the signed-in session, and runs the live notification and chat
//! feeds for that user.
//!
//! ## Features
//!
//! - **Cache store**: fetch-once caches with deduplicated reads, invalidation
//!   and mutation-following updates
//! - **Sessions**: email lookup login persisted to local storage
//! - **Notifications**: live feed with derived unread count and toasts
//! - **Chat**: live message window, unread watermark, mention and reference
//!   pickers, render-time reference resolution
//! - **Studio**: service container driving the per-user lifecycle

pub mod cache;
pub mod chat;
mod config;
mod entity;
mod error;
pub mod notifications;
mod session;
mod storage;
mod studio;

pub use cache::{CacheChange, CacheEvent, CacheState, CacheStore, EntityCache};
pub use chat::{ChatEngine, ChatSummary, Composer, Draft, Lookups, Picker, Segment};
pub use config::{
    DEFAULT_CHAT_WINDOW, DEFAULT_LOOKUP_LIMIT, DEFAULT_REQUEST_TIMEOUT, DEFAULT_UNREAD_FALLBACK,
    SyncConfig,
};
pub use entity::{Entity, EntityKind};
pub use error::{StorageError, SyncError};
pub use notifications::{
    EnginePhase, LogNotifier, NativeNotifier, NotificationEngine, NotificationFeed,
    NotificationSummary, Toast,
};
pub use session::SessionStore;
pub use storage::{LocalStorage, SESSION_KEY, chat_watermark_key};
pub use studio::Studio;
