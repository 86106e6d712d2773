//! Runtime tuning for the sync layer.

use std::time::Duration;

/// Newest chat messages kept in the visible window.
pub const DEFAULT_CHAT_WINDOW: usize = 100;

/// Cap on each autocomplete lookup list.
pub const DEFAULT_LOOKUP_LIMIT: usize = 100;

/// Window counted as unread when no watermark has been stored yet.
pub const DEFAULT_UNREAD_FALLBACK: Duration = Duration::from_secs(24 * 60 * 60);

/// Upper bound on one-shot reads and writes.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration shared by the caches and engines.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub chat_window: usize,
    pub lookup_limit: usize,
    pub unread_fallback: Duration,
    pub request_timeout: Duration,
    /// Forward new notifications to the platform notifier when permitted.
    pub native_notifications: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            chat_window: DEFAULT_CHAT_WINDOW,
            lookup_limit: DEFAULT_LOOKUP_LIMIT,
            unread_fallback: DEFAULT_UNREAD_FALLBACK,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            native_notifications: true,
        }
    }
}
