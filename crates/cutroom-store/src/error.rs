//! Error types for the document store and media clients.

use thiserror::Error;

/// Errors that can occur when talking to the document store or media API.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Authentication or permission failure.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Document not found.
    #[error("document not found: {collection}/{id}")]
    NotFound { collection: String, id: String },

    /// Invalid response from server.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Rate limited.
    #[error("rate limited{}", match retry_after_secs {
        Some(secs) => format!(" (retry after {}s)", secs),
        None => String::new(),
    })]
    RateLimited {
        /// Seconds to wait before retrying (from Retry-After header, optional).
        retry_after_secs: Option<u64>,
    },

    /// Structured error returned by the store API.
    #[error("store error: {code} - {message}")]
    Server { code: String, message: String },

    /// WebSocket error on a live query.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// A batch commit was rejected; none of its writes were applied.
    #[error("batch commit failed: {0}")]
    Batch(String),

    /// Request rejected locally before reaching the network.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Upload rejected by the media API.
    #[error("upload failed: {0}")]
    Upload(String),

    /// Simulated failure from the in-memory store.
    #[error("unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Whether the error is transient and the request is worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Server { code, .. } => {
                code == "unavailable"
                    || code == "deadline-exceeded"
                    || code == "internal"
                    || code == "aborted"
            }
            StoreError::Http(e) => e.is_timeout() || e.is_connect(),
            StoreError::Unavailable(_) => true,
            _ => false,
        }
    }
}
