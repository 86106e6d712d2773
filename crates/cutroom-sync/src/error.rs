//! Error types for the sync layer.

use thiserror::Error;

use crate::entity::EntityKind;

/// Errors from local durable storage.
#[derive(Debug, Error)]
pub enum StorageError {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored data could not be encoded or decoded.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// No platform data directory to default to.
    #[error("no data directory available on this platform")]
    NoDataDir,
}

/// Errors surfaced by sync-layer operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The document store rejected or failed the request.
    #[error("store error: {0}")]
    Store(#[from] cutroom_store::StoreError),

    /// Local storage failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Input rejected locally before any network call.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A one-shot read or write took too long.
    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Login lookup found no matching team member.
    #[error("no team member with email {0}")]
    UnknownUser(String),

    /// The operation needs a signed-in user.
    #[error("no active session")]
    NoSession,

    /// A referenced entity no longer exists.
    #[error("{kind} {id} not found")]
    NotFound { kind: EntityKind, id: String },
}

/// Run a store call under `timeout`.
pub(crate) async fn timed<T, F>(timeout: std::time::Duration, call: F) -> Result<T, SyncError>
where
    F: std::future::Future<Output = Result<T, cutroom_store::StoreError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(SyncError::Timeout(timeout)),
    }
}
