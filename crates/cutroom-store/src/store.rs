//! The document store contract consumed by the sync layer.

use async_trait::async_trait;

use crate::{Document, Fields, Query, StoreError, Subscription, WriteBatch};

/// A remote document database.
///
/// Single-document writes are atomic; [`DocumentStore::commit`] applies a
/// [`WriteBatch`] all-or-nothing. Live queries push the complete result set on
/// every change, in the order the server emits them.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// One-shot read.
    async fn get_all(&self, query: &Query) -> Result<Vec<Document>, StoreError>;

    /// Start a live query. Must be called from within a Tokio runtime.
    fn subscribe(&self, query: Query) -> Subscription;

    /// Create a document with a store-assigned id. Returns the id.
    async fn create(&self, collection: &str, data: Fields) -> Result<String, StoreError>;

    /// Merge `patch` into an existing document.
    async fn update(&self, collection: &str, id: &str, patch: Fields) -> Result<(), StoreError>;

    async fn delete(&self, collection: &str, id: &str) -> Result<(), StoreError>;

    /// Apply every write in `batch` atomically.
    async fn commit(&self, batch: WriteBatch) -> Result<(), StoreError>;
}
