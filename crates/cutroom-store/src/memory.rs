//! In-memory implementation of the document store.
//!
//! Not durable: all state is lost when the store is dropped. Used by tests and
//! by local demo runs. Writes are serialized under a single lock, so batches
//! are atomic and every live query observes a consistent snapshot.
//!
//! Server timestamp sentinels resolve to a strictly increasing clock so that
//! documents written in the same microsecond still order by write time.
//!
//! The store counts one-shot reads and writes and can be told to fail the next
//! N reads, writes or listens, which is how the sync layer's failure paths are
//! exercised.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::document::is_server_timestamp;
use crate::subscription::{self, SnapshotEvent};
use crate::{
    Document, DocumentStore, Fields, Query, StoreError, Subscription, Tid, WriteBatch, WriteOp,
};

type Collections = HashMap<String, BTreeMap<String, Fields>>;

struct Inner {
    collections: RwLock<Collections>,
    /// Bumped after every committed write; live queries re-evaluate on change.
    version: watch::Sender<u64>,
    clock: Mutex<DateTime<Utc>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
    fail_reads: AtomicUsize,
    fail_writes: AtomicUsize,
    fail_listens: AtomicUsize,
}

impl Inner {
    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn evaluate(&self, query: &Query) -> Vec<Document> {
        let collections = self.collections.read();
        let docs = collections
            .get(&query.collection)
            .into_iter()
            .flat_map(|c| c.iter())
            .map(|(id, data)| Document::new(id.clone(), data.clone()));
        query.evaluate(docs)
    }

    /// Next server timestamp, strictly after the previous one.
    fn tick(&self) -> String {
        let mut clock = self.clock.lock();
        let now = Utc::now();
        let next = if now > *clock {
            now
        } else {
            *clock + Duration::microseconds(1)
        };
        *clock = next;
        next.to_rfc3339_opts(SecondsFormat::Micros, true)
    }

    fn resolve_sentinels(&self, fields: &mut Fields) {
        let mut stamp = None;
        for value in fields.values_mut() {
            if is_server_timestamp(value) {
                let ts = stamp.get_or_insert_with(|| self.tick()).clone();
                *value = Value::String(ts);
            }
        }
    }

    fn apply(&self, collections: &mut Collections, op: WriteOp) -> Result<(), StoreError> {
        match op {
            WriteOp::Create {
                collection,
                id,
                mut data,
            } => {
                self.resolve_sentinels(&mut data);
                collections.entry(collection).or_default().insert(id, data);
            }
            WriteOp::Update {
                collection,
                id,
                mut patch,
            } => {
                self.resolve_sentinels(&mut patch);
                let doc = collections
                    .get_mut(&collection)
                    .and_then(|c| c.get_mut(&id))
                    .ok_or_else(|| StoreError::NotFound {
                        collection: collection.clone(),
                        id: id.clone(),
                    })?;
                for (key, value) in patch {
                    doc.insert(key, value);
                }
            }
            WriteOp::Delete { collection, id } => {
                if let Some(c) = collections.get_mut(&collection) {
                    c.remove(&id);
                }
            }
        }
        Ok(())
    }

    fn write(&self, ops: Vec<WriteOp>) -> Result<(), StoreError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.fail_writes) {
            return Err(StoreError::Unavailable("injected write failure".to_string()));
        }

        {
            let mut collections = self.collections.write();
            if ops.len() == 1 {
                for op in ops {
                    self.apply(&mut collections, op)?;
                }
            } else {
                // Stage on a copy so a failing op leaves nothing behind.
                let mut staged = collections.clone();
                for op in ops {
                    self.apply(&mut staged, op)
                        .map_err(|e| StoreError::Batch(e.to_string()))?;
                }
                *collections = staged;
            }
        }

        self.version.send_modify(|v| *v += 1);
        Ok(())
    }
}

/// In-memory [`DocumentStore`].
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (version, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                collections: RwLock::new(HashMap::new()),
                version,
                clock: Mutex::new(DateTime::<Utc>::MIN_UTC),
                reads: AtomicUsize::new(0),
                writes: AtomicUsize::new(0),
                fail_reads: AtomicUsize::new(0),
                fail_writes: AtomicUsize::new(0),
                fail_listens: AtomicUsize::new(0),
            }),
        }
    }

    /// Insert a document directly, bypassing the write counters.
    pub fn seed(&self, collection: &str, id: &str, mut data: Fields) {
        self.inner.resolve_sentinels(&mut data);
        self.inner
            .collections
            .write()
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), data);
        self.inner.version.send_modify(|v| *v += 1);
    }

    /// Read a document directly, bypassing the read counter.
    pub fn peek(&self, collection: &str, id: &str) -> Option<Document> {
        self.inner
            .collections
            .read()
            .get(collection)
            .and_then(|c| c.get(id))
            .map(|data| Document::new(id, data.clone()))
    }

    /// Number of documents in a collection.
    pub fn len(&self, collection: &str) -> usize {
        self.inner
            .collections
            .read()
            .get(collection)
            .map_or(0, BTreeMap::len)
    }

    /// One-shot reads served so far.
    pub fn read_count(&self) -> usize {
        self.inner.reads.load(Ordering::SeqCst)
    }

    /// Write requests (single or batch) received so far.
    pub fn write_count(&self) -> usize {
        self.inner.writes.load(Ordering::SeqCst)
    }

    pub fn fail_next_reads(&self, n: usize) {
        self.inner.fail_reads.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_writes(&self, n: usize) {
        self.inner.fail_writes.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` live queries push an error before their first snapshot.
    pub fn fail_next_listens(&self, n: usize) {
        self.inner.fail_listens.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get_all(&self, query: &Query) -> Result<Vec<Document>, StoreError> {
        self.inner.reads.fetch_add(1, Ordering::SeqCst);
        if Inner::take_failure(&self.inner.fail_reads) {
            return Err(StoreError::Unavailable("injected read failure".to_string()));
        }
        // Yield so concurrent callers can observe the in-flight read.
        tokio::task::yield_now().await;
        let docs = self.inner.evaluate(query);
        trace!(collection = %query.collection, count = docs.len(), "memory store read");
        Ok(docs)
    }

    fn subscribe(&self, query: Query) -> Subscription {
        let (mut sink, sub) = subscription::channel(query.clone());
        let inner = Arc::clone(&self.inner);
        let mut version_rx = inner.version.subscribe();

        tokio::spawn(async move {
            if Inner::take_failure(&inner.fail_listens)
                && !sink
                    .send(SnapshotEvent::Error(StoreError::Unavailable(
                        "injected listen failure".to_string(),
                    )))
                    .await
            {
                return;
            }

            let mut last: Option<Vec<Document>> = None;
            loop {
                version_rx.borrow_and_update();
                let snapshot = inner.evaluate(&query);
                if last.as_ref() != Some(&snapshot) {
                    if !sink.send(SnapshotEvent::Snapshot(snapshot.clone())).await {
                        break;
                    }
                    last = Some(snapshot);
                }

                tokio::select! {
                    changed = version_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = sink.closed() => break,
                }
            }
            debug!(collection = %query.collection, "memory listener detached");
        });

        sub
    }

    async fn create(&self, collection: &str, data: Fields) -> Result<String, StoreError> {
        let id = Tid::now().to_string();
        self.inner.write(vec![WriteOp::Create {
            collection: collection.to_string(),
            id: id.clone(),
            data,
        }])?;
        Ok(id)
    }

    async fn update(&self, collection: &str, id: &str, patch: Fields) -> Result<(), StoreError> {
        self.inner.write(vec![WriteOp::Update {
            collection: collection.to_string(),
            id: id.to_string(),
            patch,
        }])
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), StoreError> {
        self.inner.write(vec![WriteOp::Delete {
            collection: collection.to_string(),
            id: id.to_string(),
        }])
    }

    async fn commit(&self, batch: WriteBatch) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }
        self.inner.write(batch.into_ops())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::server_timestamp;
    use crate::{Direction, SnapshotEvent};
    use serde_json::json;
    use std::time::Duration as StdDuration;

    fn fields(value: Value) -> Fields {
        match value {
            Value::Object(map) => map,
            _ => Fields::new(),
        }
    }

    async fn next_snapshot(sub: &mut Subscription) -> Vec<Document> {
        loop {
            match tokio::time::timeout(StdDuration::from_secs(2), sub.next())
                .await
                .expect("timed out waiting for snapshot")
            {
                Some(SnapshotEvent::Snapshot(docs)) => return docs,
                Some(SnapshotEvent::Error(_)) => continue,
                None => panic!("subscription closed"),
            }
        }
    }

    #[tokio::test]
    async fn create_resolves_server_timestamp() {
        let store = MemoryStore::new();
        let id = store
            .create("projects", fields(json!({ "name": "Launch", "createdAt": server_timestamp() })))
            .await
            .unwrap();

        let doc = store.peek("projects", &id).unwrap();
        assert!(doc.data["createdAt"].is_string());
        assert_eq!(store.write_count(), 1);
    }

    #[tokio::test]
    async fn update_missing_document_is_not_found() {
        let store = MemoryStore::new();
        let err = store
            .update("projects", "nope", fields(json!({ "name": "x" })))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn failed_batch_applies_nothing() {
        let store = MemoryStore::new();
        store.seed("videos", "v1", fields(json!({ "videoName": "A" })));
        store.seed("videos", "v2", fields(json!({ "videoName": "B" })));

        let mut batch = WriteBatch::new();
        batch.delete("videos", "v1");
        batch.update("videos", "missing", fields(json!({ "status": "done" })));

        let err = store.commit(batch).await.unwrap_err();
        assert!(matches!(err, StoreError::Batch(_)));
        assert_eq!(store.len("videos"), 2);
    }

    #[tokio::test]
    async fn injected_read_failure_is_consumed_once() {
        let store = MemoryStore::new();
        store.fail_next_reads(1);
        let query = Query::collection("projects");
        assert!(store.get_all(&query).await.is_err());
        assert!(store.get_all(&query).await.is_ok());
        assert_eq!(store.read_count(), 2);
    }

    #[tokio::test]
    async fn live_query_pushes_full_snapshots() {
        let store = MemoryStore::new();
        let query = Query::collection("notifications")
            .where_eq("userId", "u1")
            .order_by("createdAt", Direction::Desc);
        let mut sub = store.subscribe(query);

        assert!(next_snapshot(&mut sub).await.is_empty());

        store
            .create(
                "notifications",
                fields(json!({ "userId": "u1", "title": "a", "createdAt": server_timestamp() })),
            )
            .await
            .unwrap();
        assert_eq!(next_snapshot(&mut sub).await.len(), 1);

        // Writes outside the filter don't produce a push.
        store
            .create("notifications", fields(json!({ "userId": "u2", "title": "x" })))
            .await
            .unwrap();
        store
            .create(
                "notifications",
                fields(json!({ "userId": "u1", "title": "b", "createdAt": server_timestamp() })),
            )
            .await
            .unwrap();

        let docs = next_snapshot(&mut sub).await;
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].data["title"], json!("b"));
    }

    #[tokio::test]
    async fn listen_failure_is_followed_by_snapshot() {
        let store = MemoryStore::new();
        store.fail_next_listens(1);
        let mut sub = store.subscribe(Query::collection("chatMessages"));

        let first = tokio::time::timeout(StdDuration::from_secs(2), sub.next())
            .await
            .unwrap();
        assert!(matches!(first, Some(SnapshotEvent::Error(_))));
        assert!(next_snapshot(&mut sub).await.is_empty());
    }
}
