//! Per-entity caches over one-shot reads.
//!
//! Each cache is tri-state: unfetched, loading or populated. A populated cache
//! is only ever replaced wholesale by a fetch or patched by a mutation that
//! follows a successful write; nothing pushes into it in the background.
//!
//! ## Fetch flights
//!
//! A fetch that finds the cache unfetched starts a *flight*: a shared future
//! doing the read. Non-forced fetches that arrive while a flight is up join it
//! instead of issuing their own read. `invalidate` and `mutate` ground the
//! current flight: its result is still handed to everyone awaiting it but is
//! no longer installed, so a late read never overwrites a newer local state.

use std::sync::Arc;
use std::time::Duration;

use cutroom_store::{
    CREATED_AT_FIELD, Client, Document, DocumentStore, Fields, PostProduction, Project, Script,
    Video, WriteBatch, is_server_timestamp, server_timestamp,
};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

use crate::entity::{Entity, EntityKind};
use crate::error::timed;
use crate::{SyncConfig, SyncError};

/// Capacity of the cache event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// State of one entity cache.
#[derive(Debug, Clone)]
pub enum CacheState<E> {
    Unfetched,
    Loading,
    Populated(Arc<Vec<E>>),
}

/// What happened to a cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheChange {
    /// A fetch installed fresh data.
    Populated { len: usize },
    /// A local mutation replaced the cached list.
    Mutated { len: usize },
    /// The cache was reset and will read on next fetch.
    Invalidated,
}

/// Broadcast on every cache state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheEvent {
    pub kind: EntityKind,
    pub change: CacheChange,
}

type Flight<E> = Shared<BoxFuture<'static, Option<Arc<Vec<E>>>>>;

struct InFlight<E> {
    id: u64,
    future: Flight<E>,
}

struct Slot<E> {
    state: CacheState<E>,
    next_flight: u64,
    in_flight: Option<InFlight<E>>,
}

/// Cache for one entity type.
pub struct EntityCache<E: Entity> {
    store: Arc<dyn DocumentStore>,
    slot: Arc<Mutex<Slot<E>>>,
    events: broadcast::Sender<CacheEvent>,
    timeout: Duration,
}

impl<E: Entity> EntityCache<E> {
    fn new(
        store: Arc<dyn DocumentStore>,
        events: broadcast::Sender<CacheEvent>,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            slot: Arc::new(Mutex::new(Slot {
                state: CacheState::Unfetched,
                next_flight: 0,
                in_flight: None,
            })),
            events,
            timeout,
        }
    }

    /// Return the cached list, reading from the store when unfetched or forced.
    ///
    /// Read failures are logged and yield an empty list; the cache stays
    /// unfetched so the next call retries.
    pub async fn fetch(&self, force_refresh: bool) -> Arc<Vec<E>> {
        let flight = {
            let mut slot = self.slot.lock();
            let joined = if force_refresh {
                None
            } else {
                if let CacheState::Populated(items) = &slot.state {
                    return Arc::clone(items);
                }
                slot.in_flight.as_ref().map(|f| f.future.clone())
            };

            match joined {
                Some(future) => {
                    trace!(kind = %E::KIND, "joining in-flight fetch");
                    future
                }
                None => self.start_flight(&mut slot),
            }
        };

        flight.await.unwrap_or_default()
    }

    fn start_flight(&self, slot: &mut Slot<E>) -> Flight<E> {
        let id = slot.next_flight;
        slot.next_flight += 1;
        slot.state = CacheState::Loading;

        let store = Arc::clone(&self.store);
        let shared_slot = Arc::clone(&self.slot);
        let events = self.events.clone();
        let timeout = self.timeout;

        let future = async move {
            let query = E::query();
            let result = timed(timeout, store.get_all(&query)).await;

            let mut slot = shared_slot.lock();
            let current = slot.in_flight.as_ref().is_some_and(|f| f.id == id);
            if current {
                slot.in_flight = None;
            }

            match result {
                Ok(docs) => {
                    let items = Arc::new(Document::decode_all::<E>(&docs));
                    if current {
                        slot.state = CacheState::Populated(Arc::clone(&items));
                        let _ = events.send(CacheEvent {
                            kind: E::KIND,
                            change: CacheChange::Populated { len: items.len() },
                        });
                        debug!(kind = %E::KIND, count = items.len(), "cache populated");
                    } else {
                        debug!(kind = %E::KIND, "discarding superseded fetch");
                    }
                    Some(items)
                }
                Err(e) => {
                    warn!(kind = %E::KIND, error = %e, "fetch failed, cache left unfetched");
                    if current {
                        slot.state = CacheState::Unfetched;
                    }
                    None
                }
            }
        }
        .boxed()
        .shared();

        slot.in_flight = Some(InFlight {
            id,
            future: future.clone(),
        });
        future
    }

    /// Reset to unfetched so the next fetch reads from the store.
    pub fn invalidate(&self) {
        {
            let mut slot = self.slot.lock();
            slot.state = CacheState::Unfetched;
            slot.in_flight = None;
        }
        let _ = self.events.send(CacheEvent {
            kind: E::KIND,
            change: CacheChange::Invalidated,
        });
        trace!(kind = %E::KIND, "cache invalidated");
    }

    /// Replace the cached list with `updater(previous)` without a read.
    ///
    /// `updater` receives `None` when the cache is not populated; its result
    /// becomes the populated state either way.
    pub fn mutate<F>(&self, updater: F) -> Arc<Vec<E>>
    where
        F: FnOnce(Option<&[E]>) -> Vec<E>,
    {
        let items = {
            let mut slot = self.slot.lock();
            let prev = match &slot.state {
                CacheState::Populated(items) => Some(items.as_slice()),
                _ => None,
            };
            let next = Arc::new(updater(prev));
            slot.state = CacheState::Populated(Arc::clone(&next));
            slot.in_flight = None;
            next
        };
        self.notify_mutated(items.len());
        items
    }

    /// Like [`mutate`](Self::mutate), but only when the cache is populated.
    /// Returns whether the updater ran.
    pub fn mutate_populated<F>(&self, updater: F) -> bool
    where
        F: FnOnce(&[E]) -> Vec<E>,
    {
        let len = {
            let mut slot = self.slot.lock();
            let next = match &slot.state {
                CacheState::Populated(items) => updater(items.as_slice()),
                _ => return false,
            };
            let len = next.len();
            slot.state = CacheState::Populated(Arc::new(next));
            slot.in_flight = None;
            len
        };
        self.notify_mutated(len);
        true
    }

    fn notify_mutated(&self, len: usize) {
        let _ = self.events.send(CacheEvent {
            kind: E::KIND,
            change: CacheChange::Mutated { len },
        });
    }

    pub fn state(&self) -> CacheState<E> {
        self.slot.lock().state.clone()
    }

    /// The cached list, if populated.
    pub fn cached(&self) -> Option<Arc<Vec<E>>> {
        match &self.slot.lock().state {
            CacheState::Populated(items) => Some(Arc::clone(items)),
            _ => None,
        }
    }

    /// Look up an entity by id, fetching first if needed.
    pub async fn find(&self, id: &str) -> Option<E> {
        self.fetch(false)
            .await
            .iter()
            .find(|item| item.id() == id)
            .cloned()
    }
}

/// Caches for every entity type, plus the write policies that keep them coherent.
///
/// After a successful write:
/// - `create` invalidates the acted-on cache, since ordering depends on the
///   server-assigned creation time;
/// - `update` and `delete` patch the acted-on cache in place;
/// - every write invalidates the caches whose views embed the changed kind
///   (see [`EntityKind::dependents`]).
///
/// Failed writes leave every cache untouched.
pub struct CacheStore {
    store: Arc<dyn DocumentStore>,
    events: broadcast::Sender<CacheEvent>,
    timeout: Duration,
    pub projects: EntityCache<Project>,
    pub videos: EntityCache<Video>,
    pub scripts: EntityCache<Script>,
    pub clients: EntityCache<Client>,
    pub post_productions: EntityCache<PostProduction>,
}

impl CacheStore {
    pub fn new(store: Arc<dyn DocumentStore>, config: &SyncConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let timeout = config.request_timeout;
        Self {
            projects: EntityCache::new(Arc::clone(&store), events.clone(), timeout),
            videos: EntityCache::new(Arc::clone(&store), events.clone(), timeout),
            scripts: EntityCache::new(Arc::clone(&store), events.clone(), timeout),
            clients: EntityCache::new(Arc::clone(&store), events.clone(), timeout),
            post_productions: EntityCache::new(Arc::clone(&store), events.clone(), timeout),
            store,
            events,
            timeout,
        }
    }

    /// Receive every cache change.
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.events.subscribe()
    }

    pub async fn fetch<E: Entity>(&self, force_refresh: bool) -> Arc<Vec<E>> {
        E::cache(self).fetch(force_refresh).await
    }

    pub async fn find<E: Entity>(&self, id: &str) -> Option<E> {
        E::cache(self).find(id).await
    }

    pub fn invalidate(&self, kind: EntityKind) {
        match kind {
            EntityKind::Project => self.projects.invalidate(),
            EntityKind::Video => self.videos.invalidate(),
            EntityKind::Script => self.scripts.invalidate(),
            EntityKind::Client => self.clients.invalidate(),
            EntityKind::PostProduction => self.post_productions.invalidate(),
        }
    }

    pub fn invalidate_all(&self) {
        for kind in EntityKind::ALL {
            self.invalidate(kind);
        }
    }

    fn invalidate_dependents(&self, kind: EntityKind) {
        for dependent in kind.dependents() {
            self.invalidate(*dependent);
        }
    }

    /// Create an entity. Stamps `createdAt` with the server time unless set.
    ///
    /// A populated cache gets the new entity prepended, with server-resolved
    /// fields left empty until the next read. Any other cache is invalidated.
    pub async fn create<E: Entity>(&self, mut data: Fields) -> Result<String, SyncError> {
        if data.is_empty() {
            return Err(SyncError::Validation(format!("empty {}", E::KIND)));
        }
        data.entry(CREATED_AT_FIELD.to_string())
            .or_insert_with(server_timestamp);
        let local = local_fields(&data);

        let id = timed(self.timeout, self.store.create(E::KIND.collection(), data)).await?;
        debug!(kind = %E::KIND, id = %id, "created entity");

        let cache = E::cache(self);
        match Document::new(id.clone(), local).decode::<E>() {
            Ok(created) => {
                let prepended = cache.mutate_populated(|items| {
                    std::iter::once(created)
                        .chain(items.iter().cloned())
                        .collect()
                });
                if !prepended {
                    cache.invalidate();
                }
            }
            Err(e) => {
                warn!(kind = %E::KIND, id = %id, error = %e, "created entity does not decode, invalidating");
                cache.invalidate();
            }
        }

        self.invalidate_dependents(E::KIND);
        Ok(id)
    }

    /// Merge `patch` into an entity and into its cached copy.
    pub async fn update<E: Entity>(&self, id: &str, patch: Fields) -> Result<(), SyncError> {
        if patch.is_empty() {
            return Err(SyncError::Validation("empty patch".to_string()));
        }

        timed(
            self.timeout,
            self.store.update(E::KIND.collection(), id, patch.clone()),
        )
        .await?;
        debug!(kind = %E::KIND, id = %id, "updated entity");

        let cache = E::cache(self);
        let mut unpatchable = false;
        cache.mutate_populated(|items| {
            items
                .iter()
                .map(|item| {
                    if item.id() != id {
                        return item.clone();
                    }
                    apply_patch(item, &patch).unwrap_or_else(|| {
                        unpatchable = true;
                        item.clone()
                    })
                })
                .collect()
        });
        if unpatchable {
            warn!(kind = %E::KIND, id = %id, "patch does not fit cached entity, invalidating");
            cache.invalidate();
        }

        self.invalidate_dependents(E::KIND);
        Ok(())
    }

    /// Delete an entity and drop it from the cache.
    pub async fn delete<E: Entity>(&self, id: &str) -> Result<(), SyncError> {
        timed(self.timeout, self.store.delete(E::KIND.collection(), id)).await?;
        debug!(kind = %E::KIND, id = %id, "deleted entity");

        E::cache(self).mutate_populated(|items| {
            items.iter().filter(|item| item.id() != id).cloned().collect()
        });
        self.invalidate_dependents(E::KIND);
        Ok(())
    }

    /// Delete several entities in one atomic batch.
    ///
    /// The cache is only touched once the batch has committed, so a failure
    /// leaves both store and cache exactly as they were.
    pub async fn delete_many<E: Entity>(&self, ids: &[String]) -> Result<(), SyncError> {
        if ids.is_empty() {
            return Ok(());
        }

        let mut batch = WriteBatch::new();
        for id in ids {
            batch.delete(E::KIND.collection(), id.as_str());
        }
        timed(self.timeout, self.store.commit(batch)).await?;
        debug!(kind = %E::KIND, count = ids.len(), "deleted entities");

        E::cache(self).mutate_populated(|items| {
            items
                .iter()
                .filter(|item| !ids.iter().any(|id| id == item.id()))
                .cloned()
                .collect()
        });
        self.invalidate_dependents(E::KIND);
        Ok(())
    }
}

/// Written fields as the client can know them: server sentinels become null.
fn local_fields(data: &Fields) -> Fields {
    data.iter()
        .map(|(key, field)| {
            let field = if is_server_timestamp(field) {
                Value::Null
            } else {
                field.clone()
            };
            (key.clone(), field)
        })
        .collect()
}

/// Merge a write patch into a cached entity. Server sentinels clear the field
/// until the next read brings the resolved value.
fn apply_patch<E: Entity>(item: &E, patch: &Fields) -> Option<E> {
    let mut value = serde_json::to_value(item).ok()?;
    let map = value.as_object_mut()?;
    for (key, field) in patch {
        if is_server_timestamp(field) {
            map.insert(key.clone(), Value::Null);
        } else {
            map.insert(key.clone(), field.clone());
        }
    }
    serde_json::from_value(value).ok()
}
