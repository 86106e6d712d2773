//! End-to-end cache behaviour against the in-memory store.

use std::sync::Arc;

use cutroom_store::{DocumentStore, Fields, MemoryStore, Project, Video};
use cutroom_sync::{CacheState, CacheStore, SyncConfig, SyncError};
use serde_json::{Value, json};

fn fields(value: Value) -> Fields {
    match value {
        Value::Object(map) => map,
        _ => Fields::new(),
    }
}

fn setup() -> (MemoryStore, CacheStore) {
    let memory = MemoryStore::new();
    let store: Arc<dyn DocumentStore> = Arc::new(memory.clone());
    let caches = CacheStore::new(store, &SyncConfig::default());
    (memory, caches)
}

#[tokio::test]
async fn create_then_delete_round_trip() {
    let (memory, caches) = setup();

    caches.fetch::<Project>(false).await;
    let project_id = caches
        .create::<Project>(fields(json!({ "name": "Launch", "status": "active" })))
        .await
        .unwrap();

    // Creating prepends into the populated project cache without a read.
    let reads = memory.read_count();
    let projects = caches.fetch::<Project>(false).await;
    assert_eq!(memory.read_count(), reads);
    assert_eq!(projects.len(), 1);
    assert_eq!(projects[0].id, project_id);
    assert_eq!(projects[0].display_name(), "Launch");

    let video_id = caches
        .create::<Video>(fields(json!({ "projectId": project_id, "videoName": "Teaser" })))
        .await
        .unwrap();

    // The video cache was never fetched, so the next fetch reads.
    assert!(matches!(caches.videos.state(), CacheState::Unfetched));
    let reads = memory.read_count();
    let videos = caches.fetch::<Video>(false).await;
    assert_eq!(memory.read_count(), reads + 1);
    assert_eq!(videos[0].id, video_id);
    assert!(videos[0].created_at.is_some());

    // Deleting patches the populated cache; no read follows.
    caches.delete::<Video>(&video_id).await.unwrap();
    let reads = memory.read_count();
    let videos = caches.fetch::<Video>(false).await;
    assert_eq!(memory.read_count(), reads);
    assert!(videos.is_empty());
    assert!(memory.peek("videos", &video_id).is_none());
}

#[tokio::test]
async fn batch_delete_is_all_or_nothing() {
    let (memory, caches) = setup();
    for id in ["p1", "p2", "p3"] {
        memory.seed("projects", id, fields(json!({ "name": id })));
    }
    caches.fetch::<Project>(false).await;

    memory.fail_next_writes(1);
    let err = caches
        .delete_many::<Project>(&["p1".to_string(), "p2".to_string()])
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Store(_)));
    assert_eq!(memory.len("projects"), 3);
    assert_eq!(caches.projects.cached().unwrap().len(), 3);

    caches
        .delete_many::<Project>(&["p1".to_string(), "p2".to_string()])
        .await
        .unwrap();
    assert_eq!(memory.len("projects"), 1);
    let remaining: Vec<_> = caches
        .projects
        .cached()
        .unwrap()
        .iter()
        .map(|p| p.id.clone())
        .collect();
    assert_eq!(remaining, vec!["p3".to_string()]);
}
