//! Wiring the services for a command run.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use cutroom_store::{DocumentStore, Fields, HttpStore, MemoryStore, server_timestamp};
use cutroom_sync::{LocalStorage, LogNotifier, Studio, SyncConfig};
use miette::Result;
use serde_json::{Value, json};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Value of `--store` selecting the in-process store.
pub const MEMORY_STORE: &str = "memory";

/// Connection settings shared by every command.
#[derive(Debug, Clone)]
pub struct AppOptions {
    pub store: String,
    pub api_key: Option<String>,
    pub data_dir: Option<PathBuf>,
    pub native_notifications: bool,
    pub request_timeout: Duration,
}

/// A running studio and the handles needed to shut it down.
pub struct App {
    pub studio: Arc<Studio>,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl App {
    /// Build the services and subscribe for the persisted session, if any.
    pub async fn start(options: &AppOptions) -> Result<Self> {
        let store = open_store(options)?;
        let storage = Arc::new(open_storage(options).await?);
        let config = SyncConfig {
            native_notifications: options.native_notifications,
            request_timeout: options.request_timeout,
            ..SyncConfig::default()
        };

        let studio = Arc::new(Studio::new(store, storage, Arc::new(LogNotifier), config).await);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = studio.start(shutdown_rx).await;

        Ok(Self {
            studio,
            shutdown_tx,
            handle,
        })
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.handle.await {
            debug!(error = %e, "studio task ended abnormally");
        }
    }
}

fn open_store(options: &AppOptions) -> Result<Arc<dyn DocumentStore>> {
    if options.store == MEMORY_STORE {
        info!("using in-memory store with demo data");
        let memory = MemoryStore::new();
        seed_demo(&memory);
        return Ok(Arc::new(memory));
    }

    if !options.store.starts_with("http://") && !options.store.starts_with("https://") {
        return Err(miette::miette!(
            "invalid store '{}': expected an http(s) URL or '{}'",
            options.store,
            MEMORY_STORE
        ));
    }
    let mut store = HttpStore::new(&options.store);
    if let Some(key) = &options.api_key {
        store = store.with_api_key(key);
    }
    Ok(Arc::new(store))
}

async fn open_storage(options: &AppOptions) -> Result<LocalStorage> {
    let path = match &options.data_dir {
        Some(dir) => dir.join("storage.json"),
        None => LocalStorage::default_path()
            .ok_or_else(|| miette::miette!("no data directory; pass --data-dir"))?,
    };
    debug!(path = %path.display(), "opening local storage");
    LocalStorage::open(path)
        .await
        .map_err(|e| miette::miette!("failed to open local storage: {}", e))
}

fn fields(value: Value) -> Fields {
    match value {
        Value::Object(map) => map,
        _ => Fields::new(),
    }
}

/// A small studio so the memory store has something to show.
pub fn seed_demo(memory: &MemoryStore) {
    let users = [
        ("u-ali", "Ali Haddad", "ali@studio.test", "editor"),
        ("u-sam", "Sam Ortiz", "sam@studio.test", "producer"),
        ("u-kim", "Kim Lee", "kim@studio.test", "writer"),
    ];
    for (id, name, email, role) in users {
        memory.seed(
            "users",
            id,
            fields(json!({ "name": name, "email": email, "role": role })),
        );
    }

    memory.seed(
        "clients",
        "c-acme",
        fields(json!({ "name": "Acme", "company": "Acme Footwear", "createdAt": server_timestamp() })),
    );
    memory.seed(
        "projects",
        "p-launch",
        fields(json!({
            "name": "Launch",
            "clientId": "c-acme",
            "clientName": "Acme",
            "status": "active",
            "createdAt": server_timestamp(),
        })),
    );
    memory.seed(
        "videos",
        "v-teaser",
        fields(json!({
            "projectId": "p-launch",
            "videoName": "Teaser",
            "status": "editing",
            "assignedTo": "u-ali",
            "createdAt": server_timestamp(),
        })),
    );
    memory.seed(
        "scripts",
        "s-teaser",
        fields(json!({
            "title": "Teaser VO",
            "videoId": "v-teaser",
            "projectId": "p-launch",
            "status": "approved",
            "createdAt": server_timestamp(),
        })),
    );
    memory.seed(
        "postProductions",
        "pp-teaser",
        fields(json!({
            "title": "Teaser Cut",
            "videoId": "v-teaser",
            "videoName": "Teaser",
            "projectId": "p-launch",
            "editorId": "u-ali",
            "editorName": "Ali Haddad",
            "status": "in-progress",
            "createdAt": server_timestamp(),
        })),
    );
    memory.seed(
        "chatMessages",
        "m-welcome",
        fields(json!({
            "content": "Welcome! First cut of #project:Launch is up.",
            "senderId": "u-sam",
            "senderName": "Sam Ortiz",
            "mentions": [],
            "references": [{ "type": "project", "id": "p-launch", "name": "Launch" }],
            "createdAt": server_timestamp(),
        })),
    );
    memory.seed(
        "notifications",
        "n-assigned",
        fields(json!({
            "userId": "u-ali",
            "title": "New assignment",
            "body": "You are editing Teaser",
            "type": "assignment",
            "link": "/videos/v-teaser",
            "read": false,
            "createdAt": server_timestamp(),
        })),
    );
}
