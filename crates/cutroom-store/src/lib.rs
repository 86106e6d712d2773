//! Document store and media clients for Cutroom.
//!
//! This crate defines the contract the sync layer consumes from the hosted
//! document database, plus the record types stored in it.
//!
//! ## Features
//!
//! - **Store contract**: [`DocumentStore`] with one-shot reads, live queries,
//!   single-document writes and atomic batches
//! - **HTTP client**: REST client with retry and a WebSocket live-query listener
//! - **Memory store**: in-process implementation for tests and local runs
//! - **Media**: multipart uploads with progress and URL-derived variants

mod client;
mod document;
mod error;
mod listen;
pub mod media;
mod memory;
mod records;
mod store;
pub mod subscription;
mod types;

pub use client::HttpStore;
pub use document::{
    Direction, Document, Fields, Filter, OrderBy, Query, Tid, WriteBatch, WriteOp,
    is_server_timestamp, server_timestamp, to_fields,
};
pub use error::StoreError;
pub use media::{
    MediaClient, OptimizeOptions, UploadOptions, UploadedMedia, derive_optimized_url,
    derive_thumbnail_url,
};
pub use memory::MemoryStore;
pub use records::*;
pub use store::DocumentStore;
pub use subscription::{SnapshotEvent, SnapshotSink, Subscription};
pub use types::*;
