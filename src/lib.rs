//! file-replica - A multi-node replicated file store
//!
//! This crate provides versioned file upload, metadata management, and content
//! serving with:
//! - Full-content replication to every node via an AMQP message bus
//! - Monotonic per-path revisions with SHA-256 checksums
//! - redb embedded database for metadata (ACID, MVCC, crash-safe)
//! - TTL metadata cache in front of the database
//! - REST API with multipart upload support

pub mod api;
pub mod blob_store;
pub mod bus;
pub mod cache;
pub mod config;
pub mod events;
pub mod service;
pub mod storage;
pub mod sync;

use std::sync::Arc;

use config::Config;
use service::FileService;

/// Shared application state
pub struct AppState {
    pub config: Config,
    pub files: Arc<FileService>,
    pub blobs: Arc<dyn blob_store::BlobStore>,
}
