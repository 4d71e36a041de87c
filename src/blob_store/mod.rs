mod local;

pub use local::LocalStore;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BlobStoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Backend error: {0}")]
    Backend(String),
}

/// Storage for replicated file content, addressed by (logical path, revision).
///
/// Every node holds a full replica; the sync handler and the download path
/// must derive bit-for-bit identical locations, so all implementations use
/// [`revision_path`] for layout.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn exists(&self, file_name: &str, revision: u32) -> Result<bool, BlobStoreError>;

    /// Write content, creating any missing parent directories.
    async fn write(&self, file_name: &str, revision: u32, data: Bytes)
        -> Result<(), BlobStoreError>;

    /// Read content, or None when this node has no replica of the revision.
    async fn read(&self, file_name: &str, revision: u32) -> Result<Option<Bytes>, BlobStoreError>;

    /// Delete the blob. Returns whether it existed.
    async fn delete(&self, file_name: &str, revision: u32) -> Result<bool, BlobStoreError>;

    /// Remove the revision directory if it is now empty (one level only).
    /// Returns whether a directory was removed.
    async fn remove_empty_dir(&self, file_name: &str, revision: u32)
        -> Result<bool, BlobStoreError>;
}

/// Directory holding one revision of a file:
/// `root / dirname(file_name) / stem(file_name) / revision`.
///
/// Logical names arrive in replication events from other nodes, so only
/// normal path components are honored; root and parent-dir components are
/// dropped to keep every derived location inside the storage root.
pub fn revision_dir(root: &Path, file_name: &str, revision: u32) -> PathBuf {
    let logical = Path::new(file_name);
    let parent = logical.parent().unwrap_or_else(|| Path::new(""));
    let stem = logical.file_stem().unwrap_or_default();

    let mut dir = root.to_path_buf();
    for component in parent.components() {
        if let std::path::Component::Normal(part) = component {
            dir.push(part);
        }
    }
    dir.join(stem).join(revision.to_string())
}

/// Full on-disk location of one revision of a file:
/// `revision_dir / basename(file_name)`.
pub fn revision_path(root: &Path, file_name: &str, revision: u32) -> PathBuf {
    let basename = Path::new(file_name).file_name().unwrap_or_default();
    revision_dir(root, file_name, revision).join(basename)
}
