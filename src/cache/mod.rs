mod memory;

pub use memory::InMemoryFileCache;

use async_trait::async_trait;

use crate::storage::models::FileMetadata;

/// Cache-aside store for file metadata, keyed by (path, revision) and by a
/// per-path "latest" pointer. Advisory only: the metadata database remains
/// the source of truth, and entries self-expire via TTL as a staleness
/// backstop. A failed or missing cache lookup is never an error.
#[async_trait]
pub trait FileCache: Send + Sync {
    /// Look up a revision, or the latest pointer when `revision` is None.
    async fn get(&self, file_path: &str, revision: Option<u32>) -> Option<FileMetadata>;

    /// Write both the specific-revision key and the latest-pointer key.
    /// Callers must only do this after the row is durable.
    async fn set(&self, metadata: &FileMetadata);

    /// Remove one key: a specific revision, or the latest pointer when
    /// `revision` is None. Idempotent.
    async fn remove(&self, file_path: &str, revision: Option<u32>);
}

/// Cache key scheme shared by every backend: `file:{path}:{revision}` for
/// specific revisions, `file:{path}:latest` for the latest pointer.
pub(crate) fn cache_key(file_path: &str, revision: Option<u32>) -> String {
    match revision {
        Some(rev) => format!("file:{file_path}:{rev}"),
        None => format!("file:{file_path}:latest"),
    }
}
