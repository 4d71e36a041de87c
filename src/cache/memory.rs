use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use super::{cache_key, FileCache};
use crate::storage::models::FileMetadata;

/// In-process TTL cache over a concurrent map. Entries are evicted lazily:
/// an expired entry is dropped on the read that finds it.
pub struct InMemoryFileCache {
    entries: DashMap<String, (FileMetadata, Instant)>,
    ttl: Duration,
}

impl InMemoryFileCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Number of live (non-expired) entries. Test observability.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .iter()
            .filter(|entry| entry.value().1 > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl FileCache for InMemoryFileCache {
    async fn get(&self, file_path: &str, revision: Option<u32>) -> Option<FileMetadata> {
        let key = cache_key(file_path, revision);

        let expired = match self.entries.get(&key) {
            Some(entry) => {
                let (meta, deadline) = entry.value();
                if *deadline > Instant::now() {
                    return Some(meta.clone());
                }
                true
            }
            None => false,
        };

        // Read guard must be released before removal to avoid deadlocking
        // the shard lock.
        if expired {
            self.entries.remove(&key);
        }
        None
    }

    async fn set(&self, metadata: &FileMetadata) {
        let deadline = Instant::now() + self.ttl;
        let specific = cache_key(&metadata.file_path, Some(metadata.revision));
        let latest = cache_key(&metadata.file_path, None);

        self.entries.insert(specific, (metadata.clone(), deadline));
        self.entries.insert(latest, (metadata.clone(), deadline));
    }

    async fn remove(&self, file_path: &str, revision: Option<u32>) {
        self.entries.remove(&cache_key(file_path, revision));
    }
}
