use std::sync::Arc;

use base64::Engine;
use bytes::Bytes;
use chrono::Utc;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

use crate::bus::{publish_json, BusError, ExchangeKind, MessageBus};
use crate::cache::FileCache;
use crate::events::{
    FileDeletedEvent, FileEvent, FileUploadedEvent, FILE_DELETED_EXCHANGE, FILE_UPLOADED_EXCHANGE,
};
use crate::storage::models::FileMetadata;
use crate::storage::{Database, DatabaseError};

/// Upload attempts per request: the first try plus retries after a lost
/// revision race.
const MAX_UPLOAD_ATTEMPTS: u32 = 3;

#[derive(Debug, Error)]
pub enum FileServiceError {
    #[error(transparent)]
    Database(#[from] DatabaseError),
    #[error("Failed to publish replication event: {0}")]
    Publish(#[from] BusError),
    #[error("Revision conflict for '{file_path}' after {attempts} attempts")]
    RevisionConflict { file_path: String, attempts: u32 },
}

impl FileServiceError {
    /// A lost revision race that survived retries; the client may try again.
    pub fn is_conflict(&self) -> bool {
        matches!(self, FileServiceError::RevisionConflict { .. })
    }
}

/// Upload and delete orchestration: assigns revisions, persists metadata,
/// keeps the cache coherent, and broadcasts replication events to every node.
pub struct FileService {
    db: Database,
    cache: Arc<dyn FileCache>,
    bus: Arc<dyn MessageBus>,
}

impl FileService {
    pub fn new(db: Database, cache: Arc<dyn FileCache>, bus: Arc<dyn MessageBus>) -> Self {
        Self { db, cache, bus }
    }

    /// Slash-normalized logical path of an upload: the file name, prefixed
    /// with the base path when one is given.
    pub fn relative_path(base_path: Option<&str>, file_name: &str) -> String {
        let file_name = file_name.replace('\\', "/");
        match base_path {
            Some(base) if !base.trim().is_empty() => {
                let base = base.replace('\\', "/");
                format!("{}/{file_name}", base.trim_end_matches('/'))
            }
            _ => file_name,
        }
    }

    /// Accept an upload: assign the next revision for the path, broadcast the
    /// content to all nodes, and persist the metadata row.
    ///
    /// The event is published before the row commits -- fan-out is not gated
    /// on this node's durability. The revision read-then-increment is not
    /// transactional; the unique (path, revision) index converts a lost race
    /// into a retry, and a conflict surviving all retries surfaces as
    /// [`FileServiceError::RevisionConflict`].
    pub async fn upload(
        &self,
        file_name: &str,
        base_path: Option<&str>,
        content_type: Option<String>,
        data: Bytes,
        node_id: &str,
    ) -> Result<FileMetadata, FileServiceError> {
        let file_path = Self::relative_path(base_path, file_name);

        let checksum = hex::encode(Sha256::digest(&data));
        let content_base64 = base64::engine::general_purpose::STANDARD.encode(&data);

        let mut attempt = 0;
        loop {
            attempt += 1;

            // First attempt trusts the cached latest pointer; retries go
            // straight to the database after a lost race.
            let latest = if attempt == 1 {
                match self.cache.get(&file_path, None).await {
                    Some(meta) => Some(meta),
                    None => {
                        let meta = self.db.latest_revision(&file_path)?;
                        if let Some(ref meta) = meta {
                            self.cache.set(meta).await;
                        }
                        meta
                    }
                }
            } else {
                self.db.latest_revision(&file_path)?
            };

            let revision = latest.map(|m| m.revision).unwrap_or(0) + 1;

            let event = FileEvent::FileUploaded(FileUploadedEvent {
                file_name: file_path.clone(),
                revision,
                node_id: node_id.to_string(),
                content_base64: content_base64.clone(),
            });
            publish_json(
                self.bus.as_ref(),
                FILE_UPLOADED_EXCHANGE,
                ExchangeKind::Fanout,
                "",
                &event,
            )
            .await?;

            let meta = FileMetadata {
                id: uuid::Uuid::now_v7().to_string(),
                file_path: file_path.clone(),
                revision,
                size: data.len() as u64,
                checksum: checksum.clone(),
                content_type: content_type.clone(),
                created_at: Utc::now(),
            };

            match self.db.insert_revision(&meta) {
                Ok(()) => {
                    self.cache.set(&meta).await;
                    debug!(file_path = %meta.file_path, revision, "Uploaded file revision");
                    return Ok(meta);
                }
                Err(DatabaseError::RevisionExists { .. }) if attempt < MAX_UPLOAD_ATTEMPTS => {
                    warn!(
                        file_path = %file_path,
                        revision, attempt, "Lost revision race; retrying with fresh revision"
                    );
                }
                Err(DatabaseError::RevisionExists { .. }) => {
                    return Err(FileServiceError::RevisionConflict {
                        file_path,
                        attempts: attempt,
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Cache-aside metadata lookup: a specific revision, or the latest when
    /// `revision` is None.
    pub async fn metadata(
        &self,
        file_path: &str,
        revision: Option<u32>,
    ) -> Result<Option<FileMetadata>, FileServiceError> {
        if let Some(meta) = self.cache.get(file_path, revision).await {
            return Ok(Some(meta));
        }

        let meta = match revision {
            Some(rev) => self.db.get_revision(file_path, rev)?,
            None => self.db.latest_revision(file_path)?,
        };

        if let Some(ref meta) = meta {
            self.cache.set(meta).await;
        }
        Ok(meta)
    }

    /// Delete matching revisions, invalidate their cache entries, and
    /// broadcast one deleted event per removed row. An empty result means
    /// nothing matched and nothing changed.
    pub async fn delete(
        &self,
        file_path: &str,
        revision: Option<u32>,
    ) -> Result<Vec<FileDeletedEvent>, FileServiceError> {
        let removed = self.db.remove_revisions(file_path, revision)?;
        if removed.is_empty() {
            return Ok(Vec::new());
        }

        for meta in &removed {
            self.cache.remove(&meta.file_path, Some(meta.revision)).await;
            // The latest pointer may reference any removed row; clearing it
            // once per row is redundant but idempotent.
            self.cache.remove(&meta.file_path, None).await;
        }

        let mut events = Vec::with_capacity(removed.len());
        for meta in &removed {
            let event = FileDeletedEvent {
                file_name: meta.file_path.clone(),
                revision: meta.revision,
            };
            publish_json(
                self.bus.as_ref(),
                FILE_DELETED_EXCHANGE,
                ExchangeKind::Fanout,
                "",
                &FileEvent::FileDeleted(event.clone()),
            )
            .await?;
            events.push(event);
        }

        debug!(file_path = %file_path, count = events.len(), "Deleted file revisions");
        Ok(events)
    }
}
