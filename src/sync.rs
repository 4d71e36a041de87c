use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use tracing::{info, warn};

use crate::blob_store::BlobStore;
use crate::bus::{
    AckMode, BusError, MessageBus, MessageHandler, SubscribeOptions, SubscriptionHandle,
};
use crate::events::{
    node_queue, FileDeletedEvent, FileEvent, FileUploadedEvent, FILE_DELETED_EXCHANGE,
    FILE_UPLOADED_EXCHANGE,
};

/// Applies replication events to the local blob store.
///
/// Stateless: idempotence comes from the deterministic blob location. The
/// broker delivers at least once, and the origin node receives its own
/// broadcasts, so an existing blob always means "already applied".
pub struct FileSyncService {
    node_id: String,
    blobs: Arc<dyn BlobStore>,
}

impl FileSyncService {
    pub fn new(node_id: impl Into<String>, blobs: Arc<dyn BlobStore>) -> Arc<Self> {
        Arc::new(Self {
            node_id: node_id.into(),
            blobs,
        })
    }

    /// Bind this node's event queues and start consuming. Returns one handle
    /// per subscription so composition code and tests can tear them down.
    pub async fn register(
        self: &Arc<Self>,
        bus: &dyn MessageBus,
        prefetch: u16,
        ack: AckMode,
    ) -> Result<Vec<SubscriptionHandle>, BusError> {
        let uploaded = bus
            .subscribe(
                SubscribeOptions::fanout(
                    FILE_UPLOADED_EXCHANGE,
                    node_queue(FILE_UPLOADED_EXCHANGE, &self.node_id),
                )
                .with_prefetch(prefetch)
                .with_ack(ack),
                Arc::new(UploadedHandler(Arc::clone(self))),
            )
            .await?;

        let deleted = bus
            .subscribe(
                SubscribeOptions::fanout(
                    FILE_DELETED_EXCHANGE,
                    node_queue(FILE_DELETED_EXCHANGE, &self.node_id),
                )
                .with_prefetch(prefetch)
                .with_ack(ack),
                Arc::new(DeletedHandler(Arc::clone(self))),
            )
            .await?;

        Ok(vec![uploaded, deleted])
    }

    /// Materialize an uploaded revision locally. An existing blob at the
    /// derived path is a duplicate delivery and a no-op.
    async fn apply_uploaded(&self, event: FileUploadedEvent) -> anyhow::Result<()> {
        if self.blobs.exists(&event.file_name, event.revision).await? {
            info!(
                file = %event.file_name,
                revision = event.revision,
                "Replica already present; skipping duplicate delivery"
            );
            return Ok(());
        }

        let content = base64::engine::general_purpose::STANDARD
            .decode(&event.content_base64)
            .context("invalid base64 content payload")?;

        self.blobs
            .write(&event.file_name, event.revision, Bytes::from(content))
            .await?;

        info!(
            file = %event.file_name,
            revision = event.revision,
            origin = %event.node_id,
            "Replicated file revision"
        );
        Ok(())
    }

    /// Remove a deleted revision's local replica, pruning its revision
    /// directory when empty. A missing blob means already synced or never
    /// replicated; both are no-ops.
    async fn apply_deleted(&self, event: FileDeletedEvent) -> anyhow::Result<()> {
        if self.blobs.delete(&event.file_name, event.revision).await? {
            self.blobs
                .remove_empty_dir(&event.file_name, event.revision)
                .await?;
            info!(
                file = %event.file_name,
                revision = event.revision,
                "Removed local replica"
            );
        } else {
            warn!(
                file = %event.file_name,
                revision = event.revision,
                "Replica already missing"
            );
        }
        Ok(())
    }
}

struct UploadedHandler(Arc<FileSyncService>);

#[async_trait]
impl MessageHandler for UploadedHandler {
    async fn handle(&self, payload: Bytes) -> anyhow::Result<()> {
        match serde_json::from_slice(&payload)? {
            FileEvent::FileUploaded(event) => self.0.apply_uploaded(event).await,
            FileEvent::FileDeleted(_) => {
                warn!("Unexpected deleted event on the uploaded queue; dropping");
                Ok(())
            }
        }
    }
}

struct DeletedHandler(Arc<FileSyncService>);

#[async_trait]
impl MessageHandler for DeletedHandler {
    async fn handle(&self, payload: Bytes) -> anyhow::Result<()> {
        match serde_json::from_slice(&payload)? {
            FileEvent::FileDeleted(event) => self.0.apply_deleted(event).await,
            FileEvent::FileUploaded(_) => {
                warn!("Unexpected uploaded event on the deleted queue; dropping");
                Ok(())
            }
        }
    }
}
