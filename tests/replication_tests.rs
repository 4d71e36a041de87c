use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use sha2::{Digest, Sha256};

use file_replica::blob_store::{BlobStore, LocalStore};
use file_replica::bus::{
    publish_json, AckMode, BusError, ExchangeKind, MemoryBus, MessageBus, MessageHandler,
    RpcHandler, SubscribeOptions, SubscriptionHandle,
};
use file_replica::cache::{FileCache, InMemoryFileCache};
use file_replica::events::{FileEvent, FileUploadedEvent, FILE_UPLOADED_EXCHANGE};
use file_replica::service::{FileService, FileServiceError};
use file_replica::storage::models::FileMetadata;
use file_replica::storage::Database;
use file_replica::sync::FileSyncService;

struct Node {
    dir: tempfile::TempDir,
    blobs: Arc<dyn BlobStore>,
    sync: Arc<FileSyncService>,
}

impl Node {
    fn new(node_id: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let blobs: Arc<dyn BlobStore> = Arc::new(LocalStore::new(dir.path()).unwrap());
        let sync = FileSyncService::new(node_id, Arc::clone(&blobs));
        Self { dir, blobs, sync }
    }
}

struct Cluster {
    _dir: tempfile::TempDir,
    bus: Arc<MemoryBus>,
    cache: Arc<InMemoryFileCache>,
    db: Database,
    files: FileService,
    nodes: Vec<Node>,
}

/// One origin database plus `node_count` sync targets, all wired to an
/// in-process bus.
async fn cluster(node_count: usize) -> Cluster {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(dir.path().join("data")).unwrap();
    let bus = MemoryBus::new();
    let cache = Arc::new(InMemoryFileCache::new(Duration::from_secs(60)));

    let mut nodes = Vec::new();
    for i in 0..node_count {
        let node = Node::new(&format!("node-{i}"));
        node.sync
            .register(bus.as_ref(), 5, AckMode::OnDispatch)
            .await
            .unwrap();
        nodes.push(node);
    }

    let files = FileService::new(
        db.clone(),
        Arc::clone(&cache) as Arc<dyn FileCache>,
        Arc::clone(&bus) as Arc<dyn MessageBus>,
    );

    Cluster {
        _dir: dir,
        bus,
        cache,
        db,
        files,
        nodes,
    }
}

fn competing_row(file_path: &str, revision: u32) -> FileMetadata {
    FileMetadata {
        id: uuid::Uuid::now_v7().to_string(),
        file_path: file_path.to_string(),
        revision,
        size: 9,
        checksum: "ef".repeat(32),
        content_type: None,
        created_at: Utc::now(),
    }
}

/// Event handling is asynchronous; poll until the condition holds.
async fn wait_for<F, Fut>(mut condition: F, what: &str)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if condition().await {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for: {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_upload_replicates_to_every_node() {
    let cluster = cluster(2).await;
    let data = Bytes::from_static(b"quarterly numbers");

    let meta = cluster
        .files
        .upload("report.pdf", Some("docs"), None, data.clone(), "node-0")
        .await
        .unwrap();

    assert_eq!(meta.file_path, "docs/report.pdf");
    assert_eq!(meta.revision, 1);
    assert_eq!(meta.size, data.len() as u64);
    assert_eq!(meta.checksum, hex::encode(Sha256::digest(&data)));

    for node in &cluster.nodes {
        let blobs = Arc::clone(&node.blobs);
        let data = data.clone();
        wait_for(
            move || {
                let blobs = Arc::clone(&blobs);
                let data = data.clone();
                async move { blobs.read("docs/report.pdf", 1).await.unwrap() == Some(data) }
            },
            "replica on every node",
        )
        .await;
    }
}

#[tokio::test]
async fn test_revisions_increment_and_old_content_survives() {
    let cluster = cluster(1).await;

    // Sequential uploads must yield gapless revisions, with the latest
    // pointer tracking each one as soon as the upload returns
    for expected in 1..=5u32 {
        let meta = cluster
            .files
            .upload(
                "report.pdf",
                Some("docs"),
                None,
                Bytes::from(format!("v{expected}")),
                "node-0",
            )
            .await
            .unwrap();
        assert_eq!(meta.revision, expected);

        let latest = cluster
            .files
            .metadata("docs/report.pdf", None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.revision, expected);
    }

    let blobs = Arc::clone(&cluster.nodes[0].blobs);
    wait_for(
        move || {
            let blobs = Arc::clone(&blobs);
            async move {
                blobs.read("docs/report.pdf", 1).await.unwrap() == Some(Bytes::from("v1"))
                    && blobs.read("docs/report.pdf", 2).await.unwrap() == Some(Bytes::from("v2"))
            }
        },
        "both revisions replicated",
    )
    .await;
}

#[tokio::test]
async fn test_duplicate_event_delivery_is_idempotent() {
    let cluster = cluster(1).await;
    let data = Bytes::from_static(b"payload");

    cluster
        .files
        .upload("report.pdf", Some("docs"), None, data.clone(), "node-0")
        .await
        .unwrap();

    let blobs = Arc::clone(&cluster.nodes[0].blobs);
    wait_for(
        move || {
            let blobs = Arc::clone(&blobs);
            async move { blobs.exists("docs/report.pdf", 1).await.unwrap() }
        },
        "initial replica",
    )
    .await;

    // Redeliver for the same (path, revision) with different bytes; the
    // existing replica must be left alone
    use base64::Engine;
    let event = FileEvent::FileUploaded(FileUploadedEvent {
        file_name: "docs/report.pdf".to_string(),
        revision: 1,
        node_id: "node-0".to_string(),
        content_base64: base64::engine::general_purpose::STANDARD.encode(b"tampered"),
    });
    publish_json(
        cluster.bus.as_ref(),
        FILE_UPLOADED_EXCHANGE,
        ExchangeKind::Fanout,
        "",
        &event,
    )
    .await
    .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        cluster.nodes[0].blobs.read("docs/report.pdf", 1).await.unwrap(),
        Some(data)
    );
}

#[tokio::test]
async fn test_delete_removes_rows_replicas_and_cache() {
    let cluster = cluster(1).await;

    for content in ["v1", "v2"] {
        cluster
            .files
            .upload("report.pdf", Some("docs"), None, Bytes::from(content), "node-0")
            .await
            .unwrap();
    }

    let blobs = Arc::clone(&cluster.nodes[0].blobs);
    wait_for(
        move || {
            let blobs = Arc::clone(&blobs);
            async move {
                blobs.exists("docs/report.pdf", 1).await.unwrap()
                    && blobs.exists("docs/report.pdf", 2).await.unwrap()
            }
        },
        "replicas before delete",
    )
    .await;

    let deleted = cluster.files.delete("docs/report.pdf", None).await.unwrap();
    assert_eq!(deleted.len(), 2);
    assert_eq!(
        deleted.iter().map(|e| e.revision).collect::<Vec<_>>(),
        vec![1, 2]
    );

    assert!(cluster
        .files
        .metadata("docs/report.pdf", None)
        .await
        .unwrap()
        .is_none());
    assert!(cluster.cache.get("docs/report.pdf", None).await.is_none());

    let node_root = cluster.nodes[0].dir.path().to_path_buf();
    wait_for(
        move || {
            let node_root = node_root.clone();
            async move {
                !node_root.join("docs/report/1").exists()
                    && !node_root.join("docs/report/2").exists()
            }
        },
        "replicas removed and revision directories pruned",
    )
    .await;
}

#[tokio::test]
async fn test_delete_single_revision_keeps_the_rest() {
    let cluster = cluster(1).await;

    for content in ["v1", "v2"] {
        cluster
            .files
            .upload("report.pdf", Some("docs"), None, Bytes::from(content), "node-0")
            .await
            .unwrap();
    }

    let blobs = Arc::clone(&cluster.nodes[0].blobs);
    wait_for(
        move || {
            let blobs = Arc::clone(&blobs);
            async move {
                blobs.exists("docs/report.pdf", 1).await.unwrap()
                    && blobs.exists("docs/report.pdf", 2).await.unwrap()
            }
        },
        "replicas before delete",
    )
    .await;

    let deleted = cluster
        .files
        .delete("docs/report.pdf", Some(1))
        .await
        .unwrap();
    assert_eq!(deleted.len(), 1);
    assert_eq!(deleted[0].revision, 1);

    let latest = cluster
        .files
        .metadata("docs/report.pdf", None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(latest.revision, 2);

    let blobs = Arc::clone(&cluster.nodes[0].blobs);
    wait_for(
        move || {
            let blobs = Arc::clone(&blobs);
            async move { !blobs.exists("docs/report.pdf", 1).await.unwrap() }
        },
        "revision 1 removed",
    )
    .await;
    assert!(cluster.nodes[0].blobs.exists("docs/report.pdf", 2).await.unwrap());
}

#[tokio::test]
async fn test_upload_retries_past_stale_cached_latest() {
    let cluster = cluster(0).await;

    cluster
        .files
        .upload("report.pdf", Some("docs"), None, Bytes::from("v1"), "node-0")
        .await
        .unwrap();

    // Another writer advances the database; the cached latest pointer still
    // says revision 1, so the next upload's first attempt computes revision 2
    // and loses the race
    cluster
        .db
        .insert_revision(&competing_row("docs/report.pdf", 2))
        .unwrap();
    assert_eq!(
        cluster
            .cache
            .get("docs/report.pdf", None)
            .await
            .unwrap()
            .revision,
        1
    );

    let meta = cluster
        .files
        .upload("report.pdf", Some("docs"), None, Bytes::from("v3"), "node-0")
        .await
        .unwrap();

    // The retry re-resolved the latest revision from the database
    assert_eq!(meta.revision, 3);
    assert_eq!(
        cluster
            .files
            .metadata("docs/report.pdf", None)
            .await
            .unwrap()
            .unwrap()
            .revision,
        3
    );
}

/// Bus that claims each broadcast revision in the database before the
/// publisher's own insert lands, so every upload attempt loses its race.
struct CompetingWriterBus {
    inner: Arc<MemoryBus>,
    db: Database,
}

#[async_trait]
impl MessageBus for CompetingWriterBus {
    async fn publish(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        queue: &str,
        payload: Bytes,
    ) -> Result<(), BusError> {
        if exchange == FILE_UPLOADED_EXCHANGE {
            if let Ok(FileEvent::FileUploaded(event)) = serde_json::from_slice(&payload) {
                let _ = self
                    .db
                    .insert_revision(&competing_row(&event.file_name, event.revision));
            }
        }
        self.inner.publish(exchange, kind, queue, payload).await
    }

    async fn request(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        queue: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Bytes, BusError> {
        self.inner
            .request(exchange, kind, queue, payload, timeout)
            .await
    }

    async fn subscribe(
        &self,
        options: SubscribeOptions,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<SubscriptionHandle, BusError> {
        self.inner.subscribe(options, handler).await
    }

    async fn subscribe_rpc(
        &self,
        options: SubscribeOptions,
        handler: Arc<dyn RpcHandler>,
    ) -> Result<SubscriptionHandle, BusError> {
        self.inner.subscribe_rpc(options, handler).await
    }
}

#[tokio::test]
async fn test_upload_conflict_surfaces_after_exhausted_retries() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(dir.path().join("data")).unwrap();
    let bus = Arc::new(CompetingWriterBus {
        inner: MemoryBus::new(),
        db: db.clone(),
    });
    let cache = Arc::new(InMemoryFileCache::new(Duration::from_secs(60)));
    let files = FileService::new(
        db.clone(),
        Arc::clone(&cache) as Arc<dyn FileCache>,
        bus as Arc<dyn MessageBus>,
    );

    let err = files
        .upload("report.pdf", Some("docs"), None, Bytes::from("v1"), "node-0")
        .await
        .unwrap_err();

    assert!(err.is_conflict());
    assert!(matches!(
        err,
        FileServiceError::RevisionConflict {
            ref file_path,
            attempts: 3,
        } if file_path == "docs/report.pdf"
    ));

    // Only the competing writer's rows landed: one per attempt, revisions 1-3
    let rows = db.list_revisions("docs/report.pdf", None).unwrap();
    assert_eq!(
        rows.iter().map(|m| m.revision).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );

    // The failed upload must not have poisoned the cache
    assert!(cache.get("docs/report.pdf", None).await.is_none());
}

#[tokio::test]
async fn test_delete_unknown_path_is_empty_and_silent() {
    let cluster = cluster(1).await;

    let deleted = cluster.files.delete("never/uploaded.txt", None).await.unwrap();
    assert!(deleted.is_empty());
}

#[tokio::test]
async fn test_metadata_round_trip() {
    let cluster = cluster(1).await;
    let data = Bytes::from_static(b"spreadsheet");

    cluster
        .files
        .upload(
            "sheet.csv",
            None,
            Some("text/csv".to_string()),
            data.clone(),
            "node-0",
        )
        .await
        .unwrap();

    let meta = cluster
        .files
        .metadata("sheet.csv", Some(1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(meta.file_path, "sheet.csv");
    assert_eq!(meta.size, data.len() as u64);
    assert_eq!(meta.checksum, hex::encode(Sha256::digest(&data)));
    assert_eq!(meta.content_type.as_deref(), Some("text/csv"));

    assert!(cluster
        .files
        .metadata("sheet.csv", Some(2))
        .await
        .unwrap()
        .is_none());
}

#[test]
fn test_relative_path_derivation() {
    assert_eq!(
        FileService::relative_path(Some("docs"), "report.pdf"),
        "docs/report.pdf"
    );
    assert_eq!(
        FileService::relative_path(Some("docs/"), "report.pdf"),
        "docs/report.pdf"
    );
    assert_eq!(FileService::relative_path(None, "report.pdf"), "report.pdf");
    assert_eq!(FileService::relative_path(Some("  "), "report.pdf"), "report.pdf");
    assert_eq!(
        FileService::relative_path(Some("a\\b"), "c\\report.pdf"),
        "a/b/c/report.pdf"
    );
}

#[test]
fn test_event_wire_format() {
    let event = FileEvent::FileUploaded(FileUploadedEvent {
        file_name: "docs/report.pdf".to_string(),
        revision: 3,
        node_id: "node-1".to_string(),
        content_base64: "aGVsbG8=".to_string(),
    });

    let value = serde_json::to_value(&event).unwrap();
    assert_eq!(
        value,
        serde_json::json!({
            "event": "FileUploaded",
            "fileName": "docs/report.pdf",
            "revision": 3,
            "nodeId": "node-1",
            "contentBase64": "aGVsbG8=",
        })
    );

    let parsed: FileEvent = serde_json::from_value(value).unwrap();
    assert_eq!(parsed, event);
}
