use serde::{Deserialize, Serialize};

/// Fanout exchange carrying uploaded-file events.
pub const FILE_UPLOADED_EXCHANGE: &str = "file-uploaded-events";

/// Fanout exchange carrying deleted-file events.
pub const FILE_DELETED_EXCHANGE: &str = "file-deleted-events";

/// Per-node queue bound to an event exchange, so every node receives every
/// broadcast on its own queue: `{exchange}.{node_id}`.
pub fn node_queue(exchange: &str, node_id: &str) -> String {
    format!("{exchange}.{node_id}")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileUploadedEvent {
    pub file_name: String,
    pub revision: u32,
    /// Node that accepted the upload.
    pub node_id: String,
    /// Full file content, base64-encoded for broker transport.
    pub content_base64: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDeletedEvent {
    pub file_name: String,
    pub revision: u32,
}

/// Replication event envelope. The `event` discriminator makes every payload
/// self-describing, so a consumer can demultiplex variants even though each
/// variant normally travels on its own exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum FileEvent {
    FileUploaded(FileUploadedEvent),
    FileDeleted(FileDeletedEvent),
}
