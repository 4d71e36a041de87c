use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One immutable revision of a file, stored in redb.
///
/// Rows are created on upload and removed on delete; they are never mutated.
/// `(file_path, revision)` is unique across the store. "Latest" is a derived
/// concept: the row with the highest revision for a path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMetadata {
    /// Time-ordered unique id (UUIDv7), generated at creation.
    pub id: String,
    /// Logical slash-separated path, case-sensitive.
    pub file_path: String,
    /// Strictly increasing per path, starting at 1.
    pub revision: u32,
    /// Content length in bytes.
    pub size: u64,
    /// Hex-encoded SHA-256 of the content. Integrity check, not security.
    pub checksum: String,
    /// Client-supplied MIME type, if any.
    #[serde(default)]
    pub content_type: Option<String>,
    pub created_at: DateTime<Utc>,
}
