use std::sync::Arc;

use axum::extract::{Multipart, Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::BytesMut;
use serde::{Deserialize, Serialize};

use crate::api::response::{ApiError, AppQuery, JSend};
use crate::events::FileDeletedEvent;
use crate::service::FileServiceError;
use crate::storage::models::FileMetadata;
use crate::AppState;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct FileResponse {
    pub checksum: String,
    pub content_type: Option<String>,
    pub created_at: String,
    pub file_path: String,
    pub id: String,
    pub revision: u32,
    pub size: u64,
}

#[derive(Debug, Deserialize)]
pub struct UploadParams {
    /// Base path the uploaded file name is joined onto.
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RevisionParams {
    /// Specific revision; omitted means latest.
    #[serde(default)]
    pub revision: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub message: String,
    pub deleted: Vec<FileDeletedEvent>,
}

// ============================================================================
// Handlers
// ============================================================================

pub async fn upload_file(
    State(state): State<Arc<AppState>>,
    AppQuery(params): AppQuery<UploadParams>,
    mut multipart: Multipart,
) -> Result<Json<JSend<FileResponse>>, ApiError> {
    let mut file_data: Option<BytesMut> = None;
    let mut file_name: Option<String> = None;
    let mut file_content_type: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("Invalid multipart data: {e}")))?
    {
        if field.name() != Some("file") {
            // Ignore unknown fields
            continue;
        }

        file_name = field.file_name().map(|s| s.to_string());
        file_content_type = field.content_type().map(|s| s.to_string());

        let data = field
            .bytes()
            .await
            .map_err(|e| ApiError::bad_request(format!("Failed to read file: {e}")))?;

        if data.len() as u64 > state.config.max_upload_size {
            return Err(ApiError::payload_too_large(format!(
                "File exceeds maximum upload size of {} bytes",
                state.config.max_upload_size
            )));
        }

        let mut buf = BytesMut::with_capacity(data.len());
        buf.extend_from_slice(&data);
        file_data = Some(buf);
    }

    let file_data = file_data.ok_or_else(|| ApiError::bad_request("file field is required"))?;
    if file_data.is_empty() {
        return Err(ApiError::bad_request("file must not be empty"));
    }
    let file_name = file_name
        .filter(|n| !n.trim().is_empty())
        .ok_or_else(|| ApiError::bad_request("file field must carry a filename"))?;

    // Content type: from the multipart part, or guessed from the filename
    let content_type = file_content_type
        .filter(|ct| ct != "application/octet-stream")
        .or_else(|| {
            mime_guess::from_path(&file_name)
                .first()
                .map(|m| m.to_string())
        });

    let meta = state
        .files
        .upload(
            &file_name,
            params.path.as_deref(),
            content_type,
            file_data.freeze(),
            &state.config.node.id,
        )
        .await
        .map_err(upload_error)?;

    tracing::debug!(file_path = %meta.file_path, revision = meta.revision, "Uploaded file");

    Ok(JSend::success(file_to_response(&meta)))
}

pub async fn download_file(
    State(state): State<Arc<AppState>>,
    Path(file_path): Path<String>,
    AppQuery(params): AppQuery<RevisionParams>,
) -> Result<Response, ApiError> {
    let meta = state
        .files
        .metadata(&file_path, params.revision)
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?
        .ok_or_else(|| ApiError::not_found("File not found"))?;

    let data = state
        .blobs
        .read(&meta.file_path, meta.revision)
        .await
        .map_err(|e| ApiError::internal(format!("Failed to retrieve file: {e}")))?
        .ok_or_else(|| ApiError::not_found("File content not replicated on this node"))?;

    let size = data.len() as u64;
    let mut response = (StatusCode::OK, data).into_response();
    let headers = response.headers_mut();

    headers.insert(
        header::CONTENT_TYPE,
        meta.content_type
            .as_deref()
            .and_then(|ct| ct.parse().ok())
            .unwrap_or(header::HeaderValue::from_static("application/octet-stream")),
    );

    headers.insert(header::CONTENT_LENGTH, header::HeaderValue::from(size));

    let filename = meta.file_path.rsplit('/').next().unwrap_or(&meta.file_path);
    if let Ok(value) = format!("inline; filename=\"{filename}\"").parse() {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }

    Ok(response)
}

pub async fn delete_file(
    State(state): State<Arc<AppState>>,
    Path(file_path): Path<String>,
    AppQuery(params): AppQuery<RevisionParams>,
) -> Result<Json<JSend<DeleteResponse>>, ApiError> {
    let deleted = state
        .files
        .delete(&file_path, params.revision)
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;

    if deleted.is_empty() {
        return Err(ApiError::not_found("No file revisions found to delete"));
    }

    tracing::debug!(file_path = %file_path, count = deleted.len(), "Deleted file");

    Ok(JSend::success(DeleteResponse {
        message: format!("Deleted {} revision(s) of {file_path}", deleted.len()),
        deleted,
    }))
}

// ============================================================================
// Helpers
// ============================================================================

fn upload_error(e: FileServiceError) -> ApiError {
    if e.is_conflict() {
        ApiError::conflict(format!("{e}; retry the upload"))
    } else {
        ApiError::internal(e.to_string())
    }
}

fn file_to_response(meta: &FileMetadata) -> FileResponse {
    FileResponse {
        checksum: meta.checksum.clone(),
        content_type: meta.content_type.clone(),
        created_at: meta.created_at.to_rfc3339(),
        file_path: meta.file_path.clone(),
        id: meta.id.clone(),
        revision: meta.revision,
        size: meta.size,
    }
}
