//! Upload Routes
//!
//! HTTP endpoints for the chunked upload protocol.
//!
//! Endpoints:
//! - POST /upload - Ingest one chunk (multipart form)
//! - GET /upload/progress - Contiguous upload progress for a filename
//! - GET /upload/status - Session status for a filename

use axum::{
    body::Bytes,
    extract::{Multipart, Query, State},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::sanitize::SafeFileName;
use crate::state::AppState;
use crate::upload::{ChunkReceipt, ProgressReport, SessionStatusView, UploadError};

// ============================================================================
// Error Response
// ============================================================================

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    code: String,
}

impl IntoResponse for UploadError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let code = match &self {
            UploadError::FilenameRequired => "FILENAME_REQUIRED",
            UploadError::QueryFilenameRequired => "FILENAME_REQUIRED",
            UploadError::InvalidForm(_) => "INVALID_FORM",
            UploadError::InvalidTotalChunks => "INVALID_TOTAL_CHUNKS",
            UploadError::ChunkIndexOutOfBounds { .. } => "CHUNK_INDEX_OUT_OF_BOUNDS",
            UploadError::TotalChunksMismatch { .. } => "TOTAL_CHUNKS_MISMATCH",
            UploadError::Storage(_) => "STORAGE_ERROR",
            UploadError::ChunkMissing { .. } => "CHUNK_MISSING",
            UploadError::SessionNotFound => "SESSION_NOT_FOUND",
        };

        // storage details stay server-side
        let message = match &self {
            UploadError::Storage(source) => {
                tracing::error!(error = %source, "chunk storage failed");
                "failed to save file part".to_string()
            }
            _ => self.to_string(),
        };

        let body = Json(ErrorResponse {
            error: message,
            code: code.to_string(),
        });

        (status, body).into_response()
    }
}

// ============================================================================
// Router
// ============================================================================

/// Create the upload router
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(upload_chunk))
        .route("/progress", get(progress))
        .route("/status", get(status))
}

// ============================================================================
// Request / Response Types
// ============================================================================

#[derive(Serialize)]
struct ChunkUploadResponse {
    message: &'static str,
    #[serde(flatten)]
    receipt: ChunkReceipt,
}

#[derive(Deserialize)]
struct FilenameQuery {
    #[serde(default)]
    filename: String,
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /upload
///
/// Multipart form fields: `filename`, `chunk_index`, `chunks`, `file`.
/// Chunks may arrive in any order; the response reports how far the session
/// has progressed and whether this request performed the reassembly.
async fn upload_chunk(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<ChunkUploadResponse>, UploadError> {
    let mut filename: Option<String> = None;
    let mut chunk_index: Option<u64> = None;
    let mut chunks: Option<u64> = None;
    let mut data: Option<Bytes> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| UploadError::InvalidForm(e.to_string()))?
    {
        let name = field.name().map(|s| s.to_string());
        match name.as_deref() {
            Some("filename") => {
                filename = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| UploadError::InvalidForm(e.to_string()))?,
                );
            }
            Some("chunk_index") => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| UploadError::InvalidForm(e.to_string()))?;
                chunk_index = Some(text.trim().parse().map_err(|_| {
                    UploadError::InvalidForm(format!("chunk_index must be an integer, got {text:?}"))
                })?);
            }
            Some("chunks") => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| UploadError::InvalidForm(e.to_string()))?;
                chunks = Some(
                    text.trim()
                        .parse()
                        .map_err(|_| UploadError::InvalidTotalChunks)?,
                );
            }
            Some("file") => {
                data = Some(
                    field
                        .bytes()
                        .await
                        .map_err(|e| UploadError::InvalidForm(e.to_string()))?,
                );
            }
            _ => {}
        }
    }

    let file_name = SafeFileName::parse(filename.as_deref().unwrap_or(""))?;
    let chunk_index = chunk_index
        .ok_or_else(|| UploadError::InvalidForm("chunk_index field is required".to_string()))?;
    let chunks = chunks.ok_or(UploadError::InvalidTotalChunks)?;
    let data =
        data.ok_or_else(|| UploadError::InvalidForm("file field is required".to_string()))?;

    tracing::debug!(
        file_name = %file_name,
        chunk_index,
        chunks,
        bytes = data.len(),
        "chunk upload request"
    );

    let receipt = state
        .coordinator()
        .ingest(&file_name, chunk_index, chunks, &data)
        .await?;

    Ok(Json(ChunkUploadResponse {
        message: "Chunk uploaded successfully",
        receipt,
    }))
}

/// GET /upload/progress?filename=...
///
/// Reports how many chunks are uploaded. `uploadedChunks` counts the
/// contiguous prefix from index 0; `receivedChunks` counts every distinct
/// index present. Works with or without a live session.
async fn progress(
    State(state): State<AppState>,
    Query(query): Query<FilenameQuery>,
) -> Result<Json<ProgressReport>, UploadError> {
    let file_name =
        SafeFileName::parse(&query.filename).map_err(|_| UploadError::QueryFilenameRequired)?;

    let report = state.coordinator().progress(&file_name).await;
    Ok(Json(report))
}

/// GET /upload/status?filename=...
///
/// Session status view: receiving/merging for a live session, complete when
/// only the final artifact remains, 404 otherwise.
async fn status(
    State(state): State<AppState>,
    Query(query): Query<FilenameQuery>,
) -> Result<Json<SessionStatusView>, UploadError> {
    let file_name =
        SafeFileName::parse(&query.filename).map_err(|_| UploadError::QueryFilenameRequired)?;

    let view = state.coordinator().status(&file_name).await?;
    Ok(Json(view))
}
