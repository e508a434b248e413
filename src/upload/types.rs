//! Upload types for the chunked ingestion protocol

use chrono::{DateTime, Utc};
use serde::Serialize;

// ============================================================================
// Constants
// ============================================================================

/// Maximum accepted chunk body size: 16MB
pub const DEFAULT_MAX_CHUNK_BYTES: usize = 16 * 1024 * 1024;

/// Idle session expiry time: 24 hours
pub const DEFAULT_SESSION_TTL_HOURS: i64 = 24;

/// Background sweep interval: 5 minutes
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 300;

// ============================================================================
// Receipt / Query Views
// ============================================================================

/// Result of ingesting one chunk.
///
/// Echoes the `(chunk_index, chunks)` pair the client sent and reports how
/// far the session has progressed, including whether this request performed
/// the reassembly.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkReceipt {
    /// Chunk index that was stored
    pub chunk_index: u64,

    /// Total chunk count for the session
    pub chunks: u64,

    /// Distinct chunk indices received so far
    pub received: u64,

    /// Whether every index in `0..chunks` has been received
    pub complete: bool,

    /// Whether this request ran the merge and published the final artifact
    pub merged: bool,
}

/// Upload progress for one filename.
///
/// `uploaded_chunks` counts the contiguous prefix starting at index 0 and
/// stopping at the first gap; a chunk landing at index 5 while index 3 is
/// missing does not move it. `received_chunks` is the true count of distinct
/// indices present.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressReport {
    /// Contiguous prefix count (index 0 up to the first missing index)
    pub uploaded_chunks: u64,

    /// Total distinct chunk indices present
    pub received_chunks: u64,

    /// Session total, when a live session exists for the filename
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_chunks: Option<u64>,
}

/// Session status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Accepting chunks
    Receiving,
    /// A merge is currently running
    Merging,
    /// Final artifact published, chunk artifacts removed
    Complete,
}

/// Queryable view of an upload session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatusView {
    /// Sanitized filename the session is keyed by
    pub file_name: String,

    /// Current status
    pub status: SessionStatus,

    /// Whether every chunk has been received
    pub complete: bool,

    /// Distinct chunk indices received
    #[serde(skip_serializing_if = "Option::is_none")]
    pub received_chunks: Option<u64>,

    /// Total chunk count for the session
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_chunks: Option<u64>,

    /// Most recent merge failure, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    /// Session creation time
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,

    /// Last chunk arrival time
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<DateTime<Utc>>,
}

// ============================================================================
// Error Types
// ============================================================================

/// Upload error taxonomy.
///
/// Validation errors abort the request before any storage side effect.
/// Storage errors during ingestion surface as a generic server error; the
/// underlying cause is logged server-side only.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("filename is required")]
    FilenameRequired,

    #[error("Upload Filename is required")]
    QueryFilenameRequired,

    #[error("invalid upload form: {0}")]
    InvalidForm(String),

    #[error("chunks must be a positive integer")]
    InvalidTotalChunks,

    #[error("chunk index out of bounds: {index} (total: {total})")]
    ChunkIndexOutOfBounds { index: u64, total: u64 },

    #[error("total chunk count mismatch: session expects {expected}, request sent {got}")]
    TotalChunksMismatch { expected: u64, got: u64 },

    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("chunk {index} is missing or unreadable")]
    ChunkMissing {
        index: u64,
        #[source]
        source: std::io::Error,
    },

    #[error("no upload session or artifact for this filename")]
    SessionNotFound,
}

impl UploadError {
    /// Get HTTP status code for this error
    pub fn status_code(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Self::FilenameRequired => StatusCode::BAD_REQUEST,
            Self::QueryFilenameRequired => StatusCode::BAD_REQUEST,
            Self::InvalidForm(_) => StatusCode::BAD_REQUEST,
            Self::InvalidTotalChunks => StatusCode::BAD_REQUEST,
            Self::ChunkIndexOutOfBounds { .. } => StatusCode::BAD_REQUEST,
            Self::TotalChunksMismatch { .. } => StatusCode::CONFLICT,
            Self::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::ChunkMissing { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::SessionNotFound => StatusCode::NOT_FOUND,
        }
    }
}
