//! Wire types and errors for the chunked upload protocol

use serde::{Deserialize, Serialize};

use crate::db::sessions::{SessionRecord, SessionStatus};
use crate::validate::ArchiveEntry;

// ============================================================================
// Request / Response Types
// ============================================================================

/// Request to open an upload session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitRequest {
    /// Original filename; must carry the supported archive extension
    pub filename: String,

    /// Byte length of the final blob
    pub total_size: u64,

    /// Number of fixed-size chunks, ceil(total_size / chunk_size)
    pub total_chunks: u64,
}

/// Response to a session init
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitResponse {
    /// Opaque session id; the client keeps it to resume
    pub session_id: String,

    /// Chunk indices already received for this session
    pub uploaded_chunks: Vec<u64>,
}

/// Upload progress counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub completed: u64,
    pub total: u64,
}

/// Response after accepting (or deduplicating) a chunk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkUploadResponse {
    pub chunk_index: u64,

    /// True when this chunk had already been received; the blob was untouched
    pub duplicate: bool,

    pub progress: Progress,
}

/// Session status report
#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub session: SessionRecord,
    pub progress: Progress,
}

/// Listing of a completed archive
#[derive(Debug, Clone, Serialize)]
pub struct ContentsResponse {
    pub entries: Vec<ArchiveEntry>,
}

// ============================================================================
// Error Types
// ============================================================================

/// Upload protocol errors
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("session {id} is {status}; no longer accepting chunks")]
    NotAccepting { id: String, status: SessionStatus },

    #[error("chunk index {index} out of bounds (session has {total} chunks)")]
    ChunkIndexOutOfBounds { index: u64, total: u64 },

    #[error("chunk {index} length mismatch: expected {expected} bytes, got {actual}")]
    ChunkLengthMismatch {
        index: u64,
        expected: u64,
        actual: u64,
    },

    #[error("chunk hash mismatch: expected {expected}, got {actual}")]
    ChunkHashMismatch { expected: String, actual: String },

    #[error("session {id} is {status}; contents are available once completed")]
    NotCompleted { id: String, status: SessionStatus },

    #[error("assembled blob failed validation: {0}")]
    IntegrityFailed(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("storage I/O error: {0}")]
    BlobIo(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl UploadError {
    /// HTTP status code for this error
    pub fn status_code(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Self::SessionNotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotAccepting { .. } => StatusCode::CONFLICT,
            Self::ChunkIndexOutOfBounds { .. } => StatusCode::BAD_REQUEST,
            Self::ChunkLengthMismatch { .. } => StatusCode::BAD_REQUEST,
            Self::ChunkHashMismatch { .. } => StatusCode::BAD_REQUEST,
            Self::NotCompleted { .. } => StatusCode::BAD_REQUEST,
            Self::IntegrityFailed(_) => StatusCode::BAD_REQUEST,
            Self::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::BlobIo(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the client is expected to retry the same request
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Database(_) | Self::BlobIo(_) | Self::Internal(_))
    }
}

impl From<crate::error::AppError> for UploadError {
    fn from(err: crate::error::AppError) -> Self {
        use crate::error::AppError;
        match err {
            AppError::NotFound(msg) => UploadError::SessionNotFound(msg),
            AppError::BadRequest(msg) => UploadError::BadRequest(msg),
            AppError::Internal(msg) => UploadError::Internal(msg),
            AppError::Database(e) => UploadError::Database(e),
            AppError::Io(e) => UploadError::BlobIo(e),
        }
    }
}
