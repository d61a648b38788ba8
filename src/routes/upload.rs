//! Upload routes
//!
//! HTTP surface of the chunked upload protocol:
//! - POST /upload/init - open a session, get the resume manifest
//! - POST /upload/chunk - submit one chunk (multipart)
//! - GET /upload/:session_id/status - session state and progress
//! - GET /upload/:session_id/contents - archive listing once completed
//! - DELETE /upload/:session_id - cancel a session
//!
//! The chunk endpoint takes multipart fields `session_id`, `chunk_index`, an
//! optional `chunk_hash` (SHA-256 hex of the chunk), and the binary `chunk`
//! itself. The `chunk` field must come last: the payload is streamed to disk
//! as it arrives, so the routing fields have to be known before the first
//! byte of it.

use axum::{
    extract::{multipart::Field, Multipart, Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use bytes::Bytes;
use futures::stream;
use serde::Serialize;

use crate::db::sessions::SessionStatus;
use crate::state::AppState;
use crate::upload::{
    ChunkUploadResponse, ContentsResponse, InitRequest, InitResponse, StatusResponse, UploadError,
};
use crate::validate;

// ============================================================================
// Error Response
// ============================================================================

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl IntoResponse for UploadError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();

        // Infrastructure failures are logged in full but surfaced opaquely;
        // the client's move is to retry the idempotent request.
        let (message, details) = if self.is_retryable() {
            tracing::error!(error = %self, "Upload request failed");
            (
                "internal error; retry the request".to_string(),
                if cfg!(debug_assertions) {
                    Some(self.to_string())
                } else {
                    None
                },
            )
        } else {
            (self.to_string(), None)
        };

        let body = Json(ErrorResponse {
            error: message,
            details,
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
        .route("/init", post(init))
        .route("/chunk", post(upload_chunk))
        .route("/:session_id/status", get(session_status))
        .route("/:session_id/contents", get(session_contents))
        .route("/:session_id", delete(cancel_session))
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /upload/init
async fn init(
    State(state): State<AppState>,
    Json(request): Json<InitRequest>,
) -> Result<Json<InitResponse>, UploadError> {
    let response = state
        .sessions()
        .initialize(&request.filename, request.total_size, request.total_chunks)
        .await?;

    Ok(Json(response))
}

/// POST /upload/chunk
async fn upload_chunk(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<ChunkUploadResponse>, UploadError> {
    let mut session_id: Option<String> = None;
    let mut chunk_index: Option<u64> = None;
    let mut chunk_hash: Option<String> = None;

    while let Some(field) = next_field(&mut multipart).await? {
        let name = field.name().unwrap_or("").to_string();

        match name.as_str() {
            "session_id" => session_id = Some(text_field(field, &name).await?),
            "chunk_index" => {
                let raw = text_field(field, &name).await?;
                let index = raw.parse::<u64>().map_err(|_| {
                    UploadError::BadRequest(format!("chunk_index is not an integer: {}", raw))
                })?;
                chunk_index = Some(index);
            }
            "chunk_hash" => chunk_hash = Some(text_field(field, &name).await?),
            "chunk" => {
                let session_id = session_id.as_deref().ok_or_else(|| {
                    UploadError::BadRequest(
                        "session_id must precede the chunk field".to_string(),
                    )
                })?;
                let chunk_index = chunk_index.ok_or_else(|| {
                    UploadError::BadRequest(
                        "chunk_index must precede the chunk field".to_string(),
                    )
                })?;

                let payload = Box::pin(field_stream(field));
                let response = state
                    .ingestor()
                    .accept_chunk(session_id, chunk_index, chunk_hash.as_deref(), payload)
                    .await?;

                return Ok(Json(response));
            }
            other => {
                tracing::debug!(field = %other, "Ignoring unknown multipart field");
            }
        }
    }

    Err(UploadError::BadRequest(
        "multipart body is missing the chunk field".to_string(),
    ))
}

/// GET /upload/:session_id/status
async fn session_status(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<StatusResponse>, UploadError> {
    let status = state.sessions().status(&session_id).await?;
    Ok(Json(status))
}

/// GET /upload/:session_id/contents
async fn session_contents(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<ContentsResponse>, UploadError> {
    let status = state.sessions().status(&session_id).await?;

    if status.session.status != SessionStatus::Completed {
        return Err(UploadError::NotCompleted {
            id: status.session.id,
            status: status.session.status,
        });
    }

    let entries =
        validate::list_entries(std::path::Path::new(&status.session.blob_path)).await?;

    Ok(Json(ContentsResponse { entries }))
}

/// DELETE /upload/:session_id
async fn cancel_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<StatusCode, UploadError> {
    state.sessions().cancel(&session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// Multipart Helpers
// ============================================================================

async fn next_field(
    multipart: &mut Multipart,
) -> Result<Option<Field<'_>>, UploadError> {
    multipart
        .next_field()
        .await
        .map_err(|e| UploadError::BadRequest(format!("failed to read multipart body: {}", e)))
}

async fn text_field(field: Field<'_>, name: &str) -> Result<String, UploadError> {
    field
        .text()
        .await
        .map_err(|e| UploadError::BadRequest(format!("failed to read field {}: {}", name, e)))
}

/// Adapt a multipart field into the byte stream the ingestor consumes
fn field_stream(
    field: Field<'_>,
) -> impl futures::Stream<Item = std::io::Result<Bytes>> + Send + '_ {
    stream::unfold(field, |mut field| async move {
        match field.chunk().await {
            Ok(Some(bytes)) => Some((Ok(bytes), field)),
            Ok(None) => None,
            Err(e) => Some((
                Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, e)),
                field,
            )),
        }
    })
}
