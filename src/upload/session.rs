//! Upload session manager
//!
//! Opens upload sessions: validates the declared geometry, preallocates the
//! blob at its final size, and materializes the session row plus the full
//! chunk ledger in one transaction. Also serves status reports and client
//! cancellation.

use sqlx::SqlitePool;
use uuid::Uuid;

use crate::blob::BlobStore;
use crate::db::sessions::{SessionRepository, SessionStatus};

use super::types::{InitResponse, Progress, StatusResponse, UploadError};

/// Supported archive extension
const ARCHIVE_EXT: &str = ".zip";

/// Manages upload session lifecycle
#[derive(Clone)]
pub struct SessionManager {
    db: SqlitePool,
    blobs: BlobStore,
    chunk_size: u64,
}

impl SessionManager {
    pub fn new(db: SqlitePool, blobs: BlobStore, chunk_size: u64) -> Self {
        Self {
            db,
            blobs,
            chunk_size,
        }
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    // ========================================================================
    // Session Lifecycle
    // ========================================================================

    /// Open a new upload session
    ///
    /// Preallocates the blob before the metadata lands: once the session row
    /// exists, every chunk writer can seek straight to its offset.
    pub async fn initialize(
        &self,
        filename: &str,
        total_size: u64,
        total_chunks: u64,
    ) -> Result<InitResponse, UploadError> {
        self.validate_request(filename, total_size, total_chunks)?;

        let id = Uuid::new_v4().to_string();
        let blob_path = self.blobs.blob_path(&id);

        self.blobs.preallocate(&blob_path, total_size).await?;

        let repo = SessionRepository::new(&self.db);
        let created = repo
            .create(
                &id,
                filename,
                total_size as i64,
                total_chunks as i64,
                &blob_path.to_string_lossy(),
            )
            .await;

        let session = match created {
            Ok(session) => session,
            Err(e) => {
                // The metadata never landed; don't leave the blob behind.
                let _ = self.blobs.delete(&blob_path).await;
                return Err(e.into());
            }
        };

        tracing::info!(
            session_id = %session.id,
            filename = %filename,
            total_size = total_size,
            total_chunks = total_chunks,
            "Created upload session"
        );

        let uploaded = repo.uploaded_indices(&session.id).await?;
        Ok(InitResponse {
            session_id: session.id,
            uploaded_chunks: uploaded.into_iter().map(|i| i as u64).collect(),
        })
    }

    /// Status report for a session
    pub async fn status(&self, session_id: &str) -> Result<StatusResponse, UploadError> {
        let repo = SessionRepository::new(&self.db);
        let session = repo
            .get(session_id)
            .await?
            .ok_or_else(|| UploadError::SessionNotFound(session_id.to_string()))?;

        let (total, successful) = repo.chunk_counts(session_id).await?;

        Ok(StatusResponse {
            session,
            progress: Progress {
                completed: successful as u64,
                total: total as u64,
            },
        })
    }

    /// Cancel a session: remove the blob and the metadata rows
    ///
    /// Refused while the finalization pipeline owns the session.
    pub async fn cancel(&self, session_id: &str) -> Result<(), UploadError> {
        let repo = SessionRepository::new(&self.db);
        let session = repo
            .get(session_id)
            .await?
            .ok_or_else(|| UploadError::SessionNotFound(session_id.to_string()))?;

        if session.status == SessionStatus::Processing {
            return Err(UploadError::NotAccepting {
                id: session.id,
                status: session.status,
            });
        }

        self.blobs
            .delete(std::path::Path::new(&session.blob_path))
            .await?;
        repo.delete(session_id).await?;

        tracing::info!(
            session_id = %session_id,
            filename = %session.filename,
            "Upload session cancelled"
        );

        Ok(())
    }

    // ========================================================================
    // Validation
    // ========================================================================

    fn validate_request(
        &self,
        filename: &str,
        total_size: u64,
        total_chunks: u64,
    ) -> Result<(), UploadError> {
        if !filename.to_ascii_lowercase().ends_with(ARCHIVE_EXT) {
            return Err(UploadError::BadRequest(format!(
                "unsupported file type: expected a {} archive",
                ARCHIVE_EXT
            )));
        }

        if total_size == 0 {
            return Err(UploadError::BadRequest(
                "total_size must be greater than zero".to_string(),
            ));
        }

        if total_chunks == 0 {
            return Err(UploadError::BadRequest(
                "total_chunks must be greater than zero".to_string(),
            ));
        }

        if total_size > i64::MAX as u64 {
            return Err(UploadError::BadRequest("total_size too large".to_string()));
        }

        let expected_chunks = total_size.div_ceil(self.chunk_size);
        if total_chunks != expected_chunks {
            return Err(UploadError::BadRequest(format!(
                "total_chunks {} does not match total_size {} at chunk size {} (expected {})",
                total_chunks, total_size, self.chunk_size, expected_chunks
            )));
        }

        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn test_manager(dir: &TempDir, chunk_size: u64) -> SessionManager {
        let url = format!("sqlite:{}/test.db", dir.path().display());
        let pool = crate::db::create_pool(&url).await.unwrap();
        let blobs = BlobStore::new(dir.path().join("uploads"), dir.path().join("tmp"));
        blobs.ensure_dirs().await.unwrap();
        SessionManager::new(pool, blobs, chunk_size)
    }

    #[tokio::test]
    async fn test_initialize_preallocates_blob() {
        let dir = TempDir::new().unwrap();
        let manager = test_manager(&dir, 1024).await;

        let resp = manager.initialize("backup.zip", 2500, 3).await.unwrap();
        assert!(resp.uploaded_chunks.is_empty());

        let status = manager.status(&resp.session_id).await.unwrap();
        assert_eq!(status.session.status, SessionStatus::Uploading);
        assert_eq!(status.progress, Progress { completed: 0, total: 3 });

        let blob_path = std::path::PathBuf::from(&status.session.blob_path);
        assert_eq!(
            tokio::fs::metadata(&blob_path).await.unwrap().len(),
            2500
        );
    }

    #[tokio::test]
    async fn test_initialize_single_byte_file() {
        let dir = TempDir::new().unwrap();
        let manager = test_manager(&dir, 1024).await;

        let resp = manager.initialize("tiny.zip", 1, 1).await.unwrap();
        let status = manager.status(&resp.session_id).await.unwrap();
        assert_eq!(status.session.total_size, 1);
        assert_eq!(status.session.total_chunks, 1);
    }

    #[tokio::test]
    async fn test_initialize_rejects_bad_input() {
        let dir = TempDir::new().unwrap();
        let manager = test_manager(&dir, 1024).await;

        let err = manager.initialize("notes.txt", 2048, 2).await.unwrap_err();
        assert!(matches!(err, UploadError::BadRequest(_)));

        let err = manager.initialize("backup.zip", 0, 1).await.unwrap_err();
        assert!(matches!(err, UploadError::BadRequest(_)));

        // 2500 bytes at 1024-byte chunks is 3 chunks, not 2
        let err = manager.initialize("backup.zip", 2500, 2).await.unwrap_err();
        assert!(matches!(err, UploadError::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_cancel_removes_blob_and_rows() {
        let dir = TempDir::new().unwrap();
        let manager = test_manager(&dir, 1024).await;

        let resp = manager.initialize("backup.zip", 2048, 2).await.unwrap();
        let status = manager.status(&resp.session_id).await.unwrap();
        let blob_path = std::path::PathBuf::from(&status.session.blob_path);

        manager.cancel(&resp.session_id).await.unwrap();

        assert!(!tokio::fs::try_exists(&blob_path).await.unwrap());
        let err = manager.status(&resp.session_id).await.unwrap_err();
        assert!(matches!(err, UploadError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn test_status_unknown_session() {
        let dir = TempDir::new().unwrap();
        let manager = test_manager(&dir, 1024).await;

        let err = manager.status("nope").await.unwrap_err();
        assert!(matches!(err, UploadError::SessionNotFound(_)));
    }
}
