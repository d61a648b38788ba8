//! Finalization pipeline
//!
//! Drives a fully-received session to its terminal state: claim exclusive
//! ownership, verify the assembled blob (size, SHA-256, archive structure),
//! then record COMPLETED or FAILED.
//!
//! The uploading → processing flip is the only mutual exclusion in the
//! system. It is an atomic conditional update, so any number of triggers may
//! race on the same session and exactly one proceeds; the rest observe a
//! no-op. The expensive verification runs outside any database transaction:
//! PROCESSING is the durable marker that keeps other finalizers out while no
//! lock is held, and the recovery sweep can always resume a session that
//! crashed mid-pipeline.

use std::path::Path;

use sqlx::SqlitePool;

use crate::blob::BlobStore;
use crate::db::sessions::{SessionRecord, SessionRepository, SessionStatus};
use crate::validate;

use super::types::UploadError;

/// Exclusive post-assembly pipeline
#[derive(Clone)]
pub struct Finalizer {
    db: SqlitePool,
    blobs: BlobStore,
}

impl Finalizer {
    pub fn new(db: SqlitePool, blobs: BlobStore) -> Self {
        Self { db, blobs }
    }

    /// Finalize a session if it is ready
    ///
    /// Safe to call from any number of triggers, any number of times. Losing
    /// the claim, or finding the session not yet complete, is a quiet no-op.
    pub async fn finalize(&self, session_id: &str) -> Result<(), UploadError> {
        let repo = SessionRepository::new(&self.db);
        let session = repo
            .get(session_id)
            .await?
            .ok_or_else(|| UploadError::SessionNotFound(session_id.to_string()))?;

        if session.status != SessionStatus::Uploading {
            tracing::debug!(
                session_id = %session_id,
                status = %session.status,
                "Finalize skipped: session not in uploading state"
            );
            return Ok(());
        }

        let (total, successful) = repo.chunk_counts(session_id).await?;
        if successful < total {
            tracing::debug!(
                session_id = %session_id,
                completed = successful,
                total = total,
                "Finalize skipped: chunks still outstanding"
            );
            return Ok(());
        }

        if !repo.try_begin_processing(session_id).await? {
            tracing::debug!(session_id = %session_id, "Finalize skipped: another finalizer won");
            return Ok(());
        }

        self.run_pipeline(&session).await
    }

    /// Run the verification pipeline for a session already in PROCESSING
    ///
    /// Pure function of the blob contents, so re-running after a crash is
    /// safe: rehashing and revalidating an already-complete file reach the
    /// same terminal state.
    pub async fn run_pipeline(&self, session: &SessionRecord) -> Result<(), UploadError> {
        let repo = SessionRepository::new(&self.db);

        match self.verify(session).await {
            Ok(final_hash) => {
                if repo.complete(&session.id, &final_hash).await? {
                    tracing::info!(
                        session_id = %session.id,
                        filename = %session.filename,
                        final_hash = %final_hash,
                        "Upload completed"
                    );
                } else {
                    tracing::warn!(
                        session_id = %session.id,
                        "Completion refused: session left processing state concurrently"
                    );
                }
                Ok(())
            }
            Err(reason) => {
                tracing::warn!(
                    session_id = %session.id,
                    filename = %session.filename,
                    error = %reason,
                    "Upload failed validation"
                );

                // Failed sessions keep no blob on disk.
                let _ = self.blobs.delete(Path::new(&session.blob_path)).await;
                repo.fail(&session.id).await?;
                Ok(())
            }
        }
    }

    /// Size, digest, and structural checks over the assembled blob
    ///
    /// Any error is a verification failure and drives the session to FAILED;
    /// nothing in here touches the database.
    async fn verify(&self, session: &SessionRecord) -> Result<String, UploadError> {
        let path = Path::new(&session.blob_path);

        let actual_size = self.blobs.size(path).await?;
        if actual_size != session.total_size as u64 {
            return Err(UploadError::IntegrityFailed(format!(
                "assembled size {} does not match declared size {}",
                actual_size, session.total_size
            )));
        }

        let final_hash = validate::hash_blob(path).await?;

        if !validate::is_valid_archive(path).await {
            return Err(UploadError::IntegrityFailed(
                "archive central directory does not parse".to_string(),
            ));
        }

        Ok(final_hash)
    }
}

// ============================================================================
// Tests
// ============================================================================
