//! Chunk ingestion
//!
//! Accepts one chunk per call: checks the session state, streams the payload
//! to `index × chunk_size` inside the pre-sized blob, and records the SUCCESS
//! row. The row update is the commit point of ingestion; everything before it
//! can be retried byte-identically, so client retries after an ambiguous
//! response are safe.
//!
//! Out-of-order and concurrent delivery need no coordination here: writers
//! address disjoint byte ranges, and the ledger update is a single
//! conditional row flip.

use bytes::Bytes;
use futures::{Stream, StreamExt};
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use tokio::io::AsyncWriteExt;

use crate::blob::BlobStore;
use crate::db::sessions::{ChunkStatus, SessionRecord, SessionRepository, SessionStatus};

use super::finalize::Finalizer;
use super::types::{ChunkUploadResponse, Progress, UploadError};

/// Accepts and records individual chunks
#[derive(Clone)]
pub struct ChunkIngestor {
    db: SqlitePool,
    blobs: BlobStore,
    chunk_size: u64,
    finalizer: Finalizer,
}

impl ChunkIngestor {
    pub fn new(db: SqlitePool, blobs: BlobStore, chunk_size: u64, finalizer: Finalizer) -> Self {
        Self {
            db,
            blobs,
            chunk_size,
            finalizer,
        }
    }

    /// Accept a single chunk
    ///
    /// `declared_hash` is the optional client-supplied SHA-256 of the payload.
    /// When present, the payload is staged in the temp directory and promoted
    /// into the blob only after the digest matches; without it the payload
    /// streams straight to its offset. Neither path buffers the chunk in
    /// memory.
    pub async fn accept_chunk<S>(
        &self,
        session_id: &str,
        chunk_index: u64,
        declared_hash: Option<&str>,
        payload: S,
    ) -> Result<ChunkUploadResponse, UploadError>
    where
        S: Stream<Item = std::io::Result<Bytes>> + Unpin + Send,
    {
        let repo = SessionRepository::new(&self.db);
        let session = repo
            .get(session_id)
            .await?
            .ok_or_else(|| UploadError::SessionNotFound(session_id.to_string()))?;

        if session.status != SessionStatus::Uploading {
            return Err(UploadError::NotAccepting {
                id: session.id,
                status: session.status,
            });
        }

        let total_chunks = session.total_chunks as u64;
        if chunk_index >= total_chunks {
            return Err(UploadError::ChunkIndexOutOfBounds {
                index: chunk_index,
                total: total_chunks,
            });
        }

        // Retries of an already-committed chunk never touch the blob again.
        if repo.chunk_status(session_id, chunk_index as i64).await?
            == Some(ChunkStatus::Success)
        {
            return self.response(&repo, session_id, chunk_index, true).await;
        }

        let expected_len = self.expected_chunk_len(&session, chunk_index);
        let offset = chunk_index * self.chunk_size;

        if let Some(expected_hash) = declared_hash {
            self.write_staged(&session, chunk_index, offset, expected_len, expected_hash, payload)
                .await?;
        } else {
            self.write_direct(&session, chunk_index, offset, expected_len, payload)
                .await?;
        }

        // Commit point: the only transition other components can observe.
        let newly_marked = repo
            .mark_chunk_success(session_id, chunk_index as i64)
            .await?;

        let response = self
            .response(&repo, session_id, chunk_index, !newly_marked)
            .await?;

        tracing::debug!(
            session_id = %session_id,
            chunk_index = chunk_index,
            duplicate = response.duplicate,
            completed = response.progress.completed,
            total = response.progress.total,
            "Chunk ingested"
        );

        if response.progress.completed == response.progress.total {
            // Advisory trigger: losing the race or dying here is fine, the
            // recovery sweep also drives fully-received sessions forward.
            let finalizer = self.finalizer.clone();
            let id = session_id.to_string();
            tokio::spawn(async move {
                if let Err(e) = finalizer.finalize(&id).await {
                    tracing::warn!(session_id = %id, error = %e, "Deferred finalization failed");
                }
            });
        }

        Ok(response)
    }

    /// Byte length this chunk must have (invariant: every chunk but the last
    /// is exactly chunk_size; the last carries the remainder)
    fn expected_chunk_len(&self, session: &SessionRecord, chunk_index: u64) -> u64 {
        let total_size = session.total_size as u64;
        let total_chunks = session.total_chunks as u64;
        if chunk_index + 1 == total_chunks {
            total_size - (total_chunks - 1) * self.chunk_size
        } else {
            self.chunk_size
        }
    }

    async fn response(
        &self,
        repo: &SessionRepository<'_>,
        session_id: &str,
        chunk_index: u64,
        duplicate: bool,
    ) -> Result<ChunkUploadResponse, UploadError> {
        let (total, successful) = repo.chunk_counts(session_id).await?;
        Ok(ChunkUploadResponse {
            chunk_index,
            duplicate,
            progress: Progress {
                completed: successful as u64,
                total: total as u64,
            },
        })
    }

    /// Stream the payload straight to its offset in the blob
    async fn write_direct<S>(
        &self,
        session: &SessionRecord,
        chunk_index: u64,
        offset: u64,
        expected_len: u64,
        payload: S,
    ) -> Result<(), UploadError>
    where
        S: Stream<Item = std::io::Result<Bytes>> + Unpin + Send,
    {
        let blob_path = std::path::Path::new(&session.blob_path);
        let mut file = self.blobs.writer_at(blob_path, offset).await?;
        let (written, _digest) = drain_to_file(&mut file, payload, expected_len, chunk_index).await?;
        file.flush().await?;

        if written != expected_len {
            return Err(UploadError::ChunkLengthMismatch {
                index: chunk_index,
                expected: expected_len,
                actual: written,
            });
        }

        Ok(())
    }

    /// Stage the payload, verify the declared hash, then promote it
    ///
    /// A mismatched chunk never reaches the blob: the staged copy is dropped
    /// and the chunk row stays PENDING for the client to retry.
    async fn write_staged<S>(
        &self,
        session: &SessionRecord,
        chunk_index: u64,
        offset: u64,
        expected_len: u64,
        expected_hash: &str,
        payload: S,
    ) -> Result<(), UploadError>
    where
        S: Stream<Item = std::io::Result<Bytes>> + Unpin + Send,
    {
        let stage_path = self.blobs.stage_path(&session.id, chunk_index);

        let staged = async {
            let mut stage = tokio::fs::File::create(&stage_path).await?;
            let (written, digest) =
                drain_to_file(&mut stage, payload, expected_len, chunk_index).await?;
            stage.flush().await?;

            if written != expected_len {
                return Err(UploadError::ChunkLengthMismatch {
                    index: chunk_index,
                    expected: expected_len,
                    actual: written,
                });
            }

            if !digest.eq_ignore_ascii_case(expected_hash) {
                return Err(UploadError::ChunkHashMismatch {
                    expected: expected_hash.to_string(),
                    actual: digest,
                });
            }

            let blob_path = std::path::Path::new(&session.blob_path);
            let mut reader = tokio::fs::File::open(&stage_path).await?;
            let mut writer = self.blobs.writer_at(blob_path, offset).await?;
            tokio::io::copy(&mut reader, &mut writer).await?;
            writer.flush().await?;

            Ok(())
        }
        .await;

        let _ = tokio::fs::remove_file(&stage_path).await;
        staged
    }
}

/// Drain a payload stream into an open file, hashing in flight
///
/// Refuses to write past `expected_len`: an oversized payload is rejected
/// before any byte beyond the chunk's range reaches the file.
async fn drain_to_file<S>(
    file: &mut tokio::fs::File,
    mut payload: S,
    expected_len: u64,
    chunk_index: u64,
) -> Result<(u64, String), UploadError>
where
    S: Stream<Item = std::io::Result<Bytes>> + Unpin + Send,
{
    let mut hasher = Sha256::new();
    let mut written: u64 = 0;

    while let Some(piece) = payload.next().await {
        let piece = piece?;
        let incoming = written + piece.len() as u64;
        if incoming > expected_len {
            return Err(UploadError::ChunkLengthMismatch {
                index: chunk_index,
                expected: expected_len,
                actual: incoming,
            });
        }
        hasher.update(&piece);
        file.write_all(&piece).await?;
        written = incoming;
    }

    Ok((written, hex::encode(hasher.finalize())))
}

// ============================================================================
// Tests
// ============================================================================
