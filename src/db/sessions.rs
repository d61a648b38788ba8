//! Upload session and chunk ledger operations
//!
//! All session state transitions go through this repository. Transitions are
//! status-guarded conditional updates: the number of affected rows tells the
//! caller whether it won the transition, which is what makes duplicate and
//! racing callers safe. Terminal states (completed, failed) carry no
//! outbound transitions.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use crate::error::Result;

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Accepting chunks
    Uploading,
    /// Finalization pipeline owns the session; no new chunks
    Processing,
    /// Terminal: blob verified, final_hash recorded
    Completed,
    /// Terminal: validation failed or the session was reaped
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Uploading => "uploading",
            SessionStatus::Processing => "processing",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Failed)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Chunk state: pending until its bytes are durably at their offset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum ChunkStatus {
    Pending,
    Success,
}

/// Session record
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct SessionRecord {
    pub id: String,
    pub filename: String,
    pub total_size: i64,
    pub total_chunks: i64,
    pub status: SessionStatus,
    #[serde(skip_serializing)]
    pub blob_path: String,
    pub final_hash: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub completed_at: Option<String>,
}

/// Current timestamp as a fixed-width RFC 3339 UTC string
///
/// Millisecond precision with a `Z` suffix keeps every stored timestamp the
/// same length, so lexicographic comparison in SQL equals chronological
/// order.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Session repository
pub struct SessionRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> SessionRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Create a session and its full chunk ledger in one transaction
    ///
    /// Either the session row and all `total_chunks` pending chunk rows land,
    /// or none of them do.
    pub async fn create(
        &self,
        id: &str,
        filename: &str,
        total_size: i64,
        total_chunks: i64,
        blob_path: &str,
    ) -> Result<SessionRecord> {
        let now = now_rfc3339();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO upload_sessions
                (id, filename, total_size, total_chunks, status, blob_path, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(id)
        .bind(filename)
        .bind(total_size)
        .bind(total_chunks)
        .bind(SessionStatus::Uploading)
        .bind(blob_path)
        .bind(&now)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        for index in 0..total_chunks {
            sqlx::query(
                "INSERT INTO upload_chunks (session_id, chunk_index, status) VALUES (?, ?, ?)",
            )
            .bind(id)
            .bind(index)
            .bind(ChunkStatus::Pending)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        self.get(id).await?.ok_or_else(|| {
            crate::error::AppError::Internal("failed to fetch created session".to_string())
        })
    }

    /// Snapshot read of a session
    pub async fn get(&self, id: &str) -> Result<Option<SessionRecord>> {
        let session = sqlx::query_as::<_, SessionRecord>(
            r#"
            SELECT id, filename, total_size, total_chunks, status, blob_path,
                   final_hash, created_at, updated_at, completed_at
            FROM upload_sessions
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(self.pool)
        .await?;

        Ok(session)
    }

    /// Claim exclusive ownership of a session for finalization
    ///
    /// The atomic uploading → processing flip is the mutual-exclusion
    /// primitive: of any number of concurrent callers exactly one sees an
    /// affected row, and a terminal session can never be re-claimed.
    pub async fn try_begin_processing(&self, id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE upload_sessions SET status = ?, updated_at = ? WHERE id = ? AND status = ?",
        )
        .bind(SessionStatus::Processing)
        .bind(now_rfc3339())
        .bind(id)
        .bind(SessionStatus::Uploading)
        .execute(self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Mark a chunk received; returns false if it was already SUCCESS
    ///
    /// A chunk transitions pending → success at most once, so retries and
    /// concurrent duplicate submissions collapse into a single transition.
    pub async fn mark_chunk_success(&self, session_id: &str, chunk_index: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE upload_chunks SET status = ?, received_at = ?
            WHERE session_id = ? AND chunk_index = ? AND status = ?
            "#,
        )
        .bind(ChunkStatus::Success)
        .bind(now_rfc3339())
        .bind(session_id)
        .bind(chunk_index)
        .bind(ChunkStatus::Pending)
        .execute(self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Status of a single chunk row
    pub async fn chunk_status(
        &self,
        session_id: &str,
        chunk_index: i64,
    ) -> Result<Option<ChunkStatus>> {
        let status = sqlx::query_scalar::<_, ChunkStatus>(
            "SELECT status FROM upload_chunks WHERE session_id = ? AND chunk_index = ?",
        )
        .bind(session_id)
        .bind(chunk_index)
        .fetch_optional(self.pool)
        .await?;

        Ok(status)
    }

    /// (total, successful) chunk counts for a session
    pub async fn chunk_counts(&self, session_id: &str) -> Result<(i64, i64)> {
        let counts: (i64, i64) = sqlx::query_as(
            r#"
            SELECT COUNT(*),
                   COALESCE(SUM(CASE WHEN status = 'success' THEN 1 ELSE 0 END), 0)
            FROM upload_chunks
            WHERE session_id = ?
            "#,
        )
        .bind(session_id)
        .fetch_one(self.pool)
        .await?;

        Ok(counts)
    }

    /// Indices already received, ascending (the resume manifest)
    pub async fn uploaded_indices(&self, session_id: &str) -> Result<Vec<i64>> {
        let indices = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT chunk_index FROM upload_chunks
            WHERE session_id = ? AND status = 'success'
            ORDER BY chunk_index ASC
            "#,
        )
        .bind(session_id)
        .fetch_all(self.pool)
        .await?;

        Ok(indices)
    }

    /// All sessions currently in the given status
    pub async fn list_by_status(&self, status: SessionStatus) -> Result<Vec<SessionRecord>> {
        let sessions = sqlx::query_as::<_, SessionRecord>(
            r#"
            SELECT id, filename, total_size, total_chunks, status, blob_path,
                   final_hash, created_at, updated_at, completed_at
            FROM upload_sessions
            WHERE status = ?
            ORDER BY created_at ASC
            "#,
        )
        .bind(status)
        .fetch_all(self.pool)
        .await?;

        Ok(sessions)
    }

    /// Sessions in `status` created strictly before `cutoff`
    pub async fn list_older_than(
        &self,
        status: SessionStatus,
        cutoff: &str,
    ) -> Result<Vec<SessionRecord>> {
        let sessions = sqlx::query_as::<_, SessionRecord>(
            r#"
            SELECT id, filename, total_size, total_chunks, status, blob_path,
                   final_hash, created_at, updated_at, completed_at
            FROM upload_sessions
            WHERE status = ? AND created_at < ?
            ORDER BY created_at ASC
            "#,
        )
        .bind(status)
        .bind(cutoff)
        .fetch_all(self.pool)
        .await?;

        Ok(sessions)
    }

    /// Sessions in `status` last touched strictly before `cutoff`
    pub async fn list_updated_before(
        &self,
        status: SessionStatus,
        cutoff: &str,
    ) -> Result<Vec<SessionRecord>> {
        let sessions = sqlx::query_as::<_, SessionRecord>(
            r#"
            SELECT id, filename, total_size, total_chunks, status, blob_path,
                   final_hash, created_at, updated_at, completed_at
            FROM upload_sessions
            WHERE status = ? AND updated_at < ?
            ORDER BY updated_at ASC
            "#,
        )
        .bind(status)
        .bind(cutoff)
        .fetch_all(self.pool)
        .await?;

        Ok(sessions)
    }

    /// Drive a PROCESSING session to COMPLETED, recording the blob digest
    pub async fn complete(&self, id: &str, final_hash: &str) -> Result<bool> {
        let now = now_rfc3339();
        let result = sqlx::query(
            r#"
            UPDATE upload_sessions
            SET status = ?, final_hash = ?, updated_at = ?, completed_at = ?
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(SessionStatus::Completed)
        .bind(final_hash)
        .bind(&now)
        .bind(&now)
        .bind(id)
        .bind(SessionStatus::Processing)
        .execute(self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Drive a non-terminal session to FAILED
    pub async fn fail(&self, id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE upload_sessions SET status = ?, updated_at = ?
            WHERE id = ? AND status IN ('uploading', 'processing')
            "#,
        )
        .bind(SessionStatus::Failed)
        .bind(now_rfc3339())
        .bind(id)
        .execute(self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Hand a PROCESSING session back to the client for resume
    pub async fn reset_to_uploading(&self, id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE upload_sessions SET status = ?, updated_at = ? WHERE id = ? AND status = ?",
        )
        .bind(SessionStatus::Uploading)
        .bind(now_rfc3339())
        .bind(id)
        .bind(SessionStatus::Processing)
        .execute(self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Delete a session row; chunk rows cascade
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM upload_sessions WHERE id = ?")
            .bind(id)
            .execute(self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Total chunk rows across all sessions (cascade check helper)
    pub async fn total_chunk_rows(&self) -> Result<i64> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM upload_chunks")
            .fetch_one(self.pool)
            .await?;

        Ok(count.0)
    }
}

// ============================================================================
// Tests
// ============================================================================
