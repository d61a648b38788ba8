//! Crash recovery and abandonment sweeps
//!
//! Runs at startup and on a timer. Every sweep is idempotent and safe to run
//! concurrently with live ingestion: re-running reaches the same eventual
//! state, so a crash during recovery just means the next pass finishes the
//! job.
//!
//! Sweeps, in order:
//! 1. Interrupted finalization: PROCESSING sessions left behind by a dead
//!    pipeline are failed (blob gone), handed back to the client (chunks
//!    outstanding), or re-verified to a terminal state.
//! 2. Stragglers: UPLOADING sessions whose chunks are all SUCCESS but whose
//!    finalize trigger never fired; UPLOADING sessions whose blob vanished
//!    are failed.
//! 3. Abandonment: UPLOADING sessions older than the timeout lose their blob
//!    first, then flip to FAILED. The status update is the commit point, so
//!    a crash in between is caught by sweep 2 on the next pass.
//! 4. Purge: FAILED sessions untouched for another full timeout are deleted
//!    outright, chunk rows cascading with them.
//! 5. Orphans: blobs and stale staging files with no matching session row,
//!    old enough to rule out an in-flight init, are removed.

use std::path::Path;
use std::time::{Duration as StdDuration, SystemTime};

use chrono::{Duration, SecondsFormat, Utc};
use sqlx::SqlitePool;

use crate::blob::BlobStore;
use crate::db::sessions::{SessionRepository, SessionStatus};

use super::finalize::Finalizer;
use super::types::UploadError;

/// Counters for one recovery pass
#[derive(Debug, Default, Clone, Copy)]
pub struct RecoveryReport {
    /// PROCESSING sessions re-driven through the verification pipeline
    pub resumed: usize,
    /// PROCESSING sessions handed back to UPLOADING
    pub reset: usize,
    /// UPLOADING sessions with a full ledger that got finalized
    pub stragglers: usize,
    /// Sessions failed because their blob was missing
    pub failed_missing_blob: usize,
    /// Abandoned sessions reaped (blob deleted, FAILED)
    pub reaped: usize,
    /// FAILED sessions purged from the store
    pub purged: usize,
    /// Orphaned blobs and staging files removed
    pub orphans_removed: usize,
}

impl RecoveryReport {
    pub fn total_actions(&self) -> usize {
        self.resumed
            + self.reset
            + self.stragglers
            + self.failed_missing_blob
            + self.reaped
            + self.purged
            + self.orphans_removed
    }
}

/// Startup and periodic recovery sweeps
#[derive(Clone)]
pub struct RecoveryService {
    db: SqlitePool,
    blobs: BlobStore,
    finalizer: Finalizer,
    abandon_after: Duration,
}

impl RecoveryService {
    pub fn new(db: SqlitePool, blobs: BlobStore, finalizer: Finalizer, abandon_after: Duration) -> Self {
        Self {
            db,
            blobs,
            finalizer,
            abandon_after,
        }
    }

    /// Run all sweeps once
    pub async fn run(&self) -> Result<RecoveryReport, UploadError> {
        let mut report = RecoveryReport::default();

        self.sweep_interrupted(&mut report).await?;
        self.sweep_uploading(&mut report).await?;
        self.sweep_abandoned(&mut report).await?;
        self.purge_failed(&mut report).await?;
        self.sweep_orphans(&mut report).await?;

        if report.total_actions() > 0 {
            tracing::info!(
                resumed = report.resumed,
                reset = report.reset,
                stragglers = report.stragglers,
                failed_missing_blob = report.failed_missing_blob,
                reaped = report.reaped,
                purged = report.purged,
                orphans_removed = report.orphans_removed,
                "Recovery sweep finished"
            );
        }

        Ok(report)
    }

    /// Spawn the periodic sweep loop
    pub fn start_task(self, period: StdDuration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // The startup pass already ran; skip the immediate first tick.
            interval.tick().await;

            loop {
                interval.tick().await;
                if let Err(e) = self.run().await {
                    tracing::warn!(error = %e, "Recovery sweep failed");
                }
            }
        })
    }

    // ========================================================================
    // Sweeps
    // ========================================================================

    /// Sessions stranded in PROCESSING by a dead finalizer
    async fn sweep_interrupted(&self, report: &mut RecoveryReport) -> Result<(), UploadError> {
        let repo = SessionRepository::new(&self.db);

        for session in repo.list_by_status(SessionStatus::Processing).await? {
            let blob_path = Path::new(&session.blob_path);

            if !self.blobs.exists(blob_path).await {
                tracing::warn!(
                    session_id = %session.id,
                    "Processing session has no blob; failing"
                );
                repo.fail(&session.id).await?;
                report.failed_missing_blob += 1;
                continue;
            }

            let (total, successful) = repo.chunk_counts(&session.id).await?;
            if successful < total {
                // Should not arise, but the client-resumable path is the safe
                // one for anything we do find.
                tracing::warn!(
                    session_id = %session.id,
                    completed = successful,
                    total = total,
                    "Processing session missing chunks; handing back to client"
                );
                repo.reset_to_uploading(&session.id).await?;
                report.reset += 1;
                continue;
            }

            tracing::info!(session_id = %session.id, "Resuming interrupted finalization");
            self.finalizer.run_pipeline(&session).await?;
            report.resumed += 1;
        }

        Ok(())
    }

    /// UPLOADING sessions that lost their blob or their finalize trigger
    async fn sweep_uploading(&self, report: &mut RecoveryReport) -> Result<(), UploadError> {
        let repo = SessionRepository::new(&self.db);

        for session in repo.list_by_status(SessionStatus::Uploading).await? {
            let blob_path = Path::new(&session.blob_path);

            if !self.blobs.exists(blob_path).await {
                tracing::warn!(
                    session_id = %session.id,
                    "Uploading session has no blob; failing"
                );
                repo.fail(&session.id).await?;
                report.failed_missing_blob += 1;
                continue;
            }

            let (total, successful) = repo.chunk_counts(&session.id).await?;
            if successful == total {
                tracing::info!(
                    session_id = %session.id,
                    "Fully received session never finalized; finalizing now"
                );
                self.finalizer.finalize(&session.id).await?;
                report.stragglers += 1;
            }
        }

        Ok(())
    }

    /// UPLOADING sessions past the abandonment timeout
    async fn sweep_abandoned(&self, report: &mut RecoveryReport) -> Result<(), UploadError> {
        let repo = SessionRepository::new(&self.db);
        let cutoff = self.cutoff(self.abandon_after);

        for session in repo
            .list_older_than(SessionStatus::Uploading, &cutoff)
            .await?
        {
            tracing::info!(
                session_id = %session.id,
                filename = %session.filename,
                created_at = %session.created_at,
                "Reaping abandoned session"
            );

            // Blob first; the status flip below is the commit point.
            self.blobs.delete(Path::new(&session.blob_path)).await?;
            repo.fail(&session.id).await?;
            report.reaped += 1;
        }

        Ok(())
    }

    /// Delete FAILED sessions that have sat untouched for a full timeout
    async fn purge_failed(&self, report: &mut RecoveryReport) -> Result<(), UploadError> {
        let repo = SessionRepository::new(&self.db);
        let cutoff = self.cutoff(self.abandon_after);

        for session in repo
            .list_updated_before(SessionStatus::Failed, &cutoff)
            .await?
        {
            repo.delete(&session.id).await?;
            report.purged += 1;
        }

        Ok(())
    }

    /// Remove blobs and staging files that no session row accounts for
    ///
    /// A freshly preallocated blob exists before its session row commits, so
    /// only files older than the abandonment timeout qualify.
    async fn sweep_orphans(&self, report: &mut RecoveryReport) -> Result<(), UploadError> {
        let repo = SessionRepository::new(&self.db);
        let min_age = self
            .abandon_after
            .to_std()
            .unwrap_or(StdDuration::from_secs(0));

        let mut entries = match tokio::fs::read_dir(self.blobs.upload_dir()).await {
            Ok(entries) => entries,
            Err(_) => return Ok(()),
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };

            if !is_old_enough(&path, min_age).await {
                continue;
            }

            if repo.get(stem).await?.is_none() {
                tracing::info!(path = %path.display(), "Removing orphaned blob");
                self.blobs.delete(&path).await?;
                report.orphans_removed += 1;
            }
        }

        // Staging leftovers from crashed hash-verified writes
        if let Ok(mut entries) = tokio::fs::read_dir(self.blobs.temp_dir()).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) == Some("part")
                    && is_old_enough(&path, min_age).await
                {
                    tracing::info!(path = %path.display(), "Removing stale staging file");
                    self.blobs.delete(&path).await?;
                    report.orphans_removed += 1;
                }
            }
        }

        Ok(())
    }

    fn cutoff(&self, age: Duration) -> String {
        (Utc::now() - age).to_rfc3339_opts(SecondsFormat::Millis, true)
    }
}

async fn is_old_enough(path: &Path, min_age: StdDuration) -> bool {
    match tokio::fs::metadata(path).await.and_then(|m| m.modified()) {
        Ok(modified) => match SystemTime::now().duration_since(modified) {
            Ok(age) => age >= min_age,
            Err(_) => false,
        },
        Err(_) => false,
    }
}

// ============================================================================
// Tests
// ============================================================================
