//! Blob store
//!
//! Local-filesystem storage for the reassembled archives. Each session owns
//! one file, created at its final size up front so chunk writers can address
//! their byte range directly; on filesystems with sparse-file support the
//! preallocation costs no disk until bytes land.
//!
//! Concurrency contract: writers obtained from `writer_at` are independent
//! file handles. Any number of them may write the same file at once as long
//! as their ranges do not overlap, which the chunk offset arithmetic
//! guarantees.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncSeekExt;

/// Local blob storage rooted at the configured upload directory
#[derive(Debug, Clone)]
pub struct BlobStore {
    upload_dir: PathBuf,
    temp_dir: PathBuf,
}

impl BlobStore {
    pub fn new(upload_dir: PathBuf, temp_dir: PathBuf) -> Self {
        Self {
            upload_dir,
            temp_dir,
        }
    }

    pub fn upload_dir(&self) -> &Path {
        &self.upload_dir
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    /// Create both storage directories if they do not exist yet
    pub async fn ensure_dirs(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.upload_dir).await?;
        tokio::fs::create_dir_all(&self.temp_dir).await?;
        Ok(())
    }

    /// Canonical blob location for a session
    pub fn blob_path(&self, session_id: &str) -> PathBuf {
        self.upload_dir.join(format!("{}.zip", session_id))
    }

    /// Staging location for a chunk awaiting hash verification
    pub fn stage_path(&self, session_id: &str, chunk_index: u64) -> PathBuf {
        self.temp_dir
            .join(format!("{}.{:08}.part", session_id, chunk_index))
    }

    /// Create (or truncate) a file of exactly `size` bytes
    ///
    /// Must succeed before any chunk write; afterwards offset writers never
    /// need to extend the file.
    pub async fn preallocate(&self, path: &Path, size: u64) -> std::io::Result<()> {
        let file = File::create(path).await?;
        file.set_len(size).await?;
        file.sync_all().await?;
        Ok(())
    }

    /// Open an existing file for writing, positioned at `offset`
    ///
    /// The file is opened without create or truncate: preallocation must have
    /// happened first, and a vanished blob surfaces as NotFound here.
    pub async fn writer_at(&self, path: &Path, offset: u64) -> std::io::Result<File> {
        let mut file = OpenOptions::new().write(true).open(path).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        Ok(file)
    }

    /// Current size of a blob in bytes
    pub async fn size(&self, path: &Path) -> std::io::Result<u64> {
        let meta = tokio::fs::metadata(path).await?;
        Ok(meta.len())
    }

    pub async fn exists(&self, path: &Path) -> bool {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }

    /// Delete a blob; an already-absent file is not an error
    pub async fn delete(&self, path: &Path) -> std::io::Result<()> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
