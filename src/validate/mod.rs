//! Blob verification
//!
//! Post-assembly checks over the reassembled archive: a streaming SHA-256 of
//! the full file and a structural pass over the ZIP central directory. Both
//! run in bounded memory regardless of blob size; the archive work happens on
//! the blocking pool since the zip reader is synchronous.

use std::path::Path;

use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use zip::ZipArchive;

use crate::error::{AppError, Result};

const HASH_BUF_SIZE: usize = 64 * 1024;

/// One entry of an archive listing
#[derive(Debug, Clone, Serialize)]
pub struct ArchiveEntry {
    pub name: String,
    /// Uncompressed size in bytes
    pub size: u64,
    /// Compressed size in bytes
    pub compressed: u64,
    pub is_directory: bool,
    /// Last-modified timestamp recorded in the archive, if any
    pub modified: Option<String>,
}

/// Streaming SHA-256 of the full file, as a lowercase hex digest
pub async fn hash_blob(path: &Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_BUF_SIZE];

    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Whether the file parses as a ZIP archive
///
/// Opens the central directory with the streaming reader; nothing is
/// extracted. Any read or parse failure counts as invalid.
pub async fn is_valid_archive(path: &Path) -> bool {
    let path = path.to_path_buf();
    let parsed = tokio::task::spawn_blocking(move || {
        let file = std::fs::File::open(&path)?;
        ZipArchive::new(file)?;
        Ok::<_, anyhow::Error>(())
    })
    .await;

    matches!(parsed, Ok(Ok(())))
}

/// List the central-directory entries of a completed archive
pub async fn list_entries(path: &Path) -> Result<Vec<ArchiveEntry>> {
    let path = path.to_path_buf();

    tokio::task::spawn_blocking(move || {
        let file = std::fs::File::open(&path)?;
        let mut archive = ZipArchive::new(file)
            .map_err(|e| AppError::BadRequest(format!("not a readable archive: {}", e)))?;

        let mut entries = Vec::with_capacity(archive.len());
        for i in 0..archive.len() {
            let entry = archive
                .by_index(i)
                .map_err(|e| AppError::Internal(format!("archive entry {}: {}", i, e)))?;

            entries.push(ArchiveEntry {
                name: entry.name().to_string(),
                size: entry.size(),
                compressed: entry.compressed_size(),
                is_directory: entry.is_dir(),
                modified: entry.last_modified().map(|m| {
                    format!(
                        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}",
                        m.year(),
                        m.month(),
                        m.day(),
                        m.hour(),
                        m.minute(),
                        m.second()
                    )
                }),
            });
        }

        Ok(entries)
    })
    .await
    .map_err(|e| AppError::Internal(format!("archive listing task failed: {}", e)))?
}

// ============================================================================
// Tests
// ============================================================================
