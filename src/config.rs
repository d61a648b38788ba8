//! Configuration management for the Depot server

use serde::Deserialize;
use std::env;
use std::path::PathBuf;

/// Default chunk size: 5 MiB
pub const DEFAULT_CHUNK_SIZE: u64 = 5 * 1024 * 1024;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub database: DatabaseConfig,
    pub cleanup: CleanupConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Directory holding one pre-sized blob per session
    pub upload_dir: PathBuf,
    /// Staging area for chunks that carry a client-supplied hash
    pub temp_dir: PathBuf,
    /// Fixed chunk size in bytes; every chunk but the last is exactly this long
    pub chunk_size: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CleanupConfig {
    /// Sessions still UPLOADING after this many hours are reaped
    pub abandon_after_hours: i64,
    /// Cadence of the periodic recovery sweep, in seconds
    pub interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 3000,
            },
            storage: StorageConfig {
                upload_dir: PathBuf::from("./data/uploads"),
                temp_dir: PathBuf::from("./data/tmp"),
                chunk_size: DEFAULT_CHUNK_SIZE,
            },
            database: DatabaseConfig {
                url: "sqlite:./depot.db".to_string(),
            },
            cleanup: CleanupConfig {
                abandon_after_hours: 24,
                interval_secs: 3600,
            },
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, env::VarError> {
        Ok(Config {
            server: ServerConfig {
                host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: env::var("SERVER_PORT")
                    .unwrap_or_else(|_| "3000".to_string())
                    .parse()
                    .unwrap_or(3000),
            },
            storage: StorageConfig {
                upload_dir: env::var("UPLOAD_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| PathBuf::from("./data/uploads")),
                temp_dir: env::var("TEMP_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| PathBuf::from("./data/tmp")),
                chunk_size: env::var("CHUNK_SIZE")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(DEFAULT_CHUNK_SIZE),
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite:./depot.db".to_string()),
            },
            cleanup: CleanupConfig {
                abandon_after_hours: env::var("ABANDON_AFTER_HOURS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(24),
                interval_secs: env::var("CLEANUP_INTERVAL_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(3600),
            },
        })
    }
}
