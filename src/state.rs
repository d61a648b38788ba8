//! Application state management

use std::sync::Arc;

use chrono::Duration;
use sqlx::SqlitePool;

use crate::blob::BlobStore;
use crate::config::Config;
use crate::upload::{ChunkIngestor, Finalizer, RecoveryService, SessionManager};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: Config,
    db: SqlitePool,
    blobs: BlobStore,
    sessions: SessionManager,
    ingestor: ChunkIngestor,
    recovery: RecoveryService,
}

impl AppState {
    /// Create a new application state, wiring up the upload services
    pub fn new(config: Config, db: SqlitePool) -> Self {
        let blobs = BlobStore::new(
            config.storage.upload_dir.clone(),
            config.storage.temp_dir.clone(),
        );
        let chunk_size = config.storage.chunk_size;

        let finalizer = Finalizer::new(db.clone(), blobs.clone());
        let sessions = SessionManager::new(db.clone(), blobs.clone(), chunk_size);
        let ingestor = ChunkIngestor::new(db.clone(), blobs.clone(), chunk_size, finalizer.clone());
        let recovery = RecoveryService::new(
            db.clone(),
            blobs.clone(),
            finalizer,
            Duration::hours(config.cleanup.abandon_after_hours),
        );

        Self {
            inner: Arc::new(AppStateInner {
                config,
                db,
                blobs,
                sessions,
                ingestor,
                recovery,
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn db(&self) -> &SqlitePool {
        &self.inner.db
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.inner.blobs
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.inner.sessions
    }

    pub fn ingestor(&self) -> &ChunkIngestor {
        &self.inner.ingestor
    }

    pub fn recovery(&self) -> &RecoveryService {
        &self.inner.recovery
    }
}
