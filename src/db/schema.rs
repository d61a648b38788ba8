//! Database schema initialization

use sqlx::SqlitePool;

use crate::error::Result;

/// Initialize the database schema
pub async fn initialize_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(SCHEMA_TABLES_SQL).execute(pool).await?;
    sqlx::query(SCHEMA_INDEXES_SQL).execute(pool).await?;
    Ok(())
}

/// SQL for creating tables (without indexes)
const SCHEMA_TABLES_SQL: &str = r#"
-- Upload sessions: one row per upload attempt
CREATE TABLE IF NOT EXISTS upload_sessions (
    id TEXT PRIMARY KEY,
    filename TEXT NOT NULL,
    total_size INTEGER NOT NULL,
    total_chunks INTEGER NOT NULL,
    -- 'uploading' | 'processing' | 'completed' | 'failed'
    status TEXT NOT NULL DEFAULT 'uploading',
    blob_path TEXT NOT NULL,
    -- SHA-256 hex digest of the assembled blob; set only on completion
    final_hash TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    completed_at TEXT
);

-- Chunk ledger: one row per (session, index), pre-materialized at init
CREATE TABLE IF NOT EXISTS upload_chunks (
    session_id TEXT NOT NULL REFERENCES upload_sessions(id) ON DELETE CASCADE,
    chunk_index INTEGER NOT NULL,
    -- 'pending' | 'success'
    status TEXT NOT NULL DEFAULT 'pending',
    received_at TEXT,

    PRIMARY KEY (session_id, chunk_index)
);
"#;

/// SQL for creating indexes
const SCHEMA_INDEXES_SQL: &str = r#"
CREATE INDEX IF NOT EXISTS idx_upload_sessions_status ON upload_sessions(status);
CREATE INDEX IF NOT EXISTS idx_upload_sessions_created ON upload_sessions(created_at);

CREATE INDEX IF NOT EXISTS idx_upload_chunks_status ON upload_chunks(session_id, status);
"#;
