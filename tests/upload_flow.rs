//! End-to-end upload flows over the HTTP surface
//!
//! Drives the real router against a temp upload directory and a temp SQLite
//! file, with a small chunk size so multi-chunk archives stay cheap to build.

use std::io::Write;
use std::time::Duration;

use axum_test::TestServer;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use zip::write::SimpleFileOptions;

use depot_server::config::{
    CleanupConfig, Config, DatabaseConfig, ServerConfig, StorageConfig,
};
use depot_server::db;
use depot_server::routes::api_router;
use depot_server::state::AppState;

const CHUNK_SIZE: u64 = 1024;
const BOUNDARY: &str = "----depot-test-boundary";

struct TestApp {
    _dir: TempDir,
    server: TestServer,
    state: AppState,
}

async fn spawn_app() -> TestApp {
    let dir = TempDir::new().unwrap();

    let config = Config {
        server: ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
        },
        storage: StorageConfig {
            upload_dir: dir.path().join("uploads"),
            temp_dir: dir.path().join("tmp"),
            chunk_size: CHUNK_SIZE,
        },
        database: DatabaseConfig {
            url: format!("sqlite:{}/test.db", dir.path().display()),
        },
        cleanup: CleanupConfig {
            abandon_after_hours: 24,
            interval_secs: 3600,
        },
    };

    let pool = db::create_pool(&config.database.url).await.unwrap();
    let state = AppState::new(config, pool);
    state.blobs().ensure_dirs().await.unwrap();

    let server = TestServer::new(api_router(state.clone())).unwrap();

    TestApp {
        _dir: dir,
        server,
        state,
    }
}

/// A real ZIP archive of at least `min_len` bytes (stored, not compressed,
/// so the size is predictable)
fn build_zip(min_len: usize) -> Vec<u8> {
    let mut filler = Vec::with_capacity(min_len);
    let mut x: u32 = 0x2545_f491;
    while filler.len() < min_len {
        x = x.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
        filler.extend_from_slice(&x.to_le_bytes());
    }

    let options =
        SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    writer.start_file("payload.bin", options).unwrap();
    writer.write_all(&filler).unwrap();
    writer.finish().unwrap().into_inner()
}

fn chunks_of(data: &[u8]) -> Vec<&[u8]> {
    data.chunks(CHUNK_SIZE as usize).collect()
}

fn multipart_chunk_body(
    session_id: &str,
    chunk_index: u64,
    chunk_hash: Option<&str>,
    data: &[u8],
) -> Vec<u8> {
    let mut body = Vec::new();
    let mut text_part = |name: &str, value: &str| {
        body.extend_from_slice(
            format!(
                "--{}\r\nContent-Disposition: form-data; name=\"{}\"\r\n\r\n{}\r\n",
                BOUNDARY, name, value
            )
            .as_bytes(),
        );
    };

    text_part("session_id", session_id);
    text_part("chunk_index", &chunk_index.to_string());
    if let Some(hash) = chunk_hash {
        text_part("chunk_hash", hash);
    }

    body.extend_from_slice(
        format!(
            "--{}\r\nContent-Disposition: form-data; name=\"chunk\"; filename=\"chunk.bin\"\r\n\
             Content-Type: application/octet-stream\r\n\r\n",
            BOUNDARY
        )
        .as_bytes(),
    );
    body.extend_from_slice(data);
    body.extend_from_slice(format!("\r\n--{}--\r\n", BOUNDARY).as_bytes());
    body
}

async fn init_session(app: &TestApp, filename: &str, total_size: u64, total_chunks: u64) -> String {
    let response = app
        .server
        .post("/upload/init")
        .json(&json!({
            "filename": filename,
            "total_size": total_size,
            "total_chunks": total_chunks,
        }))
        .await;
    response.assert_status_ok();

    let body: Value = response.json();
    assert_eq!(body["uploaded_chunks"], json!([]));
    body["session_id"].as_str().unwrap().to_string()
}

async fn send_chunk(app: &TestApp, session_id: &str, index: u64, data: &[u8]) -> Value {
    let response = app
        .server
        .post("/upload/chunk")
        .content_type(&format!("multipart/form-data; boundary={}", BOUNDARY))
        .bytes(multipart_chunk_body(session_id, index, None, data).into())
        .await;
    response.assert_status_ok();
    response.json()
}

async fn get_status(app: &TestApp, session_id: &str) -> Value {
    let response = app
        .server
        .get(&format!("/upload/{}/status", session_id))
        .await;
    response.assert_status_ok();
    response.json()
}

/// Finalization runs on a spawned task; poll until the session settles
async fn wait_for_terminal(app: &TestApp, session_id: &str) -> Value {
    for _ in 0..200 {
        let status = get_status(app, session_id).await;
        let state = status["session"]["status"].as_str().unwrap().to_string();
        if state == "completed" || state == "failed" {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("session {} never reached a terminal state", session_id);
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn happy_path_out_of_order_chunks() {
    let app = spawn_app().await;

    let archive = build_zip(1500);
    let chunks = chunks_of(&archive);
    assert!(chunks.len() >= 2);

    let session_id = init_session(
        &app,
        "backup.zip",
        archive.len() as u64,
        chunks.len() as u64,
    )
    .await;

    // Last chunk first, then the rest in reverse
    for index in (0..chunks.len()).rev() {
        let response = send_chunk(&app, &session_id, index as u64, chunks[index]).await;
        assert_eq!(response["duplicate"], json!(false));
        assert_eq!(response["chunk_index"], json!(index));
    }

    let status = wait_for_terminal(&app, &session_id).await;
    assert_eq!(status["session"]["status"], json!("completed"));
    assert_eq!(
        status["session"]["final_hash"],
        json!(hex::encode(Sha256::digest(&archive)))
    );
    assert_eq!(status["progress"], json!({"completed": chunks.len(), "total": chunks.len()}));
}

#[tokio::test]
async fn resume_after_disconnect() {
    let app = spawn_app().await;

    let archive = build_zip(2 * CHUNK_SIZE as usize + 100);
    let chunks = chunks_of(&archive);
    assert_eq!(chunks.len(), 3);

    let session_id = init_session(&app, "big.zip", archive.len() as u64, 3).await;

    // Client uploads one chunk, then vanishes
    send_chunk(&app, &session_id, 0, chunks[0]).await;

    // On reconnect, status shows what survived
    let status = get_status(&app, &session_id).await;
    assert_eq!(status["session"]["status"], json!("uploading"));
    assert_eq!(status["progress"], json!({"completed": 1, "total": 3}));

    send_chunk(&app, &session_id, 1, chunks[1]).await;
    send_chunk(&app, &session_id, 2, chunks[2]).await;

    let status = wait_for_terminal(&app, &session_id).await;
    assert_eq!(status["session"]["status"], json!("completed"));
}

#[tokio::test]
async fn duplicate_chunk_is_idempotent() {
    let app = spawn_app().await;

    let archive = build_zip(1500);
    let chunks = chunks_of(&archive);

    let session_id = init_session(
        &app,
        "dup.zip",
        archive.len() as u64,
        chunks.len() as u64,
    )
    .await;

    let first = send_chunk(&app, &session_id, 0, chunks[0]).await;
    assert_eq!(first["duplicate"], json!(false));
    assert_eq!(first["progress"]["completed"], json!(1));

    // Same (session, index, payload) again: same state, flagged duplicate
    let second = send_chunk(&app, &session_id, 0, chunks[0]).await;
    assert_eq!(second["duplicate"], json!(true));
    assert_eq!(second["progress"]["completed"], json!(1));

    for index in 1..chunks.len() {
        send_chunk(&app, &session_id, index as u64, chunks[index]).await;
    }

    let status = wait_for_terminal(&app, &session_id).await;
    assert_eq!(status["session"]["status"], json!("completed"));
}

#[tokio::test]
async fn chunk_with_hash_is_verified() {
    let app = spawn_app().await;

    let archive = build_zip(100);
    assert!(archive.len() <= CHUNK_SIZE as usize);
    let session_id = init_session(&app, "hashed.zip", archive.len() as u64, 1).await;

    // Wrong hash: rejected, nothing recorded
    let wrong = hex::encode(Sha256::digest(b"not the payload"));
    let response = app
        .server
        .post("/upload/chunk")
        .content_type(&format!("multipart/form-data; boundary={}", BOUNDARY))
        .bytes(multipart_chunk_body(&session_id, 0, Some(&wrong), &archive).into())
        .await;
    response.assert_status_bad_request();

    let status = get_status(&app, &session_id).await;
    assert_eq!(status["progress"]["completed"], json!(0));

    // Correct hash: accepted
    let good = hex::encode(Sha256::digest(&archive));
    let response = app
        .server
        .post("/upload/chunk")
        .content_type(&format!("multipart/form-data; boundary={}", BOUNDARY))
        .bytes(multipart_chunk_body(&session_id, 0, Some(&good), &archive).into())
        .await;
    response.assert_status_ok();

    let status = wait_for_terminal(&app, &session_id).await;
    assert_eq!(status["session"]["status"], json!("completed"));
}

#[tokio::test]
async fn invalid_archive_fails_without_hash() {
    let app = spawn_app().await;

    // Right size, wrong bytes: not a ZIP
    let garbage = vec![0x17u8; CHUNK_SIZE as usize + 50];
    let chunks = chunks_of(&garbage);

    let session_id = init_session(
        &app,
        "junk.zip",
        garbage.len() as u64,
        chunks.len() as u64,
    )
    .await;

    for (index, chunk) in chunks.iter().enumerate() {
        send_chunk(&app, &session_id, index as u64, chunk).await;
    }

    let status = wait_for_terminal(&app, &session_id).await;
    assert_eq!(status["session"]["status"], json!("failed"));
    assert_eq!(status["session"]["final_hash"], Value::Null);
}

#[tokio::test]
async fn contents_listing_after_completion() {
    let app = spawn_app().await;

    let archive = build_zip(600);
    let session_id = init_session(&app, "list.zip", archive.len() as u64, 1).await;

    // Not completed yet: listing refused
    let response = app
        .server
        .get(&format!("/upload/{}/contents", session_id))
        .await;
    response.assert_status_bad_request();

    send_chunk(&app, &session_id, 0, &archive).await;
    wait_for_terminal(&app, &session_id).await;

    let response = app
        .server
        .get(&format!("/upload/{}/contents", session_id))
        .await;
    response.assert_status_ok();

    let body: Value = response.json();
    let entries = body["entries"].as_array().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["name"], json!("payload.bin"));
    assert_eq!(entries[0]["is_directory"], json!(false));
    assert!(entries[0]["size"].as_u64().unwrap() >= 600);
}

#[tokio::test]
async fn chunk_after_completion_conflicts() {
    let app = spawn_app().await;

    let archive = build_zip(100);
    let session_id = init_session(&app, "done.zip", archive.len() as u64, 1).await;
    send_chunk(&app, &session_id, 0, &archive).await;
    wait_for_terminal(&app, &session_id).await;

    let response = app
        .server
        .post("/upload/chunk")
        .content_type(&format!("multipart/form-data; boundary={}", BOUNDARY))
        .bytes(multipart_chunk_body(&session_id, 0, None, &archive).into())
        .await;
    response.assert_status(axum::http::StatusCode::CONFLICT);
}

#[tokio::test]
async fn boundary_chunk_lengths_enforced() {
    let app = spawn_app().await;

    let total = CHUNK_SIZE + 10;
    let session_id = init_session(&app, "bounds.zip", total, 2).await;

    // Non-final chunk shorter than the chunk size
    let response = app
        .server
        .post("/upload/chunk")
        .content_type(&format!("multipart/form-data; boundary={}", BOUNDARY))
        .bytes(multipart_chunk_body(&session_id, 0, None, &vec![1u8; 100]).into())
        .await;
    response.assert_status_bad_request();

    // Final chunk longer than the remainder
    let response = app
        .server
        .post("/upload/chunk")
        .content_type(&format!("multipart/form-data; boundary={}", BOUNDARY))
        .bytes(multipart_chunk_body(&session_id, 1, None, &vec![1u8; 500]).into())
        .await;
    response.assert_status_bad_request();

    // Out-of-range index
    let response = app
        .server
        .post("/upload/chunk")
        .content_type(&format!("multipart/form-data; boundary={}", BOUNDARY))
        .bytes(multipart_chunk_body(&session_id, 2, None, &vec![1u8; 10]).into())
        .await;
    response.assert_status_bad_request();

    let status = get_status(&app, &session_id).await;
    assert_eq!(status["progress"]["completed"], json!(0));
}

#[tokio::test]
async fn init_validation() {
    let app = spawn_app().await;

    // Wrong extension
    let response = app
        .server
        .post("/upload/init")
        .json(&json!({"filename": "notes.txt", "total_size": 100, "total_chunks": 1}))
        .await;
    response.assert_status_bad_request();

    // Zero size
    let response = app
        .server
        .post("/upload/init")
        .json(&json!({"filename": "a.zip", "total_size": 0, "total_chunks": 1}))
        .await;
    response.assert_status_bad_request();

    // Chunk count inconsistent with size
    let response = app
        .server
        .post("/upload/init")
        .json(&json!({"filename": "a.zip", "total_size": CHUNK_SIZE * 3, "total_chunks": 2}))
        .await;
    response.assert_status_bad_request();

    // Unknown session
    let response = app.server.get("/upload/no-such-session/status").await;
    response.assert_status_not_found();
}

#[tokio::test]
async fn single_byte_upload_completes() {
    // total_size = 1: one chunk of one byte. Not a valid archive, but the
    // whole pipeline must still run to a terminal state.
    let app = spawn_app().await;

    let session_id = init_session(&app, "one.zip", 1, 1).await;
    let response = send_chunk(&app, &session_id, 0, &[0x50]).await;
    assert_eq!(response["progress"], json!({"completed": 1, "total": 1}));

    let status = wait_for_terminal(&app, &session_id).await;
    assert_eq!(status["session"]["status"], json!("failed"));
}

#[tokio::test]
async fn abandonment_sweep_reaps_stale_session() {
    let app = spawn_app().await;

    let session_id = init_session(&app, "stale.zip", CHUNK_SIZE * 2, 2).await;

    // Age the session past the 24h timeout
    sqlx::query("UPDATE upload_sessions SET created_at = ?, updated_at = ? WHERE id = ?")
        .bind("2000-01-01T00:00:00.000Z")
        .bind("2000-01-01T00:00:00.000Z")
        .bind(&session_id)
        .execute(app.state.db())
        .await
        .unwrap();

    let report = app.state.recovery().run().await.unwrap();
    assert_eq!(report.reaped, 1);

    let status = get_status(&app, &session_id).await;
    assert_eq!(status["session"]["status"], json!("failed"));
    assert!(!app
        .state
        .blobs()
        .exists(&app.state.blobs().blob_path(&session_id))
        .await);

    // Chunks are refused after the reap
    let response = app
        .server
        .post("/upload/chunk")
        .content_type(&format!("multipart/form-data; boundary={}", BOUNDARY))
        .bytes(multipart_chunk_body(&session_id, 0, None, &vec![0u8; CHUNK_SIZE as usize]).into())
        .await;
    response.assert_status(axum::http::StatusCode::CONFLICT);
}

#[tokio::test]
async fn recovery_after_completion_changes_nothing() {
    let app = spawn_app().await;

    let archive = build_zip(1500);
    let chunks = chunks_of(&archive);
    let session_id = init_session(
        &app,
        "stable.zip",
        archive.len() as u64,
        chunks.len() as u64,
    )
    .await;
    for (index, chunk) in chunks.iter().enumerate() {
        send_chunk(&app, &session_id, index as u64, chunk).await;
    }
    let before = wait_for_terminal(&app, &session_id).await;

    // Two sweeps in a row leave the terminal session untouched
    app.state.recovery().run().await.unwrap();
    app.state.recovery().run().await.unwrap();

    let after = get_status(&app, &session_id).await;
    assert_eq!(before["session"]["status"], after["session"]["status"]);
    assert_eq!(before["session"]["final_hash"], after["session"]["final_hash"]);
    assert_eq!(
        before["session"]["completed_at"],
        after["session"]["completed_at"]
    );
}

#[tokio::test]
async fn cancel_session_removes_everything() {
    let app = spawn_app().await;

    let session_id = init_session(&app, "gone.zip", CHUNK_SIZE, 1).await;

    let response = app.server.delete(&format!("/upload/{}", session_id)).await;
    response.assert_status(axum::http::StatusCode::NO_CONTENT);

    let response = app
        .server
        .get(&format!("/upload/{}/status", session_id))
        .await;
    response.assert_status_not_found();
}
