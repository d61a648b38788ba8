//! Route modules for the Depot server

pub mod health;
pub mod upload;

use axum::{extract::DefaultBodyLimit, routing::get, Router};

use crate::state::AppState;

/// Build the API router
///
/// The body limit tracks the configured chunk size: a chunk request carries
/// one chunk plus small multipart framing, and nothing else comes close.
pub fn api_router(state: AppState) -> Router {
    let body_limit = state.config().storage.chunk_size as usize + 1024 * 1024;

    Router::new()
        .route("/health", get(health::health_check))
        .nest("/upload", upload::router())
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}
