//! Depot Server
//!
//! A self-hosted ingest server for very large archive files: clients upload
//! fixed-size chunks over HTTP in any order, across any number of
//! connections and process restarts, and the server reassembles, verifies,
//! and serves the result.

use anyhow::Context;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::signal;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use depot_server::config::Config;
use depot_server::state::AppState;
use depot_server::{db, routes};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "depot_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();

    let config = Config::from_env().unwrap_or_else(|e| {
        tracing::warn!("Failed to load config from env: {}, using defaults", e);
        Config::default()
    });

    tracing::info!("Starting Depot Server v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Upload directory: {}", config.storage.upload_dir.display());
    tracing::info!("Chunk size: {} bytes", config.storage.chunk_size);

    // Initialize database
    let db_pool = db::create_pool(&config.database.url)
        .await
        .context("failed to initialize database")?;
    tracing::info!("Database initialized at {}", config.database.url);

    // Create application state
    let app_state = AppState::new(config.clone(), db_pool);
    app_state
        .blobs()
        .ensure_dirs()
        .await
        .context("failed to create storage directories")?;

    // Drive everything a previous process left behind to a defined state
    match app_state.recovery().run().await {
        Ok(report) if report.total_actions() > 0 => {
            tracing::info!(actions = report.total_actions(), "Startup recovery finished");
        }
        Ok(_) => tracing::info!("Startup recovery: nothing to do"),
        Err(e) => tracing::warn!("Startup recovery failed: {}", e),
    }

    // Periodic sweep for abandoned and stuck sessions
    let _sweep = app_state
        .recovery()
        .clone()
        .start_task(Duration::from_secs(config.cleanup.interval_secs));

    // Build CORS layer
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Build router
    let app = routes::api_router(app_state)
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    // Start server with graceful shutdown
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("invalid listen address")?;
    tracing::info!("Depot Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("failed to bind listener")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, starting graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown...");
        },
    }
}
