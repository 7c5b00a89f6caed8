//! HTTP command surface for the engine.

pub mod backup;
pub mod error;
pub mod health;
pub mod restore;
pub mod storage;

use crate::engine::Engine;
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
}

impl AppState {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }
}

/// Create the API router. Request bodies are capped at `max_upload_bytes`.
pub fn create_router(state: AppState, max_upload_bytes: u64) -> Router {
    let body_limit = usize::try_from(max_upload_bytes).unwrap_or(usize::MAX);

    Router::new()
        // Liveness and status
        .route("/health", get(health::health))
        .route("/status", get(health::status))
        // Storage targets
        .route("/targets", get(storage::list_targets))
        // Backups
        .route("/backup", post(backup::create_backup))
        .route("/backup/filename", get(backup::preview_filename))
        .route("/backups", get(backup::list_backups).delete(backup::delete_backup))
        .route("/backups/download", get(backup::download_backup))
        .route("/backups/upload", post(backup::upload_backup))
        // Restore
        .route("/restore", post(restore::restore))
        // Event stream
        .route("/ws", get(crate::ws::ws_handler))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
