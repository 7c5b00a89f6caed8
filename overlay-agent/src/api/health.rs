//! Health check and status endpoints.

use super::AppState;
use axum::{extract::State, response::IntoResponse, Json};
use serde_json::json;
use std::time::{SystemTime, UNIX_EPOCH};

static START_TIME: std::sync::OnceLock<u64> = std::sync::OnceLock::new();

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub fn init_start_time() {
    START_TIME.get_or_init(now_secs);
}

/// GET /health - Liveness probe, polled by callers after a reboot
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let uptime = now_secs().saturating_sub(*START_TIME.get().unwrap_or(&0));

    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": uptime,
        "state": state.engine.state(),
    }))
}

/// GET /status - Current engine state
pub async fn status(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({ "state": state.engine.state() }))
}
