//! Restore endpoint.

use super::error::{blocking, ApiError};
use super::AppState;
use crate::restore::RestoreOutcome;
use axum::{extract::State, Json};
use serde::Deserialize;
use std::path::PathBuf;

fn default_auto_reboot() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct RestoreRequest {
    pub path: PathBuf,
    #[serde(default = "default_auto_reboot")]
    pub auto_reboot: bool,
}

/// POST /restore - Replace the overlay with an archive's contents
///
/// Returns once the new contents are committed and, with `auto_reboot`, a
/// reboot has been requested. The caller then polls `/health` until the
/// device is back.
pub async fn restore(
    State(state): State<AppState>,
    Json(req): Json<RestoreRequest>,
) -> Result<Json<RestoreOutcome>, ApiError> {
    tracing::info!(
        "Restore requested from {} (auto_reboot: {})",
        req.path.display(),
        req.auto_reboot
    );
    let engine = state.engine.clone();
    let outcome = blocking(move || engine.restore(&req.path, req.auto_reboot)).await?;
    Ok(Json(outcome))
}

#[cfg(test)]
mod tests {
    use crate::api::tests::{get, post_json, router, send};
    use crate::archive::builder::tests::Fixture;
    use axum::http::StatusCode;
    use serde_json::json;
    use std::fs;

    #[tokio::test]
    async fn test_restore_without_reboot() {
        let fixture = Fixture::new();
        let (router, engine) = router(&fixture);
        let record = engine.create_backup(&fixture.upload()).unwrap();
        let passwd = fixture.config.overlay.root.join("upper/etc/passwd");
        fs::write(&passwd, b"edited").unwrap();

        let (status, body) = send(
            &router,
            post_json("/restore", json!({ "path": record.path, "auto_reboot": false })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "restored-manual-reboot-required");
        assert_eq!(body["reboot"], false);
        assert_eq!(fs::read(&passwd).unwrap(), b"root:x:0:0\n");
    }

    #[tokio::test]
    async fn test_restore_then_rebooting() {
        let fixture = Fixture::new();
        let (router, engine) = router(&fixture);
        let record = engine.create_backup(&fixture.upload()).unwrap();

        let (status, body) = send(&router, post_json("/restore", json!({ "path": record.path }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "restored-pending-reboot");

        let (_, health) = send(&router, get("/health")).await;
        assert_eq!(health["state"], "rebooting");

        let (status, body) = send(&router, post_json("/restore", json!({ "path": record.path }))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "engine_busy");
    }

    #[tokio::test]
    async fn test_restore_missing_archive() {
        let fixture = Fixture::new();
        let (router, _) = router(&fixture);

        let (status, body) = send(
            &router,
            post_json("/restore", json!({ "path": fixture.upload().join("gone.tar.gz") })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "archive_not_found");
    }
}
