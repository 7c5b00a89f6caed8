//! Storage target endpoints.

use super::error::{blocking, ApiError};
use super::AppState;
use crate::storage::StorageTarget;
use axum::{extract::State, Json};

/// GET /targets - Currently available storage targets, default first
pub async fn list_targets(State(state): State<AppState>) -> Result<Json<Vec<StorageTarget>>, ApiError> {
    let engine = state.engine.clone();
    let targets = blocking(move || Ok(engine.discover_targets())).await?;
    Ok(Json(targets))
}

#[cfg(test)]
mod tests {
    use crate::api::tests::{get, router, send};
    use crate::archive::builder::tests::Fixture;
    use axum::http::StatusCode;

    #[tokio::test]
    async fn test_default_target_only() {
        let fixture = Fixture::new();
        let (router, _) = router(&fixture);

        let (status, body) = send(&router, get("/targets")).await;
        assert_eq!(status, StatusCode::OK);
        let targets = body.as_array().unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0]["path"], fixture.upload().to_string_lossy().into_owned());
        assert_eq!(targets[0]["writable"], true);
    }
}
