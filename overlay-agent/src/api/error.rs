use crate::EngineError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Engine(e) => match e {
                EngineError::EngineBusy(_) => StatusCode::CONFLICT,
                EngineError::NotFound(_) | EngineError::ArchiveNotFound(_) => StatusCode::NOT_FOUND,
                EngineError::PermissionDenied(_) => StatusCode::FORBIDDEN,
                EngineError::Config(_) => StatusCode::BAD_REQUEST,
                EngineError::RejectedUpload(_) | EngineError::IntegrityCheckFailed(_) => {
                    StatusCode::UNPROCESSABLE_ENTITY
                }
                EngineError::InsufficientSpace { .. } => StatusCode::INSUFFICIENT_STORAGE,
                EngineError::StorageUnwritable(_)
                | EngineError::SnapshotFailed(_)
                | EngineError::ExtractionFailed(_)
                | EngineError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let (code, msg) = match &self {
            ApiError::Engine(e) => {
                if status.is_server_error() {
                    tracing::error!("Request failed: {e}");
                }
                (e.code(), e.to_string())
            }
            ApiError::Internal(e) => {
                tracing::error!("Internal error: {e:#}");
                ("internal", "Internal server error".to_string())
            }
        };
        (status, Json(json!({ "error": msg, "code": code }))).into_response()
    }
}

/// Run a blocking engine call off the async runtime.
pub async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> crate::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let result = tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;
    Ok(result?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (EngineError::EngineBusy("restoring".into()), StatusCode::CONFLICT),
            (EngineError::ArchiveNotFound("x".into()), StatusCode::NOT_FOUND),
            (EngineError::PermissionDenied("x".into()), StatusCode::FORBIDDEN),
            (EngineError::RejectedUpload("x".into()), StatusCode::UNPROCESSABLE_ENTITY),
            (
                EngineError::InsufficientSpace { needed: 2, available: 1 },
                StatusCode::INSUFFICIENT_STORAGE,
            ),
            (EngineError::ExtractionFailed("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status(), status);
        }
    }
}
