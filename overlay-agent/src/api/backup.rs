//! Backup archive endpoints.

use super::error::{blocking, ApiError};
use super::AppState;
use crate::archive::ArchiveRecord;
use crate::EngineError;
use axum::{
    body::{Body, Bytes},
    extract::{rejection::BytesRejection, Query, State},
    http::header,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;
use std::path::PathBuf;
use tokio_util::io::ReaderStream;

#[derive(Debug, Deserialize)]
pub struct TargetQuery {
    pub target: PathBuf,
}

#[derive(Debug, Deserialize)]
pub struct CreateBackupRequest {
    pub target: PathBuf,
}

#[derive(Debug, Deserialize)]
pub struct ArchiveQuery {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize)]
pub struct UploadQuery {
    pub target: PathBuf,
    pub name: String,
}

/// GET /backup/filename?target= - Name the next backup would get
pub async fn preview_filename(
    State(state): State<AppState>,
    Query(query): Query<TargetQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let engine = state.engine.clone();
    let filename = blocking(move || engine.preview_filename(&query.target)).await?;
    Ok(Json(json!({ "filename": filename })))
}

/// POST /backup - Snapshot the overlay into the given target
pub async fn create_backup(
    State(state): State<AppState>,
    Json(req): Json<CreateBackupRequest>,
) -> Result<Json<ArchiveRecord>, ApiError> {
    tracing::info!("Backup requested to {}", req.target.display());
    let engine = state.engine.clone();
    let record = blocking(move || engine.create_backup(&req.target)).await?;
    Ok(Json(record))
}

/// GET /backups?target= - Archives at a target, newest first
pub async fn list_backups(
    State(state): State<AppState>,
    Query(query): Query<TargetQuery>,
) -> Result<Json<Vec<ArchiveRecord>>, ApiError> {
    let engine = state.engine.clone();
    let records = blocking(move || Ok(engine.list_backups(&query.target))).await?;
    Ok(Json(records))
}

/// DELETE /backups?path= - Delete an archive
pub async fn delete_backup(
    State(state): State<AppState>,
    Query(query): Query<ArchiveQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let engine = state.engine.clone();
    let path = query.path.clone();
    blocking(move || engine.delete_backup(&path)).await?;
    Ok(Json(json!({ "status": "deleted", "path": query.path })))
}

/// POST /backups/upload?target=&name= - Admit an archive sent as the raw body
pub async fn upload_backup(
    State(state): State<AppState>,
    Query(query): Query<UploadQuery>,
    body: Result<Bytes, BytesRejection>,
) -> Result<Json<ArchiveRecord>, ApiError> {
    // Oversized bodies are cut off by the router's body limit.
    let body = body.map_err(|e| {
        tracing::warn!("Upload of {} rejected: {}", query.name, e.body_text());
        EngineError::RejectedUpload(e.body_text())
    })?;
    tracing::info!(
        "Upload of {} ({} bytes) to {}",
        query.name,
        body.len(),
        query.target.display()
    );
    let engine = state.engine.clone();
    let record = blocking(move || engine.upload_backup(&body, &query.name, &query.target)).await?;
    Ok(Json(record))
}

/// GET /backups/download?path= - Stream an archive
pub async fn download_backup(
    State(state): State<AppState>,
    Query(query): Query<ArchiveQuery>,
) -> Result<Response, ApiError> {
    let engine = state.engine.clone();
    let record = blocking(move || engine.resolve_backup(&query.path)).await?;

    let file = tokio::fs::File::open(&record.path)
        .await
        .map_err(EngineError::from)?;
    let body = Body::from_stream(ReaderStream::new(file));

    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::CONTENT_LENGTH, record.size.to_string()),
            (header::CONTENT_DISPOSITION, attachment(&record.filename)),
        ],
        body,
    )
        .into_response())
}

/// `Content-Disposition` value with the file name as a quoted string.
fn attachment(filename: &str) -> String {
    let quoted: String = filename
        .chars()
        .map(|c| match c {
            '"' | '\\' => format!("\\{}", c),
            c if c.is_control() => "_".to_string(),
            c => c.to_string(),
        })
        .collect();
    format!("attachment; filename=\"{}\"", quoted)
}

#[cfg(test)]
mod tests {
    use super::attachment;
    use crate::api::tests::{get, post_json, query_path, router, send};
    use crate::archive::builder::tests::Fixture;
    use crate::archive::tests::write_test_archive;
    use crate::engine::EngineState;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::json;
    use std::fs;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_create_list_delete() {
        let fixture = Fixture::new();
        let (router, _) = router(&fixture);
        let target = fixture.upload();

        let (status, created) = send(
            &router,
            post_json("/backup", json!({ "target": target })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let filename = created["filename"].as_str().unwrap().to_string();
        assert!(filename.starts_with("overlay-gw-"));

        let (status, listed) = send(&router, get(&format!("/backups?target={}", query_path(&target)))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed[0]["filename"], filename.as_str());

        let path = target.join(&filename);
        let delete = Request::delete(format!("/backups?path={}", query_path(&path)))
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(&router, delete).await;
        assert_eq!(status, StatusCode::OK);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_delete_outside_targets_forbidden() {
        let fixture = Fixture::new();
        let (router, _) = router(&fixture);
        let outside = fixture.dir.path().join("outside.tar.gz");
        write_test_archive(&outside, &[("upper/a", b"a")]);

        let delete = Request::delete(format!("/backups?path={}", query_path(&outside)))
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(&router, delete).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["code"], "permission_denied");
        assert!(outside.exists());
    }

    #[tokio::test]
    async fn test_filename_preview() {
        let fixture = Fixture::new();
        let (router, _) = router(&fixture);

        let uri = format!("/backup/filename?target={}", query_path(&fixture.upload()));
        let (status, body) = send(&router, get(&uri)).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["filename"].as_str().unwrap().ends_with(".tar.gz"));

        let (status, body) = send(&router, get("/backup/filename?target=%2Fnowhere")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "not_found");
    }

    #[tokio::test]
    async fn test_upload_and_download() {
        let fixture = Fixture::new();
        let (router, _) = router(&fixture);
        let source = fixture.dir.path().join("source.tar.gz");
        write_test_archive(&source, &[("upper/etc/hosts", b"127.0.0.1 localhost\n")]);
        let bytes = fs::read(&source).unwrap();

        let upload = Request::post(format!(
            "/backups/upload?target={}&name=mine.tar.gz",
            query_path(&fixture.upload())
        ))
        .body(Body::from(bytes.clone()))
        .unwrap();
        let (status, record) = send(&router, upload).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(record["filename"], "mine.tar.gz");

        let path = fixture.upload().join("mine.tar.gz");
        let response = router
            .clone()
            .oneshot(get(&format!("/backups/download?path={}", query_path(&path))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let downloaded = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(downloaded.as_ref(), bytes.as_slice());
    }

    #[tokio::test]
    async fn test_upload_garbage_rejected() {
        let fixture = Fixture::new();
        let (router, _) = router(&fixture);

        let upload = Request::post(format!(
            "/backups/upload?target={}&name=bad.tar.gz",
            query_path(&fixture.upload())
        ))
        .body(Body::from("definitely not gzip"))
        .unwrap();
        let (status, body) = send(&router, upload).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["code"], "rejected_upload");
        assert_eq!(fs::read_dir(fixture.upload()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_oversized_upload_rejected_as_json() {
        let fixture = Fixture::new();
        let (router, _) = router(&fixture);

        // One byte over the router's limit.
        let upload = Request::post(format!(
            "/backups/upload?target={}&name=big.tar.gz",
            query_path(&fixture.upload())
        ))
        .body(Body::from(vec![0u8; 1024 * 1024 + 1]))
        .unwrap();
        let (status, body) = send(&router, upload).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["code"], "rejected_upload");
        assert_eq!(fs::read_dir(fixture.upload()).unwrap().count(), 0);
    }

    #[test]
    fn test_attachment_header_quoting() {
        assert_eq!(attachment("a.tar.gz"), r#"attachment; filename="a.tar.gz""#);
        assert_eq!(
            attachment("we\"ird\\x\n.tar.gz"),
            r#"attachment; filename="we\"ird\\x_.tar.gz""#
        );
    }

    #[tokio::test]
    async fn test_busy_engine_conflict() {
        let fixture = Fixture::new();
        let (router, engine) = router(&fixture);
        let _claim = engine.claim(EngineState::BackingUp).unwrap();

        let (status, body) = send(
            &router,
            post_json("/backup", json!({ "target": fixture.upload() })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "engine_busy");
    }
}
