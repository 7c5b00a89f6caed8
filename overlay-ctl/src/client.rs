//! HTTP client for the overlay agent.

use crate::error::{CtlError, Result};
use crate::monitor::Probe;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TargetInfo {
    pub path: String,
    pub label: String,
    pub writable: bool,
    #[serde(default)]
    pub free_bytes: Option<u64>,
    #[serde(default)]
    pub external: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ArchiveInfo {
    pub filename: String,
    pub path: String,
    pub size: u64,
    #[serde(default)]
    pub size_human: String,
    #[serde(default)]
    pub date: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RestoreReply {
    pub status: String,
    pub reboot: bool,
    #[serde(default)]
    pub entries_restored: usize,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
    #[serde(default)]
    code: String,
}

#[derive(Clone)]
pub struct AgentClient {
    http: Client,
    base_url: String,
    probe_timeout: Duration,
}

impl AgentClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            probe_timeout: Duration::from_secs(3),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn targets(&self) -> Result<Vec<TargetInfo>> {
        self.json(self.http.get(self.url("/targets"))).await
    }

    pub async fn preview_filename(&self, target: &Path) -> Result<String> {
        #[derive(Deserialize)]
        struct Reply {
            filename: String,
        }
        let reply: Reply = self
            .json(
                self.http
                    .get(self.url("/backup/filename"))
                    .query(&[("target", target)]),
            )
            .await?;
        Ok(reply.filename)
    }

    pub async fn create_backup(&self, target: &Path) -> Result<ArchiveInfo> {
        self.json(
            self.http
                .post(self.url("/backup"))
                .json(&json!({ "target": target })),
        )
        .await
    }

    pub async fn list_backups(&self, target: &Path) -> Result<Vec<ArchiveInfo>> {
        self.json(self.http.get(self.url("/backups")).query(&[("target", target)]))
            .await
    }

    pub async fn delete_backup(&self, path: &Path) -> Result<()> {
        let _: serde_json::Value = self
            .json(self.http.delete(self.url("/backups")).query(&[("path", path)]))
            .await?;
        Ok(())
    }

    pub async fn upload_backup(&self, bytes: Vec<u8>, name: &str, target: &Path) -> Result<ArchiveInfo> {
        self.json(
            self.http
                .post(self.url("/backups/upload"))
                .query(&[("target", &*target.to_string_lossy()), ("name", name)])
                .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                .body(bytes),
        )
        .await
    }

    pub async fn download_backup(&self, path: &Path) -> Result<Vec<u8>> {
        let response = self
            .send(self.http.get(self.url("/backups/download")).query(&[("path", path)]))
            .await?;
        Ok(response.bytes().await?.to_vec())
    }

    pub async fn restore(&self, path: &Path, auto_reboot: bool) -> Result<RestoreReply> {
        self.json(
            self.http
                .post(self.url("/restore"))
                .json(&json!({ "path": path, "auto_reboot": auto_reboot })),
        )
        .await
    }

    /// Single liveness check with a short deadline.
    pub async fn is_alive(&self) -> bool {
        match self
            .http
            .get(self.url("/health"))
            .timeout(self.probe_timeout)
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let text = response.text().await.unwrap_or_default();
        let (code, message) = match serde_json::from_str::<ErrorBody>(&text) {
            Ok(body) => (body.code, body.error),
            Err(_) => (String::new(), text),
        };
        Err(CtlError::Agent {
            status: status.as_u16(),
            code,
            message,
        })
    }

    async fn json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        Ok(self.send(request).await?.json().await?)
    }
}

impl Probe for AgentClient {
    async fn probe(&self) -> bool {
        self.is_alive().await
    }
}
