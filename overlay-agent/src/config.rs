//! Configuration management for the overlay agent.
//!
//! Loads configuration from an optional TOML file, then applies
//! `OVERLAY_AGENT__<SECTION>__<KEY>` environment overrides. Every field has
//! a default so the agent runs on a stock router without any file.

use crate::archive::Compression;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Prefix for environment overrides, e.g. `OVERLAY_AGENT__AGENT__PORT=8080`.
pub const ENV_PREFIX: &str = "OVERLAY_AGENT";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub agent: AgentConfig,
    pub storage: StorageConfig,
    pub overlay: OverlayConfig,
    pub archive: ArchiveConfig,
    pub reboot: RebootConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Stable device identifier used in archive names
    pub id: String,

    /// HTTP port
    pub port: u16,

    /// Bind address
    pub bind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Internal temporary location, always offered first
    pub default_target: PathBuf,

    /// Label shown for the default target
    pub default_label: String,

    /// Mount table to enumerate external storage from
    pub mounts_file: PathBuf,

    /// Mount points under these roots count as external storage
    pub external_roots: Vec<PathBuf>,

    /// Space kept free on a target after writing an archive
    pub min_free_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    /// Root of the writable overlay
    pub root: PathBuf,

    /// Top-level entries that are neither archived nor replaced on restore
    pub exclude: Vec<String>,

    /// Release file holding the firmware version
    pub release_file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Compression for newly created archives (gzip, zstd)
    pub compression: Compression,

    /// Compression level (0-9 for gzip, 1-22 for zstd)
    pub compression_level: i32,

    /// Largest upload the ingestion gate accepts
    pub max_upload_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RebootConfig {
    /// Command spawned to request a reboot; must return immediately
    pub command: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            id: hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "router".to_string()),
            port: 9991,
            bind: "0.0.0.0".to_string(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            default_target: PathBuf::from("/tmp/upload"),
            default_label: "Internal temporary storage".to_string(),
            mounts_file: PathBuf::from("/proc/mounts"),
            external_roots: vec![PathBuf::from("/mnt"), PathBuf::from("/media")],
            min_free_bytes: 64 * 1024,
        }
    }
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/overlay"),
            exclude: vec!["work".to_string()],
            release_file: PathBuf::from("/etc/openwrt_release"),
        }
    }
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            compression: Compression::Gzip,
            compression_level: 6,
            max_upload_bytes: 256 * 1024 * 1024,
        }
    }
}

impl Default for RebootConfig {
    fn default() -> Self {
        Self {
            command: vec!["reboot".to_string(), "-d".to_string(), "3".to_string()],
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from an optional TOML file plus environment overrides
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path.to_path_buf()).format(config::FileFormat::Toml),
            );
        }
        let settings = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;
        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Render the effective configuration as TOML
    pub fn to_toml(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if !self.storage.default_target.is_absolute() {
            anyhow::bail!("storage.default_target must be absolute");
        }
        if !self.overlay.root.is_absolute() {
            anyhow::bail!("overlay.root must be absolute");
        }
        if self.agent.id.trim().is_empty() {
            anyhow::bail!("agent.id must not be empty");
        }
        Ok(())
    }
}
