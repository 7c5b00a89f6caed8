//! Manifest sidecar carrying an archive's integrity token.
//!
//! Stored as `<archive>.manifest.json` next to the archive. It is written
//! before the archive is renamed into place, so every listed archive the
//! engine produced has one.

use super::{sha256_file, with_suffix};
use crate::fs::atomic::write_atomic;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub const MANIFEST_SUFFIX: &str = ".manifest.json";
pub const MANIFEST_VERSION: u32 = 1;

/// How an archive entered the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveOrigin {
    Backup,
    Upload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub archive: String,
    pub origin: ArchiveOrigin,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub firmware: Option<String>,
    pub created_at: DateTime<Utc>,
    pub sha256: String,
    pub size: u64,
    pub total_entries: usize,
    pub total_bytes: u64,
}

impl Manifest {
    pub fn sidecar_path(archive: &Path) -> PathBuf {
        with_suffix(archive, MANIFEST_SUFFIX)
    }

    /// Load the sidecar of `archive`; `Ok(None)` when there is none.
    pub fn load(archive: &Path) -> io::Result<Option<Self>> {
        match fs::read(Self::sidecar_path(archive)) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Write the sidecar for an archive that will be named `archive`.
    pub fn store(&self, archive: &Path) -> io::Result<()> {
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        write_atomic(&Self::sidecar_path(archive), &json)
    }

    /// Check the archive on disk against the recorded size and hash.
    pub fn verify(&self, archive: &Path) -> Result<(), String> {
        let size = fs::metadata(archive)
            .map_err(|e| format!("cannot stat archive: {}", e))?
            .len();
        if size != self.size {
            return Err(format!("size is {} bytes, manifest records {}", size, self.size));
        }
        let digest = sha256_file(archive).map_err(|e| format!("cannot read archive: {}", e))?;
        if digest != self.sha256 {
            return Err(format!("sha256 {} does not match manifest {}", digest, self.sha256));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manifest_for(archive: &Path) -> Manifest {
        Manifest {
            version: MANIFEST_VERSION,
            archive: "a.tar.gz".to_string(),
            origin: ArchiveOrigin::Backup,
            device_id: Some("gw".to_string()),
            firmware: None,
            created_at: Utc::now(),
            sha256: sha256_file(archive).unwrap(),
            size: fs::metadata(archive).unwrap().len(),
            total_entries: 1,
            total_bytes: 4,
        }
    }

    #[test]
    fn test_store_and_load() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("a.tar.gz");
        fs::write(&archive, b"data").unwrap();

        assert_eq!(Manifest::load(&archive).unwrap(), None);

        let manifest = manifest_for(&archive);
        manifest.store(&archive).unwrap();
        assert!(dir.path().join("a.tar.gz.manifest.json").exists());
        assert_eq!(Manifest::load(&archive).unwrap(), Some(manifest));
    }

    #[test]
    fn test_verify_detects_tampering() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("a.tar.gz");
        fs::write(&archive, b"data").unwrap();
        let manifest = manifest_for(&archive);
        assert!(manifest.verify(&archive).is_ok());

        fs::write(&archive, b"dat4").unwrap();
        let err = manifest.verify(&archive).unwrap_err();
        assert!(err.contains("sha256"));

        fs::write(&archive, b"longer").unwrap();
        let err = manifest.verify(&archive).unwrap_err();
        assert!(err.contains("size"));
    }
}
