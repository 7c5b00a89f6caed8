//! Admission of uploaded archives.
//!
//! An upload is written under a temporary name, decoded end to end, and
//! only renamed into the catalog once it proves to be a well-formed
//! archive. Rejected uploads leave nothing behind.

use super::manifest::{ArchiveOrigin, Manifest, MANIFEST_VERSION};
use super::naming::next_available;
use super::{is_archive_name, sha256_file, verify_structure, ArchiveRecord, Compression};
use crate::fs::atomic::PartialFile;
use crate::storage::StorageLocator;
use crate::{EngineError, Result};
use chrono::Utc;
use std::io::Write;
use std::path::Path;
use tracing::{info, warn};

pub struct IngestionGate {
    locator: StorageLocator,
    max_upload_bytes: u64,
}

impl IngestionGate {
    pub fn new(locator: StorageLocator, max_upload_bytes: u64) -> Self {
        Self {
            locator,
            max_upload_bytes,
        }
    }

    /// Validate an uploaded archive and admit it into the catalog at
    /// `target_path`.
    pub fn admit(&self, bytes: &[u8], declared_name: &str, target_path: &Path) -> Result<ArchiveRecord> {
        let (name, compression) = validate_name(declared_name)?;

        if bytes.is_empty() {
            return Err(EngineError::RejectedUpload("upload is empty".into()));
        }
        if bytes.len() as u64 > self.max_upload_bytes {
            return Err(EngineError::RejectedUpload(format!(
                "upload is {} bytes, limit is {}",
                bytes.len(),
                self.max_upload_bytes
            )));
        }

        let target = self
            .locator
            .resolve_target(target_path)
            .map_err(|_| EngineError::RejectedUpload(format!("{} is not a storage target", target_path.display())))?;
        if !target.writable {
            return Err(EngineError::RejectedUpload(format!(
                "{} is not writable",
                target.path.display()
            )));
        }

        let name = next_available(&target.path, &name);
        let final_path = target.path.join(&name);

        let mut partial = PartialFile::create(&final_path)?;
        partial.file()?.write_all(bytes)?;
        partial.file()?.sync_all()?;

        // Dropping `partial` on any error below deletes the upload.
        let summary = verify_structure(partial.temp_path(), compression).map_err(|e| {
            warn!("Rejecting upload {}: {}", declared_name, e);
            EngineError::RejectedUpload(format!("not a valid archive: {}", e))
        })?;

        let manifest = Manifest {
            version: MANIFEST_VERSION,
            archive: name.clone(),
            origin: ArchiveOrigin::Upload,
            device_id: None,
            firmware: None,
            created_at: Utc::now(),
            sha256: sha256_file(partial.temp_path())?,
            size: bytes.len() as u64,
            total_entries: summary.entries,
            total_bytes: summary.bytes,
        };
        manifest.store(&final_path)?;

        let final_path = match partial.commit() {
            Ok(path) => path,
            Err(e) => {
                let _ = std::fs::remove_file(Manifest::sidecar_path(&final_path));
                return Err(e.into());
            }
        };

        info!("Admitted upload {} as {}", declared_name, final_path.display());
        ArchiveRecord::from_path(&final_path).map_err(EngineError::from)
    }
}

/// Reduce a declared name to a bare, accepted archive file name.
fn validate_name(declared: &str) -> Result<(String, Compression)> {
    let reject = |why: &str| EngineError::RejectedUpload(format!("{:?}: {}", declared, why));

    let name = declared.trim();
    if name.is_empty() {
        return Err(reject("empty file name"));
    }
    if name.contains('/') || name.contains('\\') || name.contains('\0') {
        return Err(reject("file name must not contain path separators"));
    }
    if name.chars().any(|c| c == '"' || c.is_control()) {
        return Err(reject("file name must not contain quotes or control characters"));
    }
    if !is_archive_name(name) {
        return Err(reject("expected a .tar.gz, .tgz or .tar.zst archive"));
    }
    let compression = Compression::from_file_name(name).ok_or_else(|| reject("unknown extension"))?;
    Ok((name.to_string(), compression))
}
