//! Listing, resolving, verifying and deleting archives.

use super::manifest::Manifest;
use super::{is_archive_name, verify_structure, ArchiveRecord, ArchiveSummary};
use crate::fs::atomic::PARTIAL_SUFFIX;
use crate::storage::StorageLocator;
use crate::{EngineError, Result};
use std::fs;
use std::io;
use std::path::Path;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct ArchiveCatalog {
    locator: StorageLocator,
}

impl ArchiveCatalog {
    pub fn new(locator: StorageLocator) -> Self {
        Self { locator }
    }

    /// Archives at a target, most recent first. An unknown or unreadable
    /// target yields an empty list.
    pub fn list(&self, target_path: &Path) -> Vec<ArchiveRecord> {
        let target = match self.locator.resolve_target(target_path) {
            Ok(target) => target,
            Err(e) => {
                warn!("Not listing {}: {}", target_path.display(), e);
                return Vec::new();
            }
        };

        let read_dir = match fs::read_dir(&target.path) {
            Ok(read_dir) => read_dir,
            Err(e) => {
                warn!("Failed to read {}: {}", target.path.display(), e);
                return Vec::new();
            }
        };

        let mut records: Vec<ArchiveRecord> = read_dir
            .flatten()
            .filter(|entry| is_archive_name(&entry.file_name().to_string_lossy()))
            // Vanished or non-regular entries are skipped, not reported.
            .filter_map(|entry| ArchiveRecord::from_path(&entry.path()).ok())
            .collect();

        records.sort_by(|a, b| {
            b.modified
                .cmp(&a.modified)
                .then_with(|| b.filename.cmp(&a.filename))
        });

        debug!("Listed {} archive(s) at {}", records.len(), target.path.display());
        records
    }

    /// Resolve a caller-supplied archive path to a catalog record.
    ///
    /// The path is re-validated against the currently discovered targets
    /// before anything on disk is touched.
    pub fn resolve(&self, path: &Path) -> Result<ArchiveRecord> {
        let (_target, path) = self.locator.locate_archive(path)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if !is_archive_name(&name) {
            return Err(EngineError::PermissionDenied(format!(
                "{} is not a backup archive",
                path.display()
            )));
        }

        match fs::symlink_metadata(&path) {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => {
                return Err(EngineError::PermissionDenied(format!(
                    "{} is not a regular file",
                    path.display()
                )))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(EngineError::NotFound(path.display().to_string()))
            }
            Err(e) => return Err(e.into()),
        }

        ArchiveRecord::from_path(&path).map_err(EngineError::from)
    }

    /// Delete an archive and its manifest.
    pub fn delete(&self, path: &Path) -> Result<()> {
        let record = self.resolve(path)?;

        fs::remove_file(&record.path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => EngineError::NotFound(record.path.display().to_string()),
            io::ErrorKind::PermissionDenied => {
                EngineError::PermissionDenied(format!("{}: {}", record.path.display(), e))
            }
            _ => EngineError::Io(e),
        })?;

        let sidecar = Manifest::sidecar_path(&record.path);
        if let Err(e) = fs::remove_file(&sidecar) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("Failed to remove manifest {}: {}", sidecar.display(), e);
            }
        }

        info!("Deleted backup {}", record.path.display());
        Ok(())
    }

    /// Check an archive's integrity token and readability.
    ///
    /// Archives carrying a manifest must match its size and hash; archives
    /// without one (copied onto a stick by hand) are checked structurally
    /// only.
    pub fn verify(&self, record: &ArchiveRecord) -> Result<ArchiveSummary> {
        let compression = record.compression().ok_or_else(|| {
            EngineError::IntegrityCheckFailed(format!("{} has no archive extension", record.filename))
        })?;

        match Manifest::load(&record.path) {
            Ok(Some(manifest)) => manifest
                .verify(&record.path)
                .map_err(|e| EngineError::IntegrityCheckFailed(format!("{}: {}", record.filename, e)))?,
            Ok(None) => debug!("{} has no manifest, checking structure only", record.filename),
            Err(e) => {
                return Err(EngineError::IntegrityCheckFailed(format!(
                    "{}: unreadable manifest: {}",
                    record.filename, e
                )))
            }
        }

        verify_structure(&record.path, compression)
            .map_err(|e| EngineError::IntegrityCheckFailed(format!("{}: {}", record.filename, e)))
    }

    /// Remove leftovers of interrupted writes in every discovered target:
    /// `.partial` files and manifests whose archive never arrived.
    pub fn sweep(&self) -> usize {
        let mut removed = 0;
        for target in self.locator.discover_targets().into_iter().filter(|t| t.writable) {
            let Ok(read_dir) = fs::read_dir(&target.path) else {
                continue;
            };
            for entry in read_dir.flatten() {
                let name = entry.file_name().to_string_lossy().into_owned();
                let stale = if let Some(base) = name.strip_suffix(PARTIAL_SUFFIX) {
                    is_archive_name(base) || base.ends_with(super::manifest::MANIFEST_SUFFIX)
                } else if let Some(archive) = name.strip_suffix(super::manifest::MANIFEST_SUFFIX) {
                    is_archive_name(archive) && !target.path.join(archive).exists()
                } else {
                    false
                };
                if !stale {
                    continue;
                }
                match fs::remove_file(entry.path()) {
                    Ok(()) => {
                        info!("Removed leftover {}", entry.path().display());
                        removed += 1;
                    }
                    Err(e) => warn!("Failed to remove leftover {}: {}", entry.path().display(), e),
                }
            }
        }
        removed
    }
}
