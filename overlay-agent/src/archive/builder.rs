//! Snapshot the overlay into a compressed archive.
//!
//! The archive is written to `<name>.partial` inside the target, flushed,
//! read back for verification, given its manifest, and only then renamed
//! to its final name. A crash at any point leaves at most a `.partial` file,
//! which the catalog never lists.

use super::manifest::{ArchiveOrigin, Manifest, MANIFEST_VERSION};
use super::naming::{next_available, DeviceIdentity};
use super::{sha256_file, verify_structure, ArchiveRecord, Compression};
use crate::config::Config;
use crate::fs::atomic::{is_out_of_space, PartialFile};
use crate::fs::walker::{walk_overlay, EntryKind, OverlayEntry, WalkOptions};
use crate::storage::{available_bytes, StorageLocator, StorageTarget};
use crate::{EngineError, Result};
use chrono::{Local, Utc};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub struct ArchiveBuilder {
    locator: StorageLocator,
    overlay_root: PathBuf,
    walk_options: WalkOptions,
    identity: DeviceIdentity,
    compression: Compression,
    compression_level: i32,
    min_free_bytes: u64,
}

/// What went into an archive.
#[derive(Debug, Default)]
struct SnapshotStats {
    entries: usize,
    bytes: u64,
    vanished: usize,
}

impl ArchiveBuilder {
    pub fn new(config: &Config, locator: StorageLocator, identity: DeviceIdentity) -> Self {
        Self {
            locator,
            overlay_root: config.overlay.root.clone(),
            walk_options: WalkOptions::excluding(&config.overlay.exclude),
            identity,
            compression: config.archive.compression,
            compression_level: config.archive.compression_level,
            min_free_bytes: config.storage.min_free_bytes,
        }
    }

    /// Name the next archive would get at `target` if created now.
    pub fn preview_filename(&self, target: &Path) -> String {
        let base = self.identity.archive_name(Local::now(), self.compression);
        next_available(target, &base)
    }

    /// Create an archive of the overlay in the given storage target.
    pub fn create_backup(&self, target_path: &Path) -> Result<ArchiveRecord> {
        // Re-validate at execution time, not only when the target was picked.
        let target = self
            .locator
            .resolve_target(target_path)
            .map_err(|_| EngineError::StorageUnwritable(format!("{} is not a storage target", target_path.display())))?;
        if !target.writable {
            return Err(EngineError::StorageUnwritable(target.path.display().to_string()));
        }

        let entries = walk_overlay(&self.overlay_root, &self.walk_options).map_err(|e| {
            EngineError::SnapshotFailed(format!("cannot walk {}: {}", self.overlay_root.display(), e))
        })?;
        self.check_space(&target, &entries)?;

        let name = self.preview_filename(&target.path);
        let final_path = target.path.join(&name);
        info!("Creating backup {} ({} overlay entries)", final_path.display(), entries.len());

        let mut partial = PartialFile::create(&final_path).map_err(|e| write_error(&target, e))?;
        let stats = self
            .write_snapshot(&mut partial, &entries)
            .map_err(|e| write_error(&target, e))?;
        if stats.vanished > 0 {
            warn!("{} overlay entries vanished during the snapshot", stats.vanished);
        }

        // Read the finished file back before it becomes visible.
        let summary = verify_structure(partial.temp_path(), self.compression)
            .map_err(|e| EngineError::SnapshotFailed(format!("archive failed verification: {}", e)))?;
        let sha256 = sha256_file(partial.temp_path()).map_err(|e| write_error(&target, e))?;
        let size = std::fs::metadata(partial.temp_path())
            .map_err(|e| write_error(&target, e))?
            .len();

        let manifest = Manifest {
            version: MANIFEST_VERSION,
            archive: name.clone(),
            origin: ArchiveOrigin::Backup,
            device_id: Some(self.identity.device_id.clone()),
            firmware: Some(self.identity.firmware.clone()),
            created_at: Utc::now(),
            sha256,
            size,
            total_entries: summary.entries,
            total_bytes: stats.bytes,
        };
        manifest.store(&final_path).map_err(|e| write_error(&target, e))?;

        let final_path = match partial.commit() {
            Ok(path) => path,
            Err(e) => {
                let _ = std::fs::remove_file(Manifest::sidecar_path(&final_path));
                return Err(write_error(&target, e));
            }
        };

        info!(
            "Backup created: {} ({} entries, {} bytes compressed)",
            name, stats.entries, size
        );
        ArchiveRecord::from_path(&final_path).map_err(EngineError::from)
    }

    fn check_space(&self, target: &StorageTarget, entries: &[OverlayEntry]) -> Result<()> {
        // Uncompressed payload plus one tar header per entry; compression is
        // never assumed to help.
        let payload = entries.iter().fold(0u64, |sum, e| sum.saturating_add(e.size));
        let needed = payload
            .saturating_add((entries.len() as u64).saturating_mul(512))
            .saturating_add(self.min_free_bytes);
        match available_bytes(&target.path) {
            Some(available) if available < needed => {
                warn!(
                    "Not enough space on {}: need {} bytes, {} available",
                    target.path.display(),
                    needed,
                    available
                );
                Err(EngineError::InsufficientSpace { needed, available })
            }
            _ => Ok(()),
        }
    }

    fn write_snapshot(&self, partial: &mut PartialFile, entries: &[OverlayEntry]) -> io::Result<SnapshotStats> {
        let file = partial.take()?;
        let (file, stats) = match self.compression {
            Compression::Gzip => {
                let level = self.compression_level.clamp(0, 9) as u32;
                let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::new(level));
                let (encoder, stats) = append_entries(encoder, entries)?;
                (encoder.finish()?, stats)
            }
            Compression::Zstd => {
                let encoder = zstd::stream::write::Encoder::new(file, self.compression_level)?;
                let (encoder, stats) = append_entries(encoder, entries)?;
                (encoder.finish()?, stats)
            }
        };
        partial.finish(file)?;
        Ok(stats)
    }
}

fn append_entries<W: Write>(writer: W, entries: &[OverlayEntry]) -> io::Result<(W, SnapshotStats)> {
    let mut builder = tar::Builder::new(writer);
    builder.follow_symlinks(false);
    let mut stats = SnapshotStats::default();

    for entry in entries {
        match builder.append_path_with_name(&entry.path, &entry.relative_path) {
            Ok(()) => {
                stats.entries += 1;
                if entry.kind == EntryKind::File {
                    stats.bytes += entry.size;
                }
            }
            // The overlay is live; a file deleted since the walk is skipped.
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("Skipping vanished entry {}", entry.path.display());
                stats.vanished += 1;
            }
            Err(e) => return Err(e),
        }
    }

    let writer = builder.into_inner()?;
    Ok((writer, stats))
}

fn write_error(target: &StorageTarget, err: io::Error) -> EngineError {
    if is_out_of_space(&err) {
        EngineError::InsufficientSpace {
            needed: 0,
            available: available_bytes(&target.path).unwrap_or(0),
        }
    } else if err.kind() == io::ErrorKind::PermissionDenied || err.raw_os_error() == Some(nix::errno::Errno::EROFS as i32) {
        EngineError::StorageUnwritable(format!("{}: {}", target.path.display(), err))
    } else {
        EngineError::SnapshotFailed(err.to_string())
    }
}
