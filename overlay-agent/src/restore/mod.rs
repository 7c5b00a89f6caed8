//! Restore orchestration.
//!
//! ```text
//! validating -> staging -> committed -> rebooting | awaiting-manual-reboot
//!      \            \
//!       +-----------+--> failed
//! ```
//!
//! Validation and staging never touch the live overlay: the archive is
//! extracted into a sibling staging directory on the same filesystem. The
//! commit journal marks the point of no return; after it is written the
//! restore is never reported as failed.

pub mod journal;
pub mod reboot;

use crate::archive::{open_archive, top_level_name, is_safe_entry_path, ArchiveCatalog, ArchiveRecord};
use crate::fs::atomic::sync_dir;
use crate::fs::walker::{is_internal, WalkOptions};
use crate::{EngineError, Result};
use journal::CommitJournal;
use reboot::Rebooter;
use serde::Serialize;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

const STAGING_PREFIX: &str = ".restore-staging-";
const PREVIOUS_PREFIX: &str = ".restore-previous-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestorePhase {
    Validating,
    Staging,
    Committed,
    Rebooting,
    AwaitingManualReboot,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestoreStatus {
    RestoredPendingReboot,
    RestoredManualRebootRequired,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreOutcome {
    pub status: RestoreStatus,
    /// Whether a reboot has been requested
    pub reboot: bool,
    pub archive: ArchiveRecord,
    pub entries_restored: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// What start-up recovery found and did.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub commit_completed: bool,
    pub stale_dirs_removed: usize,
}

pub struct RestoreOrchestrator {
    catalog: ArchiveCatalog,
    overlay_root: PathBuf,
    walk_options: WalkOptions,
    rebooter: Arc<dyn Rebooter>,
}

impl RestoreOrchestrator {
    pub fn new(
        catalog: ArchiveCatalog,
        overlay_root: PathBuf,
        walk_options: WalkOptions,
        rebooter: Arc<dyn Rebooter>,
    ) -> Self {
        Self {
            catalog,
            overlay_root,
            walk_options,
            rebooter,
        }
    }

    /// Replace the overlay contents with those of the archive at
    /// `archive_path`. `observe` is told about every phase change.
    pub fn restore(
        &self,
        archive_path: &Path,
        auto_reboot: bool,
        observe: &dyn Fn(RestorePhase),
    ) -> Result<RestoreOutcome> {
        observe(RestorePhase::Validating);
        let record = match self.validate(archive_path) {
            Ok(record) => record,
            Err(e) => {
                warn!("Restore of {} rejected: {}", archive_path.display(), e);
                observe(RestorePhase::Failed);
                return Err(e);
            }
        };

        observe(RestorePhase::Staging);
        let restore_id = uuid::Uuid::new_v4().simple().to_string()[..12].to_string();
        let staging = self.overlay_root.join(format!("{}{}", STAGING_PREFIX, restore_id));
        let prepared = self
            .stage(&record, &staging)
            .and_then(|entries| {
                let journal = self.plan_commit(&restore_id, &staging)?;
                journal.write(&self.overlay_root)?;
                Ok((entries, journal))
            });
        let (entries_restored, journal) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                error!("Staging {} failed: {}", record.filename, e);
                discard(&staging);
                observe(RestorePhase::Failed);
                return Err(EngineError::ExtractionFailed(e.to_string()));
            }
        };

        // Point of no return.
        observe(RestorePhase::Committed);
        info!("Committing restore {} from {}", restore_id, record.filename);
        let mut message = self.commit(&journal);

        let reboot = auto_reboot
            && match self.rebooter.request_reboot() {
                Ok(()) => true,
                Err(e) => {
                    error!("Reboot request failed: {}", e);
                    message.get_or_insert_with(|| format!("reboot request failed: {}, reboot manually", e));
                    false
                }
            };

        let status = if reboot {
            observe(RestorePhase::Rebooting);
            RestoreStatus::RestoredPendingReboot
        } else {
            observe(RestorePhase::AwaitingManualReboot);
            RestoreStatus::RestoredManualRebootRequired
        };

        Ok(RestoreOutcome {
            status,
            reboot,
            archive: record,
            entries_restored,
            message,
        })
    }

    /// Finish or clean up after a restore interrupted by a crash, and drop
    /// the contents parked by restores committed before the last reboot.
    pub fn recover(&self) -> io::Result<RecoveryReport> {
        let mut report = RecoveryReport::default();

        if let Some(journal) = CommitJournal::load(&self.overlay_root)? {
            warn!("Found interrupted restore {}, rolling forward", journal.restore_id);
            journal.roll_forward(&self.overlay_root)?;
            journal.finish(&self.overlay_root)?;
            report.commit_completed = true;
        }

        let read_dir = match fs::read_dir(&self.overlay_root) {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(report),
            Err(e) => return Err(e),
        };
        for entry in read_dir.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(STAGING_PREFIX) || name.starts_with(PREVIOUS_PREFIX) {
                info!("Removing stale {}", entry.path().display());
                fs::remove_dir_all(entry.path())?;
                report.stale_dirs_removed += 1;
            }
        }

        Ok(report)
    }

    fn validate(&self, archive_path: &Path) -> Result<ArchiveRecord> {
        let record = self.catalog.resolve(archive_path).map_err(|e| match e {
            EngineError::NotFound(_) | EngineError::PermissionDenied(_) => {
                EngineError::ArchiveNotFound(archive_path.display().to_string())
            }
            other => other,
        })?;
        self.catalog.verify(&record)?;
        Ok(record)
    }

    /// Extract the archive into `staging` and flush it to disk.
    fn stage(&self, record: &ArchiveRecord, staging: &Path) -> io::Result<usize> {
        let compression = record
            .compression()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "unknown archive type"))?;
        fs::create_dir_all(staging)?;

        let mut archive = open_archive(&record.path, compression)?;
        archive.set_preserve_permissions(true);
        archive.set_preserve_mtime(true);
        archive.set_unpack_xattrs(true);
        archive.set_preserve_ownerships(nix::unistd::geteuid().is_root());

        let mut count = 0;
        for entry in archive.entries()? {
            let mut entry = entry?;
            let path = entry.path()?.into_owned();
            if !is_safe_entry_path(&path) {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unsafe entry path {}", path.display()),
                ));
            }
            let Some(top) = top_level_name(&path) else {
                continue;
            };
            if !self.walk_options.is_managed(&top) {
                debug!("Skipping unmanaged entry {}", path.display());
                continue;
            }
            if !entry.unpack_in(staging)? {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("entry {} escapes the staging area", path.display()),
                ));
            }
            count += 1;
        }

        sync_tree(staging)?;
        debug!("Staged {} entries in {}", count, staging.display());
        Ok(count)
    }

    fn plan_commit(&self, restore_id: &str, staging: &Path) -> io::Result<CommitJournal> {
        let managed_names = |dir: &Path| -> io::Result<Vec<String>> {
            let mut names: Vec<String> = fs::read_dir(dir)?
                .flatten()
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .filter(|name| self.walk_options.is_managed(name) && !is_internal(name))
                .collect();
            names.sort();
            Ok(names)
        };

        Ok(CommitJournal {
            restore_id: restore_id.to_string(),
            staging: staging.to_path_buf(),
            previous: self.overlay_root.join(format!("{}{}", PREVIOUS_PREFIX, restore_id)),
            displaced: managed_names(&self.overlay_root)?,
            incoming: managed_names(staging)?,
        })
    }

    /// Apply the journal. Returns a message when the commit could not be
    /// completed now; the journal then stays behind for start-up recovery.
    fn commit(&self, journal: &CommitJournal) -> Option<String> {
        let attempt = || {
            journal
                .roll_forward(&self.overlay_root)
                .and_then(|_| journal.finish(&self.overlay_root))
        };
        match attempt() {
            Ok(()) => None,
            Err(first) => {
                warn!("Commit of restore {} hit {}, retrying", journal.restore_id, first);
                match attempt() {
                    Ok(()) => None,
                    Err(e) => {
                        error!("Commit of restore {} incomplete: {}", journal.restore_id, e);
                        Some(format!(
                            "restore committed but not yet fully applied ({}); it completes when the agent next starts",
                            e
                        ))
                    }
                }
            }
        }
    }
}

fn discard(staging: &Path) {
    if let Err(e) = fs::remove_dir_all(staging) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!("Failed to discard {}: {}", staging.display(), e);
        }
    }
}

/// fsync every file and directory below `root`.
fn sync_tree(root: &Path) -> io::Result<()> {
    for entry in WalkDir::new(root).follow_links(false).contents_first(true) {
        let entry = entry.map_err(io::Error::from)?;
        let file_type = entry.file_type();
        if !(file_type.is_file() || file_type.is_dir()) {
            continue;
        }
        match File::open(entry.path()) {
            Ok(file) => file.sync_all()?,
            // Unreadable modes restored from the archive; nothing to flush
            // through this handle.
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {}
            Err(e) => return Err(e),
        }
    }
    sync_dir(root)
}
