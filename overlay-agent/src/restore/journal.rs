//! Commit journal for overlay replacement.
//!
//! Replacing the overlay takes one rename per top-level entry, which is not
//! a single atomic step. The journal is written before the first rename and
//! removed after the last; while it exists the commit is rolled forward,
//! never back. Rolling forward is idempotent, so it is safe to repeat after
//! a crash at any point.

use crate::fs::atomic::{sync_dir, write_atomic};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const JOURNAL_NAME: &str = ".restore-journal.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitJournal {
    pub restore_id: String,
    /// Directory holding the fully extracted new contents
    pub staging: PathBuf,
    /// Directory receiving the displaced live contents
    pub previous: PathBuf,
    /// Live top-level entries to displace
    pub displaced: Vec<String>,
    /// Staged top-level entries to move into the overlay root
    pub incoming: Vec<String>,
}

impl CommitJournal {
    pub fn path(overlay_root: &Path) -> PathBuf {
        overlay_root.join(JOURNAL_NAME)
    }

    pub fn load(overlay_root: &Path) -> io::Result<Option<Self>> {
        match fs::read(Self::path(overlay_root)) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Persist the journal. From here on the commit is irrevocable.
    pub fn write(&self, overlay_root: &Path) -> io::Result<()> {
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        write_atomic(&Self::path(overlay_root), &json)
    }

    /// Move displaced entries out and staged entries in, skipping whatever
    /// an earlier attempt already moved.
    pub fn roll_forward(&self, overlay_root: &Path) -> io::Result<()> {
        fs::create_dir_all(&self.previous)?;

        for name in &self.displaced {
            let live = overlay_root.join(name);
            let parked = self.previous.join(name);
            // Already parked: whatever sits at `live` now is new content.
            if parked.symlink_metadata().is_ok() {
                continue;
            }
            if live.symlink_metadata().is_ok() {
                fs::rename(&live, &parked)?;
            }
        }
        sync_dir(&self.previous)?;

        for name in &self.incoming {
            let staged = self.staging.join(name);
            if staged.symlink_metadata().is_err() {
                continue;
            }
            fs::rename(&staged, overlay_root.join(name))?;
        }
        sync_dir(overlay_root)?;
        Ok(())
    }

    /// Drop the journal and the emptied staging directory.
    ///
    /// The parked old contents stay: a mounted overlayfs keeps writing to
    /// the upper directory it was mounted with, wherever that now lives.
    /// They are removed by start-up recovery once the device has rebooted.
    pub fn finish(&self, overlay_root: &Path) -> io::Result<()> {
        fs::remove_file(Self::path(overlay_root))?;
        sync_dir(overlay_root)?;

        if let Err(e) = fs::remove_dir_all(&self.staging) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("Failed to remove {}: {}", self.staging.display(), e);
            }
        }
        info!(
            "Restore {} committed, previous contents parked in {}",
            self.restore_id,
            self.previous.display()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, CommitJournal) {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("upper/etc")).unwrap();
        fs::write(root.join("upper/etc/old"), b"old").unwrap();
        fs::create_dir_all(root.join("extra")).unwrap();

        let staging = root.join(".restore-staging-t");
        fs::create_dir_all(staging.join("upper/etc")).unwrap();
        fs::write(staging.join("upper/etc/new"), b"new").unwrap();

        let journal = CommitJournal {
            restore_id: "t".to_string(),
            staging,
            previous: root.join(".restore-previous-t"),
            displaced: vec!["extra".to_string(), "upper".to_string()],
            incoming: vec!["upper".to_string()],
        };
        (dir, journal)
    }

    #[test]
    fn test_roll_forward_replaces_contents() {
        let (dir, journal) = setup();
        let root = dir.path();
        journal.write(root).unwrap();

        journal.roll_forward(root).unwrap();
        journal.finish(root).unwrap();

        assert_eq!(fs::read(root.join("upper/etc/new")).unwrap(), b"new");
        assert!(!root.join("upper/etc/old").exists());
        assert!(!root.join("extra").exists());
        assert!(!CommitJournal::path(root).exists());
        assert!(!journal.staging.exists());
        // The live mount may still be using the old upper directory.
        assert_eq!(fs::read(journal.previous.join("upper/etc/old")).unwrap(), b"old");
    }

    #[test]
    fn test_roll_forward_resumes_after_partial_move() {
        let (dir, journal) = setup();
        let root = dir.path();
        journal.write(root).unwrap();

        // Simulate a crash after the first displacement only.
        fs::create_dir_all(&journal.previous).unwrap();
        fs::rename(root.join("extra"), journal.previous.join("extra")).unwrap();

        let reloaded = CommitJournal::load(root).unwrap().unwrap();
        assert_eq!(reloaded, journal);
        reloaded.roll_forward(root).unwrap();
        // A second pass must be a no-op.
        reloaded.roll_forward(root).unwrap();
        reloaded.finish(root).unwrap();

        assert_eq!(fs::read(root.join("upper/etc/new")).unwrap(), b"new");
        assert!(!root.join("upper/etc/old").exists());
    }

    #[test]
    fn test_load_without_journal() {
        let dir = TempDir::new().unwrap();
        assert_eq!(CommitJournal::load(dir.path()).unwrap(), None);
    }
}
