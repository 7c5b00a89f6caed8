//! Write-to-temp-then-rename helpers.
//!
//! A `PartialFile` lives under `<final>.partial` until `commit` flushes it to
//! stable storage and renames it into place. Dropping an uncommitted
//! `PartialFile` removes the temporary file, so an error path never leaves a
//! `.partial` behind.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Suffix carried by files that are still being written.
pub const PARTIAL_SUFFIX: &str = ".partial";

/// Path of the temporary file used while writing `final_path`.
pub fn partial_path(final_path: &Path) -> PathBuf {
    let mut name = final_path.as_os_str().to_owned();
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

pub struct PartialFile {
    file: Option<File>,
    temp_path: PathBuf,
    final_path: PathBuf,
}

impl PartialFile {
    /// Create `<final_path>.partial`, failing if it already exists.
    pub fn create(final_path: &Path) -> io::Result<Self> {
        let temp_path = partial_path(final_path);
        let file = OpenOptions::new()
            .write(true)
            .read(true)
            .create_new(true)
            .open(&temp_path)?;
        Ok(Self {
            file: Some(file),
            temp_path,
            final_path: final_path.to_path_buf(),
        })
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    /// Writable handle to the temporary file.
    pub fn file(&mut self) -> io::Result<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::other("partial file already closed"))
    }

    /// Hand the file to an encoder; it must be returned through `finish`.
    pub fn take(&mut self) -> io::Result<File> {
        self.file
            .take()
            .ok_or_else(|| io::Error::other("partial file already closed"))
    }

    /// Give back the file returned by an encoder and flush it to disk.
    pub fn finish(&mut self, file: File) -> io::Result<()> {
        file.sync_all()?;
        self.file = Some(file);
        Ok(())
    }

    /// Flush, rename into place and persist the directory entry.
    pub fn commit(mut self) -> io::Result<PathBuf> {
        if let Some(file) = self.file.take() {
            file.sync_all()?;
        }
        fs::rename(&self.temp_path, &self.final_path)?;
        if let Some(parent) = self.final_path.parent() {
            sync_dir(parent)?;
        }
        // Renamed away; nothing left for Drop to clean up.
        self.temp_path = PathBuf::new();
        Ok(self.final_path.clone())
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if self.temp_path.as_os_str().is_empty() {
            return;
        }
        self.file.take();
        if let Err(e) = fs::remove_file(&self.temp_path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("Failed to remove {}: {}", self.temp_path.display(), e);
            }
        }
    }
}

/// Write a small file atomically.
pub fn write_atomic(final_path: &Path, contents: &[u8]) -> io::Result<()> {
    use std::io::Write;

    let temp_path = partial_path(final_path);
    // A leftover from a crash would make create_new fail forever.
    match fs::remove_file(&temp_path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    let mut partial = PartialFile::create(final_path)?;
    partial.file()?.write_all(contents)?;
    partial.commit()?;
    Ok(())
}

/// fsync a directory so renames inside it survive power loss.
pub fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

/// True when an I/O error means the device ran out of space.
pub fn is_out_of_space(err: &io::Error) -> bool {
    err.raw_os_error() == Some(nix::errno::Errno::ENOSPC as i32)
        || err.raw_os_error() == Some(nix::errno::Errno::EDQUOT as i32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_commit_renames() -> io::Result<()> {
        let dir = TempDir::new()?;
        let target = dir.path().join("archive.tar.gz");

        let mut partial = PartialFile::create(&target)?;
        partial.file()?.write_all(b"payload")?;
        assert!(partial_path(&target).exists());
        assert!(!target.exists());

        partial.commit()?;
        assert_eq!(fs::read(&target)?, b"payload");
        assert!(!partial_path(&target).exists());
        Ok(())
    }

    #[test]
    fn test_drop_removes_partial() -> io::Result<()> {
        let dir = TempDir::new()?;
        let target = dir.path().join("archive.tar.gz");

        {
            let mut partial = PartialFile::create(&target)?;
            partial.file()?.write_all(b"half")?;
        }

        assert_eq!(fs::read_dir(dir.path())?.count(), 0);
        Ok(())
    }

    #[test]
    fn test_write_atomic_replaces_stale_partial() -> io::Result<()> {
        let dir = TempDir::new()?;
        let target = dir.path().join("journal.json");
        fs::write(partial_path(&target), b"stale")?;

        write_atomic(&target, b"{}")?;
        assert_eq!(fs::read(&target)?, b"{}");
        assert!(!partial_path(&target).exists());
        Ok(())
    }
}
