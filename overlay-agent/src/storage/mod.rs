//! Storage target discovery.
//!
//! A storage target is a directory allowed to hold archives: the internal
//! temporary location plus every mounted external device. Targets are
//! rediscovered on every call and never cached, so a stick pulled between
//! discovery and use is caught at use time.

use crate::config::StorageConfig;
use crate::{EngineError, Result};
use nix::unistd::{access, AccessFlags};
use serde::Serialize;
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

/// A candidate backup location, snapshotted at discovery time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StorageTarget {
    pub path: PathBuf,
    pub label: String,
    pub writable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub free_bytes: Option<u64>,
    pub external: bool,
}

impl StorageTarget {
    fn probe(path: PathBuf, label: String, external: bool, read_only_mount: bool) -> Self {
        let writable = !read_only_mount && access(&path, AccessFlags::W_OK).is_ok();
        let free_bytes = available_bytes(&path);
        Self {
            path,
            label,
            writable,
            free_bytes,
            external,
        }
    }
}

/// Enumerates and re-validates storage targets.
#[derive(Debug, Clone)]
pub struct StorageLocator {
    default_target: PathBuf,
    default_label: String,
    mounts_file: PathBuf,
    external_roots: Vec<PathBuf>,
}

impl StorageLocator {
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            default_target: config.default_target.clone(),
            default_label: config.default_label.clone(),
            mounts_file: config.mounts_file.clone(),
            external_roots: config.external_roots.clone(),
        }
    }

    /// Discover targets: the internal default first, then external mounts in
    /// mount-table order. Never fails; a broken mount table yields just the
    /// default target.
    pub fn discover_targets(&self) -> Vec<StorageTarget> {
        if let Err(e) = fs::create_dir_all(&self.default_target) {
            warn!(
                "Cannot create default target {}: {}",
                self.default_target.display(),
                e
            );
        }

        let mut targets = vec![StorageTarget::probe(
            self.default_target.clone(),
            self.default_label.clone(),
            false,
            false,
        )];

        match fs::read_to_string(&self.mounts_file) {
            Ok(table) => {
                for mount in parse_mount_table(&table) {
                    if !self.is_external(&mount.mount_point) {
                        continue;
                    }
                    if targets.iter().any(|t| t.path == mount.mount_point) {
                        continue;
                    }
                    let label = format!("{} ({})", mount.mount_point.display(), mount.device);
                    targets.push(StorageTarget::probe(
                        mount.mount_point,
                        label,
                        true,
                        mount.read_only,
                    ));
                }
            }
            Err(e) => {
                warn!(
                    "Failed to read mount table {}: {}, offering default target only",
                    self.mounts_file.display(),
                    e
                );
            }
        }

        debug!("Discovered {} storage target(s)", targets.len());
        targets
    }

    /// Check that a caller-supplied path is one of the currently discovered
    /// targets.
    pub fn resolve_target(&self, path: &Path) -> Result<StorageTarget> {
        let wanted = normalize(path)?;
        self.discover_targets()
            .into_iter()
            .find(|t| t.path == wanted)
            .ok_or_else(|| EngineError::NotFound(format!("storage target {}", path.display())))
    }

    /// Locate an archive path inside a currently discovered target.
    ///
    /// Archives live directly in a target root. Anything else (relative
    /// paths, `..` components, nested directories, symlinked roots) is
    /// rejected with `PermissionDenied` whether or not the file exists.
    pub fn locate_archive(&self, path: &Path) -> Result<(StorageTarget, PathBuf)> {
        let denied = || {
            EngineError::PermissionDenied(format!(
                "{} is outside approved storage",
                path.display()
            ))
        };

        let path = normalize(path).map_err(|_| denied())?;
        let parent = path.parent().ok_or_else(denied)?;
        let file_name = path.file_name().ok_or_else(denied)?;

        let target = self
            .discover_targets()
            .into_iter()
            .find(|t| t.path == parent)
            .ok_or_else(denied)?;

        // The lexical check above is defeated by a symlinked target; compare
        // the resolved directories as well.
        let real_parent = fs::canonicalize(parent).map_err(|_| denied())?;
        let real_target = fs::canonicalize(&target.path).map_err(|_| denied())?;
        if real_parent != real_target {
            return Err(denied());
        }

        Ok((target, real_target.join(file_name)))
    }

    fn is_external(&self, mount_point: &Path) -> bool {
        self.external_roots
            .iter()
            .any(|root| mount_point.starts_with(root) && mount_point != root)
    }
}

/// Free space available to unprivileged writers, if the filesystem reports it.
pub fn available_bytes(path: &Path) -> Option<u64> {
    nix::sys::statvfs::statvfs(path)
        .ok()
        .map(|s| (s.blocks_available() as u64).saturating_mul(s.fragment_size() as u64))
}

#[derive(Debug, PartialEq, Eq)]
struct MountEntry {
    device: String,
    mount_point: PathBuf,
    read_only: bool,
}

fn parse_mount_table(table: &str) -> Vec<MountEntry> {
    table
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let device = fields.next()?;
            let mount_point = fields.next()?;
            let _fs_type = fields.next()?;
            let options = fields.next().unwrap_or("");
            Some(MountEntry {
                device: unescape_mount_field(device),
                mount_point: PathBuf::from(unescape_mount_field(mount_point)),
                read_only: options.split(',').any(|o| o == "ro"),
            })
        })
        .collect()
}

/// Undo the octal escaping the kernel applies to spaces, tabs and
/// backslashes in /proc/mounts.
fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let value = std::str::from_utf8(&bytes[i + 1..i + 4])
                .ok()
                .and_then(|digits| u8::from_str_radix(digits, 8).ok());
            if let Some(value) = value {
                out.push(value);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Lexically normalize an absolute path, refusing `..` so a request can never
/// climb out of a target.
fn normalize(path: &Path) -> Result<PathBuf> {
    if !path.is_absolute() {
        return Err(EngineError::NotFound(format!(
            "{} is not an absolute path",
            path.display()
        )));
    }
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::RootDir => out.push("/"),
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::Prefix(_) => {
                return Err(EngineError::NotFound(format!(
                    "{} contains a parent reference",
                    path.display()
                )))
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    pub(crate) fn locator_in(dir: &Path, mounts: &str) -> StorageLocator {
        let mounts_file = dir.join("mounts");
        fs::write(&mounts_file, mounts).unwrap();
        StorageLocator::new(&StorageConfig {
            default_target: dir.join("upload"),
            default_label: "Internal".to_string(),
            mounts_file,
            external_roots: vec![dir.join("mnt")],
            min_free_bytes: 0,
        })
    }

    #[test]
    fn test_default_target_only() {
        let dir = TempDir::new().unwrap();
        let locator = locator_in(dir.path(), "proc /proc proc rw 0 0\n");

        let targets = locator.discover_targets();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].path, dir.path().join("upload"));
        assert!(targets[0].writable);
        assert!(!targets[0].external);
    }

    #[test]
    fn test_unreadable_mount_table_falls_back() {
        let dir = TempDir::new().unwrap();
        let locator = StorageLocator::new(&StorageConfig {
            default_target: dir.path().join("upload"),
            default_label: "Internal".to_string(),
            mounts_file: dir.path().join("missing"),
            external_roots: vec![dir.path().join("mnt")],
            min_free_bytes: 0,
        });

        let targets = locator.discover_targets();
        assert_eq!(targets.len(), 1);
        assert!(targets[0].writable);
    }

    #[test]
    fn test_external_mounts_in_table_order() {
        let dir = TempDir::new().unwrap();
        let usb = dir.path().join("mnt/usb");
        let sd = dir.path().join("mnt/sd card");
        fs::create_dir_all(&usb).unwrap();
        fs::create_dir_all(&sd).unwrap();

        let table = format!(
            "/dev/sdb1 {} ext4 rw,relatime 0 0\n/dev/root /rom squashfs ro 0 0\n/dev/mmcblk0p1 {} vfat ro 0 0\n",
            usb.display(),
            sd.display().to_string().replace(' ', "\\040"),
        );
        let locator = locator_in(dir.path(), &table);

        let targets = locator.discover_targets();
        assert_eq!(targets.len(), 3);
        assert_eq!(targets[1].path, usb);
        assert!(targets[1].writable);
        assert!(targets[1].external);
        assert_eq!(targets[2].path, sd);
        assert!(!targets[2].writable);
    }

    #[test]
    fn test_resolve_target_rejects_unknown() {
        let dir = TempDir::new().unwrap();
        let locator = locator_in(dir.path(), "");

        assert!(locator.resolve_target(&dir.path().join("upload")).is_ok());
        assert!(locator.resolve_target(&dir.path().join("upload/")).is_ok());
        assert!(matches!(
            locator.resolve_target(Path::new("/etc")),
            Err(EngineError::NotFound(_))
        ));
        assert!(matches!(
            locator.resolve_target(Path::new("upload")),
            Err(EngineError::NotFound(_))
        ));
    }

    #[test]
    fn test_locate_archive_rejects_traversal() {
        let dir = TempDir::new().unwrap();
        let locator = locator_in(dir.path(), "");
        let upload = dir.path().join("upload");
        locator.discover_targets();

        assert!(locator.locate_archive(&upload.join("a.tar.gz")).is_ok());

        for bad in [
            upload.join("../mounts"),
            upload.join("nested/a.tar.gz"),
            PathBuf::from("/etc/passwd"),
            PathBuf::from("a.tar.gz"),
        ] {
            assert!(
                matches!(locator.locate_archive(&bad), Err(EngineError::PermissionDenied(_))),
                "{} should be denied",
                bad.display()
            );
        }
    }

    #[test]
    fn test_unescape_mount_field() {
        assert_eq!(unescape_mount_field("/mnt/my\\040disk"), "/mnt/my disk");
        assert_eq!(unescape_mount_field("/mnt/plain"), "/mnt/plain");
        assert_eq!(unescape_mount_field("/mnt/x\\"), "/mnt/x\\");
    }
}
