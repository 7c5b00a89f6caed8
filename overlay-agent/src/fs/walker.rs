//! Overlay traversal for snapshots.
//!
//! Walks the overlay root without following symlinks, in a stable
//! (name-sorted) order, skipping excluded top-level entries.

use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// Top-level names the engine itself creates inside the overlay root.
pub const INTERNAL_PREFIXES: &[&str] = &[".restore-staging-", ".restore-previous-", ".restore-journal"];

/// Options for walking the overlay
#[derive(Debug, Clone, Default)]
pub struct WalkOptions {
    /// Top-level entry names to leave out
    pub exclude_top_level: Vec<String>,
}

impl WalkOptions {
    pub fn excluding(names: &[String]) -> Self {
        Self {
            exclude_top_level: names.to_vec(),
        }
    }

    /// Whether a top-level name belongs to the overlay contents proper.
    pub fn is_managed(&self, name: &str) -> bool {
        !is_internal(name) && !self.exclude_top_level.iter().any(|e| e == name)
    }
}

/// Whether a top-level name is engine bookkeeping.
pub fn is_internal(name: &str) -> bool {
    INTERNAL_PREFIXES.iter().any(|p| name.starts_with(p))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Dir,
    File,
    Symlink,
    /// Devices, fifos and sockets, e.g. overlayfs whiteouts
    Special,
}

/// An entry discovered during walking
#[derive(Debug, Clone)]
pub struct OverlayEntry {
    /// Full path to the entry
    pub path: PathBuf,

    /// Relative path from the root
    pub relative_path: PathBuf,

    /// Size in bytes (regular files only)
    pub size: u64,

    pub kind: EntryKind,
}

impl OverlayEntry {
    fn from_entry(entry: &DirEntry, root: &Path) -> std::io::Result<Self> {
        let path = entry.path().to_path_buf();
        let relative_path = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
        let file_type = entry.file_type();

        let (kind, size) = if file_type.is_symlink() {
            (EntryKind::Symlink, 0)
        } else if file_type.is_dir() {
            (EntryKind::Dir, 0)
        } else if file_type.is_file() {
            (EntryKind::File, entry.metadata()?.len())
        } else {
            (EntryKind::Special, 0)
        };

        Ok(Self {
            path,
            relative_path,
            size,
            kind,
        })
    }
}

/// Walk the overlay and collect every entry below the root, parents before
/// children.
pub fn walk_overlay(root: &Path, options: &WalkOptions) -> std::io::Result<Vec<OverlayEntry>> {
    let mut entries = Vec::new();

    let walker = WalkDir::new(root)
        .follow_links(false)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !should_exclude(e, options));

    for entry in walker {
        let entry = entry?;
        entries.push(OverlayEntry::from_entry(&entry, root)?);
    }

    Ok(entries)
}

fn should_exclude(entry: &DirEntry, options: &WalkOptions) -> bool {
    if entry.depth() != 1 {
        return false;
    }
    let name = entry.file_name().to_string_lossy();
    !options.is_managed(&name)
}
