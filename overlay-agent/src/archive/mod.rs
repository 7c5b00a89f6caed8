//! Overlay archives: naming, creation, cataloguing and ingestion.
//!
//! An archive is a compressed tarball of the overlay contents sitting
//! directly in a storage target, next to a `<archive>.manifest.json`
//! sidecar that carries its integrity token.

pub mod builder;
pub mod catalog;
pub mod ingest;
pub mod manifest;
pub mod naming;

use crate::fs::atomic::PARTIAL_SUFFIX;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Component, Path, PathBuf};

pub use builder::ArchiveBuilder;
pub use catalog::ArchiveCatalog;
pub use ingest::IngestionGate;
pub use manifest::Manifest;

/// Accepted archive extensions and the decoder each one selects.
pub const ARCHIVE_EXTENSIONS: &[(&str, Compression)] = &[
    (".tar.gz", Compression::Gzip),
    (".tgz", Compression::Gzip),
    (".tar.zst", Compression::Zstd),
];

/// Compression applied to the tar stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    Gzip,
    Zstd,
}

impl Compression {
    /// Extension given to archives the engine writes.
    pub fn extension(self) -> &'static str {
        match self {
            Compression::Gzip => ".tar.gz",
            Compression::Zstd => ".tar.zst",
        }
    }

    /// Detect compression from an archive file name. `None` means the name
    /// is not an accepted archive name.
    pub fn from_file_name(name: &str) -> Option<Self> {
        ARCHIVE_EXTENSIONS
            .iter()
            .find(|(ext, _)| name.ends_with(ext))
            .map(|(_, compression)| *compression)
    }
}

/// Whether a file name denotes a finished, listable archive.
pub fn is_archive_name(name: &str) -> bool {
    !name.starts_with('.')
        && !name.ends_with(PARTIAL_SUFFIX)
        && Compression::from_file_name(name).is_some()
}

/// A backup file as presented to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchiveRecord {
    pub filename: String,
    pub path: PathBuf,
    pub size: u64,
    pub size_human: String,
    pub modified: DateTime<Utc>,
    /// Display date, matching what the panel shows
    pub date: String,
    /// SHA-256 from the manifest sidecar, when one exists
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

impl ArchiveRecord {
    /// Build a record from an archive on disk.
    pub fn from_path(path: &Path) -> io::Result<Self> {
        let metadata = fs::symlink_metadata(path)?;
        if !metadata.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", path.display()),
            ));
        }
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let modified: DateTime<Utc> = metadata.modified()?.into();
        let sha256 = Manifest::load(path).ok().flatten().map(|m| m.sha256);

        Ok(Self {
            filename,
            path: path.to_path_buf(),
            size: metadata.len(),
            size_human: format_bytes(metadata.len()),
            date: modified
                .with_timezone(&chrono::Local)
                .format("%Y-%m-%d %H:%M:%S")
                .to_string(),
            modified,
            sha256,
        })
    }

    pub fn compression(&self) -> Option<Compression> {
        Compression::from_file_name(&self.filename)
    }
}

/// Totals gathered while reading an archive end to end.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArchiveSummary {
    pub entries: usize,
    pub bytes: u64,
}

/// Open an archive for reading with the decoder its name calls for.
pub fn open_archive(path: &Path, compression: Compression) -> io::Result<tar::Archive<Box<dyn Read>>> {
    let file = BufReader::new(File::open(path)?);
    let reader: Box<dyn Read> = match compression {
        Compression::Gzip => Box::new(flate2::read::GzDecoder::new(file)),
        Compression::Zstd => Box::new(zstd::stream::read::Decoder::new(file)?),
    };
    Ok(tar::Archive::new(reader))
}

/// Read every entry of an archive, checking that the container decodes
/// cleanly and that no entry escapes the extraction root.
pub fn verify_structure(path: &Path, compression: Compression) -> io::Result<ArchiveSummary> {
    let mut archive = open_archive(path, compression)?;
    let mut summary = ArchiveSummary::default();

    for entry in archive.entries()? {
        let mut entry = entry?;
        let entry_path = entry.path()?.into_owned();
        if !is_safe_entry_path(&entry_path) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unsafe entry path {}", entry_path.display()),
            ));
        }
        summary.bytes += io::copy(&mut entry, &mut io::sink())?;
        summary.entries += 1;
    }

    Ok(summary)
}

/// Entry paths must be relative and never climb upwards.
pub fn is_safe_entry_path(path: &Path) -> bool {
    path.components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// First real path component of an entry, ignoring a leading `./`.
pub fn top_level_name(path: &Path) -> Option<String> {
    path.components().find_map(|c| match c {
        Component::Normal(name) => Some(name.to_string_lossy().into_owned()),
        _ => None,
    })
}

/// Hex SHA-256 of a file
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", size, UNITS[unit_index])
    }
}

/// Path of the file holding a sibling of `archive` with an extra suffix.
pub(crate) fn with_suffix(archive: &Path, suffix: &str) -> PathBuf {
    let mut name = archive.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    /// Write a gzip tarball with the given (path, contents) entries.
    pub(crate) fn write_test_archive(path: &Path, entries: &[(&str, &[u8])]) {
        let file = File::create(path).unwrap();
        let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (name, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_entry_type(tar::EntryType::Regular);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    #[test]
    fn test_archive_names() {
        assert!(is_archive_name("overlay-gw-23.05-20240101-120000.tar.gz"));
        assert!(is_archive_name("backup.tgz"));
        assert!(is_archive_name("backup.tar.zst"));
        assert!(!is_archive_name("backup.tar.gz.partial"));
        assert!(!is_archive_name("backup.tar.gz.manifest.json"));
        assert!(!is_archive_name(".hidden.tar.gz"));
        assert!(!is_archive_name("notes.txt"));
    }

    #[test]
    fn test_verify_structure_counts_entries() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ok.tar.gz");
        write_test_archive(&path, &[("upper/a", b"one"), ("upper/b", b"three")]);

        let summary = verify_structure(&path, Compression::Gzip).unwrap();
        assert_eq!(summary.entries, 2);
        assert_eq!(summary.bytes, 8);
    }

    #[test]
    fn test_verify_structure_rejects_garbage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.tar.gz");
        File::create(&path).unwrap().write_all(b"definitely not gzip").unwrap();

        assert!(verify_structure(&path, Compression::Gzip).is_err());
    }

    #[test]
    fn test_verify_structure_rejects_truncation() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cut.tar.gz");
        let payload = vec![7u8; 64 * 1024];
        write_test_archive(&path, &[("upper/big", &payload)]);
        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();

        assert!(verify_structure(&path, Compression::Gzip).is_err());
    }

    #[test]
    fn test_safe_entry_paths() {
        assert!(is_safe_entry_path(Path::new("upper/etc/config")));
        assert!(is_safe_entry_path(Path::new("./upper")));
        assert!(!is_safe_entry_path(Path::new("../etc/passwd")));
        assert!(!is_safe_entry_path(Path::new("/etc/passwd")));
        assert_eq!(top_level_name(Path::new("./upper/etc")), Some("upper".to_string()));
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.00 MB");
    }
}
