//! Deterministic archive names.
//!
//! `overlay-<device>-<firmware>-<YYYYmmdd-HHMMSS><ext>`, with `-N` inserted
//! before the extension when the name is already taken at the target.

use super::{with_suffix, Compression, ARCHIVE_EXTENSIONS};
use crate::fs::atomic::partial_path;
use chrono::{DateTime, Local};
use serde::Serialize;
use std::fs;
use std::path::Path;

const NAME_PREFIX: &str = "overlay";

/// Who produced an archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub firmware: String,
}

impl DeviceIdentity {
    /// Identity from the configured device id and the firmware release file.
    pub fn detect(device_id: &str, release_file: &Path) -> Self {
        let firmware = fs::read_to_string(release_file)
            .ok()
            .and_then(|content| parse_release(&content))
            .unwrap_or_else(|| "unknown".to_string());
        Self {
            device_id: device_id.to_string(),
            firmware,
        }
    }

    /// Base name (without collision suffix) for an archive created at `now`.
    pub fn archive_name(&self, now: DateTime<Local>, compression: Compression) -> String {
        format!(
            "{}-{}-{}-{}{}",
            NAME_PREFIX,
            sanitize(&self.device_id),
            sanitize(&self.firmware),
            now.format("%Y%m%d-%H%M%S"),
            compression.extension()
        )
    }
}

/// Pull `DISTRIB_RELEASE` out of an OpenWrt-style release file.
fn parse_release(content: &str) -> Option<String> {
    content.lines().find_map(|line| {
        let value = line.trim().strip_prefix("DISTRIB_RELEASE=")?;
        let value = value.trim_matches(|c| c == '\'' || c == '"');
        (!value.is_empty()).then(|| value.to_string())
    })
}

/// Keep names portable across the filesystems found on USB sticks.
pub fn sanitize(part: &str) -> String {
    let cleaned: String = part
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_matches('.').to_string();
    if cleaned.is_empty() {
        "unknown".to_string()
    } else {
        cleaned
    }
}

/// Split an archive file name into stem and accepted extension.
pub fn split_extension(name: &str) -> Option<(&str, &str)> {
    ARCHIVE_EXTENSIONS
        .iter()
        .find_map(|(ext, _)| name.strip_suffix(ext).map(|stem| (stem, *ext)))
        .filter(|(stem, _)| !stem.is_empty())
}

/// First free variant of `name` in `dir`: the name itself, then `stem-1.ext`,
/// `stem-2.ext`, ... A name counts as taken if the archive, its partial
/// file or its manifest exists.
pub fn next_available(dir: &Path, name: &str) -> String {
    let taken = |candidate: &str| {
        let path = dir.join(candidate);
        path.exists()
            || partial_path(&path).exists()
            || with_suffix(&path, super::manifest::MANIFEST_SUFFIX).exists()
    };

    if !taken(name) {
        return name.to_string();
    }

    let (stem, ext) = split_extension(name).unwrap_or((name, ""));
    (1u32..)
        .map(|n| format!("{}-{}{}", stem, n, ext))
        .find(|candidate| !taken(candidate))
        .unwrap_or_else(|| name.to_string())
}
