//! Error types for the overlay backup engine.
//!
//! Every failure the engine can report maps to exactly one variant, so the
//! caller can branch on `code()` without parsing messages.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage target is not writable: {0}")]
    StorageUnwritable(String),

    #[error("Insufficient space: {needed} bytes needed, {available} available")]
    InsufficientSpace { needed: u64, available: u64 },

    #[error("Snapshot failed: {0}")]
    SnapshotFailed(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Upload rejected: {0}")]
    RejectedUpload(String),

    #[error("Archive not found: {0}")]
    ArchiveNotFound(String),

    #[error("Integrity check failed: {0}")]
    IntegrityCheckFailed(String),

    #[error("Extraction failed: {0}")]
    ExtractionFailed(String),

    #[error("Engine busy: {0} in progress")]
    EngineBusy(String),
}

impl EngineError {
    /// Stable machine-readable code for the error.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Config(_) => "config",
            EngineError::Io(_) => "io",
            EngineError::StorageUnwritable(_) => "storage_unwritable",
            EngineError::InsufficientSpace { .. } => "insufficient_space",
            EngineError::SnapshotFailed(_) => "snapshot_failed",
            EngineError::NotFound(_) => "not_found",
            EngineError::PermissionDenied(_) => "permission_denied",
            EngineError::RejectedUpload(_) => "rejected_upload",
            EngineError::ArchiveNotFound(_) => "archive_not_found",
            EngineError::IntegrityCheckFailed(_) => "integrity_check_failed",
            EngineError::ExtractionFailed(_) => "extraction_failed",
            EngineError::EngineBusy(_) => "engine_busy",
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
