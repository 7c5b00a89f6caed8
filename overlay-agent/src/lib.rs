//! Overlay Agent Library
//!
//! Backup and restore engine for a router's writable overlay filesystem:
//! storage target discovery, archive creation and cataloguing, upload
//! admission, and crash-safe restore with reboot hand-off.

pub mod api;
pub mod archive;
pub mod config;
pub mod daemon;
pub mod engine;
pub mod fs;
pub mod restore;
pub mod storage;
pub mod utils;
pub mod ws;

// Re-export commonly used types
pub use config::Config;
pub use engine::{Engine, EngineEvent, EngineState};
pub use utils::errors::{EngineError, Result};
