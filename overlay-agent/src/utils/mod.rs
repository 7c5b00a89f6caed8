//! Utility modules for the overlay agent.

pub mod errors;
pub mod logger;

pub use errors::{EngineError, Result};
