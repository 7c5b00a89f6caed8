//! File system helpers: overlay traversal and crash-safe writes.

pub mod atomic;
pub mod walker;
