//! File system operations: traversal, metadata, copies and locking.

pub mod copy;
pub mod lock;
pub mod metadata;
pub mod walker;
