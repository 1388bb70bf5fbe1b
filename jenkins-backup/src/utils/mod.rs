//! Utility modules shared by the pipelines.

pub mod errors;
pub mod format;
pub mod logger;
pub mod shutdown;

pub use errors::{BackupError, Result};
