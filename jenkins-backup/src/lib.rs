//! jenkins-backup library
//!
//! Produces checksummed point-in-time bundles of a Jenkins host and
//! restores them with a safety copy, a health check and automatic rollback.

pub mod bundle;
pub mod config;
pub mod executor;
pub mod fs;
pub mod health;
pub mod jenkins;
pub mod service;
pub mod utils;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use config::Config;
pub use utils::errors::BackupError;
pub type Result<T> = std::result::Result<T, BackupError>;
