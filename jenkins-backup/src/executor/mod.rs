//! Pipelines - the bundle producer and the restore executor.
//!
//! Both run strictly sequentially. Filesystem-heavy steps go through
//! [`blocking`] so the runtime stays responsive to signals and timers, but
//! every step is awaited before the next one starts.

pub mod backup;
pub mod restore;

use crate::utils::errors::{BackupError, Result};
use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Run a blocking filesystem step on the blocking pool and wait for it
pub(crate) async fn blocking<T, E, F>(f: F) -> Result<T>
where
    F: FnOnce() -> std::result::Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: Into<BackupError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| BackupError::Io(std::io::Error::other(e)))?
        .map_err(Into::into)
}

/// `<dir>/<name><suffix>` for a path `<dir>/<name>`
pub(crate) fn sibling(path: &Path, prefix: &str, suffix: &str) -> PathBuf {
    let mut name = OsString::from(prefix);
    name.push(path.file_name().unwrap_or(path.as_os_str()));
    name.push(suffix);
    path.with_file_name(name)
}
