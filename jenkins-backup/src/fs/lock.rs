//! Exclusive lock on the producer work directory.
//!
//! The lock is an advisory `flock` on a file inside the work directory. It
//! is released when [`WorkLock`] drops, and by the kernel when the process
//! exits for any reason.

use crate::utils::errors::{BackupError, Result};
use fs4::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

const LOCK_FILE: &str = ".jenkins-backup.lock";

/// Held for the lifetime of one producer run
#[derive(Debug)]
pub struct WorkLock {
    file: File,
    path: PathBuf,
}

impl WorkLock {
    /// Take the lock without waiting; a held lock is reported as [`BackupError::Locked`]
    pub fn acquire(work_dir: &Path) -> Result<Self> {
        fs::create_dir_all(work_dir)?;
        let path = work_dir.join(LOCK_FILE);

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                debug!(path = %path.display(), "Work directory locked");
                Ok(Self { file, path })
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => Err(BackupError::Locked(path)),
            Err(e) => Err(e.into()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WorkLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}
