//! Error taxonomy for the backup and restore pipelines.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Another backup is already running (lock held on {0})")]
    Locked(PathBuf),

    #[error("Digest mismatch for {path}: expected {expected}, computed {actual}")]
    DigestMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("Invalid digest file {0}")]
    InvalidDigestFile(PathBuf),

    #[error("Bundle {bundle} is missing required member {member}")]
    MissingMember { bundle: PathBuf, member: String },

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Safety copy failed: {0}")]
    Snapshot(String),

    #[error("Command `{command}` failed: {reason}")]
    Command { command: String, reason: String },

    #[error("Restore failed ({reason}) and was rolled back; safety copy kept at {}", safety_copy.display())]
    RolledBack { safety_copy: PathBuf, reason: String },

    #[error("Rollback failed, live state may be inconsistent ({reason}); safety copy kept at {}", safety_copy.display())]
    RollbackFailed { safety_copy: PathBuf, reason: String },

    #[error("Interrupted")]
    Interrupted,
}

impl BackupError {
    /// Failures raised before any state was mutated.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            BackupError::Config(_)
                | BackupError::FileNotFound(_)
                | BackupError::PermissionDenied(_)
                | BackupError::Locked(_)
                | BackupError::DigestMismatch { .. }
                | BackupError::InvalidDigestFile(_)
        )
    }

    /// Process exit code for this failure.
    pub fn exit_code(&self) -> u8 {
        match self {
            BackupError::RollbackFailed { .. } => 4,
            BackupError::RolledBack { .. } => 3,
            BackupError::Interrupted => 130,
            e if e.is_precondition() => 2,
            _ => 1,
        }
    }

    pub(crate) fn command(command: impl Into<String>, reason: impl ToString) -> Self {
        BackupError::Command {
            command: command.into(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
