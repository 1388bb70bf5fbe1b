//! File metadata handling for backup and restore.
//!
//! Ownership, mode bits, file mtimes and extended attributes (which carry
//! POSIX ACLs) are captured from the live tree and re-applied to copies.
//! Ownership and xattrs can only be re-applied by root.

use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;
use std::time::{Duration, SystemTime};

/// Whether the process may restore ownership and privileged xattrs
pub fn running_as_root() -> bool {
    nix::unistd::geteuid().is_root()
}

/// Complete metadata of a single tree entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetadata {
    pub uid: u32,
    pub gid: u32,

    /// Unix mode bits (permissions only)
    pub mode: u32,

    /// Last modified time (seconds since Unix epoch)
    pub modified: i64,

    pub is_dir: bool,
    pub is_symlink: bool,

    /// Extended attributes, by name
    pub xattrs: BTreeMap<String, Vec<u8>>,
}

impl FileMetadata {
    /// Extract metadata from a path without following symlinks
    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        let metadata = fs::symlink_metadata(path)?;

        Ok(Self {
            uid: metadata.uid(),
            gid: metadata.gid(),
            mode: metadata.mode() & 0o7777,
            modified: metadata.mtime(),
            is_dir: metadata.is_dir(),
            is_symlink: metadata.file_type().is_symlink(),
            xattrs: read_xattrs(path),
        })
    }

    /// Apply this metadata to a path.
    ///
    /// Ownership and xattrs are applied only when `privileged` is set.
    /// Mode changes are applied after chown since chown clears setuid bits.
    pub fn apply_to_path(&self, path: &Path, privileged: bool) -> std::io::Result<()> {
        if privileged {
            std::os::unix::fs::lchown(path, Some(self.uid), Some(self.gid))?;
            for (name, value) in &self.xattrs {
                xattr::set(path, name, value)?;
            }
        }

        if self.is_symlink {
            return Ok(());
        }

        if !self.is_dir && self.modified >= 0 {
            let mtime = SystemTime::UNIX_EPOCH + Duration::from_secs(self.modified as u64);
            fs::File::open(path)?.set_modified(mtime)?;
        }

        fs::set_permissions(path, fs::Permissions::from_mode(self.mode))
    }
}

/// Read all extended attributes; unsupported filesystems yield none
pub fn read_xattrs(path: &Path) -> BTreeMap<String, Vec<u8>> {
    let mut attrs = BTreeMap::new();

    let names = match xattr::list(path) {
        Ok(names) => names,
        Err(_) => return attrs,
    };

    for name in names {
        let Some(key) = name.to_str() else { continue };
        if let Ok(Some(value)) = xattr::get(path, &name) {
            attrs.insert(key.to_string(), value);
        }
    }

    attrs
}
