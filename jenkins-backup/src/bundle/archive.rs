//! Tar/zstd archiving of live state and bundle packaging.
//!
//! The state archive stores the live root under its absolute path with the
//! leading `/` removed (`/var/lib/jenkins/config.xml` becomes
//! `var/lib/jenkins/config.xml`). Headers carry uid/gid, mode and mtime;
//! extended attributes (including POSIX ACLs) travel as `SCHILY.xattr.*` PAX
//! records ahead of their entry.

use super::{STATE_ARCHIVE_MEMBER, METADATA_MEMBER};
use crate::fs::metadata::read_xattrs;
use crate::fs::walker::{walk_tree, EntryKind};
use crate::utils::errors::{BackupError, Result};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

const XATTR_PAX_PREFIX: &str = "SCHILY.xattr.";

/// Totals of an archive run
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveStats {
    pub entries: usize,
    pub files: usize,
    pub bytes: u64,
}

/// Producer-side archiving
pub trait ArchiveWriter: Send + Sync {
    /// Archive `live_root` into the tar file `dest`
    fn write_state_archive(&self, live_root: &Path, dest: &Path) -> Result<ArchiveStats>;

    /// Package every member of `staging` into the compressed bundle `dest`
    fn package(&self, staging: &Path, dest: &Path) -> Result<u64>;
}

/// tar + zstd implementation
#[derive(Debug, Clone)]
pub struct TarZstArchiver {
    level: i32,
}

impl TarZstArchiver {
    pub fn new(level: i32) -> Self {
        Self { level }
    }
}

impl Default for TarZstArchiver {
    fn default() -> Self {
        Self::new(3)
    }
}

impl ArchiveWriter for TarZstArchiver {
    fn write_state_archive(&self, live_root: &Path, dest: &Path) -> Result<ArchiveStats> {
        let prefix = member_prefix(live_root)?;
        let mut builder = tar::Builder::new(BufWriter::new(File::create(dest)?));
        builder.follow_symlinks(false);
        builder.mode(tar::HeaderMode::Complete);

        let mut stats = ArchiveStats::default();

        for entry in walk_tree(live_root)? {
            if entry.kind == EntryKind::Special {
                warn!(path = %entry.path.display(), "Skipping special file");
                continue;
            }

            let name = prefix.join(&entry.relative_path);

            let xattrs = read_xattrs(&entry.path);
            if !xattrs.is_empty() {
                let records: Vec<(String, Vec<u8>)> = xattrs
                    .into_iter()
                    .map(|(k, v)| (format!("{}{}", XATTR_PAX_PREFIX, k), v))
                    .collect();
                builder.append_pax_extensions(
                    records.iter().map(|(k, v)| (k.as_str(), v.as_slice())),
                )?;
            }

            builder
                .append_path_with_name(&entry.path, &name)
                .map_err(|e| {
                    BackupError::Archive(format!("{}: {}", entry.path.display(), e))
                })?;

            stats.entries += 1;
            if entry.kind == EntryKind::File {
                stats.files += 1;
                stats.bytes += entry.size;
            }
        }

        let mut writer = builder.into_inner()?;
        writer.flush()?;
        writer
            .into_inner()
            .map_err(|e| BackupError::Io(e.into_error()))?
            .sync_all()?;

        debug!(root = %live_root.display(), entries = stats.entries, "State archive written");
        Ok(stats)
    }

    fn package(&self, staging: &Path, dest: &Path) -> Result<u64> {
        if !staging.join(STATE_ARCHIVE_MEMBER).is_file() {
            return Err(BackupError::MissingMember {
                bundle: staging.to_path_buf(),
                member: STATE_ARCHIVE_MEMBER.to_string(),
            });
        }

        let encoder = zstd::Encoder::new(BufWriter::new(File::create(dest)?), self.level)?;
        let mut builder = tar::Builder::new(encoder);
        builder.follow_symlinks(false);

        for entry in walk_tree(staging)? {
            if entry.relative_path.as_os_str().is_empty() {
                continue;
            }
            builder.append_path_with_name(&entry.path, &entry.relative_path)?;
        }

        let mut writer = builder.into_inner()?.finish()?;
        writer.flush()?;
        let file = writer
            .into_inner()
            .map_err(|e| BackupError::Io(e.into_error()))?;
        file.sync_all()?;

        Ok(file.metadata()?.len())
    }
}

/// Archive member prefix for a live root: its absolute path without the leading `/`
pub fn member_prefix(live_root: &Path) -> Result<PathBuf> {
    if !live_root.is_absolute() {
        return Err(BackupError::Archive(format!(
            "live root must be absolute: {}",
            live_root.display()
        )));
    }
    let prefix: PathBuf = live_root
        .components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .collect();
    if prefix.as_os_str().is_empty() {
        return Err(BackupError::Archive("refusing to archive /".to_string()));
    }
    Ok(prefix)
}

/// Unpack a bundle into `workspace`. The state archive member is required;
/// a missing `METADATA` is only logged.
pub fn unpack_bundle(bundle: &Path, workspace: &Path) -> Result<()> {
    let decoder = zstd::Decoder::new(BufReader::new(File::open(bundle)?))?;
    let mut archive = tar::Archive::new(decoder);
    archive
        .unpack(workspace)
        .map_err(|e| BackupError::Archive(format!("{}: {}", bundle.display(), e)))?;

    if !workspace.join(STATE_ARCHIVE_MEMBER).is_file() {
        return Err(BackupError::MissingMember {
            bundle: bundle.to_path_buf(),
            member: STATE_ARCHIVE_MEMBER.to_string(),
        });
    }
    if !workspace.join(METADATA_MEMBER).is_file() {
        warn!(bundle = %bundle.display(), "Bundle has no {} member", METADATA_MEMBER);
    }

    Ok(())
}

/// Member names of a bundle, read without unpacking
pub fn list_members(bundle: &Path) -> Result<Vec<String>> {
    let decoder = zstd::Decoder::new(BufReader::new(File::open(bundle)?))?;
    let mut archive = tar::Archive::new(decoder);
    let mut names = Vec::new();
    for entry in archive
        .entries()
        .map_err(|e| BackupError::Archive(format!("{}: {}", bundle.display(), e)))?
    {
        let entry =
            entry.map_err(|e| BackupError::Archive(format!("{}: {}", bundle.display(), e)))?;
        names.push(entry.path()?.to_string_lossy().trim_end_matches('/').to_string());
    }
    Ok(names)
}

/// Unpack a state archive below `shadow_root`, recreating the absolute
/// layout it was captured with, and return the path of the captured root
/// inside the shadow tree.
///
/// Ownership and xattrs are restored only when `privileged`.
pub fn unpack_state_archive(
    archive_path: &Path,
    captured_root: &Path,
    shadow_root: &Path,
    privileged: bool,
) -> Result<PathBuf> {
    let mut archive = tar::Archive::new(BufReader::new(File::open(archive_path)?));
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);
    archive.set_preserve_ownerships(privileged);
    archive.set_unpack_xattrs(privileged);
    archive.set_overwrite(true);

    archive
        .unpack(shadow_root)
        .map_err(|e| BackupError::Archive(format!("{}: {}", archive_path.display(), e)))?;

    let restored = shadow_root.join(member_prefix(captured_root)?);
    if !restored.is_dir() {
        return Err(BackupError::Archive(format!(
            "state archive does not contain {}",
            captured_root.display()
        )));
    }

    Ok(restored)
}
