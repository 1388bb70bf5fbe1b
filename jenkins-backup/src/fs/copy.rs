//! Recursive copies, directory swaps and atomic file placement.

use super::metadata::FileMetadata;
use super::walker::{walk_tree, EntryKind};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Totals of a finished copy
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CopyStats {
    pub files: usize,
    pub bytes: u64,
}

/// Copy `src` to `dst` recursively, preserving symlinks, modes and mtimes
/// (plus ownership and xattrs when `privileged`).
///
/// `dst` must not exist yet.
pub fn copy_tree(src: &Path, dst: &Path, privileged: bool) -> io::Result<CopyStats> {
    if dst.exists() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} already exists", dst.display()),
        ));
    }

    let entries = walk_tree(src)?;
    let mut stats = CopyStats::default();
    let mut applied = Vec::with_capacity(entries.len());

    for entry in &entries {
        let target = if entry.relative_path.as_os_str().is_empty() {
            dst.to_path_buf()
        } else {
            dst.join(&entry.relative_path)
        };

        match entry.kind {
            EntryKind::Dir => fs::create_dir(&target)?,
            EntryKind::File => {
                stats.bytes += fs::copy(&entry.path, &target)?;
                stats.files += 1;
            }
            EntryKind::Symlink => {
                let link = fs::read_link(&entry.path)?;
                std::os::unix::fs::symlink(&link, &target)?;
            }
            EntryKind::Special => {
                warn!(path = %entry.path.display(), "Skipping special file");
                continue;
            }
        }

        applied.push((FileMetadata::from_path(&entry.path)?, target));
    }

    // Children first so read-only directories are locked down last
    for (metadata, target) in applied.iter().rev() {
        metadata.apply_to_path(target, privileged)?;
    }

    debug!(src = %src.display(), dst = %dst.display(), files = stats.files, "Tree copied");
    Ok(stats)
}

/// Remove a tree if it exists
pub fn remove_tree(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Replace `live` with `incoming` using two renames on the same filesystem.
///
/// The displaced tree is parked at `outgoing` and removed afterwards; a
/// failure to remove it is only logged.
pub fn swap_dir(incoming: &Path, live: &Path, outgoing: &Path) -> io::Result<()> {
    let had_live = live.exists();
    if had_live {
        fs::rename(live, outgoing)?;
    }

    if let Err(e) = fs::rename(incoming, live) {
        if had_live {
            // Put the old tree back so the caller sees the pre-swap state
            if let Err(back) = fs::rename(outgoing, live) {
                warn!(path = %outgoing.display(), error = %back, "Failed to move displaced tree back");
            }
        }
        return Err(e);
    }

    if had_live {
        if let Err(e) = remove_tree(outgoing) {
            warn!(path = %outgoing.display(), error = %e, "Failed to remove displaced tree");
        }
    }

    Ok(())
}

/// Place `src` at `dest_dir/name` so readers never observe a partial file.
///
/// Tries a rename first; across filesystems the file is copied to a hidden
/// `.partial` name, synced, then renamed.
pub fn persist_file(src: &Path, dest_dir: &Path, name: &str) -> io::Result<PathBuf> {
    let final_path = dest_dir.join(name);

    if fs::rename(src, &final_path).is_ok() {
        return Ok(final_path);
    }

    let partial = dest_dir.join(format!(".{}.partial", name));
    let result = (|| {
        fs::copy(src, &partial)?;
        fs::File::open(&partial)?.sync_all()?;
        fs::rename(&partial, &final_path)
    })();

    if let Err(e) = result {
        let _ = fs::remove_file(&partial);
        return Err(e);
    }

    let _ = fs::remove_file(src);
    Ok(final_path)
}
