//! Keep-newest-N pruning of the backup directory.

use super::{digest_path, list_bundles};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Delete every bundle but the newest `keep`, together with its digest file.
///
/// Returns the deleted bundle paths, newest first.
pub fn prune(dir: &Path, keep: usize) -> io::Result<Vec<PathBuf>> {
    let mut removed = Vec::new();

    for old in list_bundles(dir)?.into_iter().skip(keep) {
        fs::remove_file(&old.path)?;

        let sidecar = digest_path(&old.path);
        match fs::remove_file(&sidecar) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        tracing::info!(bundle = %old.path.display(), "Removed old bundle");
        removed.push(old.path);
    }

    Ok(removed)
}
