//! Directory traversal shared by archiving and the safety copy.
//!
//! Symlinks are never followed: they are reported as links so both the
//! archiver and the copier can recreate them verbatim.

use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// Type of a tree entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Dir,
    File,
    Symlink,
    /// Sockets, FIFOs, devices
    Special,
}

/// Information about an entry discovered during walking
#[derive(Debug, Clone)]
pub struct TreeEntry {
    /// Full path to the entry
    pub path: PathBuf,

    /// Path relative to the walk root (empty for the root itself)
    pub relative_path: PathBuf,

    pub kind: EntryKind,

    /// File size in bytes (0 for non-files)
    pub size: u64,
}

impl TreeEntry {
    fn from_entry(entry: &DirEntry, root: &Path) -> std::io::Result<Self> {
        let path = entry.path().to_path_buf();
        let relative_path = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
        let file_type = entry.file_type();

        let kind = if file_type.is_symlink() {
            EntryKind::Symlink
        } else if file_type.is_dir() {
            EntryKind::Dir
        } else if file_type.is_file() {
            EntryKind::File
        } else {
            EntryKind::Special
        };

        let size = if kind == EntryKind::File {
            entry.metadata()?.len()
        } else {
            0
        };

        Ok(Self {
            path,
            relative_path,
            kind,
            size,
        })
    }
}

/// Walk a tree, parents before children, siblings in name order.
///
/// The root itself is the first entry.
pub fn walk_tree(root: &Path) -> std::io::Result<Vec<TreeEntry>> {
    let mut entries = Vec::new();

    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name();

    for entry in walker {
        let entry = entry?;
        entries.push(TreeEntry::from_entry(&entry, root)?);
    }

    Ok(entries)
}

/// File count and total bytes of a tree
pub fn tree_size(root: &Path) -> std::io::Result<(usize, u64)> {
    let entries = walk_tree(root)?;
    let files = entries.iter().filter(|e| e.kind == EntryKind::File);
    Ok(files.fold((0, 0), |(count, bytes), e| (count + 1, bytes + e.size)))
}
