//! Directory traversal for embedding source trees into an archive.

use std::path::{Component, Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// Kind of filesystem object found during the walk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Directory,
    File,
    Symlink,
}

/// A filesystem object to embed, with its name inside the archive
#[derive(Debug, Clone)]
pub struct TreeEntry {
    /// Full path on disk
    pub path: PathBuf,

    /// Path inside the archive: the original absolute path without its root
    pub archive_path: PathBuf,

    pub kind: EntryKind,

    /// File size in bytes (0 for directories and symlinks)
    pub size: u64,
}

impl TreeEntry {
    fn from_entry(entry: &DirEntry, archive_root: &Path, root: &Path) -> std::io::Result<Self> {
        let path = entry.path().to_path_buf();
        let archive_path = match path.strip_prefix(root) {
            Ok(relative) if !relative.as_os_str().is_empty() => archive_root.join(relative),
            _ => archive_root.to_path_buf(),
        };

        let file_type = entry.file_type();
        let (kind, size) = if file_type.is_symlink() {
            (EntryKind::Symlink, 0)
        } else if file_type.is_dir() {
            (EntryKind::Directory, 0)
        } else {
            (EntryKind::File, entry.metadata()?.len())
        };

        Ok(Self {
            path,
            archive_path,
            kind,
            size,
        })
    }
}

/// Archive name for a source root: `/srv/www` is stored as `srv/www`.
pub fn archive_root(root: &Path) -> PathBuf {
    root.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part),
            _ => None,
        })
        .collect()
}

/// Walk a directory tree, root included, in a stable (file-name) order.
///
/// Symlinks are reported as symlinks and never followed.
///
/// # Example
/// ```no_run
/// use serverbackup::fs::walker::walk_tree;
/// use std::path::Path;
///
/// let entries = walk_tree(Path::new("/srv/www")).unwrap();
/// println!("Found {} entries", entries.len());
/// ```
pub fn walk_tree(root: &Path) -> std::io::Result<Vec<TreeEntry>> {
    let archive_root = archive_root(root);
    let mut entries = Vec::new();

    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let entry = entry?;
        entries.push(TreeEntry::from_entry(&entry, &archive_root, root)?);
    }

    Ok(entries)
}
