/// Filesystem abstraction consumed by the caches and the catalog.
///
/// Everything that touches directories goes through [`MediaFs`] so tests can
/// count reads or fake whole trees, and so network shares can be told apart
/// from local disks (only local directories are watched for changes).
use crate::error::Result;
use crate::model::FileEntry;
use std::path::Path;

pub trait MediaFs: Send + Sync {
    /// Non-hidden children of `dir`. Entries whose metadata cannot be read
    /// are returned with `is_readable == false`.
    fn entry_list(&self, dir: &Path) -> Result<Vec<FileEntry>>;

    /// Stat a single path.
    fn read_info(&self, path: &Path) -> Result<FileEntry>;

    /// `false` for network locations, which are never watched.
    fn is_local(&self, path: &Path) -> bool;

    /// Whether `path` can currently be opened for reading. Files still being
    /// copied or locked by another program fail this check.
    fn is_openable(&self, path: &Path) -> bool {
        std::fs::File::open(path).is_ok()
    }
}

/// The real filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFs;

impl MediaFs for LocalFs {
    fn entry_list(&self, dir: &Path) -> Result<Vec<FileEntry>> {
        let mut entries = Vec::new();
        for dirent in std::fs::read_dir(dir)? {
            let dirent = match dirent {
                Ok(d) => d,
                Err(_) => continue,
            };
            if is_hidden_name(&dirent.file_name().to_string_lossy()) {
                continue;
            }
            let path = dirent.path();
            // Follow symlinks so linked media folders behave like real ones.
            let entry = match std::fs::metadata(&path) {
                Ok(meta) => FileEntry::from_metadata(path, &meta),
                Err(_) => FileEntry::unreadable(path),
            };
            entries.push(entry);
        }
        Ok(entries)
    }

    fn read_info(&self, path: &Path) -> Result<FileEntry> {
        let meta = std::fs::metadata(path)?;
        Ok(FileEntry::from_metadata(path.to_path_buf(), &meta))
    }

    fn is_local(&self, path: &Path) -> bool {
        !is_network_path(path)
    }
}

/// Dot-files and dot-directories.
pub fn is_hidden_name(name: &str) -> bool {
    name.starts_with('.')
}

/// Paths of the form `scheme://...` address network shares.
pub fn is_network_path(path: &Path) -> bool {
    path.to_str().is_some_and(|s| {
        s.find("://")
            .is_some_and(|i| i > 0 && s[..i].chars().all(|c| c.is_ascii_alphanumeric()))
    })
}
