/// A single file or directory as reported by the filesystem layer.
///
/// Entries are snapshots: they are produced by listing or stat calls and are
/// never persisted on their own, only embedded in scan and probe records.
use chrono::{DateTime, Utc};
use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use std::fs::Metadata;
use std::path::{Path, PathBuf};

/// Allowed drift between a stored modification time and the live one.
///
/// Network shares and FAT volumes round timestamps, so an exact match would
/// cause endless re-probing.
pub const MTIME_TOLERANCE_SECS: i64 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Absolute path. Identity of the entry.
    pub path: PathBuf,
    pub is_dir: bool,
    /// `false` when the metadata could not be read.
    pub is_readable: bool,
    /// Byte size for files, zero for directories.
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
}

impl FileEntry {
    /// Build an entry from already-fetched metadata.
    pub fn from_metadata(path: PathBuf, meta: &Metadata) -> Self {
        let is_dir = meta.is_dir();
        Self {
            path,
            is_dir,
            is_readable: true,
            size: if is_dir { 0 } else { meta.len() },
            last_modified: meta.modified().ok().map(DateTime::<Utc>::from),
        }
    }

    /// Placeholder for an entry whose metadata could not be read.
    pub fn unreadable(path: PathBuf) -> Self {
        Self {
            path,
            is_dir: false,
            is_readable: false,
            size: 0,
            last_modified: None,
        }
    }

    /// File name only. Directories get a trailing `/` so listings can tell
    /// them apart without another stat.
    pub fn name(&self) -> CompactString {
        let mut name = CompactString::new(file_name(&self.path));
        if self.is_dir {
            name.push('/');
        }
        name
    }

    /// Modification time as whole seconds since the epoch, `0` when unknown.
    pub fn mtime_secs(&self) -> i64 {
        self.last_modified.map(|t| t.timestamp()).unwrap_or(0)
    }
}

/// Final path component as a lossy string.
pub(crate) fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Compare two modification times within [`MTIME_TOLERANCE_SECS`].
///
/// Two unknown timestamps match; a known and an unknown one do not.
pub fn mtime_matches(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => (a - b).num_seconds().abs() <= MTIME_TOLERANCE_SECS,
        (None, None) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_mtime_tolerance() {
        let base = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let near = base + chrono::Duration::seconds(2);
        let far = base + chrono::Duration::seconds(3);
        assert!(mtime_matches(Some(base), Some(near)));
        assert!(mtime_matches(Some(near), Some(base)));
        assert!(!mtime_matches(Some(base), Some(far)));
        assert!(!mtime_matches(Some(base), None));
        assert!(mtime_matches(None, None));
    }

    #[test]
    fn test_dir_names_carry_trailing_slash() {
        let entry = FileEntry {
            path: PathBuf::from("/media/Movies"),
            is_dir: true,
            is_readable: true,
            size: 0,
            last_modified: None,
        };
        assert_eq!(entry.name(), "Movies/");

        let file = FileEntry {
            is_dir: false,
            path: PathBuf::from("/media/a.mkv"),
            ..entry
        };
        assert_eq!(file.name(), "a.mkv");
    }
}
