/// Volatile per-directory listing cache.
///
/// A listing is the filtered, sorted list of child names of one directory.
/// Directories come first and carry a trailing `/`; within each group names
/// are sorted case-insensitively. Hidden entries and sidecar files
/// (subtitles, indexes, databases and the like) never appear.
///
/// Entries older than the TTL are treated as absent. Local directories are
/// registered with the [`DirWatcher`] on first listing; a change notification
/// expires the entry at once and publishes [`MediaEvent::ItemChanged`].
use crate::error::Result;
use crate::events::{EventBus, MediaEvent};
use crate::fs::{is_hidden_name, MediaFs};
use crate::model::file_entry::file_name;
use crate::model::FileEntry;
use crate::watch::DirWatcher;
use compact_str::CompactString;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Extensions that never show up in a listing.
const SIDECAR_EXTENSIONS: &[&str] = &[
    "db", "idx", "nfo", "srt", "sub", "txt", "ini", "lnk", "log", "smi", "ssa", "ass", "vtt",
];

struct Listing {
    names: Arc<Vec<CompactString>>,
    captured_at: Instant,
}

#[derive(Default)]
struct Entries {
    listings: HashMap<PathBuf, Listing>,
    /// Bumped by every change notification; a read that straddles a bump is
    /// not cached.
    generations: HashMap<PathBuf, u64>,
}

pub struct ListingCache {
    fs: Arc<dyn MediaFs>,
    ttl: Duration,
    entries: Mutex<Entries>,
    watcher: Option<Arc<DirWatcher>>,
    events: Arc<EventBus>,
}

impl ListingCache {
    pub fn new(
        fs: Arc<dyn MediaFs>,
        ttl: Duration,
        watcher: Option<Arc<DirWatcher>>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            fs,
            ttl,
            entries: Mutex::new(Entries::default()),
            watcher,
            events,
        }
    }

    /// Sorted, filtered child names of `dir`.
    pub fn list_names(&self, dir: &Path) -> Result<Arc<Vec<CompactString>>> {
        let generation = {
            let entries = self.entries.lock();
            if let Some(listing) = entries.listings.get(dir) {
                if listing.captured_at.elapsed() <= self.ttl {
                    return Ok(Arc::clone(&listing.names));
                }
            }
            entries.generations.get(dir).copied().unwrap_or(0)
        };

        // The directory read happens without the lock held.
        let listed = self.fs.entry_list(dir)?;
        let names = Arc::new(sort_and_filter(listed));
        debug!("Listed {:?}: {} entries", dir, names.len());

        let mut entries = self.entries.lock();
        if entries.generations.get(dir).copied().unwrap_or(0) == generation {
            entries.listings.insert(
                dir.to_path_buf(),
                Listing {
                    names: Arc::clone(&names),
                    captured_at: Instant::now(),
                },
            );
        } else {
            debug!("Listing of {:?} changed while being read", dir);
        }
        drop(entries);

        if let Some(watcher) = &self.watcher {
            if self.fs.is_local(dir) {
                if let Err(e) = watcher.watch(dir) {
                    warn!("Cannot watch {:?}: {}", dir, e);
                }
            }
        }
        Ok(names)
    }

    /// A page of [`ListingCache::list_names`]; see [`select_page`].
    pub fn list_page(&self, dir: &Path, start: usize, count: i32) -> Result<Vec<CompactString>> {
        let names = self.list_names(dir)?;
        Ok(select_page(&names, start, count))
    }

    /// Expire the listing of `dir` and tell subscribers it changed. A
    /// directory that no longer exists stops being watched.
    pub fn notify_changed(&self, dir: &Path) {
        {
            let mut entries = self.entries.lock();
            entries.listings.remove(dir);
            *entries.generations.entry(dir.to_path_buf()).or_insert(0) += 1;
        }
        if let Some(watcher) = &self.watcher {
            let exists = self.fs.read_info(dir).is_ok_and(|info| info.is_dir);
            if !exists {
                watcher.unwatch(dir);
            }
        }
        self.events
            .publish(MediaEvent::ItemChanged(dir.to_path_buf()));
    }
}

/// Whether `name` would be filtered out of a listing.
pub fn is_listable(name: &str) -> bool {
    if is_hidden_name(name) {
        return false;
    }
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => !SIDECAR_EXTENSIONS
            .iter()
            .any(|s| s.eq_ignore_ascii_case(ext)),
        _ => true,
    }
}

fn sort_and_filter(entries: Vec<FileEntry>) -> Vec<CompactString> {
    let mut keyed: Vec<(bool, String, CompactString)> = entries
        .into_iter()
        .filter(|e| {
            let name = file_name(&e.path);
            if e.is_dir {
                !is_hidden_name(&name)
            } else {
                is_listable(&name)
            }
        })
        .map(|e| {
            let name = e.name();
            (!e.is_dir, name.to_lowercase().to_string(), name)
        })
        .collect();
    keyed.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    keyed.into_iter().map(|(_, _, name)| name).collect()
}

/// Select a page of `names`.
///
/// * `count == 0`: everything from `start` on.
/// * `count > 0`: up to `count` names from `start`.
/// * `count < 0`: up to `-count` evenly spaced samples across the whole
///   listing; `start` is ignored.
pub fn select_page<T: Clone>(names: &[T], start: usize, count: i32) -> Vec<T> {
    if count < 0 {
        let wanted = count.unsigned_abs() as usize;
        if names.len() <= wanted {
            return names.to_vec();
        }
        return (0..wanted)
            .map(|i| names[i * names.len() / wanted].clone())
            .collect();
    }
    let start = start.min(names.len());
    let end = if count == 0 {
        names.len()
    } else {
        (start + count as usize).min(names.len())
    };
    names[start..end].to_vec()
}
