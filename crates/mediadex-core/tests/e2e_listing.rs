/// End-to-end listing cache tests against a real temporary directory.
///
/// The filesystem is wrapped in a counter so that cache hits (no directory
/// read) can be told apart from misses.
use mediadex_core::cache::ListingCache;
use mediadex_core::events::{EventBus, MediaEvent};
use mediadex_core::fs::{LocalFs, MediaFs};
use mediadex_core::model::FileEntry;
use mediadex_core::watch::DirWatcher;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tempfile::TempDir;

// ── Helpers ──────────────────────────────────────────────────────────────────

#[derive(Default)]
struct CountingFs {
    lists: AtomicUsize,
}

impl MediaFs for CountingFs {
    fn entry_list(&self, dir: &Path) -> mediadex_core::Result<Vec<FileEntry>> {
        self.lists.fetch_add(1, Ordering::SeqCst);
        LocalFs.entry_list(dir)
    }

    fn read_info(&self, path: &Path) -> mediadex_core::Result<FileEntry> {
        LocalFs.read_info(path)
    }

    fn is_local(&self, _path: &Path) -> bool {
        true
    }
}

/// Changes the directory and notifies the cache while the first read is
/// still in progress.
#[derive(Default)]
struct RacingFs {
    lists: AtomicUsize,
    raced: AtomicBool,
    cache: OnceLock<Weak<ListingCache>>,
}

impl MediaFs for RacingFs {
    fn entry_list(&self, dir: &Path) -> mediadex_core::Result<Vec<FileEntry>> {
        self.lists.fetch_add(1, Ordering::SeqCst);
        let listed = LocalFs.entry_list(dir);
        if !self.raced.swap(true, Ordering::SeqCst) {
            fs::write(dir.join("new.mkv"), b"x").unwrap();
            if let Some(cache) = self.cache.get().and_then(Weak::upgrade) {
                cache.notify_changed(dir);
            }
        }
        listed
    }

    fn read_info(&self, path: &Path) -> mediadex_core::Result<FileEntry> {
        LocalFs.read_info(path)
    }

    fn is_local(&self, _path: &Path) -> bool {
        true
    }
}

/// ```text
/// root/
///   Extras/
///   b.mkv
///   A.mkv
///   a.srt      (sidecar, filtered)
///   .hidden    (filtered)
/// ```
fn build_test_dir(root: &Path) {
    fs::create_dir(root.join("Extras")).unwrap();
    for name in ["b.mkv", "A.mkv", "a.srt", ".hidden"] {
        fs::write(root.join(name), b"x").unwrap();
    }
}

fn cache(fs: Arc<CountingFs>, ttl: Duration, events: Arc<EventBus>) -> ListingCache {
    ListingCache::new(fs, ttl, None, events)
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[test]
fn test_listing_is_filtered_and_sorted() {
    let tmp = TempDir::new().unwrap();
    build_test_dir(tmp.path());

    let listing = cache(
        Arc::new(CountingFs::default()),
        Duration::from_secs(15),
        Arc::new(EventBus::new()),
    );
    let names = listing.list_names(tmp.path()).unwrap();
    let names: Vec<&str> = names.iter().map(|n| n.as_str()).collect();
    assert_eq!(names, vec!["Extras/", "A.mkv", "b.mkv"]);
}

#[test]
fn test_listing_is_reused_within_ttl() {
    let tmp = TempDir::new().unwrap();
    build_test_dir(tmp.path());
    let fs = Arc::new(CountingFs::default());
    let listing = cache(
        Arc::clone(&fs),
        Duration::from_millis(300),
        Arc::new(EventBus::new()),
    );

    listing.list_names(tmp.path()).unwrap();
    listing.list_names(tmp.path()).unwrap();
    listing.list_page(tmp.path(), 1, 1).unwrap();
    assert_eq!(fs.lists.load(Ordering::SeqCst), 1);

    std::thread::sleep(Duration::from_millis(500));
    listing.list_names(tmp.path()).unwrap();
    assert_eq!(fs.lists.load(Ordering::SeqCst), 2);
}

#[test]
fn test_change_notification_expires_listing() {
    let tmp = TempDir::new().unwrap();
    build_test_dir(tmp.path());
    let fs = Arc::new(CountingFs::default());
    let events = Arc::new(EventBus::new());
    let rx = events.subscribe();
    let listing = cache(Arc::clone(&fs), Duration::from_secs(60), events);

    assert_eq!(listing.list_names(tmp.path()).unwrap().len(), 3);
    fs::write(tmp.path().join("c.mkv"), b"x").unwrap();
    listing.notify_changed(tmp.path());

    assert_eq!(
        rx.recv_timeout(Duration::from_secs(5)).unwrap(),
        MediaEvent::ItemChanged(tmp.path().to_path_buf())
    );
    assert_eq!(listing.list_names(tmp.path()).unwrap().len(), 4);
    assert_eq!(fs.lists.load(Ordering::SeqCst), 2);
}

#[test]
fn test_negative_count_samples_whole_listing() {
    let tmp = TempDir::new().unwrap();
    for i in 0..10 {
        fs::write(tmp.path().join(format!("photo{i:02}.jpg")), b"x").unwrap();
    }
    let listing = cache(
        Arc::new(CountingFs::default()),
        Duration::from_secs(15),
        Arc::new(EventBus::new()),
    );
    let sample = listing.list_page(tmp.path(), 7, -3).unwrap();
    let sample: Vec<&str> = sample.iter().map(|n| n.as_str()).collect();
    assert_eq!(sample, vec!["photo00.jpg", "photo03.jpg", "photo06.jpg"]);
}

#[test]
fn test_change_during_read_is_not_cached() {
    let tmp = TempDir::new().unwrap();
    fs::write(tmp.path().join("a.mkv"), b"x").unwrap();
    let fs = Arc::new(RacingFs::default());
    let listing = Arc::new(ListingCache::new(
        Arc::clone(&fs) as Arc<dyn MediaFs>,
        Duration::from_secs(60),
        None,
        Arc::new(EventBus::new()),
    ));
    fs.cache.set(Arc::downgrade(&listing)).unwrap();

    let first = listing.list_names(tmp.path()).unwrap();
    assert_eq!(first.len(), 1);

    let second = listing.list_names(tmp.path()).unwrap();
    let second: Vec<&str> = second.iter().map(|n| n.as_str()).collect();
    assert_eq!(second, vec!["a.mkv", "new.mkv"]);
    assert_eq!(fs.lists.load(Ordering::SeqCst), 2);
}

#[test]
fn test_removed_dir_is_unwatched() {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path().join("Season 1");
    fs::create_dir(&dir).unwrap();
    let (watcher, _changes) = DirWatcher::new().unwrap();
    let watcher = Arc::new(watcher);
    let listing = ListingCache::new(
        Arc::new(CountingFs::default()),
        Duration::from_secs(60),
        Some(Arc::clone(&watcher)),
        Arc::new(EventBus::new()),
    );

    listing.list_names(&dir).unwrap();
    assert!(watcher.is_watching(&dir));

    listing.notify_changed(&dir);
    assert!(watcher.is_watching(&dir), "existing dir stays watched");

    fs::remove_dir(&dir).unwrap();
    listing.notify_changed(&dir);
    assert!(!watcher.is_watching(&dir));
}
