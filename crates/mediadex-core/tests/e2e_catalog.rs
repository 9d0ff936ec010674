/// End-to-end catalog tests through [`MediaLibrary`].
///
/// Each test builds a real media tree and data directory under a
/// `TempDir` and probes in-process with a fake prober that reports every
/// `.mkv` as a 90 minute audio/video file, so no media fixtures are needed.
use crossbeam_channel::{unbounded, Receiver, Sender};
use mediadex_core::catalog::TitleMatcher;
use mediadex_core::fs::{LocalFs, MediaFs};
use mediadex_core::model::{AudioStream, Category, MediaRecord, ProbeKind, Program, VideoStream};
use mediadex_core::probe::Prober;
use mediadex_core::{Config, MediaEvent, MediaLibrary};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

// ── Helpers ──────────────────────────────────────────────────────────────────

const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

struct FakeProber {
    calls: AtomicUsize,
    /// Calls from this index on wait for `release`.
    hold_from: usize,
    release: Receiver<()>,
}

impl FakeProber {
    fn new() -> Self {
        let (_tx, rx) = unbounded();
        Self {
            calls: AtomicUsize::new(0),
            hold_from: usize::MAX,
            release: rx,
        }
    }

    fn holding_from(index: usize) -> (Self, Sender<()>) {
        let (tx, rx) = unbounded();
        let prober = Self {
            calls: AtomicUsize::new(0),
            hold_from: index,
            release: rx,
        };
        (prober, tx)
    }
}

impl Prober for FakeProber {
    fn probe(&self, kind: ProbeKind, path: &Path) -> mediadex_core::Result<MediaRecord> {
        if self.calls.fetch_add(1, Ordering::SeqCst) >= self.hold_from {
            let _ = self.release.recv_timeout(IDLE_TIMEOUT);
        }
        let mut record = MediaRecord::for_entry(&LocalFs.read_info(path)?);
        record.format_probed = true;
        record.content_probed = kind == ProbeKind::Content;
        if path.extension().is_some_and(|e| e == "mkv") {
            record.programs = vec![Program {
                duration_ms: Some(90 * 60 * 1000),
                audio_streams: vec![AudioStream::default()],
                video_streams: vec![VideoStream::default()],
                ..Program::default()
            }];
        }
        Ok(record)
    }

    fn thumbnail(&self, _path: &Path, _max_edge: u32) -> mediadex_core::Result<Option<Vec<u8>>> {
        Ok(None)
    }
}

struct StaticMatcher;

impl TitleMatcher for StaticMatcher {
    fn find_match(&self, title: &str) -> Option<String> {
        (title == "Known Film").then(|| "tt0000001".to_owned())
    }
}

/// Media root plus a separate data directory.
struct Fixture {
    tmp: TempDir,
}

impl Fixture {
    fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("movies")).unwrap();
        Self { tmp }
    }

    fn movies(&self) -> PathBuf {
        self.tmp.path().join("movies")
    }

    fn config(&self) -> Config {
        let mut roots = BTreeMap::new();
        roots.insert(Category::Movies, vec![self.movies()]);
        Config {
            roots,
            data_dir: self.tmp.path().join("data"),
            worker_threads: 2,
            ..Config::default()
        }
    }

    fn library(&self, prober: Arc<dyn Prober>) -> MediaLibrary {
        MediaLibrary::builder(self.config())
            .prober(prober)
            .without_watcher()
            .build()
            .unwrap()
    }
}

fn write_movies(dir: &Path, count: usize) {
    fs::create_dir_all(dir).unwrap();
    for i in 0..count {
        fs::write(dir.join(format!("Movie {i:02}.mkv")), vec![0u8; 100 + i]).unwrap();
    }
}

fn category_updates(rx: &Receiver<MediaEvent>, category: Category) -> usize {
    rx.try_iter()
        .filter(|e| *e == MediaEvent::CategoryUpdated(category))
        .count()
}

/// Poll `condition` until it holds or the deadline passes.
fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + IDLE_TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    false
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[test]
fn test_scan_files_movies_by_album() {
    let fx = Fixture::new();
    write_movies(&fx.movies().join("Action"), 3);
    fs::write(fx.movies().join("Action").join("notes.txt"), b"x").unwrap();

    let library = fx.library(Arc::new(FakeProber::new()));
    library.scan().unwrap();
    let catalog = library.catalog();
    assert!(catalog.wait_idle(IDLE_TIMEOUT));

    assert_eq!(catalog.file_count().unwrap(), 4);
    assert_eq!(catalog.albums(Category::Movies).unwrap(), vec!["Action"]);
    let files = catalog.album_files(Category::Movies, "Action", 0, 0).unwrap();
    let titles: Vec<&str> = files.iter().map(|f| f.title.as_str()).collect();
    assert_eq!(titles, vec!["Movie 00", "Movie 01", "Movie 02"]);
    assert_eq!(catalog.count_album_files(Category::Movies, "Action").unwrap(), 3);

    let node = catalog
        .read_node(&fx.movies().join("Action").join("Movie 01.mkv"))
        .unwrap()
        .unwrap();
    assert_eq!(node.size, 101);
    assert!(node.is_probed());
}

#[test]
fn test_second_scan_converges() {
    let fx = Fixture::new();
    write_movies(&fx.movies(), 5);
    write_movies(&fx.movies().join("Extras"), 2);

    let prober = Arc::new(FakeProber::new());
    let library = fx.library(Arc::clone(&prober) as Arc<dyn Prober>);
    let catalog = library.catalog();

    library.scan().unwrap();
    assert!(catalog.wait_idle(IDLE_TIMEOUT));
    let first = catalog.counters();
    assert_eq!(first.probes_enqueued, 7);

    library.scan().unwrap();
    assert!(catalog.wait_idle(IDLE_TIMEOUT));
    let second = catalog.counters();
    assert_eq!(second.probes_enqueued, first.probes_enqueued);
    assert!(second.scans_completed > first.scans_completed);
    assert_eq!(prober.calls.load(Ordering::SeqCst), 7);

    // A new file is picked up by the next pass.
    fs::write(fx.movies().join("Extras").join("New.mkv"), b"new").unwrap();
    library.scan().unwrap();
    assert!(catalog.wait_idle(IDLE_TIMEOUT));
    assert_eq!(catalog.counters().probes_enqueued, 8);
}

#[test]
fn test_removed_files_leave_catalog() {
    let fx = Fixture::new();
    write_movies(&fx.movies().join("Drama"), 2);

    let library = fx.library(Arc::new(FakeProber::new()));
    let catalog = library.catalog();
    library.scan().unwrap();
    assert!(catalog.wait_idle(IDLE_TIMEOUT));
    assert_eq!(catalog.count_album_files(Category::Movies, "Drama").unwrap(), 2);

    let events = library.subscribe();
    fs::remove_dir_all(fx.movies().join("Drama")).unwrap();
    library.scan().unwrap();
    assert!(catalog.wait_idle(IDLE_TIMEOUT));

    assert_eq!(catalog.count_album_files(Category::Movies, "Drama").unwrap(), 0);
    assert_eq!(catalog.file_count().unwrap(), 0);
    assert_eq!(category_updates(&events, Category::Movies), 1);
}

#[test]
fn test_category_update_fires_once_after_drain() {
    let fx = Fixture::new();
    write_movies(&fx.movies(), 10);

    let (prober, release) = FakeProber::holding_from(9);
    let library = fx.library(Arc::new(prober));
    let catalog = library.catalog();
    let events = library.subscribe();

    library.scan().unwrap();
    assert!(wait_for(|| catalog.pending_updates(Category::Movies) >= 9));
    assert!(!catalog.is_idle());
    assert_eq!(category_updates(&events, Category::Movies), 0);

    release.send(()).unwrap();
    assert!(catalog.wait_idle(IDLE_TIMEOUT));
    assert_eq!(category_updates(&events, Category::Movies), 1);
    assert_eq!(catalog.pending_updates(Category::Movies), 0);
}

#[test]
fn test_unmatched_movies_are_looked_up() {
    let fx = Fixture::new();
    fs::write(fx.movies().join("Known Film.mkv"), b"known").unwrap();
    fs::write(fx.movies().join("Obscure Film.mkv"), b"obscure").unwrap();

    let library = MediaLibrary::builder(fx.config())
        .prober(Arc::new(FakeProber::new()))
        .matcher(Arc::new(StaticMatcher))
        .without_watcher()
        .build()
        .unwrap();
    let catalog = library.catalog();
    library.scan().unwrap();
    assert!(catalog.wait_idle(IDLE_TIMEOUT));

    assert_eq!(
        catalog
            .movie_external_id(&fx.movies().join("Known Film.mkv"))
            .unwrap()
            .as_deref(),
        Some("tt0000001")
    );
    assert_eq!(
        catalog
            .movie_external_id(&fx.movies().join("Obscure Film.mkv"))
            .unwrap()
            .as_deref(),
        Some("")
    );
    assert_eq!(catalog.counters().matches_completed, 2);
}

#[test]
fn test_unconfigured_root_is_pruned() {
    let fx = Fixture::new();
    write_movies(&fx.movies(), 2);
    let shows = fx.tmp.path().join("shows");
    fs::create_dir_all(shows.join("Season 1")).unwrap();
    fs::write(shows.join("Season 1").join("Pilot.mkv"), b"pilot").unwrap();

    let mut config = fx.config();
    config.roots.insert(Category::TvShows, vec![shows.clone()]);
    {
        let library = MediaLibrary::builder(config)
            .prober(Arc::new(FakeProber::new()))
            .without_watcher()
            .build()
            .unwrap();
        library.scan().unwrap();
        assert!(library.catalog().wait_idle(IDLE_TIMEOUT));
        assert_eq!(library.catalog().file_count().unwrap(), 3);
        assert_eq!(library.catalog().albums(Category::TvShows).unwrap(), vec!["Season 1"]);
    }

    let library = fx.library(Arc::new(FakeProber::new()));
    library.scan().unwrap();
    assert!(library.catalog().wait_idle(IDLE_TIMEOUT));
    assert_eq!(library.catalog().file_count().unwrap(), 2);
    assert!(library.catalog().albums(Category::TvShows).unwrap().is_empty());
}

#[test]
fn test_playback_position_round_trip() {
    let fx = Fixture::new();
    let library = fx.library(Arc::new(FakeProber::new()));
    let movie = fx.movies().join("Film.mkv");

    assert_eq!(library.last_playback_position(&movie), None);
    library.set_last_playback_position(&movie, 754.5);
    assert_eq!(library.last_playback_position(&movie), Some(754.5));
    library.set_last_playback_position(&movie, 0.0);
    assert_eq!(library.last_playback_position(&movie), None);
}

#[test]
fn test_list_directory_format_probes_page() {
    let fx = Fixture::new();
    write_movies(&fx.movies(), 4);
    fs::create_dir(fx.movies().join("Extras")).unwrap();

    let prober = Arc::new(FakeProber::new());
    let library = fx.library(Arc::clone(&prober) as Arc<dyn Prober>);

    let page = library.list_directory(&fx.movies(), 0, 3);
    assert_eq!(page.len(), 3);
    assert!(page[0].is_directory);
    assert!(page[1].format_probed && page[2].format_probed);
    assert!(!library.is_empty(&fx.movies()));
    assert!(library.is_empty(&fx.movies().join("Extras")));

    // The listing queued the whole directory for content probing.
    assert!(library.preprobe().wait_idle(IDLE_TIMEOUT));
    let movie = fx.movies().join("Movie 03.mkv");
    assert!(library.read_full_content(&movie).unwrap().content_probed);
    let sample = library.representative_sample(&fx.movies(), 2);
    assert_eq!(sample.len(), 2);
    assert_eq!(prober.calls.load(Ordering::SeqCst), 2 + 4);
}
