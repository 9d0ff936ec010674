/// The persistent file and category catalog.
///
/// # Work model
///
/// All catalog work is one of three task kinds, held in separate queues and
/// always taken in this order:
///
/// 1. **Scan** a directory ([`scanner::scan_dir`]), yielding subdirectories
///    to scan and files to probe.
/// 2. **Probe** a file through the [`ProbeService`] and classify it
///    ([`Categorizer::classify`]).
/// 3. **Match** an unmatched movie title through the [`TitleMatcher`]; only
///    taken while both other queues are empty.
///
/// Tasks run on a bounded rayon pool. Each worker loops, popping the next
/// task, until the queues are empty. The last worker to go idle publishes one
/// [`MediaEvent::CategoryUpdated`] per category changed since the previous
/// drain, then signals [`Catalog::wait_idle`].
///
/// # Locking
///
/// The database connection, the work queues and the categorizer's dirty
/// counters each sit behind their own mutex and are never held together.
/// Probing runs with no catalog lock held.
///
/// # Retries
///
/// A file that cannot be opened has its (negative) size decremented instead
/// of being probed. Once it has failed `max_probe_attempts` times its real
/// size is recorded and it is never retried. [`Catalog::enqueue_unprobed`]
/// re-queues every file still waiting.
pub mod categorizer;
pub mod matcher;
pub mod scanner;
pub mod schema;
pub mod store;

pub use categorizer::{Categorizer, CategorizerRules};
pub use matcher::TitleMatcher;
pub use store::{AlbumFile, CatalogNode};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::events::{EventBus, MediaEvent};
use crate::fs::MediaFs;
use crate::model::{Category, MediaRecord, ProbeKind};
use crate::service::ProbeService;
use parking_lot::{Condvar, Mutex};
use rusqlite::Connection;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use store::path_key;
use tracing::{debug, info, warn};

/// How long [`Catalog::shutdown`] waits for running tasks.
const SHUTDOWN_WAIT: Duration = Duration::from_secs(10);

/// Catalog settings, usually taken from [`Config`].
#[derive(Debug, Clone)]
pub struct CatalogOptions {
    pub roots: BTreeMap<Category, Vec<PathBuf>>,
    pub hidden_dirs: Vec<PathBuf>,
    pub max_probe_attempts: u32,
    pub workers: usize,
    pub song_max_duration: Duration,
    pub movie_min_duration: Duration,
}

impl CatalogOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            roots: config.roots.clone(),
            hidden_dirs: config.hidden_dirs.clone(),
            max_probe_attempts: config.max_probe_attempts,
            workers: config.effective_workers(),
            song_max_duration: Duration::from_secs(config.song_max_duration_secs),
            movie_min_duration: Duration::from_secs(config.movie_min_duration_secs),
        }
    }

    /// Every configured root, deduplicated.
    fn all_roots(&self) -> Vec<PathBuf> {
        let mut roots: Vec<PathBuf> = self.roots.values().flatten().cloned().collect();
        roots.sort();
        roots.dedup();
        roots
    }
}

/// Snapshot of the catalog's work counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CatalogCounters {
    pub scans_completed: u64,
    pub probes_enqueued: u64,
    pub probes_completed: u64,
    pub matches_completed: u64,
}

#[derive(Default)]
struct CatalogStats {
    scans_completed: AtomicU64,
    probes_enqueued: AtomicU64,
    probes_completed: AtomicU64,
    matches_completed: AtomicU64,
}

enum Task {
    Scan(PathBuf),
    Probe(PathBuf),
    Match(i64, String),
}

enum Next {
    Run(Task),
    /// Queues empty and this is the last active worker.
    Drained,
    Exit,
}

#[derive(Default)]
struct WorkState {
    scan: VecDeque<PathBuf>,
    probe: VecDeque<PathBuf>,
    matching: VecDeque<(i64, String)>,
    queued_scans: HashSet<PathBuf>,
    queued_probes: HashSet<PathBuf>,
    active: usize,
}

impl WorkState {
    fn pop(&mut self) -> Option<Task> {
        if let Some(dir) = self.scan.pop_front() {
            self.queued_scans.remove(&dir);
            return Some(Task::Scan(dir));
        }
        if let Some(path) = self.probe.pop_front() {
            self.queued_probes.remove(&path);
            return Some(Task::Probe(path));
        }
        self.matching
            .pop_front()
            .map(|(id, title)| Task::Match(id, title))
    }

    fn pending(&self) -> usize {
        self.scan.len() + self.probe.len() + self.matching.len()
    }

    fn push_scan(&mut self, dir: PathBuf) -> bool {
        if self.queued_scans.insert(dir.clone()) {
            self.scan.push_back(dir);
            true
        } else {
            false
        }
    }

    fn push_probe(&mut self, path: PathBuf) -> bool {
        if self.queued_probes.insert(path.clone()) {
            self.probe.push_back(path);
            true
        } else {
            false
        }
    }

    fn clear(&mut self) {
        self.scan.clear();
        self.probe.clear();
        self.matching.clear();
        self.queued_scans.clear();
        self.queued_probes.clear();
    }
}

pub struct Catalog {
    db: Mutex<Connection>,
    fs: Arc<dyn MediaFs>,
    service: Arc<ProbeService>,
    categorizer: Categorizer,
    matcher: Option<Arc<dyn TitleMatcher>>,
    events: Arc<EventBus>,
    options: CatalogOptions,
    roots: Vec<PathBuf>,
    work: Mutex<WorkState>,
    idle: Condvar,
    pool: rayon::ThreadPool,
    stats: CatalogStats,
    shutdown: AtomicBool,
}

impl Catalog {
    /// Open (or create) the catalog database at `db_path`.
    pub fn open(
        db_path: &Path,
        options: CatalogOptions,
        fs: Arc<dyn MediaFs>,
        service: Arc<ProbeService>,
        events: Arc<EventBus>,
        matcher: Option<Arc<dyn TitleMatcher>>,
    ) -> Result<Arc<Self>> {
        let conn = Connection::open(db_path)?;
        info!("Catalog: opened {:?}", db_path);
        Self::with_connection(conn, options, fs, service, events, matcher)
    }

    pub fn with_connection(
        conn: Connection,
        options: CatalogOptions,
        fs: Arc<dyn MediaFs>,
        service: Arc<ProbeService>,
        events: Arc<EventBus>,
        matcher: Option<Arc<dyn TitleMatcher>>,
    ) -> Result<Arc<Self>> {
        schema::run_migrations(&conn)?;
        let workers = options.workers.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("mediadex-catalog-{i}"))
            .build()
            .map_err(|e| Error::Other(format!("catalog pool: {e}")))?;
        let categorizer = Categorizer::new(CategorizerRules {
            roots: options.roots.clone(),
            song_max_duration: options.song_max_duration,
            movie_min_duration: options.movie_min_duration,
        });
        Ok(Arc::new(Self {
            db: Mutex::new(conn),
            fs,
            service,
            categorizer,
            matcher,
            events,
            roots: options.all_roots(),
            options: CatalogOptions { workers, ..options },
            work: Mutex::new(WorkState::default()),
            idle: Condvar::new(),
            pool,
            stats: CatalogStats::default(),
            shutdown: AtomicBool::new(false),
        }))
    }

    // ─── Enqueueing ─────────────────────────────────────────────────────────

    /// Start a full pass: prune unconfigured roots, scan every root, and
    /// re-queue unprobed files and unmatched movies.
    pub fn scan_all(self: &Arc<Self>) -> Result<()> {
        let pruned = {
            let db = self.db.lock();
            scanner::prune_roots(&db, &self.roots)?
        };
        self.categorizer.mark_dirty(&pruned);

        // Leftovers first, so files the scan is about to insert are not
        // queued twice.
        self.enqueue_unprobed()?;
        self.enqueue_unmatched()?;

        info!("Catalog: scanning {} roots", self.roots.len());
        self.push(|work| {
            for root in &self.roots {
                work.push_scan(root.clone());
            }
        });
        Ok(())
    }

    /// Queue a rescan of `dir`. Ignored outside the configured roots and
    /// inside hidden directories.
    pub fn enqueue_scan(self: &Arc<Self>, dir: &Path) {
        if !self.roots.iter().any(|root| dir.starts_with(root)) {
            debug!("Catalog: ignoring scan of {:?} outside the roots", dir);
            return;
        }
        if scanner::is_hidden_dir(dir, &self.options.hidden_dirs) {
            return;
        }
        let dir = dir.to_path_buf();
        self.push(move |work| {
            work.push_scan(dir);
        });
    }

    /// Queue every file still waiting to be probed. Returns how many.
    pub fn enqueue_unprobed(self: &Arc<Self>) -> Result<usize> {
        let paths = {
            let db = self.db.lock();
            store::unprobed_files(&db)?
        };
        let count = paths.len();
        if count > 0 {
            debug!("Catalog: re-queueing {} unprobed files", count);
            self.push_probes(paths);
        }
        Ok(count)
    }

    /// Queue title lookups for every unmatched movie, if a matcher is set.
    pub fn enqueue_unmatched(self: &Arc<Self>) -> Result<usize> {
        if self.matcher.is_none() {
            return Ok(0);
        }
        let movies = {
            let db = self.db.lock();
            store::unmatched_movies(&db)?
        };
        let count = movies.len();
        self.push(move |work| work.matching.extend(movies));
        Ok(count)
    }

    fn push_probes(self: &Arc<Self>, paths: Vec<PathBuf>) {
        self.push(|work| {
            let added = paths
                .into_iter()
                .filter(|path| work.push_probe(path.clone()))
                .count();
            self.stats
                .probes_enqueued
                .fetch_add(added as u64, Ordering::Relaxed);
        });
    }

    /// Mutate the queues and start workers for the new work.
    fn push(self: &Arc<Self>, fill: impl FnOnce(&mut WorkState)) {
        if self.shutdown.load(Ordering::Acquire) {
            return;
        }
        let spawn = {
            let mut work = self.work.lock();
            fill(&mut work);
            let spawn = self
                .options
                .workers
                .saturating_sub(work.active)
                .min(work.pending());
            work.active += spawn;
            spawn
        };
        for _ in 0..spawn {
            let this = Arc::clone(self);
            self.pool.spawn(move || this.worker_loop());
        }
    }

    // ─── Workers ────────────────────────────────────────────────────────────

    fn worker_loop(self: Arc<Self>) {
        loop {
            let next = {
                let mut work = self.work.lock();
                self.next_task(&mut work)
            };
            match next {
                Next::Run(task) => self.run_task(task),
                Next::Drained => {
                    self.publish_updates();
                    let mut work = self.work.lock();
                    if work.pending() == 0 || self.shutdown.load(Ordering::Acquire) {
                        work.active -= 1;
                        if work.active == 0 {
                            self.idle.notify_all();
                        }
                        return;
                    }
                }
                Next::Exit => return,
            }
        }
    }

    fn next_task(&self, work: &mut WorkState) -> Next {
        if !self.shutdown.load(Ordering::Acquire) {
            if let Some(task) = work.pop() {
                return Next::Run(task);
            }
            if work.active == 1 {
                return Next::Drained;
            }
        }
        work.active -= 1;
        if work.active == 0 {
            self.idle.notify_all();
        }
        Next::Exit
    }

    fn publish_updates(&self) {
        for category in self.categorizer.take_dirty() {
            debug!("Catalog: {} updated", category);
            self.events.publish(MediaEvent::CategoryUpdated(category));
        }
    }

    fn run_task(self: &Arc<Self>, task: Task) {
        match task {
            Task::Scan(dir) => self.run_scan(&dir),
            Task::Probe(path) => match self.probe_file(&path) {
                Ok(Some(unmatched)) => self.push(move |work| work.matching.push_back(unmatched)),
                Ok(None) => {}
                Err(e) => warn!("Catalog: probe of {:?} failed: {}", path, e),
            },
            Task::Match(file_id, title) => {
                if let Err(e) = self.match_movie(file_id, &title) {
                    warn!("Catalog: lookup of {:?} failed: {}", title, e);
                }
            }
        }
    }

    fn run_scan(self: &Arc<Self>, dir: &Path) {
        let outcome = {
            let db = self.db.lock();
            scanner::scan_dir(&db, self.fs.as_ref(), dir, &self.options.hidden_dirs)
        };
        self.stats.scans_completed.fetch_add(1, Ordering::Relaxed);
        match outcome {
            Ok(outcome) => {
                self.categorizer.mark_dirty(&outcome.invalidated);
                if !outcome.subdirs.is_empty() {
                    let subdirs = outcome.subdirs;
                    self.push(move |work| {
                        for subdir in subdirs {
                            work.push_scan(subdir);
                        }
                    });
                }
                if !outcome.to_probe.is_empty() {
                    self.push_probes(outcome.to_probe);
                }
            }
            Err(e) => warn!("Catalog: scan of {:?} failed: {}", dir, e),
        }
    }

    /// Probe one catalogued file and refresh its category rows. Returns the
    /// movie title to look up, if one is due.
    fn probe_file(&self, path: &Path) -> Result<Option<(i64, String)>> {
        let node = {
            let db = self.db.lock();
            store::find_node(&db, &path_key(path, false))?
        };
        let Some(node) = node else {
            return Ok(None);
        };

        let entry = match self.fs.read_info(path) {
            Ok(entry) if self.fs.is_openable(path) => entry,
            _ => {
                self.delay_file(&node, path)?;
                return Ok(None);
            }
        };

        let record = self.service.read_entry(&entry, ProbeKind::Content);
        self.stats.probes_completed.fetch_add(1, Ordering::Relaxed);
        let size = entry.size as i64;
        let mtime = entry.mtime_secs();

        let (touched, unmatched) = {
            let db = self.db.lock();
            match &record {
                Some(record) => {
                    let info = media_info_json(record)?;
                    store::set_media_info(&db, node.id, size, mtime, Some(&info))?;
                    let touched = self.categorizer.classify(&db, node.id, path, record)?;
                    let unmatched =
                        if self.matcher.is_some() && touched.contains(&Category::Movies) {
                            store::unmatched_movie(&db, node.id)?
                        } else {
                            None
                        };
                    (touched, unmatched)
                }
                None => {
                    debug!("Catalog: no metadata for {:?}", path);
                    store::set_media_info(&db, node.id, size, mtime, None)?;
                    (store::delete_category_rows(&db, node.id)?, None)
                }
            }
        };
        self.categorizer.mark_dirty(&touched);
        Ok(unmatched.map(|title| (node.id, title)))
    }

    /// Count a failed open attempt; give up after the configured maximum.
    fn delay_file(&self, node: &CatalogNode, path: &Path) -> Result<()> {
        let next = if node.size >= 0 { -1 } else { node.size - 1 };
        // -1 means "never tried", so failures are one less than the magnitude.
        let failures = -next - 1;
        if failures >= i64::from(self.options.max_probe_attempts) {
            let size = self.fs.read_info(path).map(|e| e.size as i64).unwrap_or(0);
            warn!(
                "Catalog: giving up on {:?} after {} failed attempts",
                path, failures
            );
            let db = self.db.lock();
            store::set_media_info(&db, node.id, size, node.last_modified, None)
        } else {
            debug!("Catalog: {:?} not openable yet ({} failures)", path, failures);
            let db = self.db.lock();
            store::update_size(&db, node.id, next)
        }
    }

    fn match_movie(&self, file_id: i64, title: &str) -> Result<()> {
        let Some(matcher) = &self.matcher else {
            return Ok(());
        };
        let found = matcher.find_match(title);
        debug!("Catalog: {:?} matched {:?}", title, found);
        {
            let db = self.db.lock();
            store::set_external_id(&db, file_id, found.as_deref().unwrap_or(""))?;
        }
        self.stats.matches_completed.fetch_add(1, Ordering::Relaxed);
        self.categorizer
            .mark_dirty(&std::iter::once(Category::Movies).collect());
        Ok(())
    }

    // ─── Status ─────────────────────────────────────────────────────────────

    /// Block until every queue is empty and no task is running, or until
    /// `timeout`. Returns whether the catalog went idle.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut work = self.work.lock();
        while work.pending() > 0 || work.active > 0 {
            if self.idle.wait_until(&mut work, deadline).timed_out() {
                return false;
            }
        }
        true
    }

    pub fn is_idle(&self) -> bool {
        let work = self.work.lock();
        work.pending() == 0 && work.active == 0
    }

    pub fn counters(&self) -> CatalogCounters {
        CatalogCounters {
            scans_completed: self.stats.scans_completed.load(Ordering::Relaxed),
            probes_enqueued: self.stats.probes_enqueued.load(Ordering::Relaxed),
            probes_completed: self.stats.probes_completed.load(Ordering::Relaxed),
            matches_completed: self.stats.matches_completed.load(Ordering::Relaxed),
        }
    }

    /// Pending change count of `category`, before the next drain publishes it.
    pub fn pending_updates(&self, category: Category) -> u32 {
        self.categorizer.dirty_count(category)
    }

    /// Drop queued work and wait briefly for running tasks. Idempotent.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        self.work.lock().clear();
        if !self.wait_idle(SHUTDOWN_WAIT) {
            warn!("Catalog: tasks still running after {:?}", SHUTDOWN_WAIT);
        }
        info!("Catalog: shut down");
    }

    // ─── Queries ────────────────────────────────────────────────────────────

    /// The catalog row of a file or directory.
    pub fn read_node(&self, path: &Path) -> Result<Option<CatalogNode>> {
        let db = self.db.lock();
        if let Some(node) = store::find_node(&db, &path_key(path, false))? {
            return Ok(Some(node));
        }
        store::find_node(&db, &path_key(path, true))
    }

    pub fn file_count(&self) -> Result<i64> {
        store::count_files(&self.db.lock())
    }

    pub fn albums(&self, category: Category) -> Result<Vec<String>> {
        store::albums(&self.db.lock(), category)
    }

    pub fn album_files(
        &self,
        category: Category,
        album: &str,
        start: usize,
        count: usize,
    ) -> Result<Vec<AlbumFile>> {
        store::album_files(&self.db.lock(), category, album, start, count)
    }

    pub fn count_album_files(&self, category: Category, album: &str) -> Result<usize> {
        store::count_album_files(&self.db.lock(), category, album)
    }

    /// External identifier stored for a movie, `Some("")` when looked up
    /// without a match.
    pub fn movie_external_id(&self, path: &Path) -> Result<Option<String>> {
        let db = self.db.lock();
        match store::find_node(&db, &path_key(path, false))? {
            Some(node) => store::external_id(&db, node.id),
            None => Ok(None),
        }
    }

    pub fn playback_position(&self, path: &Path) -> Result<Option<f64>> {
        store::playback_position(&self.db.lock(), path)
    }

    pub fn set_playback_position(&self, path: &Path, seconds: f64) -> Result<()> {
        store::set_playback_position(&self.db.lock(), path, seconds)
    }
}

/// Probe result as stored in the catalog, without thumbnail bytes.
fn media_info_json(record: &MediaRecord) -> Result<String> {
    let mut slim = record.clone();
    slim.thumbnails.clear();
    for program in &mut slim.programs {
        program.thumbnail = None;
    }
    Ok(serde_json::to_string(&slim)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_work_state_priority_and_dedupe() {
        let mut work = WorkState::default();
        assert!(work.push_probe(PathBuf::from("/a.mkv")));
        assert!(!work.push_probe(PathBuf::from("/a.mkv")));
        work.matching.push_back((1, "Film".into()));
        assert!(work.push_scan(PathBuf::from("/dir")));
        assert_eq!(work.pending(), 3);

        assert!(matches!(work.pop(), Some(Task::Scan(_))));
        assert!(matches!(work.pop(), Some(Task::Probe(_))));
        assert!(matches!(work.pop(), Some(Task::Match(1, _))));
        assert!(work.pop().is_none());

        // Popped work may be queued again.
        assert!(work.push_probe(PathBuf::from("/a.mkv")));
    }

    #[test]
    fn test_media_info_drops_thumbnails() {
        let record = MediaRecord {
            thumbnails: vec![crate::model::Thumbnail {
                width: 1,
                height: 1,
                png: vec![1, 2, 3],
            }],
            ..MediaRecord::default()
        };
        let json = media_info_json(&record).unwrap();
        let back: MediaRecord = serde_json::from_str(&json).unwrap();
        assert!(back.thumbnails.is_empty());
    }
}
