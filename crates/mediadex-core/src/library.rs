/// Composition root and public read API.
///
/// [`MediaLibrary`] wires every subsystem together exactly once: the probe
/// cache, the listing cache and its directory watcher, the sandbox (or an
/// in-process prober), the pre-probe scheduler and the catalog. Consumers
/// get plain values back: failures are logged and degrade to `None` or an
/// empty list, never to an error.
///
/// A maintenance thread runs alongside the workers. It forwards directory
/// change notifications to the listing cache and the catalog, flushes the
/// probe cache when its interval elapses, stops an idle sandbox and
/// periodically re-queues files that could not be opened yet.
use crate::cache::{ListingCache, ProbeCache};
use crate::catalog::{Catalog, CatalogOptions, TitleMatcher};
use crate::config::Config;
use crate::error::Result;
use crate::events::{EventBus, MediaEvent};
use crate::fs::{LocalFs, MediaFs};
use crate::model::{FileEntry, MediaRecord, ProbeKind};
use crate::preprobe::PreProbeScheduler;
use crate::probe::{NativeProber, Prober};
use crate::sandbox::Sandbox;
use crate::service::{ProbeBackend, ProbeService};
use crate::watch::DirWatcher;
use crossbeam_channel::{bounded, never, select, tick, Receiver, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Maintenance thread period.
const MAINTENANCE_TICK: Duration = Duration::from_secs(1);

/// Optional overrides applied when building a [`MediaLibrary`].
pub struct LibraryBuilder {
    config: Config,
    fs: Option<Arc<dyn MediaFs>>,
    prober: Option<Arc<dyn Prober>>,
    matcher: Option<Arc<dyn TitleMatcher>>,
    watch: bool,
}

impl LibraryBuilder {
    pub fn fs(mut self, fs: Arc<dyn MediaFs>) -> Self {
        self.fs = Some(fs);
        self
    }

    /// Probe in-process with `prober` instead of the configured backend.
    pub fn prober(mut self, prober: Arc<dyn Prober>) -> Self {
        self.prober = Some(prober);
        self
    }

    pub fn matcher(mut self, matcher: Arc<dyn TitleMatcher>) -> Self {
        self.matcher = Some(matcher);
        self
    }

    /// Do not register a filesystem watcher.
    pub fn without_watcher(mut self) -> Self {
        self.watch = false;
        self
    }

    pub fn build(self) -> Result<MediaLibrary> {
        let config = self.config.validated()?;
        let fs = self.fs.unwrap_or_else(|| Arc::new(LocalFs) as Arc<dyn MediaFs>);
        let events = Arc::new(EventBus::new());

        let (watcher, watch_rx) = if self.watch {
            match DirWatcher::new() {
                Ok((watcher, rx)) => (Some(Arc::new(watcher)), Some(rx)),
                Err(e) => {
                    warn!("Directory watching unavailable: {}", e);
                    (None, None)
                }
            }
        } else {
            (None, None)
        };

        let probe_cache = Arc::new(ProbeCache::open(config.probe_cache_path())?);
        let listing = Arc::new(ListingCache::new(
            Arc::clone(&fs),
            config.listing_ttl(),
            watcher.clone(),
            Arc::clone(&events),
        ));

        let backend = match (self.prober, &config.sandbox) {
            (Some(prober), _) => ProbeBackend::InProcess(prober),
            (None, Some(command)) => {
                info!("Probing through sandbox {:?}", command.program);
                ProbeBackend::Sandboxed(Arc::new(Sandbox::new(
                    command.clone(),
                    config.max_request_line,
                )))
            }
            (None, None) => {
                info!("Probing in-process");
                ProbeBackend::InProcess(Arc::new(NativeProber::new(config.ffprobe.clone())))
            }
        };
        // Foreground reads, pre-probing and the catalog never share a worker.
        let new_service = |backend: ProbeBackend| {
            Arc::new(ProbeService::new(
                Arc::clone(&probe_cache),
                Arc::clone(&fs),
                backend,
            ))
        };
        let preprobe_service = new_service(backend.detached());
        let catalog_service = new_service(backend.detached());
        let service = new_service(backend);
        let sandboxes: Vec<Arc<Sandbox>> = [&service, &preprobe_service, &catalog_service]
            .into_iter()
            .filter_map(|s| s.sandbox().cloned())
            .collect();

        let batch_limit = config.preprobe_batch_factor.max(1) * num_cpus::get().max(1);
        let preprobe = PreProbeScheduler::start(
            preprobe_service,
            Arc::clone(&listing),
            Arc::clone(&fs),
            batch_limit,
        )?;

        let catalog = Catalog::open(
            &config.catalog_path(),
            CatalogOptions::from_config(&config),
            Arc::clone(&fs),
            catalog_service,
            Arc::clone(&events),
            self.matcher,
        )?;

        let maintenance = Maintenance {
            probe_cache: Arc::clone(&probe_cache),
            listing: Arc::clone(&listing),
            sandboxes: sandboxes.clone(),
            catalog: Arc::clone(&catalog),
            flush_interval: config.cache_flush_interval(),
            sandbox_idle: config.sandbox_idle_timeout(),
            retry_interval: config.retry_interval(),
        };
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let handle = std::thread::Builder::new()
            .name("mediadex-maintenance".to_owned())
            .spawn(move || maintenance.run(stop_rx, watch_rx))?;

        info!("Media library ready, data in {:?}", config.data_dir);
        Ok(MediaLibrary {
            config,
            fs,
            events,
            probe_cache,
            listing,
            service,
            sandboxes,
            preprobe,
            catalog,
            _watcher: watcher,
            maintenance: Mutex::new(Some((stop_tx, handle))),
        })
    }
}

pub struct MediaLibrary {
    config: Config,
    fs: Arc<dyn MediaFs>,
    events: Arc<EventBus>,
    probe_cache: Arc<ProbeCache>,
    listing: Arc<ListingCache>,
    service: Arc<ProbeService>,
    sandboxes: Vec<Arc<Sandbox>>,
    preprobe: PreProbeScheduler,
    catalog: Arc<Catalog>,
    _watcher: Option<Arc<DirWatcher>>,
    maintenance: Mutex<Option<(Sender<()>, JoinHandle<()>)>>,
}

impl MediaLibrary {
    pub fn builder(config: Config) -> LibraryBuilder {
        LibraryBuilder {
            config,
            fs: None,
            prober: None,
            matcher: None,
            watch: true,
        }
    }

    /// Build a library with the configured backends.
    pub fn open(config: Config) -> Result<Self> {
        Self::builder(config).build()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn probe_cache(&self) -> &Arc<ProbeCache> {
        &self.probe_cache
    }

    pub fn preprobe(&self) -> &PreProbeScheduler {
        &self.preprobe
    }

    pub fn subscribe(&self) -> Receiver<MediaEvent> {
        self.events.subscribe()
    }

    /// Start a full catalog pass. Returns immediately; use
    /// [`Catalog::wait_idle`] to wait for it.
    pub fn scan(&self) -> Result<()> {
        self.catalog.scan_all()
    }

    // ─── Read API ───────────────────────────────────────────────────────────

    /// Container format only. Cheap; served from the cache when possible.
    pub fn read_format_only(&self, path: &Path) -> Option<MediaRecord> {
        self.service.read(path, ProbeKind::Format)
    }

    /// Streams, duration, chapters, tags and thumbnails.
    pub fn read_full_content(&self, path: &Path) -> Option<MediaRecord> {
        self.service.read(path, ProbeKind::Content)
    }

    /// PNG thumbnail no larger than `max_edge` pixels on either side.
    pub fn read_thumbnail(&self, path: &Path, max_edge: u32) -> Option<Vec<u8>> {
        self.service.thumbnail(path, max_edge)
    }

    /// One page of `dir` with every file format-probed. `count == 0` lists
    /// everything from `start`; a negative count returns up to `-count`
    /// evenly spaced samples. Full listings queue the files for background
    /// content probing, starting at `start`.
    pub fn list_directory(&self, dir: &Path, start: usize, count: i32) -> Vec<MediaRecord> {
        let names = match self.listing.list_page(dir, start, count) {
            Ok(names) => names,
            Err(e) => {
                debug!("Cannot list {:?}: {}", dir, e);
                return Vec::new();
            }
        };
        let entries: Vec<FileEntry> = names
            .iter()
            .filter_map(|name| {
                let path = dir.join(name.trim_end_matches('/'));
                self.fs.read_info(&path).ok()
            })
            .collect();
        let records = self.describe(&entries);

        if count >= 0 {
            match self.fs.read_info(dir) {
                Ok(dir_entry) => self.preprobe.enqueue_dir(dir_entry, start, true),
                Err(e) => debug!("Cannot stat {:?}: {}", dir, e),
            }
        }
        records
    }

    /// Whether `dir` has nothing worth listing. Unreadable directories count
    /// as empty.
    pub fn is_empty(&self, dir: &Path) -> bool {
        self.listing
            .list_names(dir)
            .map(|names| names.is_empty())
            .unwrap_or(true)
    }

    /// Up to `count` entries spread evenly across `dir`.
    pub fn representative_sample(&self, dir: &Path, count: usize) -> Vec<MediaRecord> {
        if count == 0 {
            return Vec::new();
        }
        let count = i32::try_from(count).unwrap_or(i32::MAX);
        self.list_directory(dir, 0, -count)
    }

    pub fn last_playback_position(&self, path: &Path) -> Option<f64> {
        self.catalog
            .playback_position(path)
            .unwrap_or_else(|e| {
                warn!("Cannot read playback position of {:?}: {}", path, e);
                None
            })
    }

    /// Remember where playback of `path` stopped. Zero or less forgets it.
    pub fn set_last_playback_position(&self, path: &Path, seconds: f64) {
        if let Err(e) = self.catalog.set_playback_position(path, seconds) {
            warn!("Cannot store playback position of {:?}: {}", path, e);
        }
    }

    /// Format-level records for `entries`, in order. Directories and files
    /// that could not be probed get a bare record.
    fn describe(&self, entries: &[FileEntry]) -> Vec<MediaRecord> {
        let cached: Vec<Option<MediaRecord>> = entries
            .iter()
            .map(|entry| {
                if entry.is_dir {
                    Some(MediaRecord::for_entry(entry))
                } else {
                    self.service.cached(entry, ProbeKind::Format)
                }
            })
            .collect();
        let missing: Vec<FileEntry> = entries
            .iter()
            .zip(&cached)
            .filter(|(_, record)| record.is_none())
            .map(|(entry, _)| entry.clone())
            .collect();
        let mut probed: HashMap<PathBuf, MediaRecord> = self
            .service
            .probe_entries(ProbeKind::Format, &missing)
            .into_iter()
            .map(|record| (record.file_path.clone(), record))
            .collect();

        entries
            .iter()
            .zip(cached)
            .map(|(entry, record)| {
                record
                    .or_else(|| probed.remove(&entry.path))
                    .unwrap_or_else(|| MediaRecord::for_entry(entry))
            })
            .collect()
    }

    // ─── Shutdown ───────────────────────────────────────────────────────────

    /// Stop background work and release the sandbox. Idempotent.
    pub fn shutdown(&self) {
        if let Some((stop_tx, handle)) = self.maintenance.lock().take() {
            let _ = stop_tx.send(());
            if handle.join().is_err() {
                warn!("Maintenance thread panicked");
            }
        }
        self.preprobe.shutdown();
        self.catalog.shutdown();
        for sandbox in &self.sandboxes {
            sandbox.stop();
        }
        info!("Media library shut down");
    }
}

impl Drop for MediaLibrary {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ─── Maintenance thread ─────────────────────────────────────────────────────

struct Maintenance {
    probe_cache: Arc<ProbeCache>,
    listing: Arc<ListingCache>,
    sandboxes: Vec<Arc<Sandbox>>,
    catalog: Arc<Catalog>,
    flush_interval: Duration,
    sandbox_idle: Duration,
    retry_interval: Duration,
}

impl Maintenance {
    fn run(self, stop: Receiver<()>, changes: Option<Receiver<PathBuf>>) {
        debug!("Maintenance: started");
        let mut changes = changes.unwrap_or_else(never);
        let ticker = tick(MAINTENANCE_TICK);
        let mut last_retry = Instant::now();
        loop {
            select! {
                recv(stop) -> _ => break,
                recv(changes) -> msg => match msg {
                    Ok(dir) => self.on_change(&dir),
                    Err(_) => {
                        debug!("Maintenance: watcher channel closed");
                        changes = never();
                    }
                },
                recv(ticker) -> _ => {
                    if last_retry.elapsed() >= self.retry_interval {
                        last_retry = Instant::now();
                        self.retry_unprobed();
                    }
                    self.on_tick();
                }
            }
        }
        debug!("Maintenance: stopped");
    }

    fn on_change(&self, dir: &Path) {
        debug!("Maintenance: {:?} changed", dir);
        self.listing.notify_changed(dir);
        self.catalog.enqueue_scan(dir);
    }

    fn on_tick(&self) {
        self.probe_cache.flush_if_due(self.flush_interval);
        for sandbox in &self.sandboxes {
            sandbox.stop_if_idle(self.sandbox_idle);
        }
    }

    fn retry_unprobed(&self) {
        if !self.catalog.is_idle() {
            return;
        }
        match self.catalog.enqueue_unprobed() {
            Ok(0) => {}
            Ok(n) => debug!("Maintenance: retrying {} unprobed files", n),
            Err(e) => warn!("Maintenance: cannot list unprobed files: {}", e),
        }
    }
}
