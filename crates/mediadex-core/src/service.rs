/// Cache-first probing.
///
/// [`ProbeService`] answers "what is in this file" by consulting the
/// [`ProbeCache`] first and only probing on a miss, through either the
/// [`Sandbox`] or an in-process [`Prober`]. Fresh results are stored before
/// being returned, so every caller (read API, pre-probe scheduler, catalog)
/// warms the cache for the others.
use crate::cache::ProbeCache;
use crate::fs::MediaFs;
use crate::model::{FileEntry, MediaRecord, ProbeKind};
use crate::probe::Prober;
use crate::sandbox::Sandbox;
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Where probes actually run.
#[derive(Clone)]
pub enum ProbeBackend {
    Sandboxed(Arc<Sandbox>),
    InProcess(Arc<dyn Prober>),
}

impl ProbeBackend {
    /// A backend of the same kind that shares no worker process with `self`.
    pub fn detached(&self) -> Self {
        match self {
            Self::Sandboxed(sandbox) => Self::Sandboxed(Arc::new(sandbox.sibling())),
            Self::InProcess(prober) => Self::InProcess(Arc::clone(prober)),
        }
    }
}

pub struct ProbeService {
    cache: Arc<ProbeCache>,
    fs: Arc<dyn MediaFs>,
    backend: ProbeBackend,
}

impl ProbeService {
    pub fn new(cache: Arc<ProbeCache>, fs: Arc<dyn MediaFs>, backend: ProbeBackend) -> Self {
        Self { cache, fs, backend }
    }

    pub fn cache(&self) -> &Arc<ProbeCache> {
        &self.cache
    }

    pub fn sandbox(&self) -> Option<&Arc<Sandbox>> {
        match &self.backend {
            ProbeBackend::Sandboxed(sandbox) => Some(sandbox),
            ProbeBackend::InProcess(_) => None,
        }
    }

    /// Stat `path` and read it through the cache.
    pub fn read(&self, path: &Path, kind: ProbeKind) -> Option<MediaRecord> {
        match self.fs.read_info(path) {
            Ok(entry) => self.read_entry(&entry, kind),
            Err(e) => {
                debug!("Cannot stat {:?}: {}", path, e);
                None
            }
        }
    }

    /// Cached record for `entry` if it is still valid and deep enough,
    /// otherwise a fresh probe.
    pub fn read_entry(&self, entry: &FileEntry, kind: ProbeKind) -> Option<MediaRecord> {
        if let Some(record) = self.cached(entry, kind) {
            return Some(record);
        }
        self.probe_entries(kind, std::slice::from_ref(entry))
            .into_iter()
            .next()
    }

    /// Valid cached record of at least depth `kind`.
    pub fn cached(&self, entry: &FileEntry, kind: ProbeKind) -> Option<MediaRecord> {
        self.cache
            .lookup_entry(entry)
            .filter(|record| record.satisfies(kind))
    }

    /// Probe every entry (ignoring the cache) and store the results.
    pub fn probe_entries(&self, kind: ProbeKind, entries: &[FileEntry]) -> Vec<MediaRecord> {
        if entries.is_empty() {
            return Vec::new();
        }
        let records = match &self.backend {
            ProbeBackend::Sandboxed(sandbox) => {
                let paths: Vec<PathBuf> = entries.iter().map(|e| e.path.clone()).collect();
                sandbox.probe_many(kind, &paths)
            }
            ProbeBackend::InProcess(prober) => entries
                .par_iter()
                .filter_map(|entry| match prober.probe(kind, &entry.path) {
                    Ok(record) => Some(record),
                    Err(e) => {
                        debug!("{} probe of {:?} failed: {}", kind, entry.path, e);
                        None
                    }
                })
                .collect(),
        };

        for record in &records {
            if let Err(e) = self.cache.store(record) {
                warn!("Cannot cache probe of {:?}: {}", record.file_path, e);
            }
        }
        records
    }

    /// PNG thumbnail of `path`.
    pub fn thumbnail(&self, path: &Path, max_edge: u32) -> Option<Vec<u8>> {
        match &self.backend {
            ProbeBackend::Sandboxed(sandbox) => sandbox.read_thumbnail(path, max_edge),
            ProbeBackend::InProcess(prober) => match prober.thumbnail(path, max_edge) {
                Ok(png) => png,
                Err(e) => {
                    debug!("Thumbnail of {:?} failed: {}", path, e);
                    None
                }
            },
        }
    }
}
