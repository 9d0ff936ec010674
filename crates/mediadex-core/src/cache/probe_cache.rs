/// Durable probe cache: an append-only log of JSON-serialised
/// [`MediaRecord`]s with an in-memory `hash(path) -> [offset]` index.
///
/// # Layout
///
/// One record per line. The file is only ever appended to or truncated to
/// zero, so an offset stays valid for the lifetime of the log generation it
/// was recorded in.
///
/// # Index
///
/// Built lazily on the first operation by scanning the log from offset 0.
/// Hash collisions and superseded records for the same path coexist in a
/// bucket; lookups walk the bucket newest first and return the first record
/// whose path (and, for [`ProbeCache::lookup_entry`], size and mtime)
/// matches.
///
/// # Self-healing
///
/// Any seek, read or parse failure is treated as corruption: the log is
/// truncated to zero and the index cleared. Callers just see a miss.
///
/// All operations are serialised by one mutex.
use crate::error::Result;
use crate::model::{FileEntry, MediaRecord};
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::hash::Hasher;
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use twox_hash::XxHash64;

const SEPARATOR: u8 = b'\n';

pub struct ProbeCache {
    inner: Mutex<CacheLog>,
}

struct CacheLog {
    path: PathBuf,
    file: File,
    index: HashMap<u64, Vec<u64>>,
    loaded: bool,
    last_flush: Instant,
}

/// The only field needed to rebuild the index.
#[derive(Deserialize)]
struct IndexProbe {
    file_path: PathBuf,
}

/// Hash used as the index key.
pub(crate) fn path_hash(path: &Path) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(path.as_os_str().as_encoded_bytes());
    hasher.finish()
}

impl ProbeCache {
    /// Open (or create) the log at `path`. The index is not built until the
    /// first lookup or store.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)?;
        debug!("Probe cache: opened {:?}", path);
        Ok(Self {
            inner: Mutex::new(CacheLog {
                path,
                file,
                index: HashMap::new(),
                loaded: false,
                last_flush: Instant::now(),
            }),
        })
    }

    /// Most recent record stored for `path`, regardless of freshness.
    pub fn lookup(&self, path: &Path) -> Option<MediaRecord> {
        self.inner.lock().find(path, |_| true)
    }

    /// Most recent record for `entry.path` that is still valid for the live
    /// file (same size, mtime within tolerance).
    pub fn lookup_entry(&self, entry: &FileEntry) -> Option<MediaRecord> {
        self.inner
            .lock()
            .find(&entry.path, |record| record.is_valid_for(entry))
    }

    /// Append `record`. It supersedes every earlier record for its path.
    pub fn store(&self, record: &MediaRecord) -> Result<()> {
        let mut log = self.inner.lock();
        log.ensure_loaded();
        let mut line = serde_json::to_vec(record)?;
        line.push(SEPARATOR);

        let offset = log.file.seek(SeekFrom::End(0))?;
        if let Err(e) = log.file.write_all(&line) {
            warn!("Probe cache: append failed at {}: {}", offset, e);
            log.reset();
            return Err(e.into());
        }
        log.index
            .entry(path_hash(&record.file_path))
            .or_default()
            .push(offset);
        Ok(())
    }

    /// Drop every record.
    pub fn flush(&self) {
        let mut log = self.inner.lock();
        info!("Probe cache: flushing {:?}", log.path);
        log.reset();
        log.loaded = true;
    }

    /// Flush when `interval` has elapsed since the last flush. Returns
    /// whether a flush happened.
    pub fn flush_if_due(&self, interval: Duration) -> bool {
        let due = self.inner.lock().last_flush.elapsed() >= interval;
        if due {
            self.flush();
        }
        due
    }

    /// Current size of the log file in bytes.
    pub fn len_bytes(&self) -> u64 {
        self.inner
            .lock()
            .file
            .metadata()
            .map(|m| m.len())
            .unwrap_or(0)
    }

    /// Number of distinct offsets currently indexed.
    pub fn indexed_records(&self) -> usize {
        let mut log = self.inner.lock();
        log.ensure_loaded();
        log.index.values().map(Vec::len).sum()
    }
}

impl CacheLog {
    fn ensure_loaded(&mut self) {
        if self.loaded {
            return;
        }
        self.loaded = true;
        if let Err(reason) = self.rebuild_index() {
            warn!("Probe cache: corrupt log {:?} ({}), truncating", self.path, reason);
            self.reset();
        } else {
            debug!(
                "Probe cache: indexed {} records from {:?}",
                self.index.values().map(Vec::len).sum::<usize>(),
                self.path
            );
        }
    }

    fn rebuild_index(&mut self) -> std::result::Result<(), String> {
        self.index.clear();
        self.file.seek(SeekFrom::Start(0)).map_err(|e| e.to_string())?;
        let mut reader = BufReader::new(&self.file);
        let mut offset = 0u64;
        let mut line = Vec::new();
        loop {
            line.clear();
            let read = reader
                .read_until(SEPARATOR, &mut line)
                .map_err(|e| e.to_string())?;
            if read == 0 {
                return Ok(());
            }
            if line.last() != Some(&SEPARATOR) {
                return Err(format!("unterminated record at {offset}"));
            }
            let probe: IndexProbe = serde_json::from_slice(&line[..read - 1])
                .map_err(|e| format!("bad record at {offset}: {e}"))?;
            self.index
                .entry(path_hash(&probe.file_path))
                .or_default()
                .push(offset);
            offset += read as u64;
        }
    }

    fn find(&mut self, path: &Path, accept: impl Fn(&MediaRecord) -> bool) -> Option<MediaRecord> {
        self.ensure_loaded();
        let offsets = self.index.get(&path_hash(path))?.clone();
        for offset in offsets.into_iter().rev() {
            let record = match self.read_at(offset) {
                Ok(record) => record,
                Err(reason) => {
                    warn!("Probe cache: corrupt record in {:?} ({}), truncating", self.path, reason);
                    self.reset();
                    return None;
                }
            };
            if record.file_path == path && accept(&record) {
                return Some(record);
            }
        }
        None
    }

    fn read_at(&mut self, offset: u64) -> std::result::Result<MediaRecord, String> {
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(|e| e.to_string())?;
        let mut reader = BufReader::new(&self.file);
        let mut line = Vec::new();
        reader
            .read_until(SEPARATOR, &mut line)
            .map_err(|e| e.to_string())?;
        if line.pop() != Some(SEPARATOR) {
            return Err(format!("short read at {offset}"));
        }
        serde_json::from_slice(&line).map_err(|e| format!("bad record at {offset}: {e}"))
    }

    /// Truncate the log and forget every offset.
    fn reset(&mut self) {
        self.index.clear();
        if let Err(e) = self.file.set_len(0) {
            warn!("Probe cache: truncate of {:?} failed: {}", self.path, e);
        }
        self.last_flush = Instant::now();
    }
}
