/// Speculative background probing.
///
/// The pre-probe scheduler owns one dedicated thread that drains a priority
/// queue of [`PreProbeRequest`]s into the probe cache, so that by the time a
/// client asks for a file's metadata it is usually already there.
///
/// # Ordering
///
/// Requests are keyed by `(priority, insertion sequence)`: lower priorities
/// first, FIFO among equals. A request with a negative priority names a
/// directory: it is listed through the [`ListingCache`] and each file child
/// from `start_offset` on is re-inserted with its position as priority, so
/// the first page a client is looking at is probed first.
///
/// # Batching
///
/// Consecutive per-item requests asking for the same probe depth are popped
/// together, up to `batch_limit`, and sent as one probe call. Entries whose
/// cached record is already valid for the requested depth are skipped.
///
/// # Shutdown
///
/// [`PreProbeScheduler::shutdown`] raises the flag and wakes the thread,
/// which finishes the batch it is working on and exits. Requests still
/// queued are dropped.
use crate::cache::ListingCache;
use crate::error::Result;
use crate::fs::MediaFs;
use crate::model::{FileEntry, ProbeKind};
use crate::service::ProbeService;
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Priority used for directory enumeration requests.
pub const DIRECTORY_PRIORITY: i32 = -1;

#[derive(Debug, Clone)]
pub struct PreProbeRequest {
    /// `< 0` enumerates a directory, `>= 0` probes one file.
    pub priority: i32,
    pub entry: FileEntry,
    /// First child considered when enumerating a directory.
    pub start_offset: usize,
    pub wants_content: bool,
}

impl PreProbeRequest {
    fn kind(&self) -> ProbeKind {
        if self.wants_content {
            ProbeKind::Content
        } else {
            ProbeKind::Format
        }
    }
}

#[derive(Default)]
struct QueueState {
    items: BTreeMap<(i32, u64), PreProbeRequest>,
    seq: u64,
    shutdown: bool,
    busy: bool,
}

struct Shared {
    queue: Mutex<QueueState>,
    wake: Condvar,
    idle: Condvar,
    service: Arc<ProbeService>,
    listing: Arc<ListingCache>,
    fs: Arc<dyn MediaFs>,
    batch_limit: usize,
}

enum Job {
    List(PreProbeRequest),
    Probe(ProbeKind, Vec<FileEntry>),
}

pub struct PreProbeScheduler {
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PreProbeScheduler {
    /// Start the scheduler thread.
    pub fn start(
        service: Arc<ProbeService>,
        listing: Arc<ListingCache>,
        fs: Arc<dyn MediaFs>,
        batch_limit: usize,
    ) -> Result<Self> {
        let shared = Arc::new(Shared {
            queue: Mutex::new(QueueState::default()),
            wake: Condvar::new(),
            idle: Condvar::new(),
            service,
            listing,
            fs,
            batch_limit: batch_limit.max(1),
        });
        let worker = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("mediadex-preprobe".to_owned())
            .spawn(move || run(&worker))?;
        Ok(Self {
            shared,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn enqueue(&self, request: PreProbeRequest) {
        let mut queue = self.shared.queue.lock();
        if queue.shutdown {
            return;
        }
        insert(&mut queue, request);
        self.shared.wake.notify_one();
    }

    /// Pre-probe the files of `dir` from `start_offset` on.
    pub fn enqueue_dir(&self, dir: FileEntry, start_offset: usize, wants_content: bool) {
        self.enqueue(PreProbeRequest {
            priority: DIRECTORY_PRIORITY,
            entry: dir,
            start_offset,
            wants_content,
        });
    }

    /// Requests waiting in the queue.
    pub fn pending(&self) -> usize {
        self.shared.queue.lock().items.len()
    }

    /// Block until the queue is empty and the thread is idle, or `timeout`
    /// elapses. Returns whether the scheduler went idle.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut queue = self.shared.queue.lock();
        while !queue.items.is_empty() || queue.busy {
            if self
                .shared
                .idle
                .wait_until(&mut queue, deadline)
                .timed_out()
            {
                return false;
            }
        }
        true
    }

    /// Stop the thread after its current batch. Idempotent.
    pub fn shutdown(&self) {
        {
            let mut queue = self.shared.queue.lock();
            queue.shutdown = true;
            self.shared.wake.notify_all();
        }
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                warn!("Pre-probe thread panicked");
            }
        }
    }
}

impl Drop for PreProbeScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn insert(queue: &mut QueueState, request: PreProbeRequest) {
    queue.seq += 1;
    let key = (request.priority, queue.seq);
    queue.items.insert(key, request);
}

// ─── Worker thread ──────────────────────────────────────────────────────────

fn run(shared: &Shared) {
    debug!("Pre-probe: thread started");
    while let Some(job) = next_job(shared) {
        match job {
            Job::List(request) => expand_directory(shared, request),
            Job::Probe(kind, entries) => {
                let pending: Vec<FileEntry> = entries
                    .into_iter()
                    .filter(|entry| shared.service.cached(entry, kind).is_none())
                    .collect();
                if !pending.is_empty() {
                    let probed = shared.service.probe_entries(kind, &pending);
                    debug!("Pre-probe: {} of {} {} probes succeeded", probed.len(), pending.len(), kind);
                }
            }
        }
    }
    info!("Pre-probe: thread exiting");
}

/// Wait for work and pop the next job. `None` means shut down.
fn next_job(shared: &Shared) -> Option<Job> {
    let mut queue = shared.queue.lock();
    queue.busy = false;
    loop {
        if queue.shutdown {
            shared.idle.notify_all();
            return None;
        }
        if !queue.items.is_empty() {
            break;
        }
        shared.idle.notify_all();
        shared.wake.wait(&mut queue);
    }
    queue.busy = true;

    let (_, first) = queue.items.pop_first()?;
    if first.priority < 0 {
        return Some(Job::List(first));
    }

    let kind = first.kind();
    let mut entries = vec![first.entry];
    while entries.len() < shared.batch_limit {
        let same_kind = queue
            .items
            .first_key_value()
            .is_some_and(|((priority, _), next)| *priority >= 0 && next.kind() == kind);
        if !same_kind {
            break;
        }
        if let Some((_, next)) = queue.items.pop_first() {
            entries.push(next.entry);
        }
    }
    Some(Job::Probe(kind, entries))
}

fn expand_directory(shared: &Shared, request: PreProbeRequest) {
    let dir = &request.entry.path;
    let names = match shared.listing.list_names(dir) {
        Ok(names) => names,
        Err(e) => {
            debug!("Pre-probe: cannot list {:?}: {}", dir, e);
            return;
        }
    };

    let children: Vec<PreProbeRequest> = names
        .iter()
        .skip(request.start_offset)
        .enumerate()
        .filter(|(_, name)| !name.ends_with('/'))
        .filter_map(|(position, name)| {
            let entry = shared.fs.read_info(&dir.join(name.as_str())).ok()?;
            Some(PreProbeRequest {
                priority: i32::try_from(position).unwrap_or(i32::MAX),
                entry,
                start_offset: 0,
                wants_content: request.wants_content,
            })
        })
        .collect();

    debug!("Pre-probe: {} files queued from {:?}", children.len(), dir);
    let mut queue = shared.queue.lock();
    if queue.shutdown {
        return;
    }
    for child in children {
        insert(&mut queue, child);
    }
}
