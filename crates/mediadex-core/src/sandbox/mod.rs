/// Process sandbox around the prober.
///
/// Parsing untrusted media can crash or hang, so probes run in a child
/// worker process (`mediadex sandbox-worker` by default) spoken to over its
/// stdin/stdout with the line protocol in [`protocol`].
///
/// # Lifecycle
///
/// ```text
/// Stopped -> Starting -> Running -> Crashed -> Starting ...
///                                \-> Stopping -> Stopped
/// ```
///
/// The worker is started lazily by the first request, restarted after a
/// crash by the next one, and stopped by [`Sandbox::stop_if_idle`] once it
/// has been unused for the idle timeout.
///
/// # Crashes
///
/// A crash is detected by EOF or a pipe error during a round trip, or by a
/// liveness check right after one. It never surfaces as an error: the
/// [`CrashStrategy`] decides whether the batch is resubmitted one path at a
/// time, and paths that still crash simply get no result.
pub mod protocol;
pub mod retry;
pub mod worker;

use crate::config::SandboxCommand;
use crate::error::{Error, Result};
use crate::model::{MediaRecord, ProbeKind};
use parking_lot::Mutex;
use protocol::Request;
use retry::{CrashAction, CrashStrategy, IsolateOffender};
use std::collections::HashSet;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Grace period for a worker to exit after its stdin is closed.
const STOP_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SandboxState {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Crashed = 3,
    Stopping = 4,
}

impl SandboxState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Starting,
            2 => Self::Running,
            3 => Self::Crashed,
            4 => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

struct WorkerProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

/// Marker for a round trip that ended with a dead worker.
struct Crashed;

pub struct Sandbox {
    command: SandboxCommand,
    max_line: usize,
    strategy: Box<dyn CrashStrategy>,
    process: Mutex<Option<WorkerProcess>>,
    state: AtomicU8,
    created: Instant,
    /// Milliseconds since `created` of the last request.
    last_used_ms: AtomicU64,
    crashes: AtomicU64,
}

impl Sandbox {
    pub fn new(command: SandboxCommand, max_line: usize) -> Self {
        Self::with_strategy(command, max_line, Box::new(IsolateOffender))
    }

    pub fn with_strategy(
        command: SandboxCommand,
        max_line: usize,
        strategy: Box<dyn CrashStrategy>,
    ) -> Self {
        Self {
            command,
            max_line,
            strategy,
            process: Mutex::new(None),
            state: AtomicU8::new(SandboxState::Stopped as u8),
            created: Instant::now(),
            last_used_ms: AtomicU64::new(0),
            crashes: AtomicU64::new(0),
        }
    }

    /// A new, stopped sandbox running the same worker command.
    pub fn sibling(&self) -> Self {
        Self::new(self.command.clone(), self.max_line)
    }

    pub fn state(&self) -> SandboxState {
        SandboxState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Number of worker crashes observed so far.
    pub fn crash_count(&self) -> u64 {
        self.crashes.load(Ordering::Relaxed)
    }

    fn set_state(&self, state: SandboxState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn touch(&self) {
        self.last_used_ms
            .store(self.created.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_used_ms.load(Ordering::Relaxed));
        self.created.elapsed().saturating_sub(last)
    }

    pub fn probe(&self, kind: ProbeKind, path: &Path) -> Option<MediaRecord> {
        self.probe_many(kind, &[path.to_path_buf()]).into_iter().next()
    }

    /// Probe `paths`, batching as many as fit in one request line. Paths that
    /// fail, crash the worker or cannot be encoded are missing from the
    /// result.
    pub fn probe_many(&self, kind: ProbeKind, paths: &[PathBuf]) -> Vec<MediaRecord> {
        let mut records = Vec::with_capacity(paths.len());
        for batch in self.batches(kind, paths) {
            match self.probe_batch(kind, &batch) {
                Ok(mut found) => records.append(&mut found),
                Err(Crashed) => match self.strategy.on_crash(batch.len()) {
                    CrashAction::ResubmitIndividually => {
                        warn!("Sandbox: resubmitting {} paths one by one", batch.len());
                        for path in batch {
                            match self.probe_batch(kind, std::slice::from_ref(&path)) {
                                Ok(mut found) => records.append(&mut found),
                                Err(Crashed) => {
                                    warn!("Sandbox: worker crashed on {:?}, skipping", path)
                                }
                            }
                        }
                    }
                    CrashAction::Skip => {
                        warn!("Sandbox: skipping {} paths after crash", batch.len())
                    }
                },
            }
        }
        records
    }

    /// PNG thumbnail of `path`, at most `max_edge` pixels on either side.
    pub fn read_thumbnail(&self, path: &Path, max_edge: u32) -> Option<Vec<u8>> {
        let request = Request::Thumbnail {
            max_edge,
            path: path.to_path_buf(),
        };
        let line = match request.encode() {
            Ok(line) => line,
            Err(e) => {
                warn!("Sandbox: {}", e);
                return None;
            }
        };
        let response = self.round_trip(&line).ok()?;
        match protocol::decode_thumbnail_response(&response) {
            Ok(png) => png,
            Err(e) => {
                warn!("Sandbox: thumbnail of {:?}: {}", path, e);
                None
            }
        }
    }

    /// Split `paths` into request-sized batches, dropping unencodable ones.
    fn batches(&self, kind: ProbeKind, paths: &[PathBuf]) -> Vec<Vec<PathBuf>> {
        let header = protocol::probe_header(kind).len();
        let mut batches = Vec::new();
        let mut current: Vec<PathBuf> = Vec::new();
        let mut len = header;
        for path in paths {
            if !protocol::is_encodable(path) {
                warn!("Sandbox: cannot send {:?} to the worker", path);
                continue;
            }
            let add = protocol::encoded_len(path);
            if !current.is_empty() && len + add > self.max_line {
                batches.push(std::mem::take(&mut current));
                len = header;
            }
            len += add;
            current.push(path.clone());
        }
        if !current.is_empty() {
            batches.push(current);
        }
        batches
    }

    fn probe_batch(&self, kind: ProbeKind, batch: &[PathBuf]) -> std::result::Result<Vec<MediaRecord>, Crashed> {
        let request = Request::Probe {
            kind,
            paths: batch.to_vec(),
        };
        let line = match request.encode() {
            Ok(line) => line,
            Err(e) => {
                warn!("Sandbox: {}", e);
                return Ok(Vec::new());
            }
        };
        let response = self.round_trip(&line)?;
        let wanted: HashSet<&PathBuf> = batch.iter().collect();
        match protocol::decode_probe_response(&response) {
            Ok(records) => Ok(records
                .into_iter()
                .filter(|r| wanted.contains(&r.file_path))
                .collect()),
            Err(e) => {
                warn!("Sandbox: unreadable probe response: {}", e);
                Ok(Vec::new())
            }
        }
    }

    /// Send one request line and read one response line, starting the worker
    /// first if needed.
    fn round_trip(&self, line: &str) -> std::result::Result<String, Crashed> {
        let mut guard = self.process.lock();
        self.touch();

        if guard.is_none() {
            match self.spawn() {
                Ok(process) => *guard = Some(process),
                Err(e) => {
                    error!("Sandbox: cannot start worker: {}", e);
                    self.set_state(SandboxState::Stopped);
                    return Err(Crashed);
                }
            }
        }
        let Some(process) = guard.as_mut() else {
            return Err(Crashed);
        };

        let mut response = String::new();
        let io = process
            .stdin
            .write_all(line.as_bytes())
            .and_then(|_| process.stdin.write_all(b"\n"))
            .and_then(|_| process.stdin.flush())
            .and_then(|_| process.stdout.read_line(&mut response));

        let alive = matches!(process.child.try_wait(), Ok(None));
        let complete = matches!(io, Ok(n) if n > 0) && response.ends_with('\n');
        self.touch();

        if complete && alive {
            return Ok(response);
        }

        self.crashes.fetch_add(1, Ordering::Relaxed);
        self.set_state(SandboxState::Crashed);
        error!(
            "Sandbox: worker died during request ({})",
            match &io {
                Err(e) => e.to_string(),
                Ok(_) if !complete => "no response".to_owned(),
                Ok(_) => "exited after responding".to_owned(),
            }
        );
        if let Some(mut dead) = guard.take() {
            let _ = dead.child.kill();
            let _ = dead.child.wait();
        }
        if complete {
            // The answer arrived before the worker went away.
            Ok(response)
        } else {
            Err(Crashed)
        }
    }

    fn spawn(&self) -> Result<WorkerProcess> {
        self.set_state(SandboxState::Starting);
        let mut child = Command::new(&self.command.program)
            .args(&self.command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Sandbox("worker stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Sandbox("worker stdout unavailable".into()))?;
        info!("Sandbox: started worker pid {}", child.id());
        self.set_state(SandboxState::Running);
        Ok(WorkerProcess {
            child,
            stdin,
            stdout: BufReader::new(stdout),
        })
    }

    /// Stop the worker: close its stdin, give it a moment to exit, then kill.
    pub fn stop(&self) {
        let mut guard = self.process.lock();
        if let Some(process) = guard.take() {
            self.set_state(SandboxState::Stopping);
            shutdown_worker(process);
        }
        self.set_state(SandboxState::Stopped);
    }

    /// Stop the worker if it has been idle for `timeout`. Never waits for a
    /// request in flight. Returns whether the worker was stopped.
    pub fn stop_if_idle(&self, timeout: Duration) -> bool {
        if self.state() != SandboxState::Running || self.idle_for() < timeout {
            return false;
        }
        let Some(mut guard) = self.process.try_lock() else {
            return false;
        };
        let Some(process) = guard.take() else {
            return false;
        };
        debug!("Sandbox: idle for {:?}, stopping worker", timeout);
        self.set_state(SandboxState::Stopping);
        shutdown_worker(process);
        self.set_state(SandboxState::Stopped);
        true
    }
}

fn shutdown_worker(process: WorkerProcess) {
    let WorkerProcess {
        mut child,
        stdin,
        stdout,
    } = process;
    drop(stdin);
    drop(stdout);

    let deadline = Instant::now() + STOP_GRACE;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                debug!("Sandbox: worker exited with {}", status);
                return;
            }
            Ok(None) if Instant::now() < deadline => {
                std::thread::sleep(Duration::from_millis(10));
            }
            _ => break,
        }
    }
    warn!("Sandbox: worker did not exit, killing pid {}", child.id());
    let _ = child.kill();
    let _ = child.wait();
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sandbox(max_line: usize) -> Sandbox {
        Sandbox::new(
            SandboxCommand {
                program: PathBuf::from("/nonexistent/worker"),
                args: Vec::new(),
            },
            max_line,
        )
    }

    #[test]
    fn test_batches_respect_line_limit() {
        let paths: Vec<PathBuf> = (0..6).map(|i| PathBuf::from(format!("/m/{i}.mkv"))).collect();
        // "probe\tformat" = 12 bytes, each path adds 9.
        let batches = sandbox(12 + 9 * 2).batches(ProbeKind::Format, &paths);
        assert_eq!(batches.len(), 3);
        assert!(batches.iter().all(|b| b.len() == 2));
    }

    #[test]
    fn test_oversized_path_travels_alone() {
        let paths = vec![PathBuf::from("/m/a.mkv"), PathBuf::from(format!("/m/{}.mkv", "x".repeat(64)))];
        let batches = sandbox(20).batches(ProbeKind::Format, &paths);
        assert_eq!(batches.len(), 2);
    }

    #[test]
    fn test_unencodable_paths_are_dropped() {
        let paths = vec![PathBuf::from("/m/bad\tname.mkv"), PathBuf::from("/m/ok.mkv")];
        let batches = sandbox(8_192).batches(ProbeKind::Content, &paths);
        assert_eq!(batches, vec![vec![PathBuf::from("/m/ok.mkv")]]);
    }

    #[test]
    fn test_missing_worker_degrades_to_no_results() {
        let sandbox = sandbox(8_192);
        assert!(sandbox.probe(ProbeKind::Format, Path::new("/m/a.mkv")).is_none());
        assert!(sandbox.read_thumbnail(Path::new("/m/a.jpg"), 64).is_none());
        assert_eq!(sandbox.state(), SandboxState::Stopped);
    }
}
