/// Directory change watcher built on `notify`.
///
/// Directories are registered one at a time, non-recursively, as they are
/// listed. Every create/modify/remove event is reduced to the directory whose
/// contents changed and sent on the receiver returned by [`DirWatcher::new`]:
/// the parent of a changed entry, plus the entry itself when it is a watched
/// directory. Access events are ignored.
use crate::error::Result;
use crossbeam_channel::{unbounded, Receiver};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

pub struct DirWatcher {
    watcher: Mutex<RecommendedWatcher>,
    /// Shared with the event callback, which never touches `watcher`.
    watched: Arc<Mutex<HashSet<PathBuf>>>,
}

/// Directories whose listings an event on `path` affects.
fn changed_dirs(path: &Path, watched: &HashSet<PathBuf>) -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = path.parent().map(Path::to_path_buf).into_iter().collect();
    if watched.contains(path) {
        dirs.push(path.to_path_buf());
    }
    dirs
}

impl DirWatcher {
    pub fn new() -> Result<(Self, Receiver<PathBuf>)> {
        let (tx, rx) = unbounded::<PathBuf>();
        let watched = Arc::new(Mutex::new(HashSet::new()));
        let seen = Arc::clone(&watched);
        let watcher = RecommendedWatcher::new(
            move |res: std::result::Result<Event, notify::Error>| match res {
                Ok(event) => {
                    if matches!(event.kind, EventKind::Access(_)) {
                        return;
                    }
                    let dirs: Vec<PathBuf> = {
                        let seen = seen.lock();
                        event
                            .paths
                            .iter()
                            .flat_map(|path| changed_dirs(path, &seen))
                            .collect()
                    };
                    for dir in dirs {
                        let _ = tx.send(dir);
                    }
                }
                Err(e) => warn!("Watch error: {}", e),
            },
            Config::default(),
        )?;
        Ok((
            Self {
                watcher: Mutex::new(watcher),
                watched,
            },
            rx,
        ))
    }

    /// Start watching `dir` unless it is already watched.
    pub fn watch(&self, dir: &Path) -> Result<()> {
        let mut watcher = self.watcher.lock();
        if self.is_watching(dir) {
            return Ok(());
        }
        watcher.watch(dir, RecursiveMode::NonRecursive)?;
        self.watched.lock().insert(dir.to_path_buf());
        debug!("Watching {:?}", dir);
        Ok(())
    }

    /// Stop watching `dir`; a no-op if it was never watched.
    pub fn unwatch(&self, dir: &Path) {
        let mut watcher = self.watcher.lock();
        if self.watched.lock().remove(dir) {
            // Errors once the directory is gone.
            let _ = watcher.unwatch(dir);
            debug!("Unwatched {:?}", dir);
        }
    }

    pub fn is_watching(&self, dir: &Path) -> bool {
        self.watched.lock().contains(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[test]
    fn test_event_on_watched_dir_reports_dir_itself() {
        let watched: HashSet<PathBuf> = [PathBuf::from("/media/Movies")].into_iter().collect();
        assert_eq!(
            changed_dirs(Path::new("/media/Movies"), &watched),
            vec![PathBuf::from("/media"), PathBuf::from("/media/Movies")]
        );
        assert_eq!(
            changed_dirs(Path::new("/media/Movies/a.mkv"), &watched),
            vec![PathBuf::from("/media/Movies")]
        );
        assert_eq!(
            changed_dirs(Path::new("/media/Other"), &watched),
            vec![PathBuf::from("/media")]
        );
    }

    #[test]
    fn test_new_file_reports_parent_dir() {
        let tmp = tempfile::TempDir::new().unwrap();
        let dir = tmp.path().canonicalize().unwrap();
        let (watcher, rx) = DirWatcher::new().unwrap();
        watcher.watch(&dir).unwrap();
        assert!(watcher.is_watching(&dir));

        std::fs::write(dir.join("new.mkv"), b"data").unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        let mut seen = false;
        while Instant::now() < deadline {
            if let Ok(changed) = rx.recv_timeout(Duration::from_millis(200)) {
                if changed == dir {
                    seen = true;
                    break;
                }
            }
        }
        assert!(seen, "no change event for {:?}", dir);
    }
}
