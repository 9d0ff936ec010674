/// Incremental reconciliation of one directory against the catalog.
///
/// [`scan_dir`] never recurses: it reports the subdirectories to visit next
/// and the files that need probing, and the catalog's worker loop schedules
/// them. A directory whose stored child count and modification time still
/// match the disk is not re-listed against the database; only its known
/// subdirectories are handed back.
use super::store::{self, path_key, CatalogNode};
use crate::error::Result;
use crate::fs::MediaFs;
use crate::model::{Category, FileEntry, MTIME_TOLERANCE_SECS};
use rusqlite::Connection;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::categorizer::DVD_INDEX_FILE;

/// Directory names holding DVD structures.
const DVD_DIRS: [&str; 2] = ["VIDEO_TS", "AUDIO_TS"];

#[derive(Debug, Default)]
pub struct ScanOutcome {
    /// Subdirectories to scan next.
    pub subdirs: Vec<PathBuf>,
    /// New or changed files.
    pub to_probe: Vec<PathBuf>,
    /// Categories that lost rows because files vanished.
    pub invalidated: BTreeSet<Category>,
}

/// Whether `path` is inside one of `hidden_dirs`.
pub fn is_hidden_dir(path: &Path, hidden_dirs: &[PathBuf]) -> bool {
    hidden_dirs.iter().any(|hidden| path.starts_with(hidden))
}

fn is_dvd_dir(dir: &Path) -> bool {
    dir.file_name()
        .is_some_and(|n| DVD_DIRS.iter().any(|d| n.to_string_lossy().eq_ignore_ascii_case(d)))
}

/// Children of `dir` worth cataloguing.
fn live_children(
    fs: &dyn MediaFs,
    dir: &Path,
    hidden_dirs: &[PathBuf],
) -> Result<Vec<FileEntry>> {
    let dvd = is_dvd_dir(dir);
    let entries = fs
        .entry_list(dir)?
        .into_iter()
        .filter(|e| e.is_readable)
        .filter(|e| !(e.is_dir && is_hidden_dir(&e.path, hidden_dirs)))
        .filter(|e| {
            !dvd || (!e.is_dir
                && e.path
                    .file_name()
                    .is_some_and(|n| n.to_string_lossy().eq_ignore_ascii_case(DVD_INDEX_FILE)))
        })
        .collect();
    Ok(entries)
}

/// Delete `node` (and everything below it), reporting the categories that
/// lose rows.
fn remove_node(conn: &Connection, node: &CatalogNode, outcome: &mut ScanOutcome) -> Result<()> {
    let key = path_key(&node.path, node.is_dir);
    outcome
        .invalidated
        .extend(store::categories_under(conn, &key)?);
    store::delete_node(conn, node.id)?;
    Ok(())
}

/// Reconcile `dir` with the catalog.
///
/// All writes for one directory land in a single transaction, so the
/// directory row never claims children that were not stored.
pub fn scan_dir(
    conn: &Connection,
    fs: &dyn MediaFs,
    dir: &Path,
    hidden_dirs: &[PathBuf],
) -> Result<ScanOutcome> {
    let tx = conn.unchecked_transaction()?;
    let outcome = reconcile(&tx, fs, dir, hidden_dirs)?;
    tx.commit()?;
    Ok(outcome)
}

fn reconcile(
    conn: &Connection,
    fs: &dyn MediaFs,
    dir: &Path,
    hidden_dirs: &[PathBuf],
) -> Result<ScanOutcome> {
    let mut outcome = ScanOutcome::default();
    let key = path_key(dir, true);
    let node = store::find_node(conn, &key)?;

    let listed = fs
        .read_info(dir)
        .and_then(|info| Ok((info, live_children(fs, dir, hidden_dirs)?)));
    let (info, live) = match listed {
        Ok((info, live)) if info.is_dir => (info, live),
        other => {
            if let Err(e) = other {
                debug!("Scan: {:?} unavailable: {}", dir, e);
            }
            if let Some(node) = node {
                info!("Scan: {:?} vanished, removing", dir);
                remove_node(conn, &node, &mut outcome)?;
            }
            return Ok(outcome);
        }
    };
    let mtime = info.mtime_secs();
    let count = live.len() as i64;

    if let Some(node) = &node {
        if node.size == count && mtime <= node.last_modified + MTIME_TOLERANCE_SECS {
            outcome.subdirs = store::children(conn, node.id)?
                .into_iter()
                .filter(|child| child.is_dir)
                .map(|child| child.path)
                .collect();
            return Ok(outcome);
        }
    }

    let dir_id = match node {
        Some(node) => {
            store::update_node(conn, node.id, count, mtime)?;
            node.id
        }
        None => {
            let parent_id = match dir.parent() {
                Some(parent) => store::find_node(conn, &path_key(parent, true))?.map(|p| p.id),
                None => None,
            };
            store::insert_node(conn, parent_id, &key, count, mtime)?
        }
    };

    let mut known: HashMap<String, CatalogNode> = store::children(conn, dir_id)?
        .into_iter()
        .map(|child| (path_key(&child.path, child.is_dir), child))
        .collect();

    for entry in &live {
        let child_key = path_key(&entry.path, entry.is_dir);
        match known.remove(&child_key) {
            Some(existing) => {
                if entry.is_dir {
                    outcome.subdirs.push(entry.path.clone());
                } else if existing.size != entry.size as i64
                    || entry.mtime_secs() > existing.last_modified + MTIME_TOLERANCE_SECS
                {
                    // Forget the old result so a restart still finds it unprobed.
                    if existing.size >= 0 {
                        store::set_media_info(conn, existing.id, -1, entry.mtime_secs(), None)?;
                    }
                    outcome.to_probe.push(entry.path.clone());
                }
            }
            None => {
                store::insert_node(conn, Some(dir_id), &child_key, -1, 0)?;
                if entry.is_dir {
                    outcome.subdirs.push(entry.path.clone());
                } else {
                    outcome.to_probe.push(entry.path.clone());
                }
            }
        }
    }

    // Whatever is left in `known` is gone from disk.
    for (_, vanished) in known {
        debug!("Scan: {:?} vanished", vanished.path);
        remove_node(conn, &vanished, &mut outcome)?;
    }

    debug!(
        "Scan: {:?}: {} subdirs, {} to probe",
        dir,
        outcome.subdirs.len(),
        outcome.to_probe.len()
    );
    Ok(outcome)
}

/// Delete roots that are no longer configured.
pub fn prune_roots(conn: &Connection, configured: &[PathBuf]) -> Result<BTreeSet<Category>> {
    let mut outcome = ScanOutcome::default();
    for root in store::roots(conn)? {
        if !configured.iter().any(|c| *c == root.path) {
            info!("Scan: pruning unconfigured root {:?}", root.path);
            remove_node(conn, &root, &mut outcome)?;
        }
    }
    Ok(outcome.invalidated)
}
