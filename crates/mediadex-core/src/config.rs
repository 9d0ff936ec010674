/// Runtime configuration.
///
/// Loaded from a JSON file; every field has a default so a partial (or
/// empty) file is valid. Roots that do not exist or cannot be read are
/// dropped during [`Config::validated`] with a warning instead of failing
/// startup.
use crate::error::{Error, Result};
use crate::model::Category;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// File name of the catalog database inside [`Config::data_dir`].
pub const CATALOG_FILE: &str = "catalog.db";
/// File name of the probe cache log inside [`Config::data_dir`].
pub const PROBE_CACHE_FILE: &str = "probe-cache.log";

/// Command line used to launch the sandboxed probe worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxCommand {
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root directories grouped by the category their files are filed under.
    pub roots: BTreeMap<Category, Vec<PathBuf>>,
    /// Subtrees the scanner never enters.
    pub hidden_dirs: Vec<PathBuf>,
    pub data_dir: PathBuf,
    pub listing_ttl_secs: u64,
    pub cache_flush_interval_secs: u64,
    pub sandbox_idle_timeout_secs: u64,
    /// Open attempts before a file is marked permanently unprobeable.
    pub max_probe_attempts: u32,
    /// Delay between passes that retry files which could not be opened.
    pub retry_interval_secs: u64,
    /// Upper bound on one sandbox request line, in bytes.
    pub max_request_line: usize,
    /// Audio longer than this is filed as misc audio instead of a song.
    pub song_max_duration_secs: u64,
    /// Video shorter than this is never filed as a movie.
    pub movie_min_duration_secs: u64,
    /// Catalog worker threads; `0` uses the number of logical CPUs.
    pub worker_threads: usize,
    /// Pre-probe batches hold up to `factor * cpus` requests.
    pub preprobe_batch_factor: usize,
    pub sandbox: Option<SandboxCommand>,
    pub ffprobe: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            roots: BTreeMap::new(),
            hidden_dirs: Vec::new(),
            data_dir: PathBuf::from(".mediadex"),
            listing_ttl_secs: 15,
            cache_flush_interval_secs: 9_000,
            sandbox_idle_timeout_secs: 60,
            max_probe_attempts: 60,
            retry_interval_secs: 60,
            max_request_line: 8_192,
            song_max_duration_secs: 900,
            movie_min_duration_secs: 300,
            worker_threads: 0,
            preprobe_batch_factor: 2,
            sandbox: None,
            ffprobe: None,
        }
    }
}

impl Config {
    /// Read a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&text)?;
        info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Drop roots that are not readable directories and make sure the data
    /// directory exists.
    pub fn validated(mut self) -> Result<Self> {
        for (category, roots) in self.roots.iter_mut() {
            roots.retain(|root| match std::fs::read_dir(root) {
                Ok(_) => true,
                Err(e) => {
                    warn!("Skipping {} root {:?}: {}", category, root, e);
                    false
                }
            });
        }
        self.roots.retain(|_, roots| !roots.is_empty());

        std::fs::create_dir_all(&self.data_dir).map_err(|e| {
            Error::Config(format!("cannot create data dir {:?}: {e}", self.data_dir))
        })?;
        Ok(self)
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.data_dir.join(CATALOG_FILE)
    }

    pub fn probe_cache_path(&self) -> PathBuf {
        self.data_dir.join(PROBE_CACHE_FILE)
    }

    /// All configured roots regardless of category.
    pub fn all_roots(&self) -> impl Iterator<Item = &PathBuf> {
        self.roots.values().flatten()
    }

    pub fn listing_ttl(&self) -> Duration {
        Duration::from_secs(self.listing_ttl_secs)
    }

    pub fn cache_flush_interval(&self) -> Duration {
        Duration::from_secs(self.cache_flush_interval_secs)
    }

    pub fn sandbox_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.sandbox_idle_timeout_secs)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }

    /// Worker count with `0` resolved to the CPU count.
    pub fn effective_workers(&self) -> usize {
        if self.worker_threads == 0 {
            num_cpus::get().max(1)
        } else {
            self.worker_threads
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_json_yields_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.listing_ttl_secs, 15);
        assert_eq!(config.cache_flush_interval_secs, 9_000);
        assert_eq!(config.max_probe_attempts, 60);
        assert!(config.sandbox.is_none());
    }

    #[test]
    fn test_roots_keyed_by_category_name() {
        let config: Config = serde_json::from_str(
            r#"{"roots": {"movies": ["/a"], "music": ["/b", "/c"]}, "listing_ttl_secs": 3}"#,
        )
        .unwrap();
        assert_eq!(config.roots[&Category::Movies], vec![PathBuf::from("/a")]);
        assert_eq!(config.roots[&Category::Music].len(), 2);
        assert_eq!(config.listing_ttl(), Duration::from_secs(3));
    }

    #[test]
    fn test_validated_drops_missing_roots() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut config = Config {
            data_dir: tmp.path().join("data"),
            ..Config::default()
        };
        config.roots.insert(
            Category::Photos,
            vec![tmp.path().to_path_buf(), tmp.path().join("missing")],
        );
        config
            .roots
            .insert(Category::Clips, vec![tmp.path().join("gone")]);

        let config = config.validated().unwrap();
        assert_eq!(config.roots.len(), 1);
        assert_eq!(config.roots[&Category::Photos], vec![tmp.path().to_path_buf()]);
        assert!(config.data_dir.is_dir());
    }
}
