/// Sorting probed files into category tables.
///
/// A file is considered for every category whose configured root contains
/// it. Acceptance rules:
///
/// | Category    | Needs                                                  |
/// |-------------|--------------------------------------------------------|
/// | movies      | audio + video, not shorter than the movie minimum      |
/// | tvshows     | audio + video, inside a season directory               |
/// | clips       | audio + video                                          |
/// | homevideos  | audio + video                                          |
/// | music       | audio; songs are at most the song maximum long         |
/// | photos      | an image                                               |
///
/// Every change to a category table bumps that category's dirty counter.
/// [`Categorizer::take_dirty`] is called once the catalog's work queues have
/// drained and yields each dirty category exactly once.
use super::store::{self, CategoryRow};
use crate::error::Result;
use crate::model::{Category, MediaRecord};
use parking_lot::Mutex;
use regex::Regex;
use rusqlite::Connection;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

/// DVD structure file standing in for a whole disc.
pub const DVD_INDEX_FILE: &str = "VIDEO_TS.IFO";

fn season_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)^(?:season|series|saison|staffel|s)[\s._-]*(\d{1,3})$")
            .expect("season pattern is valid")
    })
}

/// Season number encoded in a directory name such as `Season 2` or `S03`.
pub fn season_of(dir_name: &str) -> Option<u32> {
    season_pattern()
        .captures(dir_name.trim())
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Normalised sort key: ASCII letters and digits only, upper case.
pub fn raw_name(title: &str) -> String {
    title
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// Raw name prefixed with the zero-padded track number.
fn numbered_raw_name(track: Option<u32>, title: &str) -> String {
    format!("{:010}{}", track.unwrap_or(0), raw_name(title))
}

fn is_dvd_index(path: &Path) -> bool {
    path.file_name()
        .is_some_and(|n| n.to_string_lossy().eq_ignore_ascii_case(DVD_INDEX_FILE))
}

/// The directory a file is shown under: its parent, or for a DVD index the
/// directory holding `VIDEO_TS`.
fn owning_dir(path: &Path) -> Option<&Path> {
    let parent = path.parent()?;
    if is_dvd_index(path) {
        parent.parent()
    } else {
        Some(parent)
    }
}

/// Tagged title, else the disc directory for a DVD, else the file stem.
fn title_for(path: &Path, record: &MediaRecord) -> String {
    if !record.title.trim().is_empty() {
        return record.title.trim().to_owned();
    }
    let named = if is_dvd_index(path) {
        owning_dir(path).and_then(Path::file_name)
    } else {
        path.file_stem()
    };
    named
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

pub struct CategorizerRules {
    pub roots: BTreeMap<Category, Vec<PathBuf>>,
    pub song_max_duration: Duration,
    pub movie_min_duration: Duration,
}

pub struct Categorizer {
    rules: CategorizerRules,
    dirty: Mutex<BTreeMap<Category, u32>>,
}

impl Categorizer {
    pub fn new(rules: CategorizerRules) -> Self {
        Self {
            rules,
            dirty: Mutex::new(BTreeMap::new()),
        }
    }

    /// Categories whose roots contain `path`, each with the album (owning
    /// directory relative to the root) the file belongs to.
    pub fn categories_for(&self, path: &Path) -> Vec<(Category, String)> {
        let Some(dir) = owning_dir(path) else {
            return Vec::new();
        };
        let mut found = Vec::new();
        for (category, roots) in &self.rules.roots {
            // The deepest root wins when roots of one category nest.
            let best = roots
                .iter()
                .filter(|root| path.starts_with(root))
                .max_by_key(|root| root.components().count());
            if let Some(root) = best {
                let album = dir
                    .strip_prefix(root)
                    .map(|rel| rel.to_string_lossy().into_owned())
                    .unwrap_or_default();
                found.push((*category, album));
            }
        }
        found
    }

    /// The row `record` earns in `category`, or `None` if it does not belong.
    pub fn row_for(
        &self,
        category: Category,
        file_id: i64,
        path: &Path,
        album: String,
        record: &MediaRecord,
    ) -> Option<CategoryRow> {
        if category.requires_audio_video() && !(record.contains_audio() && record.contains_video()) {
            return None;
        }
        let duration = record.total_duration();
        let title = title_for(path, record);
        let mut row = CategoryRow {
            file_id,
            raw_name: raw_name(&title),
            title,
            album,
            ..CategoryRow::default()
        };

        match category {
            Category::Movies => {
                if duration.is_some_and(|d| d < self.rules.movie_min_duration) {
                    return None;
                }
            }
            Category::TvShows => {
                let season_dir = path.parent()?.file_name()?.to_string_lossy().into_owned();
                row.season = season_of(&season_dir)?;
                row.raw_name = numbered_raw_name(record.track, &row.title);
            }
            Category::Music => {
                if !record.contains_audio() {
                    return None;
                }
                row.raw_name = numbered_raw_name(record.track, &row.title);
                row.artist = record.author.clone();
                row.is_song = duration.map_or(true, |d| d <= self.rules.song_max_duration);
            }
            Category::Photos => {
                if !record.contains_image() {
                    return None;
                }
            }
            Category::Clips | Category::HomeVideos => {}
        }
        Some(row)
    }

    /// Bring the category rows of one file in line with `record`. Returns
    /// every category whose table changed.
    pub fn classify(
        &self,
        conn: &Connection,
        file_id: i64,
        path: &Path,
        record: &MediaRecord,
    ) -> Result<BTreeSet<Category>> {
        let rows: BTreeMap<Category, CategoryRow> = self
            .categories_for(path)
            .into_iter()
            .filter_map(|(category, album)| {
                self.row_for(category, file_id, path, album, record)
                    .map(|row| (category, row))
            })
            .collect();

        let mut touched = BTreeSet::new();
        for category in store::delete_category_rows_except(conn, file_id, &rows)? {
            touched.insert(category);
        }
        for (category, row) in &rows {
            store::insert_category_row(conn, *category, row)?;
            touched.insert(*category);
        }
        Ok(touched)
    }

    pub fn mark_dirty(&self, categories: &BTreeSet<Category>) {
        if categories.is_empty() {
            return;
        }
        let mut dirty = self.dirty.lock();
        for category in categories {
            *dirty.entry(*category).or_insert(0) += 1;
        }
    }

    /// Every category with a non-zero counter, resetting the counters.
    pub fn take_dirty(&self) -> Vec<Category> {
        let mut dirty = self.dirty.lock();
        let fired: Vec<Category> = dirty
            .iter()
            .filter(|(_, count)| **count > 0)
            .map(|(category, _)| *category)
            .collect();
        dirty.clear();
        fired
    }

    /// Pending change count of `category`.
    pub fn dirty_count(&self, category: Category) -> u32 {
        self.dirty.lock().get(&category).copied().unwrap_or(0)
    }
}
