/// Repository functions over the catalog schema.
///
/// Plain functions taking a `&Connection`; the caller owns locking. Paths
/// are stored as text keys, directories with a trailing `/` so that a
/// prefix match on a directory key never catches a sibling whose name
/// merely starts the same way.
use crate::error::Result;
use crate::model::Category;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

/// One row of `files`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogNode {
    pub id: i64,
    pub path: PathBuf,
    pub parent_id: Option<i64>,
    /// Byte size, child count for directories, negative while unprobed.
    pub size: i64,
    /// Seconds since the epoch.
    pub last_modified: i64,
    pub media_info: Option<String>,
    pub is_dir: bool,
}

impl CatalogNode {
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    pub fn is_probed(&self) -> bool {
        self.size >= 0
    }
}

/// A row to write into a category table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CategoryRow {
    pub file_id: i64,
    pub album: String,
    pub raw_name: String,
    pub title: String,
    /// TV shows only.
    pub season: u32,
    /// Music only.
    pub artist: String,
    /// Music only.
    pub is_song: bool,
}

/// A file listed in an album.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlbumFile {
    pub file_id: i64,
    pub path: PathBuf,
    pub title: String,
}

/// Text key of `path`; directories get a trailing `/`.
pub fn path_key(path: &Path, is_dir: bool) -> String {
    let mut key = path.to_string_lossy().into_owned();
    if is_dir && !key.ends_with('/') {
        key.push('/');
    }
    key
}

fn key_to_path(key: &str) -> (PathBuf, bool) {
    match key.strip_suffix('/') {
        Some(stripped) if !stripped.is_empty() => (PathBuf::from(stripped), true),
        _ => (PathBuf::from(key), key.ends_with('/')),
    }
}

const NODE_COLUMNS: &str = "id, path, parent_id, size, last_modified, media_info";

fn node_from_row(row: &Row<'_>) -> rusqlite::Result<CatalogNode> {
    let key: String = row.get(1)?;
    let (path, is_dir) = key_to_path(&key);
    Ok(CatalogNode {
        id: row.get(0)?,
        path,
        parent_id: row.get(2)?,
        size: row.get(3)?,
        last_modified: row.get(4)?,
        media_info: row.get(5)?,
        is_dir,
    })
}

// ─── files ──────────────────────────────────────────────────────────────────

pub fn find_node(conn: &Connection, key: &str) -> Result<Option<CatalogNode>> {
    let node = conn
        .query_row(
            &format!("SELECT {NODE_COLUMNS} FROM files WHERE path = ?1"),
            params![key],
            node_from_row,
        )
        .optional()?;
    Ok(node)
}

pub fn insert_node(
    conn: &Connection,
    parent_id: Option<i64>,
    key: &str,
    size: i64,
    last_modified: i64,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO files (parent_id, path, size, last_modified) VALUES (?1, ?2, ?3, ?4)",
        params![parent_id, key, size, last_modified],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn update_node(conn: &Connection, id: i64, size: i64, last_modified: i64) -> Result<()> {
    conn.execute(
        "UPDATE files SET size = ?2, last_modified = ?3 WHERE id = ?1",
        params![id, size, last_modified],
    )?;
    Ok(())
}

pub fn update_size(conn: &Connection, id: i64, size: i64) -> Result<()> {
    conn.execute("UPDATE files SET size = ?2 WHERE id = ?1", params![id, size])?;
    Ok(())
}

pub fn set_media_info(
    conn: &Connection,
    id: i64,
    size: i64,
    last_modified: i64,
    media_info: Option<&str>,
) -> Result<()> {
    conn.execute(
        "UPDATE files SET size = ?2, last_modified = ?3, media_info = ?4 WHERE id = ?1",
        params![id, size, last_modified, media_info],
    )?;
    Ok(())
}

pub fn children(conn: &Connection, parent_id: i64) -> Result<Vec<CatalogNode>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {NODE_COLUMNS} FROM files WHERE parent_id = ?1 ORDER BY path"
    ))?;
    let nodes = stmt
        .query_map(params![parent_id], node_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(nodes)
}

pub fn roots(conn: &Connection) -> Result<Vec<CatalogNode>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {NODE_COLUMNS} FROM files WHERE parent_id IS NULL ORDER BY path"
    ))?;
    let nodes = stmt
        .query_map([], node_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(nodes)
}

/// Delete a node; descendants and category rows go with it.
pub fn delete_node(conn: &Connection, id: i64) -> Result<()> {
    conn.execute("DELETE FROM files WHERE id = ?1", params![id])?;
    Ok(())
}

/// Files still waiting to be probed.
pub fn unprobed_files(conn: &Connection) -> Result<Vec<PathBuf>> {
    let mut stmt = conn.prepare(
        "SELECT path FROM files WHERE size < 0 AND substr(path, -1) <> '/' ORDER BY path",
    )?;
    let paths = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .map(|r| r.map(PathBuf::from))
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(paths)
}

pub fn count_files(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM files WHERE substr(path, -1) <> '/'",
        [],
        |row| row.get(0),
    )?)
}

// ─── category tables ────────────────────────────────────────────────────────

/// Categories with at least one row for `key` or, for a directory key,
/// anything below it.
pub fn categories_under(conn: &Connection, key: &str) -> Result<BTreeSet<Category>> {
    let mut found = BTreeSet::new();
    for category in Category::ALL {
        let sql = format!(
            "SELECT EXISTS (SELECT 1 FROM {} c JOIN files f ON f.id = c.file_id
              WHERE f.path = ?1 OR substr(f.path, 1, length(?1)) = ?1 AND substr(?1, -1) = '/')",
            category.table()
        );
        let hit: bool = conn.query_row(&sql, params![key], |row| row.get(0))?;
        if hit {
            found.insert(category);
        }
    }
    Ok(found)
}

/// Remove every category row of `file_id`; returns the categories touched.
pub fn delete_category_rows(conn: &Connection, file_id: i64) -> Result<BTreeSet<Category>> {
    delete_category_rows_except(conn, file_id, &BTreeMap::<Category, CategoryRow>::new())
}

/// Remove the category rows of `file_id` except those in categories that
/// are keys of `keep`; returns the categories touched.
pub fn delete_category_rows_except<T>(
    conn: &Connection,
    file_id: i64,
    keep: &BTreeMap<Category, T>,
) -> Result<BTreeSet<Category>> {
    let mut touched = BTreeSet::new();
    for category in Category::ALL.into_iter().filter(|c| !keep.contains_key(c)) {
        let removed = conn.execute(
            &format!("DELETE FROM {} WHERE file_id = ?1", category.table()),
            params![file_id],
        )?;
        if removed > 0 {
            touched.insert(category);
        }
    }
    Ok(touched)
}

pub fn insert_category_row(conn: &Connection, category: Category, row: &CategoryRow) -> Result<()> {
    match category {
        Category::Movies => conn.execute(
            "INSERT OR REPLACE INTO movies (file_id, album, raw_name, title, external_id)
             VALUES (?1, ?2, ?3, ?4,
                     (SELECT external_id FROM movies WHERE file_id = ?1 AND title = ?4))",
            params![row.file_id, row.album, row.raw_name, row.title],
        )?,
        Category::TvShows => conn.execute(
            "INSERT OR REPLACE INTO tvshows (file_id, album, raw_name, title, season)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![row.file_id, row.album, row.raw_name, row.title, row.season],
        )?,
        Category::Music => conn.execute(
            "INSERT OR REPLACE INTO music (file_id, album, raw_name, title, artist, is_song)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                row.file_id,
                row.album,
                row.raw_name,
                row.title,
                row.artist,
                row.is_song
            ],
        )?,
        Category::Clips | Category::HomeVideos | Category::Photos => conn.execute(
            &format!(
                "INSERT OR REPLACE INTO {} (file_id, album, raw_name, title) VALUES (?1, ?2, ?3, ?4)",
                category.table()
            ),
            params![row.file_id, row.album, row.raw_name, row.title],
        )?,
    };
    Ok(())
}

/// Distinct albums of `category`, sorted.
pub fn albums(conn: &Connection, category: Category) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT DISTINCT album FROM {} ORDER BY album",
        category.table()
    ))?;
    let albums = stmt
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(albums)
}

/// Files of one album ordered by raw name. `count == 0` returns everything
/// from `start` on.
pub fn album_files(
    conn: &Connection,
    category: Category,
    album: &str,
    start: usize,
    count: usize,
) -> Result<Vec<AlbumFile>> {
    let limit: i64 = if count == 0 { -1 } else { count as i64 };
    let mut stmt = conn.prepare(&format!(
        "SELECT c.file_id, f.path, c.title FROM {} c JOIN files f ON f.id = c.file_id
         WHERE c.album = ?1 ORDER BY c.raw_name, f.path LIMIT ?2 OFFSET ?3",
        category.table()
    ))?;
    let files = stmt
        .query_map(params![album, limit, start as i64], |row| {
            let key: String = row.get(1)?;
            Ok(AlbumFile {
                file_id: row.get(0)?,
                path: PathBuf::from(key),
                title: row.get(2)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(files)
}

pub fn count_album_files(conn: &Connection, category: Category, album: &str) -> Result<usize> {
    let count: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM {} WHERE album = ?1", category.table()),
        params![album],
        |row| row.get(0),
    )?;
    Ok(count as usize)
}

/// Title of the movie row of `file_id` if it has not been looked up yet.
pub fn unmatched_movie(conn: &Connection, file_id: i64) -> Result<Option<String>> {
    let title = conn
        .query_row(
            "SELECT title FROM movies WHERE file_id = ?1 AND external_id IS NULL",
            params![file_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(title)
}

/// Every movie that has not been looked up yet.
pub fn unmatched_movies(conn: &Connection) -> Result<Vec<(i64, String)>> {
    let mut stmt =
        conn.prepare("SELECT file_id, title FROM movies WHERE external_id IS NULL ORDER BY file_id")?;
    let movies = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(movies)
}

/// Record a lookup result. An empty id marks "looked up, no match".
pub fn set_external_id(conn: &Connection, file_id: i64, external_id: &str) -> Result<()> {
    conn.execute(
        "UPDATE movies SET external_id = ?2 WHERE file_id = ?1",
        params![file_id, external_id],
    )?;
    Ok(())
}

pub fn external_id(conn: &Connection, file_id: i64) -> Result<Option<String>> {
    let id = conn
        .query_row(
            "SELECT external_id FROM movies WHERE file_id = ?1",
            params![file_id],
            |row| row.get::<_, Option<String>>(0),
        )
        .optional()?;
    Ok(id.flatten())
}

// ─── playback positions ─────────────────────────────────────────────────────

pub fn playback_position(conn: &Connection, path: &Path) -> Result<Option<f64>> {
    let seconds = conn
        .query_row(
            "SELECT seconds FROM playback_positions WHERE path = ?1",
            params![path.to_string_lossy()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(seconds)
}

/// Store a position; `seconds <= 0` forgets it.
pub fn set_playback_position(conn: &Connection, path: &Path, seconds: f64) -> Result<()> {
    if seconds <= 0.0 {
        conn.execute(
            "DELETE FROM playback_positions WHERE path = ?1",
            params![path.to_string_lossy()],
        )?;
    } else {
        conn.execute(
            "INSERT OR REPLACE INTO playback_positions (path, seconds, updated_at)
             VALUES (?1, ?2, ?3)",
            params![path.to_string_lossy(), seconds, Utc::now().to_rfc3339()],
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::schema::run_migrations;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        conn
    }

    #[test]
    fn test_directory_keys_round_trip() {
        let conn = test_conn();
        let root = insert_node(&conn, None, "/media/", 1, 100).unwrap();
        insert_node(&conn, Some(root), "/media/a.mkv", -1, 0).unwrap();

        let node = find_node(&conn, "/media/").unwrap().unwrap();
        assert!(node.is_dir && node.is_root());
        assert_eq!(node.path, PathBuf::from("/media"));

        let kids = children(&conn, root).unwrap();
        assert_eq!(kids.len(), 1);
        assert!(!kids[0].is_dir && !kids[0].is_probed());
        assert_eq!(unprobed_files(&conn).unwrap(), vec![PathBuf::from("/media/a.mkv")]);
    }

    #[test]
    fn test_categories_under_directory_prefix() {
        let conn = test_conn();
        let root = insert_node(&conn, None, "/m/", 2, 0).unwrap();
        let a = insert_node(&conn, Some(root), "/m/a/", 1, 0).unwrap();
        let ab = insert_node(&conn, Some(root), "/m/ab/", 1, 0).unwrap();
        let f1 = insert_node(&conn, Some(a), "/m/a/x.mkv", 5, 0).unwrap();
        let f2 = insert_node(&conn, Some(ab), "/m/ab/y.mp3", 5, 0).unwrap();
        insert_category_row(&conn, Category::Clips, &CategoryRow { file_id: f1, ..Default::default() })
            .unwrap();
        insert_category_row(&conn, Category::Music, &CategoryRow { file_id: f2, ..Default::default() })
            .unwrap();

        let under_a = categories_under(&conn, "/m/a/").unwrap();
        assert_eq!(under_a.into_iter().collect::<Vec<_>>(), vec![Category::Clips]);
        let file = categories_under(&conn, "/m/ab/y.mp3").unwrap();
        assert_eq!(file.into_iter().collect::<Vec<_>>(), vec![Category::Music]);

        delete_node(&conn, a).unwrap();
        assert!(categories_under(&conn, "/m/a/").unwrap().is_empty());
        assert!(find_node(&conn, "/m/a/x.mkv").unwrap().is_none());
    }

    #[test]
    fn test_album_queries() {
        let conn = test_conn();
        let root = insert_node(&conn, None, "/p/", 3, 0).unwrap();
        for (i, (album, name)) in [("Trip", "B"), ("Trip", "A"), ("Home", "C")].iter().enumerate() {
            let id = insert_node(&conn, Some(root), &format!("/p/{i}.jpg"), 1, 0).unwrap();
            insert_category_row(
                &conn,
                Category::Photos,
                &CategoryRow {
                    file_id: id,
                    album: album.to_string(),
                    raw_name: name.to_string(),
                    title: name.to_string(),
                    ..Default::default()
                },
            )
            .unwrap();
        }
        assert_eq!(albums(&conn, Category::Photos).unwrap(), vec!["Home", "Trip"]);
        assert_eq!(count_album_files(&conn, Category::Photos, "Trip").unwrap(), 2);
        let trip = album_files(&conn, Category::Photos, "Trip", 0, 0).unwrap();
        assert_eq!(trip.iter().map(|f| f.title.as_str()).collect::<Vec<_>>(), vec!["A", "B"]);
        let page = album_files(&conn, Category::Photos, "Trip", 1, 1).unwrap();
        assert_eq!(page[0].title, "B");
    }

    #[test]
    fn test_external_id_survives_reclassification() {
        let conn = test_conn();
        let root = insert_node(&conn, None, "/v/", 1, 0).unwrap();
        let id = insert_node(&conn, Some(root), "/v/film.mkv", 1, 0).unwrap();
        let row = CategoryRow {
            file_id: id,
            title: "Film".into(),
            raw_name: "FILM".into(),
            ..Default::default()
        };
        insert_category_row(&conn, Category::Movies, &row).unwrap();
        assert_eq!(unmatched_movie(&conn, id).unwrap().as_deref(), Some("Film"));

        set_external_id(&conn, id, "tt0000001").unwrap();
        insert_category_row(&conn, Category::Movies, &row).unwrap();
        assert_eq!(external_id(&conn, id).unwrap().as_deref(), Some("tt0000001"));
        assert!(unmatched_movies(&conn).unwrap().is_empty());
    }

    #[test]
    fn test_playback_positions() {
        let conn = test_conn();
        let path = Path::new("/v/film.mkv");
        assert_eq!(playback_position(&conn, path).unwrap(), None);
        set_playback_position(&conn, path, 42.5).unwrap();
        assert_eq!(playback_position(&conn, path).unwrap(), Some(42.5));
        set_playback_position(&conn, path, 0.0).unwrap();
        assert_eq!(playback_position(&conn, path).unwrap(), None);
    }
}
