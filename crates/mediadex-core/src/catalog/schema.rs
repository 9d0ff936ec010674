use crate::error::Result;
use rusqlite::Connection;

/// `files` holds one row per catalogued file or directory. Directory paths
/// end in `/`. `size` is the byte size of a probed file, the child count of
/// a directory, and negative while a file is waiting to be probed (the
/// magnitude counts failed open attempts). Roots have a NULL `parent_id`.
///
/// Every category table references `files` and disappears with it.
const SCHEMA_V1: &str = "
CREATE TABLE IF NOT EXISTS files (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    parent_id INTEGER REFERENCES files(id) ON DELETE CASCADE,
    path TEXT UNIQUE NOT NULL,
    size INTEGER NOT NULL DEFAULT -1,
    last_modified INTEGER NOT NULL DEFAULT 0,
    media_info TEXT
);

CREATE INDEX IF NOT EXISTS idx_files_parent ON files(parent_id);
CREATE INDEX IF NOT EXISTS idx_files_size ON files(size);

CREATE TABLE IF NOT EXISTS movies (
    file_id INTEGER PRIMARY KEY REFERENCES files(id) ON DELETE CASCADE,
    album TEXT NOT NULL,
    raw_name TEXT NOT NULL,
    title TEXT NOT NULL,
    external_id TEXT
);

CREATE TABLE IF NOT EXISTS tvshows (
    file_id INTEGER PRIMARY KEY REFERENCES files(id) ON DELETE CASCADE,
    album TEXT NOT NULL,
    raw_name TEXT NOT NULL,
    title TEXT NOT NULL,
    season INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS clips (
    file_id INTEGER PRIMARY KEY REFERENCES files(id) ON DELETE CASCADE,
    album TEXT NOT NULL,
    raw_name TEXT NOT NULL,
    title TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS homevideos (
    file_id INTEGER PRIMARY KEY REFERENCES files(id) ON DELETE CASCADE,
    album TEXT NOT NULL,
    raw_name TEXT NOT NULL,
    title TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS photos (
    file_id INTEGER PRIMARY KEY REFERENCES files(id) ON DELETE CASCADE,
    album TEXT NOT NULL,
    raw_name TEXT NOT NULL,
    title TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS music (
    file_id INTEGER PRIMARY KEY REFERENCES files(id) ON DELETE CASCADE,
    album TEXT NOT NULL,
    raw_name TEXT NOT NULL,
    title TEXT NOT NULL,
    artist TEXT NOT NULL,
    is_song INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_movies_album ON movies(album, raw_name);
CREATE INDEX IF NOT EXISTS idx_tvshows_album ON tvshows(album, raw_name);
CREATE INDEX IF NOT EXISTS idx_clips_album ON clips(album, raw_name);
CREATE INDEX IF NOT EXISTS idx_homevideos_album ON homevideos(album, raw_name);
CREATE INDEX IF NOT EXISTS idx_photos_album ON photos(album, raw_name);
CREATE INDEX IF NOT EXISTS idx_music_album ON music(album, raw_name);

CREATE TABLE IF NOT EXISTS playback_positions (
    path TEXT PRIMARY KEY,
    seconds REAL NOT NULL,
    updated_at TEXT NOT NULL
);
";

pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    conn.execute_batch(SCHEMA_V1)?;
    Ok(())
}
