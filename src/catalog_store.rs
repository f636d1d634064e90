//! Embedded SQLite catalog of tracks and watch folders.
//!
//! The store owns the normalized shadow columns: every write recomputes them
//! from the raw title/artist/album so callers can never let them drift.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use log::debug;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::protocol::{CrossReferences, ResolveMatch, TrackRecord, WatchFolder};

const SEARCH_RESULT_LIMIT: usize = 50;
const RESOLVE_RESULT_LIMIT: usize = 5;

const SCORE_ARTIST_EXACT: u32 = 40;
const SCORE_TITLE_EXACT: u32 = 40;
const SCORE_ALBUM_EXACT: u32 = 15;
const SCORE_ARTIST_SUBSTRING: u32 = 20;
const SCORE_TITLE_SUBSTRING: u32 = 20;

const TRACK_COLUMNS: &str = "path, content_hash, modified_unix_ms, file_size_bytes, title, artist, \
     album, album_artist, track_number, disc_number, year, genre, duration_secs, format, \
     bitrate_kbps, sample_rate_hz, has_embedded_art, folder_art_path, remote_art_url, \
     mb_recording_id, mb_artist_id, mb_release_id, enriched_at_unix_ms, indexed_at_unix_ms, \
     title_normalized, artist_normalized, album_normalized";

/// Lowercases, strips punctuation, and trims. Runs of whitespace collapse to
/// one space so "Paranoid  Android" and "Paranoid Android" compare equal.
pub fn normalize_text(value: &str) -> String {
    let mut normalized = String::with_capacity(value.len());
    for ch in value.chars() {
        if ch.is_alphanumeric() {
            normalized.extend(ch.to_lowercase());
        } else if ch.is_whitespace() {
            normalized.push(' ');
        }
    }
    normalized.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Escapes LIKE wildcards so user paths and queries match literally.
fn escape_like(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        if matches!(ch, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

fn contains_pattern(normalized: &str) -> String {
    format!("%{}%", escape_like(normalized))
}

/// LIKE pattern matching every path strictly below `folder`.
fn folder_prefix_pattern(folder: &str) -> String {
    let trimmed = folder.trim_end_matches(['/', '\\']);
    let separator = if folder.contains('\\') && !folder.contains('/') {
        '\\'
    } else {
        '/'
    };
    format!("{}{}%", escape_like(trimmed), escape_like(&separator.to_string()))
}

fn resolve_score(track: &TrackRecord, artist: &str, title: &str, album: Option<&str>) -> u32 {
    let mut score = 0;
    if track.artist_normalized == artist {
        score += SCORE_ARTIST_EXACT;
    }
    if track.title_normalized == title {
        score += SCORE_TITLE_EXACT;
    }
    if let Some(album) = album {
        if track.album_normalized == album {
            score += SCORE_ALBUM_EXACT;
        }
    }
    if track.artist_normalized.contains(artist) {
        score += SCORE_ARTIST_SUBSTRING;
    }
    if track.title_normalized.contains(title) {
        score += SCORE_TITLE_SUBSTRING;
    }
    score
}

/// Maps a raw score onto [0, 1]. A bare double-substring hit lands on 0.45.
pub fn confidence_for_score(score: u32) -> f64 {
    ((f64::from(score) + 5.0) / 100.0).min(1.0)
}

fn optional_u32(value: Option<i64>) -> Option<u32> {
    value.and_then(|value| u32::try_from(value).ok())
}

fn track_from_row(row: &Row<'_>) -> rusqlite::Result<TrackRecord> {
    Ok(TrackRecord {
        path: row.get(0)?,
        content_hash: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
        modified_unix_ms: row.get(2)?,
        file_size_bytes: row.get::<_, Option<i64>>(3)?.unwrap_or(0),
        title: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
        artist: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
        album: row.get::<_, Option<String>>(6)?.unwrap_or_default(),
        album_artist: row.get::<_, Option<String>>(7)?.unwrap_or_default(),
        track_number: optional_u32(row.get(8)?),
        disc_number: optional_u32(row.get(9)?),
        year: row
            .get::<_, Option<i64>>(10)?
            .and_then(|year| i32::try_from(year).ok()),
        genre: row.get::<_, Option<String>>(11)?.unwrap_or_default(),
        duration_secs: row.get(12)?,
        format: row.get::<_, Option<String>>(13)?.unwrap_or_default(),
        bitrate_kbps: optional_u32(row.get(14)?),
        sample_rate_hz: optional_u32(row.get(15)?),
        has_embedded_art: row.get(16)?,
        folder_art_path: row.get(17)?,
        remote_art_url: row.get(18)?,
        cross_refs: CrossReferences {
            recording_id: row.get(19)?,
            artist_id: row.get(20)?,
            release_id: row.get(21)?,
        },
        enriched_at_unix_ms: row.get(22)?,
        indexed_at_unix_ms: row.get(23)?,
        title_normalized: row.get::<_, Option<String>>(24)?.unwrap_or_default(),
        artist_normalized: row.get::<_, Option<String>>(25)?.unwrap_or_default(),
        album_normalized: row.get::<_, Option<String>>(26)?.unwrap_or_default(),
    })
}

fn watch_folder_from_row(row: &Row<'_>) -> rusqlite::Result<WatchFolder> {
    Ok(WatchFolder {
        path: row.get(0)?,
        enabled: row.get(1)?,
        last_scan_unix_ms: row.get(2)?,
        track_count: row.get(3)?,
    })
}

/// Single-connection catalog. Access is serialized through an internal mutex
/// so the store can be shared between the scanner, observer, and host.
pub struct CatalogStore {
    conn: Mutex<Connection>,
}

impl CatalogStore {
    /// Opens (or creates) the catalog file in WAL mode. The parent directory
    /// must already exist.
    pub fn open(db_path: &Path) -> Result<Self, rusqlite::Error> {
        let conn = Connection::open(db_path)?;
        let journal_mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        debug!(
            "Catalog opened at {} (journal_mode={})",
            db_path.display(),
            journal_mode
        );
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, rusqlite::Error> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, rusqlite::Error> {
        // Folder prefix matching must not treat "/Music" and "/music" as the same tree.
        conn.pragma_update(None, "case_sensitive_like", true)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn initialize_schema(&self) -> Result<(), rusqlite::Error> {
        self.conn().execute_batch(
            "CREATE TABLE IF NOT EXISTS tracks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                path TEXT NOT NULL UNIQUE,
                content_hash TEXT,
                modified_unix_ms INTEGER NOT NULL DEFAULT 0,
                file_size_bytes INTEGER,
                title TEXT,
                artist TEXT,
                album TEXT,
                album_artist TEXT,
                track_number INTEGER,
                disc_number INTEGER,
                year INTEGER,
                genre TEXT,
                duration_secs REAL,
                format TEXT,
                bitrate_kbps INTEGER,
                sample_rate_hz INTEGER,
                has_embedded_art INTEGER NOT NULL DEFAULT 0,
                folder_art_path TEXT,
                remote_art_url TEXT,
                mb_recording_id TEXT,
                mb_artist_id TEXT,
                mb_release_id TEXT,
                enriched_at_unix_ms INTEGER,
                indexed_at_unix_ms INTEGER NOT NULL,
                title_normalized TEXT,
                artist_normalized TEXT,
                album_normalized TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_tracks_title_normalized ON tracks(title_normalized);
            CREATE INDEX IF NOT EXISTS idx_tracks_artist_normalized ON tracks(artist_normalized);
            CREATE INDEX IF NOT EXISTS idx_tracks_album_normalized ON tracks(album_normalized);
            CREATE TABLE IF NOT EXISTS watch_folders (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                path TEXT NOT NULL UNIQUE,
                enabled INTEGER NOT NULL DEFAULT 1,
                last_scan_unix_ms INTEGER,
                track_count INTEGER NOT NULL DEFAULT 0
            );",
        )
    }

    /// Inserts or replaces the row for `record.path`.
    ///
    /// Cross references, `enriched_at`, and `remote_art_url` are kept from the
    /// existing row when the incoming record does not carry them, since the
    /// scanner never knows them.
    pub fn upsert_track(&self, record: &TrackRecord) -> Result<(), rusqlite::Error> {
        self.conn().execute(
            "INSERT INTO tracks (
                path, content_hash, modified_unix_ms, file_size_bytes, title, artist, album,
                album_artist, track_number, disc_number, year, genre, duration_secs, format,
                bitrate_kbps, sample_rate_hz, has_embedded_art, folder_art_path, remote_art_url,
                mb_recording_id, mb_artist_id, mb_release_id, enriched_at_unix_ms,
                indexed_at_unix_ms, title_normalized, artist_normalized, album_normalized
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                      ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27)
            ON CONFLICT(path) DO UPDATE SET
                content_hash = excluded.content_hash,
                modified_unix_ms = excluded.modified_unix_ms,
                file_size_bytes = excluded.file_size_bytes,
                title = excluded.title,
                artist = excluded.artist,
                album = excluded.album,
                album_artist = excluded.album_artist,
                track_number = excluded.track_number,
                disc_number = excluded.disc_number,
                year = excluded.year,
                genre = excluded.genre,
                duration_secs = excluded.duration_secs,
                format = excluded.format,
                bitrate_kbps = excluded.bitrate_kbps,
                sample_rate_hz = excluded.sample_rate_hz,
                has_embedded_art = excluded.has_embedded_art,
                folder_art_path = excluded.folder_art_path,
                remote_art_url = COALESCE(excluded.remote_art_url, tracks.remote_art_url),
                mb_recording_id = COALESCE(excluded.mb_recording_id, tracks.mb_recording_id),
                mb_artist_id = COALESCE(excluded.mb_artist_id, tracks.mb_artist_id),
                mb_release_id = COALESCE(excluded.mb_release_id, tracks.mb_release_id),
                enriched_at_unix_ms =
                    COALESCE(excluded.enriched_at_unix_ms, tracks.enriched_at_unix_ms),
                indexed_at_unix_ms = excluded.indexed_at_unix_ms,
                title_normalized = excluded.title_normalized,
                artist_normalized = excluded.artist_normalized,
                album_normalized = excluded.album_normalized",
            params![
                record.path,
                record.content_hash,
                record.modified_unix_ms,
                record.file_size_bytes,
                record.title,
                record.artist,
                record.album,
                record.album_artist,
                record.track_number,
                record.disc_number,
                record.year,
                record.genre,
                record.duration_secs,
                record.format,
                record.bitrate_kbps,
                record.sample_rate_hz,
                record.has_embedded_art,
                record.folder_art_path,
                record.remote_art_url,
                record.cross_refs.recording_id,
                record.cross_refs.artist_id,
                record.cross_refs.release_id,
                record.enriched_at_unix_ms,
                record.indexed_at_unix_ms,
                normalize_text(&record.title),
                normalize_text(&record.artist),
                normalize_text(&record.album),
            ],
        )?;
        Ok(())
    }

    /// Returns true when a row was deleted.
    pub fn remove_track(&self, path: &str) -> Result<bool, rusqlite::Error> {
        let deleted = self
            .conn()
            .execute("DELETE FROM tracks WHERE path = ?1", params![path])?;
        Ok(deleted > 0)
    }

    /// Deletes every track strictly below `folder`. Returns the number removed.
    pub fn remove_tracks_under(&self, folder: &str) -> Result<usize, rusqlite::Error> {
        self.conn().execute(
            "DELETE FROM tracks WHERE path LIKE ?1 ESCAPE '\\'",
            params![folder_prefix_pattern(folder)],
        )
    }

    pub fn get_track_by_path(&self, path: &str) -> Result<Option<TrackRecord>, rusqlite::Error> {
        self.conn()
            .query_row(
                &format!("SELECT {TRACK_COLUMNS} FROM tracks WHERE path = ?1"),
                params![path],
                track_from_row,
            )
            .optional()
    }

    pub fn track_paths_under(&self, folder: &str) -> Result<Vec<String>, rusqlite::Error> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT path FROM tracks WHERE path LIKE ?1 ESCAPE '\\'")?;
        let rows = stmt.query_map(params![folder_prefix_pattern(folder)], |row| row.get(0))?;
        rows.collect()
    }

    pub fn count_tracks_under(&self, folder: &str) -> Result<i64, rusqlite::Error> {
        self.conn().query_row(
            "SELECT COUNT(*) FROM tracks WHERE path LIKE ?1 ESCAPE '\\'",
            params![folder_prefix_pattern(folder)],
            |row| row.get(0),
        )
    }

    /// Substring search over the normalized columns.
    ///
    /// Title hits sort before artist hits, artist hits before album-only hits,
    /// then alphabetically by title. At most 50 rows come back.
    pub fn search(&self, query: &str) -> Result<Vec<TrackRecord>, rusqlite::Error> {
        let normalized = normalize_text(query);
        if normalized.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {TRACK_COLUMNS} FROM tracks
             WHERE title_normalized LIKE ?1 ESCAPE '\\'
                OR artist_normalized LIKE ?1 ESCAPE '\\'
                OR album_normalized LIKE ?1 ESCAPE '\\'
             ORDER BY
                CASE
                    WHEN title_normalized LIKE ?1 ESCAPE '\\' THEN 0
                    WHEN artist_normalized LIKE ?1 ESCAPE '\\' THEN 1
                    ELSE 2
                END,
                title_normalized ASC,
                path ASC
             LIMIT ?2"
        ))?;
        let rows = stmt.query_map(
            params![contains_pattern(&normalized), SEARCH_RESULT_LIMIT as i64],
            track_from_row,
        )?;
        rows.collect()
    }

    /// Scores catalog rows against an externally-sourced track.
    ///
    /// Candidates must contain both the normalized artist and title; the album
    /// only adds to the score. Every candidate is scored before the top five
    /// are taken, best first.
    pub fn resolve(
        &self,
        artist: &str,
        title: &str,
        album: Option<&str>,
    ) -> Result<Vec<ResolveMatch>, rusqlite::Error> {
        let artist = normalize_text(artist);
        let title = normalize_text(title);
        let album = album.map(normalize_text);

        let candidates = {
            let conn = self.conn();
            let mut stmt = conn.prepare(&format!(
                "SELECT {TRACK_COLUMNS} FROM tracks
                 WHERE artist_normalized LIKE ?1 ESCAPE '\\'
                   AND title_normalized LIKE ?2 ESCAPE '\\'"
            ))?;
            let rows = stmt.query_map(
                params![contains_pattern(&artist), contains_pattern(&title)],
                track_from_row,
            )?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        let mut matches: Vec<ResolveMatch> = candidates
            .into_iter()
            .map(|track| {
                let score = resolve_score(&track, &artist, &title, album.as_deref());
                ResolveMatch {
                    track,
                    score,
                    confidence: confidence_for_score(score),
                }
            })
            .collect();
        matches.sort_by(|left, right| {
            right
                .score
                .cmp(&left.score)
                .then_with(|| left.track.path.cmp(&right.track.path))
        });
        matches.truncate(RESOLVE_RESULT_LIMIT);
        Ok(matches)
    }

    pub fn set_remote_art_url(&self, path: &str, url: &str) -> Result<(), rusqlite::Error> {
        self.conn().execute(
            "UPDATE tracks SET remote_art_url = ?1 WHERE path = ?2",
            params![url, path],
        )?;
        Ok(())
    }

    /// Records identifiers produced by an enrichment pass. Returns false when
    /// no row exists for `path`.
    pub fn set_cross_references(
        &self,
        path: &str,
        cross_refs: &CrossReferences,
        enriched_at_unix_ms: i64,
    ) -> Result<bool, rusqlite::Error> {
        let updated = self.conn().execute(
            "UPDATE tracks
             SET mb_recording_id = ?1, mb_artist_id = ?2, mb_release_id = ?3,
                 enriched_at_unix_ms = ?4
             WHERE path = ?5",
            params![
                cross_refs.recording_id,
                cross_refs.artist_id,
                cross_refs.release_id,
                enriched_at_unix_ms,
                path
            ],
        )?;
        Ok(updated > 0)
    }

    /// Registers a folder. Existing registrations are left untouched.
    pub fn add_watch_folder(&self, path: &str) -> Result<WatchFolder, rusqlite::Error> {
        let conn = self.conn();
        conn.execute(
            "INSERT OR IGNORE INTO watch_folders (path, enabled, track_count) VALUES (?1, 1, 0)",
            params![path],
        )?;
        conn.query_row(
            "SELECT path, enabled, last_scan_unix_ms, track_count
             FROM watch_folders WHERE path = ?1",
            params![path],
            watch_folder_from_row,
        )
    }

    /// Drops the folder and cascades to every track below it.
    /// Returns the number of tracks deleted.
    pub fn remove_watch_folder(&self, path: &str) -> Result<usize, rusqlite::Error> {
        self.conn()
            .execute("DELETE FROM watch_folders WHERE path = ?1", params![path])?;
        self.remove_tracks_under(path)
    }

    pub fn get_watch_folder(&self, path: &str) -> Result<Option<WatchFolder>, rusqlite::Error> {
        self.conn()
            .query_row(
                "SELECT path, enabled, last_scan_unix_ms, track_count
             FROM watch_folders WHERE path = ?1",
                params![path],
                watch_folder_from_row,
            )
            .optional()
    }

    pub fn list_watch_folders(&self) -> Result<Vec<WatchFolder>, rusqlite::Error> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT path, enabled, last_scan_unix_ms, track_count FROM watch_folders ORDER BY path",
        )?;
        let rows = stmt.query_map([], watch_folder_from_row)?;
        rows.collect()
    }

    pub fn enabled_watch_folders(&self) -> Result<Vec<WatchFolder>, rusqlite::Error> {
        Ok(self
            .list_watch_folders()?
            .into_iter()
            .filter(|folder| folder.enabled)
            .collect())
    }

    pub fn set_watch_folder_enabled(
        &self,
        path: &str,
        enabled: bool,
    ) -> Result<bool, rusqlite::Error> {
        let updated = self.conn().execute(
            "UPDATE watch_folders SET enabled = ?1 WHERE path = ?2",
            params![enabled, path],
        )?;
        Ok(updated > 0)
    }

    /// Recounts tracks below `path` and stamps the scan time.
    pub fn record_folder_scan(
        &self,
        path: &str,
        scanned_at_unix_ms: i64,
    ) -> Result<i64, rusqlite::Error> {
        let count = self.count_tracks_under(path)?;
        self.conn().execute(
            "UPDATE watch_folders SET track_count = ?1, last_scan_unix_ms = ?2 WHERE path = ?3",
            params![count, scanned_at_unix_ms, path],
        )?;
        Ok(count)
    }

    /// Folds the write-ahead log back into the main file.
    pub fn checkpoint(&self) -> Result<(), rusqlite::Error> {
        self.conn()
            .query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))
    }

    /// Recounts tracks below `path` without touching the scan time.
    pub fn refresh_folder_count(&self, path: &str) -> Result<i64, rusqlite::Error> {
        let count = self.count_tracks_under(path)?;
        self.conn().execute(
            "UPDATE watch_folders SET track_count = ?1 WHERE path = ?2",
            params![count, path],
        )?;
        Ok(count)
    }
}
