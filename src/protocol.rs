//! Records and payloads shared by the catalog, scanner, observer, and service.
//!
//! `TrackRecord` is the one canonical internal shape of a track. Everything
//! that arrives from outside (tag readers, external JSON) is converted into it
//! at a single boundary instead of being probed field-by-field downstream.

use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Tags returned by the extraction collaborator for one file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackTags {
    pub title: String,
    pub artist: String,
    pub album: String,
    pub album_artist: String,
    pub track_number: Option<u32>,
    pub disc_number: Option<u32>,
    pub year: Option<i32>,
    pub genre: String,
    pub duration_secs: Option<f64>,
    pub format: String,
    pub bitrate_kbps: Option<u32>,
    pub sample_rate_hz: Option<u32>,
    pub has_embedded_art: bool,
}

/// Picture bytes pulled out of a file's tags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbeddedArt {
    pub data: Vec<u8>,
    pub mime_type: String,
}

/// External identifiers set by a later enrichment pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrossReferences {
    pub recording_id: Option<String>,
    pub artist_id: Option<String>,
    pub release_id: Option<String>,
}

/// Filesystem state captured when a file is indexed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileScanState {
    pub modified_unix_ms: i64,
    pub file_size_bytes: i64,
    pub content_hash: String,
}

/// One catalog row. The path is the unique key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackRecord {
    pub path: String,
    pub content_hash: String,
    pub modified_unix_ms: i64,
    pub file_size_bytes: i64,
    pub title: String,
    pub artist: String,
    pub album: String,
    pub album_artist: String,
    pub track_number: Option<u32>,
    pub disc_number: Option<u32>,
    pub year: Option<i32>,
    pub genre: String,
    pub duration_secs: Option<f64>,
    pub format: String,
    pub bitrate_kbps: Option<u32>,
    pub sample_rate_hz: Option<u32>,
    pub has_embedded_art: bool,
    pub folder_art_path: Option<String>,
    pub remote_art_url: Option<String>,
    pub cross_refs: CrossReferences,
    pub enriched_at_unix_ms: Option<i64>,
    pub indexed_at_unix_ms: i64,
    /// Maintained by the store on every write; caller values are ignored.
    pub title_normalized: String,
    pub artist_normalized: String,
    pub album_normalized: String,
}

impl TrackRecord {
    /// Builds a row from freshly extracted tags.
    pub fn from_scan(
        path: &Path,
        tags: TrackTags,
        scan_state: FileScanState,
        folder_art_path: Option<PathBuf>,
        indexed_at_unix_ms: i64,
    ) -> Self {
        let title = if tags.title.trim().is_empty() {
            fallback_title_from_path(path)
        } else {
            tags.title.trim().to_string()
        };
        let artist = tags.artist.trim().to_string();
        let album_artist = if tags.album_artist.trim().is_empty() {
            artist.clone()
        } else {
            tags.album_artist.trim().to_string()
        };
        Self {
            path: path.to_string_lossy().to_string(),
            content_hash: scan_state.content_hash,
            modified_unix_ms: scan_state.modified_unix_ms,
            file_size_bytes: scan_state.file_size_bytes,
            title,
            artist,
            album: tags.album.trim().to_string(),
            album_artist,
            track_number: tags.track_number,
            disc_number: tags.disc_number,
            year: tags.year,
            genre: tags.genre.trim().to_string(),
            duration_secs: tags.duration_secs,
            format: tags.format,
            bitrate_kbps: tags.bitrate_kbps,
            sample_rate_hz: tags.sample_rate_hz,
            has_embedded_art: tags.has_embedded_art,
            folder_art_path: folder_art_path.map(|path| path.to_string_lossy().to_string()),
            indexed_at_unix_ms,
            ..Self::default()
        }
    }
}

fn fallback_title_from_path(path: &Path) -> String {
    path.file_stem()
        .and_then(|name| name.to_str())
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "Unknown Title".to_string())
}

/// A monitored directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchFolder {
    pub path: String,
    pub enabled: bool,
    pub last_scan_unix_ms: Option<i64>,
    pub track_count: i64,
}

/// Kind of filesystem change reported by the observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Add,
    Change,
    Remove,
}

/// One queued filesystem change waiting for the debounce window to elapse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingChange {
    pub change_type: ChangeType,
    pub path: PathBuf,
    pub enqueued_at: Instant,
}

/// Per-file result of applying a change, published in a change batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum LibraryChange {
    Added { track: TrackView },
    Updated { track: TrackView },
    Removed { path: String },
    Error { path: String, error: String },
}

impl LibraryChange {
    pub fn path(&self) -> &str {
        match self {
            Self::Added { track } | Self::Updated { track } => &track.path,
            Self::Removed { path } | Self::Error { path, .. } => path,
        }
    }
}

/// Outcome of indexing a single file during a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    Added,
    Updated,
    Skipped,
}

/// Totals reported when a folder scan finishes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanSummary {
    pub processed: usize,
    pub added: usize,
    pub updated: usize,
    pub skipped: usize,
    pub removed: usize,
    pub errors: usize,
    pub total: usize,
    pub aborted: bool,
}

/// A scored candidate returned by `CatalogStore::resolve`.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolveMatch {
    pub track: TrackRecord,
    pub score: u32,
    pub confidence: f64,
}

/// Where a track's artwork can be loaded from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtReference {
    /// Image written to the art cache directory.
    CachedFile(PathBuf),
    /// Image sitting next to the audio files.
    FolderFile(PathBuf),
    /// Remote image URL recorded on the row.
    RemoteUrl(String),
}

impl ArtReference {
    pub fn to_uri(&self) -> String {
        match self {
            Self::CachedFile(path) | Self::FolderFile(path) => {
                format!("file://{}", path.to_string_lossy())
            }
            Self::RemoteUrl(url) => url.clone(),
        }
    }
}

/// Host-facing rendering of a track row.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackView {
    pub path: String,
    pub title: String,
    pub artist: String,
    pub album: String,
    pub album_artist: String,
    pub track_number: Option<u32>,
    pub disc_number: Option<u32>,
    pub year: Option<i32>,
    pub genre: String,
    pub duration: Option<f64>,
    pub format: String,
    pub bitrate: Option<u32>,
    pub sample_rate: Option<u32>,
    pub has_embedded_art: bool,
    pub art_uri: Option<String>,
    pub cross_references: CrossReferences,
    pub indexed_at: i64,
}

impl TrackView {
    pub fn from_record(record: &TrackRecord, art: Option<&ArtReference>) -> Self {
        Self {
            path: record.path.clone(),
            title: record.title.clone(),
            artist: record.artist.clone(),
            album: record.album.clone(),
            album_artist: record.album_artist.clone(),
            track_number: record.track_number,
            disc_number: record.disc_number,
            year: record.year,
            genre: record.genre.clone(),
            duration: record.duration_secs,
            format: record.format.clone(),
            bitrate: record.bitrate_kbps,
            sample_rate: record.sample_rate_hz,
            has_embedded_art: record.has_embedded_art,
            art_uri: art.map(ArtReference::to_uri),
            cross_references: record.cross_refs.clone(),
            indexed_at: record.indexed_at_unix_ms,
        }
    }
}

/// Host-facing rendering of a resolve candidate.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedTrackView {
    pub track: TrackView,
    pub score: u32,
    pub confidence: f64,
}

/// Notifications published on the library event bus.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum LibraryEvent {
    LibraryChanged {
        changes: Vec<LibraryChange>,
    },
    #[serde(rename_all = "camelCase")]
    ScanProgress {
        folder: String,
        processed: usize,
        total: usize,
        current_path: String,
    },
    ScanCompleted {
        folder: String,
        summary: ScanSummary,
    },
}

/// Externally-sourced track reference, as sent by streaming services,
/// scrobblers, or playlist imports. Field names vary by origin.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ExternalTrackRef {
    #[serde(default, alias = "artistName", alias = "artist_name", alias = "creator")]
    pub artist: String,
    #[serde(
        default,
        alias = "name",
        alias = "trackName",
        alias = "track_name",
        alias = "track"
    )]
    pub title: String,
    #[serde(default, alias = "albumName", alias = "album_name", alias = "release")]
    pub album: Option<String>,
}

impl ExternalTrackRef {
    /// Accepts any JSON object and keeps only the fields we know how to match on.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        let parsed: Self = serde_json::from_value(value.clone()).ok()?;
        if parsed.artist.trim().is_empty() && parsed.title.trim().is_empty() {
            return None;
        }
        Some(Self {
            album: parsed.album.filter(|album| !album.trim().is_empty()),
            ..parsed
        })
    }
}
