//! Folder scans and per-file incremental indexing.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use super::unix_now_ms;
use crate::catalog_store::CatalogStore;
use crate::error::{LibraryError, Result};
use crate::media_file_discovery::{
    file_scan_state, find_folder_art, modified_unix_ms, AudioFileWalk,
};
use crate::metadata::TagExtractor;
use crate::protocol::{
    ChangeType, LibraryChange, ProcessOutcome, ScanSummary, TrackRecord, TrackView,
};

const SCAN_WAIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Progress callback: `(processed, total, current_path)`.
pub type ScanProgressFn<'a> = &'a dyn Fn(usize, usize, &Path);

/// Indexes files into the catalog. At most one folder scan runs per instance.
pub struct LibraryScanner {
    store: Arc<CatalogStore>,
    extractor: Arc<dyn TagExtractor>,
    scanning: AtomicBool,
    abort_requested: AtomicBool,
    current_folder: Mutex<Option<PathBuf>>,
}

/// Clears the single-flight flag when the scan ends, including on early return.
struct ScanGuard<'a> {
    scanner: &'a LibraryScanner,
}

impl Drop for ScanGuard<'_> {
    fn drop(&mut self) {
        *self.scanner.current_folder() = None;
        self.scanner.scanning.store(false, Ordering::SeqCst);
    }
}

impl LibraryScanner {
    pub fn new(store: Arc<CatalogStore>, extractor: Arc<dyn TagExtractor>) -> Self {
        Self {
            store,
            extractor,
            scanning: AtomicBool::new(false),
            abort_requested: AtomicBool::new(false),
            current_folder: Mutex::new(None),
        }
    }

    fn current_folder(&self) -> MutexGuard<'_, Option<PathBuf>> {
        self.current_folder
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }

    /// Asks the running scan to stop before its next file.
    pub fn abort_scan(&self) {
        if self.is_scanning() {
            info!("Library scan: abort requested");
            self.abort_requested.store(true, Ordering::SeqCst);
        }
    }

    /// True while a folder scan is walking `folder` or a directory below it.
    pub fn is_scanning_under(&self, folder: &Path) -> bool {
        self.current_folder()
            .as_deref()
            .is_some_and(|current| current.starts_with(folder))
    }

    /// Aborts the running scan only when it covers `folder`.
    pub fn abort_scan_under(&self, folder: &Path) -> bool {
        if !self.is_scanning_under(folder) {
            return false;
        }
        info!("Library scan: abort requested for {}", folder.display());
        self.abort_requested.store(true, Ordering::SeqCst);
        true
    }

    /// Blocks until no scan covers `folder`, up to `timeout`.
    pub fn wait_for_scan_under(&self, folder: &Path, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.is_scanning_under(folder) {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(SCAN_WAIT_POLL_INTERVAL);
        }
        true
    }

    fn try_begin_scan(&self, folder: &Path) -> Option<ScanGuard<'_>> {
        self.scanning
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()?;
        self.abort_requested.store(false, Ordering::SeqCst);
        *self.current_folder() = Some(folder.to_path_buf());
        Some(ScanGuard { scanner: self })
    }

    /// Walks `folder`, indexes every supported file, prunes rows for files
    /// that disappeared, and refreshes the folder's cached track count.
    pub fn scan_folder(
        &self,
        folder: &Path,
        on_progress: Option<ScanProgressFn<'_>>,
    ) -> Result<ScanSummary> {
        let Some(_guard) = self.try_begin_scan(folder) else {
            return Err(LibraryError::ScanInProgress);
        };
        let folder_key = folder.to_string_lossy().to_string();
        info!("Library scan started: {}", folder.display());

        let mut walk = AudioFileWalk::new(folder);
        let files: Vec<_> = walk.by_ref().collect();
        let unreadable_directories = walk.unreadable_directories();
        let root_unreadable = !folder.is_dir();

        let mut summary = ScanSummary {
            total: files.len(),
            errors: unreadable_directories,
            ..ScanSummary::default()
        };
        let mut seen_paths: HashSet<String> = HashSet::with_capacity(files.len());

        for file_path in &files {
            if self.abort_requested.load(Ordering::SeqCst) {
                summary.aborted = true;
                break;
            }
            seen_paths.insert(file_path.to_string_lossy().to_string());
            match self.process_file(file_path) {
                Ok(ProcessOutcome::Added) => summary.added += 1,
                Ok(ProcessOutcome::Updated) => summary.updated += 1,
                Ok(ProcessOutcome::Skipped) => summary.skipped += 1,
                Err(err) => {
                    warn!("Library scan: failed to index {}: {}", file_path.display(), err);
                    summary.errors += 1;
                }
            }
            summary.processed += 1;
            if let Some(on_progress) = on_progress {
                on_progress(summary.processed, summary.total, file_path);
            }
        }

        if !summary.aborted && !root_unreadable {
            summary.removed = self.prune_missing(&folder_key, &seen_paths);
        }

        let track_count = self.store.record_folder_scan(&folder_key, unix_now_ms())?;
        info!(
            "Library scan finished: {} ({} processed, {} added, {} updated, {} skipped, {} removed, {} error(s), {} track(s){})",
            folder.display(),
            summary.processed,
            summary.added,
            summary.updated,
            summary.skipped,
            summary.removed,
            summary.errors,
            track_count,
            if summary.aborted { ", aborted" } else { "" }
        );
        Ok(summary)
    }

    /// Deletes rows below `folder_key` whose files were not walked and are gone.
    fn prune_missing(&self, folder_key: &str, seen_paths: &HashSet<String>) -> usize {
        let known_paths = match self.store.track_paths_under(folder_key) {
            Ok(paths) => paths,
            Err(err) => {
                warn!("Library scan: failed to list rows under {}: {}", folder_key, err);
                return 0;
            }
        };
        let mut removed = 0usize;
        for path in known_paths {
            if seen_paths.contains(&path) || Path::new(&path).exists() {
                continue;
            }
            match self.store.remove_track(&path) {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(err) => warn!("Library scan: failed to prune {}: {}", path, err),
            }
        }
        removed
    }

    /// Indexes one file, skipping it when the stored modification time still
    /// matches the file on disk.
    pub fn process_file(&self, path: &Path) -> Result<ProcessOutcome> {
        let metadata = fs::metadata(path)?;
        let path_key = path.to_string_lossy();
        let existing = self.store.get_track_by_path(&path_key)?;
        if let Some(existing) = &existing {
            if existing.modified_unix_ms == modified_unix_ms(&metadata) {
                return Ok(ProcessOutcome::Skipped);
            }
        }
        self.index_file(path)?;
        Ok(if existing.is_some() {
            ProcessOutcome::Updated
        } else {
            ProcessOutcome::Added
        })
    }

    fn index_file(&self, path: &Path) -> Result<TrackRecord> {
        let scan_state = file_scan_state(path)?;
        let tags = self.extractor.read_file(path)?;
        let record = TrackRecord::from_scan(
            path,
            tags,
            scan_state,
            find_folder_art(path),
            unix_now_ms(),
        );
        self.store.upsert_track(&record)?;
        Ok(record)
    }

    /// Applies one observed change. Failures are reported as `Error` entries
    /// so one bad file never blocks the rest of a batch.
    pub fn process_file_change(&self, path: &Path, change_type: ChangeType) -> Vec<LibraryChange> {
        let result = match change_type {
            ChangeType::Remove => self.apply_removal(path),
            ChangeType::Add | ChangeType::Change if path.is_dir() => self.apply_directory(path),
            ChangeType::Add | ChangeType::Change if !path.exists() => self.apply_removal(path),
            ChangeType::Add | ChangeType::Change => {
                if !self.extractor.is_supported(path) {
                    return Vec::new();
                }
                self.apply_upsert(path).map(|change| vec![change])
            }
        };
        match result {
            Ok(changes) => changes,
            Err(err) => {
                warn!("Library change: failed to apply {}: {}", path.display(), err);
                vec![LibraryChange::Error {
                    path: path.to_string_lossy().to_string(),
                    error: err.to_string(),
                }]
            }
        }
    }

    fn apply_upsert(&self, path: &Path) -> Result<LibraryChange> {
        let existed = self
            .store
            .get_track_by_path(&path.to_string_lossy())?
            .is_some();
        let record = self.index_file(path)?;
        let track = TrackView::from_record(&record, None);
        Ok(if existed {
            LibraryChange::Updated { track }
        } else {
            LibraryChange::Added { track }
        })
    }

    fn apply_upsert_if_changed(&self, path: &Path) -> Result<Option<LibraryChange>> {
        let metadata = fs::metadata(path)?;
        if let Some(existing) = self.store.get_track_by_path(&path.to_string_lossy())? {
            if existing.modified_unix_ms == modified_unix_ms(&metadata) {
                return Ok(None);
            }
        }
        self.apply_upsert(path).map(Some)
    }

    /// A removed path is either one track or a directory of them.
    fn apply_removal(&self, path: &Path) -> Result<Vec<LibraryChange>> {
        let path_key = path.to_string_lossy().to_string();
        if self.store.remove_track(&path_key)? {
            return Ok(vec![LibraryChange::Removed { path: path_key }]);
        }
        let nested_paths = self.store.track_paths_under(&path_key)?;
        if nested_paths.is_empty() {
            return Ok(Vec::new());
        }
        let removed = self.store.remove_tracks_under(&path_key)?;
        debug!("Library change: removed {} track(s) under {}", removed, path_key);
        Ok(nested_paths
            .into_iter()
            .map(|path| LibraryChange::Removed { path })
            .collect())
    }

    /// A directory moved into a watched tree arrives as a single event.
    /// Files whose stored modification time still matches are left alone.
    fn apply_directory(&self, directory: &Path) -> Result<Vec<LibraryChange>> {
        let mut changes = Vec::new();
        for file_path in AudioFileWalk::new(directory) {
            match self.apply_upsert_if_changed(&file_path) {
                Ok(Some(change)) => changes.push(change),
                Ok(None) => {}
                Err(err) => changes.push(LibraryChange::Error {
                    path: file_path.to_string_lossy().to_string(),
                    error: err.to_string(),
                }),
            }
        }
        Ok(changes)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::LibraryScanner;
    use crate::catalog_store::CatalogStore;
    use crate::error::{LibraryError, Result};
    use crate::media_file_discovery::is_supported_audio_file;
    use crate::metadata::TagExtractor;
    use crate::protocol::{ChangeType, EmbeddedArt, LibraryChange, ProcessOutcome, TrackTags};
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::{SystemTime, UNIX_EPOCH};

    /// Returns tags derived from the file name; names containing "bad" fail.
    #[derive(Default)]
    pub(crate) struct StubTagExtractor {
        pub(crate) read_calls: AtomicUsize,
        pub(crate) art_calls: AtomicUsize,
        pub(crate) embedded_art: Mutex<Option<EmbeddedArt>>,
    }

    impl TagExtractor for StubTagExtractor {
        fn is_supported(&self, path: &Path) -> bool {
            is_supported_audio_file(path)
        }

        fn read_file(&self, path: &Path) -> Result<TrackTags> {
            self.read_calls.fetch_add(1, Ordering::SeqCst);
            let stem = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .unwrap_or_default()
                .to_string();
            if stem.contains("bad") {
                return Err(LibraryError::TagRead {
                    path: path.to_path_buf(),
                    reason: "corrupt header".to_string(),
                });
            }
            Ok(TrackTags {
                title: stem,
                artist: "Stub Artist".to_string(),
                album: "Stub Album".to_string(),
                format: "mp3".to_string(),
                ..TrackTags::default()
            })
        }

        fn extract_embedded_art(&self, _path: &Path) -> Option<EmbeddedArt> {
            self.art_calls.fetch_add(1, Ordering::SeqCst);
            self.embedded_art
                .lock()
                .expect("stub lock should not be poisoned")
                .clone()
        }
    }

    pub(crate) fn unique_temp_dir(name: &str) -> PathBuf {
        let nonce = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time should be valid")
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("music_catalog_{name}_{nonce}"));
        fs::create_dir_all(&dir).expect("temp dir should be creatable");
        dir
    }

    fn scanner_with_stub() -> (LibraryScanner, Arc<CatalogStore>, Arc<StubTagExtractor>) {
        let store = Arc::new(CatalogStore::open_in_memory().expect("store should open"));
        let extractor = Arc::new(StubTagExtractor::default());
        let scanner = LibraryScanner::new(Arc::clone(&store), extractor.clone());
        (scanner, store, extractor)
    }

    #[test]
    fn test_process_file_is_idempotent_without_changes() {
        let (scanner, store, extractor) = scanner_with_stub();
        let root = unique_temp_dir("scanner_idempotent");
        let path = root.join("song.mp3");
        fs::write(&path, b"audio").expect("write");

        assert_eq!(
            scanner.process_file(&path).expect("first pass"),
            ProcessOutcome::Added
        );
        let first = store
            .get_track_by_path(&path.to_string_lossy())
            .expect("query")
            .expect("row should exist");

        assert_eq!(
            scanner.process_file(&path).expect("second pass"),
            ProcessOutcome::Skipped
        );
        let second = store
            .get_track_by_path(&path.to_string_lossy())
            .expect("query")
            .expect("row should exist");
        assert_eq!(first.indexed_at_unix_ms, second.indexed_at_unix_ms);
        assert_eq!(extractor.read_calls.load(Ordering::SeqCst), 1);

        fs::remove_dir_all(root).expect("cleanup");
    }

    #[test]
    fn test_process_file_picks_up_folder_art() {
        let (scanner, store, _) = scanner_with_stub();
        let root = unique_temp_dir("scanner_folder_art");
        fs::write(root.join("song.flac"), b"audio").expect("write");
        fs::write(root.join("cover.jpg"), b"img").expect("write");

        scanner.process_file(&root.join("song.flac")).expect("index");
        let row = store
            .get_track_by_path(&root.join("song.flac").to_string_lossy())
            .expect("query")
            .expect("row");
        assert_eq!(
            row.folder_art_path.as_deref(),
            Some(root.join("cover.jpg").to_string_lossy().as_ref())
        );
        assert_eq!(row.title, "song");

        fs::remove_dir_all(root).expect("cleanup");
    }

    #[test]
    fn test_scan_folder_counts_outcomes_and_reports_progress() {
        let (scanner, store, _) = scanner_with_stub();
        let root = unique_temp_dir("scanner_scan");
        fs::create_dir_all(root.join("album")).expect("mkdir");
        fs::write(root.join("a.mp3"), b"a").expect("write");
        fs::write(root.join("album/b.flac"), b"b").expect("write");
        fs::write(root.join("album/bad.ogg"), b"c").expect("write");
        fs::write(root.join("notes.txt"), b"d").expect("write");
        fs::write(root.join(".hidden.mp3"), b"e").expect("write");
        let root_key = root.to_string_lossy().to_string();
        store.add_watch_folder(&root_key).expect("register folder");

        let progress = Mutex::new(Vec::new());
        let on_progress = |processed: usize, total: usize, path: &Path| {
            progress
                .lock()
                .expect("lock")
                .push((processed, total, path.to_path_buf()));
        };
        let summary = scanner
            .scan_folder(&root, Some(&on_progress))
            .expect("scan should run");
        assert_eq!(summary.total, 3);
        assert_eq!(summary.processed, 3);
        assert_eq!(summary.added, 2);
        assert_eq!(summary.errors, 1);
        assert!(!summary.aborted);

        let progress = progress.into_inner().expect("lock");
        assert_eq!(progress.len(), 3);
        assert_eq!(progress[2].0, 3);
        assert_eq!(progress[2].1, 3);

        let folder = store
            .get_watch_folder(&root_key)
            .expect("query")
            .expect("folder");
        assert_eq!(folder.track_count, 2);
        assert!(folder.last_scan_unix_ms.is_some());

        let rescan = scanner.scan_folder(&root, None).expect("rescan");
        assert_eq!(rescan.skipped, 2);
        assert_eq!(rescan.added, 0);
        assert_eq!(rescan.errors, 1);

        fs::remove_dir_all(root).expect("cleanup");
    }

    #[test]
    fn test_scan_folder_prunes_deleted_files() {
        let (scanner, store, _) = scanner_with_stub();
        let root = unique_temp_dir("scanner_prune");
        fs::write(root.join("keep.mp3"), b"a").expect("write");
        fs::write(root.join("gone.mp3"), b"b").expect("write");
        scanner.scan_folder(&root, None).expect("scan");

        fs::remove_file(root.join("gone.mp3")).expect("delete");
        let summary = scanner.scan_folder(&root, None).expect("rescan");
        assert_eq!(summary.removed, 1);
        assert!(store
            .get_track_by_path(&root.join("gone.mp3").to_string_lossy())
            .expect("query")
            .is_none());
        assert_eq!(
            store
                .count_tracks_under(&root.to_string_lossy())
                .expect("count"),
            1
        );

        fs::remove_dir_all(root).expect("cleanup");
    }

    #[test]
    fn test_scan_folder_rejects_concurrent_scan() {
        let (scanner, _, _) = scanner_with_stub();
        let root = unique_temp_dir("scanner_single_flight");

        let guard = scanner.try_begin_scan(&root).expect("first scan should start");
        assert!(matches!(
            scanner.scan_folder(&root, None),
            Err(LibraryError::ScanInProgress)
        ));
        drop(guard);
        assert!(!scanner.is_scanning());
        assert!(scanner.scan_folder(&root, None).is_ok());

        fs::remove_dir_all(root).expect("cleanup");
    }

    #[test]
    fn test_abort_scan_stops_between_files() {
        let (scanner, store, _) = scanner_with_stub();
        let root = unique_temp_dir("scanner_abort");
        for name in ["1.mp3", "2.mp3", "3.mp3"] {
            fs::write(root.join(name), b"x").expect("write");
        }

        let on_progress = |_processed: usize, _total: usize, _path: &Path| scanner.abort_scan();
        let summary = scanner
            .scan_folder(&root, Some(&on_progress))
            .expect("scan should run");
        assert!(summary.aborted);
        assert_eq!(summary.processed, 1);
        assert_eq!(summary.total, 3);
        assert_eq!(
            store
                .count_tracks_under(&root.to_string_lossy())
                .expect("count"),
            1
        );

        let resumed = scanner.scan_folder(&root, None).expect("next scan");
        assert!(!resumed.aborted);
        assert_eq!(resumed.processed, 3);

        fs::remove_dir_all(root).expect("cleanup");
    }

    #[test]
    fn test_process_file_change_reports_each_action() {
        let (scanner, store, _) = scanner_with_stub();
        let root = unique_temp_dir("scanner_changes");
        let song = root.join("song.mp3");
        fs::write(&song, b"x").expect("write");
        fs::write(root.join("bad.mp3"), b"x").expect("write");
        fs::write(root.join("cover.txt"), b"x").expect("write");

        let added = scanner.process_file_change(&song, ChangeType::Add);
        assert!(matches!(added.as_slice(), [LibraryChange::Added { .. }]));
        let updated = scanner.process_file_change(&song, ChangeType::Change);
        assert!(matches!(updated.as_slice(), [LibraryChange::Updated { .. }]));

        assert!(scanner
            .process_file_change(&root.join("cover.txt"), ChangeType::Add)
            .is_empty());

        let failed = scanner.process_file_change(&root.join("bad.mp3"), ChangeType::Add);
        assert!(matches!(failed.as_slice(), [LibraryChange::Error { .. }]));

        let removed = scanner.process_file_change(&song, ChangeType::Remove);
        assert_eq!(
            removed,
            vec![LibraryChange::Removed {
                path: song.to_string_lossy().to_string()
            }]
        );
        assert!(store
            .get_track_by_path(&song.to_string_lossy())
            .expect("query")
            .is_none());

        fs::remove_dir_all(root).expect("cleanup");
    }

    #[test]
    fn test_directory_events_cover_nested_tracks() {
        let (scanner, store, _) = scanner_with_stub();
        let root = unique_temp_dir("scanner_directory_events");
        let album = root.join("album");
        fs::create_dir_all(&album).expect("mkdir");
        fs::write(album.join("1.mp3"), b"x").expect("write");
        fs::write(album.join("2.mp3"), b"x").expect("write");

        let added = scanner.process_file_change(&album, ChangeType::Add);
        assert_eq!(added.len(), 2);
        assert_eq!(
            store
                .count_tracks_under(&root.to_string_lossy())
                .expect("count"),
            2
        );

        fs::remove_dir_all(&album).expect("delete album");
        let removed = scanner.process_file_change(&album, ChangeType::Remove);
        assert_eq!(removed.len(), 2);
        assert!(removed
            .iter()
            .all(|change| matches!(change, LibraryChange::Removed { .. })));
        assert_eq!(
            store
                .count_tracks_under(&root.to_string_lossy())
                .expect("count"),
            0
        );

        fs::remove_dir_all(root).expect("cleanup");
    }
}
