//! Host-facing library service composing the store, scanner, observer, and
//! art resolver.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{info, warn};
use tokio::sync::broadcast;

use super::art_resolver::{ArtResolver, CoverArtArchiveClient, CoverArtSource};
use super::change_observer::{ChangeObserver, ObserverMode};
use super::library_scanner::LibraryScanner;
use super::unix_now_ms;
use crate::art_cache::ArtCache;
use crate::catalog_store::CatalogStore;
use crate::config::Config;
use crate::error::{LibraryError, Result};
use crate::metadata::{LoftyTagExtractor, TagExtractor};
use crate::protocol::{
    ArtReference, CrossReferences, ExternalTrackRef, LibraryEvent, ResolvedTrackView,
    ScanSummary, TrackRecord, TrackView, WatchFolder,
};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Trims whitespace and trailing separators so one folder has one key.
fn folder_key(path: &str) -> String {
    let trimmed = path.trim();
    let without_separator = trimmed.trim_end_matches(['/', '\\']);
    if without_separator.is_empty() {
        trimmed.chars().take(1).collect()
    } else {
        without_separator.to_string()
    }
}

pub struct MusicLibrary {
    config: Config,
    store: Arc<CatalogStore>,
    scanner: Arc<LibraryScanner>,
    observer: ChangeObserver,
    art: ArtResolver,
    events: broadcast::Sender<LibraryEvent>,
    shut_down: AtomicBool,
}

impl MusicLibrary {
    /// Opens the catalog and starts observing enabled folders. Failing to
    /// open the catalog is fatal.
    pub fn init(config: Config) -> Result<Self> {
        let database_path = config.library.resolved_database_path()?;
        if let Some(parent) = database_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let store = Arc::new(CatalogStore::open(&database_path)?);
        let art_cache_dir = config.library.resolved_art_cache_dir()?;
        let remote: Option<Arc<dyn CoverArtSource>> = if config.art.remote_enabled {
            Some(Arc::new(CoverArtArchiveClient::new(&config.art)))
        } else {
            None
        };
        info!("Catalog at {}", database_path.display());
        Self::with_components(
            config,
            store,
            Arc::new(LoftyTagExtractor),
            remote,
            art_cache_dir,
        )
    }

    /// Boots the service around caller-supplied collaborators.
    pub fn with_components(
        config: Config,
        store: Arc<CatalogStore>,
        extractor: Arc<dyn TagExtractor>,
        remote: Option<Arc<dyn CoverArtSource>>,
        art_cache_dir: PathBuf,
    ) -> Result<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let scanner = Arc::new(LibraryScanner::new(
            Arc::clone(&store),
            Arc::clone(&extractor),
        ));
        let observer = ChangeObserver::new(
            Arc::clone(&store),
            Arc::clone(&scanner),
            events.clone(),
            config.watcher.clone(),
        );
        let art = ArtResolver::new(
            Arc::clone(&store),
            extractor,
            ArtCache::new(art_cache_dir),
            remote,
        );

        for folder in &config.library.folders {
            store.add_watch_folder(&folder_key(folder))?;
        }
        observer.start()?;
        if config.library.scan_on_startup {
            observer.request_rescan_all();
        }
        info!(
            "Music library ready: {} folder(s), {} live handle(s)",
            store.list_watch_folders()?.len(),
            observer.live_handle_count()
        );

        Ok(Self {
            config,
            store,
            scanner,
            observer,
            art,
            events,
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LibraryEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn observer_mode(&self) -> ObserverMode {
        self.observer.mode()
    }

    /// Registers a folder, starts watching it, and schedules its first scan.
    pub fn add_folder(&self, path: &str) -> Result<WatchFolder> {
        let key = folder_key(path);
        if !Path::new(&key).is_dir() {
            return Err(LibraryError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{key} is not a directory"),
            )));
        }
        let folder = self.store.add_watch_folder(&key)?;
        if folder.enabled {
            if let Err(err) = self.observer.watch_folder(Path::new(&key)) {
                warn!("Library: cannot watch {}: {}", key, err);
            }
            self.observer.request_scan(Path::new(&key));
        }
        info!("Library: folder added {}", key);
        Ok(folder)
    }

    /// Unregisters a folder and deletes its tracks, cancelling any scan or
    /// queued change for it first. Returns how many tracks were deleted.
    pub fn remove_folder(&self, path: &str) -> Result<usize> {
        let key = folder_key(path);
        let removed = self.observer.remove_folder(Path::new(&key))?;
        info!("Library: folder removed {} ({} track(s))", key, removed);
        Ok(removed)
    }

    pub fn set_folder_enabled(&self, path: &str, enabled: bool) -> Result<bool> {
        let key = folder_key(path);
        if !self.store.set_watch_folder_enabled(&key, enabled)? {
            return Ok(false);
        }
        if enabled {
            if let Err(err) = self.observer.watch_folder(Path::new(&key)) {
                warn!("Library: cannot watch {}: {}", key, err);
            }
        } else {
            self.observer.unwatch_folder(Path::new(&key));
        }
        Ok(true)
    }

    pub fn list_folders(&self) -> Result<Vec<WatchFolder>> {
        Ok(self.store.list_watch_folders()?)
    }

    /// Scans a registered folder on the calling thread.
    pub fn rescan_folder(&self, path: &str) -> Result<ScanSummary> {
        self.observer.scan_now(Path::new(&folder_key(path)))
    }

    pub fn abort_scan(&self) {
        self.scanner.abort_scan();
    }

    fn view(&self, record: &TrackRecord, with_art: bool) -> TrackView {
        let art = if with_art {
            self.art.resolve_art(record)
        } else {
            None
        };
        TrackView::from_record(record, art.as_ref())
    }

    pub fn search(&self, query: &str, with_art: bool) -> Result<Vec<TrackView>> {
        Ok(self
            .store
            .search(query)?
            .iter()
            .map(|record| self.view(record, with_art))
            .collect())
    }

    pub fn get_track_by_path(&self, path: &str, with_art: bool) -> Result<Option<TrackView>> {
        Ok(self
            .store
            .get_track_by_path(path)?
            .map(|record| self.view(&record, with_art)))
    }

    pub fn resolve(
        &self,
        artist: &str,
        title: &str,
        album: Option<&str>,
        with_art: bool,
    ) -> Result<Vec<ResolvedTrackView>> {
        Ok(self
            .store
            .resolve(artist, title, album)?
            .into_iter()
            .map(|candidate| ResolvedTrackView {
                track: self.view(&candidate.track, with_art),
                score: candidate.score,
                confidence: candidate.confidence,
            })
            .collect())
    }

    /// Resolves a track described by an arbitrary external JSON object.
    pub fn resolve_external(
        &self,
        value: &serde_json::Value,
        with_art: bool,
    ) -> Result<Vec<ResolvedTrackView>> {
        let Some(reference) = ExternalTrackRef::from_json(value) else {
            return Ok(Vec::new());
        };
        self.resolve(
            &reference.artist,
            &reference.title,
            reference.album.as_deref(),
            with_art,
        )
    }

    pub fn resolve_art(&self, path: &str) -> Result<Option<ArtReference>> {
        Ok(self
            .store
            .get_track_by_path(path)?
            .and_then(|record| self.art.resolve_art(&record)))
    }

    /// Stores identifiers found by an enrichment pass.
    pub fn apply_cross_references(&self, path: &str, cross_refs: &CrossReferences) -> Result<bool> {
        Ok(self
            .store
            .set_cross_references(path, cross_refs, unix_now_ms())?)
    }

    /// Evicts art older than the configured age.
    pub fn clean_art_cache(&self) -> usize {
        self.art.clean_cache(self.config.art.cache_max_age_days)
    }

    pub fn on_app_foreground(&self) {
        self.observer.on_foreground();
    }

    pub fn on_app_background(&self) {
        self.observer.on_background();
    }

    /// Stops watches and timers and checkpoints the catalog. Idempotent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.observer.shutdown();
        if let Err(err) = self.store.checkpoint() {
            warn!("Library: catalog checkpoint failed: {}", err);
        }
        info!("Music library shut down");
    }
}

impl Drop for MusicLibrary {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::{folder_key, MusicLibrary};
    use crate::catalog_store::CatalogStore;
    use crate::config::Config;
    use crate::library::change_observer::ObserverMode;
    use crate::library::library_scanner::tests::{unique_temp_dir, StubTagExtractor};
    use crate::protocol::{ChangeType, CrossReferences, LibraryChange, LibraryEvent};
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn library_for(dir: &Path) -> MusicLibrary {
        let mut config = Config::default();
        config.library.scan_on_startup = false;
        MusicLibrary::with_components(
            config,
            Arc::new(CatalogStore::open_in_memory().expect("store should open")),
            Arc::new(StubTagExtractor::default()),
            None,
            dir.join("art"),
        )
        .expect("library should boot")
    }

    fn music_folder(root: &Path, files: &[&str]) -> PathBuf {
        let folder = root.join("music");
        fs::create_dir_all(&folder).expect("mkdir");
        for file in files {
            let path = folder.join(file);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).expect("mkdir");
            }
            fs::write(path, b"x").expect("write");
        }
        folder
    }

    #[test]
    fn test_folder_key_trims_trailing_separators() {
        assert_eq!(folder_key(" /music/rock/ "), "/music/rock");
        assert_eq!(folder_key("/"), "/");
    }

    #[test]
    fn test_add_folder_scans_in_background_and_reports_completion() {
        let root = unique_temp_dir("service_add");
        let library = library_for(&root);
        let mut events = library.subscribe();
        let folder = music_folder(&root, &["Creep.mp3", "album/Karma Police.flac"]);

        let added = library
            .add_folder(&format!("{}/", folder.display()))
            .expect("folder should register");
        assert_eq!(added.path, folder.to_string_lossy());

        let deadline = Instant::now() + Duration::from_secs(10);
        let summary = loop {
            match events.try_recv() {
                Ok(LibraryEvent::ScanCompleted { summary, .. }) => break summary,
                Ok(_) => {}
                Err(_) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(20))
                }
                Err(err) => panic!("scan did not complete: {err:?}"),
            }
        };
        assert_eq!(summary.added, 2);

        let folders = library.list_folders().expect("list");
        assert_eq!(folders.len(), 1);
        assert_eq!(folders[0].track_count, 2);

        library.shutdown();
        fs::remove_dir_all(root).expect("cleanup");
    }

    #[test]
    fn test_add_folder_rejects_missing_directory() {
        let root = unique_temp_dir("service_missing");
        let library = library_for(&root);
        assert!(library.add_folder("/definitely/not/here").is_err());
        assert!(library.list_folders().expect("list").is_empty());
        fs::remove_dir_all(root).expect("cleanup");
    }

    #[test]
    fn test_search_attaches_art_only_when_asked() {
        let root = unique_temp_dir("service_search");
        let library = library_for(&root);
        let folder = music_folder(&root, &["Creep.mp3", "cover.jpg"]);
        library.store.add_watch_folder(&folder.to_string_lossy()).expect("register");
        library
            .rescan_folder(&folder.to_string_lossy())
            .expect("scan");

        let plain = library.search("creep", false).expect("search");
        assert_eq!(plain.len(), 1);
        assert_eq!(plain[0].art_uri, None);

        let with_art = library.search("CREEP!", true).expect("search");
        assert_eq!(
            with_art[0].art_uri,
            Some(format!("file://{}", folder.join("cover.jpg").display()))
        );

        let path = folder.join("Creep.mp3").to_string_lossy().to_string();
        let fetched = library
            .get_track_by_path(&path, false)
            .expect("get")
            .expect("track");
        assert_eq!(fetched.title, "Creep");
        assert!(library.search("   ", false).expect("search").is_empty());

        library.shutdown();
        fs::remove_dir_all(root).expect("cleanup");
    }

    #[test]
    fn test_resolve_external_accepts_foreign_key_names() {
        let root = unique_temp_dir("service_resolve");
        let library = library_for(&root);
        let folder = music_folder(&root, &["Creep.mp3", "Creep (Acoustic).mp3"]);
        library
            .rescan_folder(&folder.to_string_lossy())
            .expect("scan");

        let matches = library
            .resolve_external(
                &serde_json::json!({ "artistName": "Stub Artist", "trackName": "Creep" }),
                false,
            )
            .expect("resolve");
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].track.title, "Creep");
        assert!((matches[0].confidence - 1.0).abs() < f64::EPSILON);
        assert!(matches[1].confidence < matches[0].confidence);

        assert!(library
            .resolve_external(&serde_json::json!({ "id": 1 }), false)
            .expect("resolve")
            .is_empty());

        library.shutdown();
        fs::remove_dir_all(root).expect("cleanup");
    }

    #[test]
    fn test_cross_references_survive_rescans_and_folder_removal_cascades() {
        let root = unique_temp_dir("service_cross_refs");
        let library = library_for(&root);
        let folder = music_folder(&root, &["Creep.mp3"]);
        let folder_key = folder.to_string_lossy().to_string();
        library.store.add_watch_folder(&folder_key).expect("register");
        library.rescan_folder(&folder_key).expect("scan");
        let path = folder.join("Creep.mp3").to_string_lossy().to_string();

        let refs = CrossReferences {
            recording_id: Some("rec-1".to_string()),
            artist_id: Some("art-1".to_string()),
            release_id: Some("rel-1".to_string()),
        };
        assert!(library.apply_cross_references(&path, &refs).expect("apply"));
        assert!(!library
            .apply_cross_references("/nowhere.mp3", &refs)
            .expect("apply"));

        let reindexed = library
            .scanner
            .process_file_change(Path::new(&path), ChangeType::Change);
        assert!(matches!(reindexed.as_slice(), [LibraryChange::Updated { .. }]));
        let view = library
            .get_track_by_path(&path, false)
            .expect("get")
            .expect("track");
        assert_eq!(view.cross_references, refs);

        assert_eq!(library.remove_folder(&folder_key).expect("remove"), 1);
        assert!(library.get_track_by_path(&path, false).expect("get").is_none());
        assert!(library.list_folders().expect("list").is_empty());

        library.shutdown();
        fs::remove_dir_all(root).expect("cleanup");
    }

    #[test]
    fn test_remove_folder_right_after_add_leaves_no_tracks() {
        let root = unique_temp_dir("service_add_remove");
        let library = library_for(&root);
        let names: Vec<String> = (0..50).map(|index| format!("{index:02}.mp3")).collect();
        let name_refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let folder = music_folder(&root, &name_refs);
        let folder_key = folder.to_string_lossy().to_string();

        library.add_folder(&folder_key).expect("folder should register");
        library.remove_folder(&folder_key).expect("folder should unregister");
        std::thread::sleep(Duration::from_millis(300));

        assert!(library.list_folders().expect("list").is_empty());
        assert_eq!(
            library
                .store
                .count_tracks_under(&folder_key)
                .expect("count"),
            0
        );

        library.shutdown();
        fs::remove_dir_all(root).expect("cleanup");
    }

    #[test]
    fn test_lifecycle_hooks_switch_observer_mode() {
        let root = unique_temp_dir("service_lifecycle");
        let library = library_for(&root);
        assert_eq!(library.observer_mode(), ObserverMode::Live);
        library.on_app_background();
        assert_eq!(library.observer_mode(), ObserverMode::Polling);
        library.on_app_foreground();
        assert_eq!(library.observer_mode(), ObserverMode::Live);
        library.shutdown();
        library.shutdown();
        assert_eq!(library.clean_art_cache(), 0);
        fs::remove_dir_all(root).expect("cleanup");
    }
}
