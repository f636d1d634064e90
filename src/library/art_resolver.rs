//! Artwork waterfall: embedded picture, folder image, recorded URL, remote
//! release cover. Resolved images are persisted in the art cache.

use std::io::Read;
use std::num::NonZeroU32;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use log::{debug, info, warn};

use crate::art_cache::{
    embedded_art_stem, extension_for_bytes, extension_for_mime, release_art_stem, ArtCache,
};
use crate::catalog_store::CatalogStore;
use crate::config::ArtConfig;
use crate::metadata::TagExtractor;
use crate::protocol::{ArtReference, TrackRecord};

const COVER_ART_USER_AGENT: &str =
    concat!("music-catalog/", env!("CARGO_PKG_VERSION"), " (local library indexer)");
const MAX_COVER_BYTES: u64 = 16 * 1024 * 1024;
const RATE_LIMIT_POLL: Duration = Duration::from_millis(100);

/// Why a remote cover request produced nothing usable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoverArtFetchError {
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("request failed: {0}")]
    Hard(String),
}

/// Remote registry of release covers.
pub trait CoverArtSource: Send + Sync {
    /// Front cover bytes for a release. `Ok(None)` when the registry has no art
    /// for it, which is the common case and not a failure.
    fn fetch_front_cover(
        &self,
        release_id: &str,
    ) -> std::result::Result<Option<Vec<u8>>, CoverArtFetchError>;
}

fn failure_for_status(code: u16, message: String) -> CoverArtFetchError {
    match code {
        429 | 503 => CoverArtFetchError::RateLimited(message),
        408 | 500 | 502 | 504 => CoverArtFetchError::Timeout(message),
        _ => CoverArtFetchError::Hard(message),
    }
}

fn is_timeout_message(message: &str) -> bool {
    let lowered = message.to_ascii_lowercase();
    lowered.contains("timed out") || lowered.contains("timeout")
}

/// Blocking Cover Art Archive client, paced by a direct rate limiter.
pub struct CoverArtArchiveClient {
    endpoint: String,
    http_client: ureq::Agent,
    limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
    rate_limit_wait: Duration,
}

impl CoverArtArchiveClient {
    pub fn new(config: &ArtConfig) -> Self {
        let request_timeout = Duration::from_millis(config.request_timeout_ms);
        let http_client = ureq::AgentBuilder::new()
            .timeout_connect(request_timeout.min(Duration::from_secs(5)))
            .timeout(request_timeout)
            .user_agent(COVER_ART_USER_AGENT)
            .build();
        let per_second = NonZeroU32::new(config.requests_per_second).unwrap_or(NonZeroU32::MIN);
        Self {
            endpoint: config.cover_art_endpoint.trim_end_matches('/').to_string(),
            http_client,
            limiter: RateLimiter::direct(Quota::per_second(per_second)),
            rate_limit_wait: request_timeout,
        }
    }

    pub fn front_cover_url(&self, release_id: &str) -> String {
        format!(
            "{}/{}/front",
            self.endpoint,
            urlencoding::encode(release_id.trim())
        )
    }

    fn wait_for_rate_limit(&self) -> bool {
        let deadline = Instant::now() + self.rate_limit_wait;
        loop {
            if self.limiter.check().is_ok() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(RATE_LIMIT_POLL);
        }
    }
}

impl CoverArtSource for CoverArtArchiveClient {
    fn fetch_front_cover(
        &self,
        release_id: &str,
    ) -> std::result::Result<Option<Vec<u8>>, CoverArtFetchError> {
        if !self.wait_for_rate_limit() {
            return Err(CoverArtFetchError::RateLimited(
                "local request budget exhausted".to_string(),
            ));
        }
        let url = self.front_cover_url(release_id);
        let response = match self.http_client.get(&url).call() {
            Ok(response) => response,
            Err(ureq::Error::Status(404, _)) => return Ok(None),
            Err(ureq::Error::Status(code, _)) => {
                return Err(failure_for_status(code, format!("HTTP {code} for {url}")));
            }
            Err(ureq::Error::Transport(transport)) => {
                let message = transport.to_string();
                return Err(if is_timeout_message(&message) {
                    CoverArtFetchError::Timeout(message)
                } else {
                    CoverArtFetchError::Hard(message)
                });
            }
        };

        let mut bytes = Vec::new();
        response
            .into_reader()
            .take(MAX_COVER_BYTES)
            .read_to_end(&mut bytes)
            .map_err(|error| {
                let message = format!("cover read failed: {error}");
                if error.kind() == std::io::ErrorKind::TimedOut || is_timeout_message(&message) {
                    CoverArtFetchError::Timeout(message)
                } else {
                    CoverArtFetchError::Hard(message)
                }
            })?;
        if bytes.is_empty() {
            return Err(CoverArtFetchError::Hard("cover response was empty".to_string()));
        }
        Ok(Some(bytes))
    }
}

fn file_uri_target(uri: &str) -> Option<&Path> {
    uri.strip_prefix("file://").map(Path::new)
}

/// Resolves a track's artwork through the waterfall, caching what it finds.
pub struct ArtResolver {
    store: Arc<CatalogStore>,
    extractor: Arc<dyn TagExtractor>,
    cache: ArtCache,
    remote: Option<Arc<dyn CoverArtSource>>,
}

impl ArtResolver {
    pub fn new(
        store: Arc<CatalogStore>,
        extractor: Arc<dyn TagExtractor>,
        cache: ArtCache,
        remote: Option<Arc<dyn CoverArtSource>>,
    ) -> Self {
        Self {
            store,
            extractor,
            cache,
            remote,
        }
    }

    pub fn cache(&self) -> &ArtCache {
        &self.cache
    }

    /// First available artwork for `track`, or `None` for a placeholder.
    pub fn resolve_art(&self, track: &TrackRecord) -> Option<ArtReference> {
        if track.has_embedded_art {
            if let Some(reference) = self.embedded_art(track) {
                return Some(reference);
            }
        }

        if let Some(folder_art) = track.folder_art_path.as_deref() {
            if Path::new(folder_art).is_file() {
                return Some(ArtReference::FolderFile(folder_art.into()));
            }
        }

        if let Some(url) = track.remote_art_url.as_deref().filter(|url| !url.is_empty()) {
            // A cleaned cache leaves the recorded file URI dangling; refetch instead.
            let dangling = file_uri_target(url).is_some_and(|path| !path.is_file());
            if !dangling {
                return Some(ArtReference::RemoteUrl(url.to_string()));
            }
        }

        let release_id = track
            .cross_refs
            .release_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())?;
        self.release_art(track, release_id)
    }

    fn embedded_art(&self, track: &TrackRecord) -> Option<ArtReference> {
        let stem = embedded_art_stem(&track.path);
        if let Some(cached) = self.cache.get(&stem) {
            return Some(ArtReference::CachedFile(cached));
        }
        let art = self.extractor.extract_embedded_art(Path::new(&track.path))?;
        match self
            .cache
            .put(&stem, extension_for_mime(&art.mime_type), &art.data)
        {
            Ok(path) => Some(ArtReference::CachedFile(path)),
            Err(err) => {
                warn!("Art: failed to cache embedded art for {}: {}", track.path, err);
                None
            }
        }
    }

    fn release_art(&self, track: &TrackRecord, release_id: &str) -> Option<ArtReference> {
        let stem = release_art_stem(release_id);
        let cached_path = match self.cache.get(&stem) {
            Some(path) => path,
            None => self.fetch_release_art(&stem, release_id)?,
        };
        let reference = ArtReference::CachedFile(cached_path);
        if let Err(err) = self.store.set_remote_art_url(&track.path, &reference.to_uri()) {
            warn!("Art: failed to record art URL for {}: {}", track.path, err);
        }
        Some(reference)
    }

    fn fetch_release_art(&self, stem: &str, release_id: &str) -> Option<std::path::PathBuf> {
        let remote = self.remote.as_ref()?;
        let bytes = match remote.fetch_front_cover(release_id) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                debug!("Art: no remote cover for release {}", release_id);
                return None;
            }
            Err(CoverArtFetchError::Hard(reason)) => {
                warn!("Art: remote cover for release {} failed: {}", release_id, reason);
                return None;
            }
            Err(err) => {
                info!("Art: remote cover for release {} deferred: {}", release_id, err);
                return None;
            }
        };
        let Some(extension) = extension_for_bytes(&bytes) else {
            warn!(
                "Art: remote cover for release {} is not a recognizable image",
                release_id
            );
            return None;
        };
        match self.cache.put(stem, extension, &bytes) {
            Ok(path) => Some(path),
            Err(err) => {
                warn!("Art: failed to cache cover for release {}: {}", release_id, err);
                None
            }
        }
    }

    /// Evicts cache entries older than `max_age_days`. Returns how many were removed.
    pub fn clean_cache(&self, max_age_days: u32) -> usize {
        let max_age = Duration::from_secs(u64::from(max_age_days) * 24 * 60 * 60);
        let removed = self.cache.clean_older_than(max_age);
        if removed > 0 {
            info!(
                "Art cache: evicted {} file(s) older than {} day(s)",
                removed, max_age_days
            );
        }
        removed
    }
}
