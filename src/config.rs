//! Persistent configuration model and defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use log::info;

use crate::error::{LibraryError, Result};

const APP_DIR_NAME: &str = "music-catalog";
const MIN_POLL_INTERVAL_SECS: u64 = 60;

/// Root configuration persisted to `config.toml`.
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Config {
    #[serde(default)]
    /// Catalog and cache locations, initial folders.
    pub library: LibraryConfig,
    #[serde(default)]
    /// Change observer timing.
    pub watcher: WatcherConfig,
    #[serde(default)]
    /// Artwork resolution and caching.
    pub art: ArtConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct LibraryConfig {
    /// Folders registered on startup in addition to those already in the catalog.
    #[serde(default)]
    pub folders: Vec<String>,
    /// Empty means `<data_dir>/music-catalog/catalog.db`.
    #[serde(default)]
    pub database_path: String,
    /// Empty means `<cache_dir>/music-catalog/art`.
    #[serde(default)]
    pub art_cache_dir: String,
    #[serde(default = "default_true")]
    pub scan_on_startup: bool,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct WatcherConfig {
    /// Quiet window a burst of changes must observe before it is drained.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// How long a file's modification time must stay still before it is read.
    #[serde(default = "default_write_settle_ms")]
    pub write_settle_ms: u64,
    /// Full rescan cadence while the host is backgrounded.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct ArtConfig {
    #[serde(default = "default_true")]
    pub remote_enabled: bool,
    #[serde(default = "default_cover_art_endpoint")]
    pub cover_art_endpoint: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: u32,
    #[serde(default = "default_cache_max_age_days")]
    pub cache_max_age_days: u32,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_true() -> bool {
    true
}

fn default_debounce_ms() -> u64 {
    1_000
}

fn default_write_settle_ms() -> u64 {
    2_000
}

fn default_poll_interval_secs() -> u64 {
    300
}

fn default_cover_art_endpoint() -> String {
    "https://coverartarchive.org/release".to_string()
}

fn default_request_timeout_ms() -> u64 {
    8_000
}

fn default_requests_per_second() -> u32 {
    1
}

fn default_cache_max_age_days() -> u32 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            folders: Vec::new(),
            database_path: String::new(),
            art_cache_dir: String::new(),
            scan_on_startup: true,
        }
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            write_settle_ms: default_write_settle_ms(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

impl WatcherConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn write_settle(&self) -> Duration {
        Duration::from_millis(self.write_settle_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

impl Default for ArtConfig {
    fn default() -> Self {
        Self {
            remote_enabled: true,
            cover_art_endpoint: default_cover_art_endpoint(),
            request_timeout_ms: default_request_timeout_ms(),
            requests_per_second: default_requests_per_second(),
            cache_max_age_days: default_cache_max_age_days(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl LoggingConfig {
    pub fn level_filter(&self) -> log::LevelFilter {
        self.level
            .trim()
            .parse::<log::LevelFilter>()
            .unwrap_or(log::LevelFilter::Info)
    }
}

impl LibraryConfig {
    pub fn resolved_database_path(&self) -> Result<PathBuf> {
        if !self.database_path.trim().is_empty() {
            return Ok(PathBuf::from(self.database_path.trim()));
        }
        dirs::data_dir()
            .map(|dir| dir.join(APP_DIR_NAME).join("catalog.db"))
            .ok_or_else(|| LibraryError::Config("could not find data directory".to_string()))
    }

    pub fn resolved_art_cache_dir(&self) -> Result<PathBuf> {
        if !self.art_cache_dir.trim().is_empty() {
            return Ok(PathBuf::from(self.art_cache_dir.trim()));
        }
        dirs::cache_dir()
            .map(|dir| dir.join(APP_DIR_NAME).join("art"))
            .ok_or_else(|| LibraryError::Config("could not find cache directory".to_string()))
    }
}

/// Clamps values that would make the runtime misbehave.
pub fn sanitize_config(mut config: Config) -> Config {
    config.watcher.poll_interval_secs =
        config.watcher.poll_interval_secs.max(MIN_POLL_INTERVAL_SECS);
    config.art.request_timeout_ms = config.art.request_timeout_ms.max(500);
    config.art.requests_per_second = config.art.requests_per_second.clamp(1, 50);
    config.art.cache_max_age_days = config.art.cache_max_age_days.max(1);
    config.art.cover_art_endpoint = config
        .art
        .cover_art_endpoint
        .trim()
        .trim_end_matches('/')
        .to_string();
    if config.art.cover_art_endpoint.is_empty() {
        config.art.cover_art_endpoint = default_cover_art_endpoint();
    }
    config.library.folders.retain(|folder| !folder.trim().is_empty());
    config
}

pub fn default_config_path() -> Result<PathBuf> {
    dirs::config_dir()
        .map(|dir| dir.join(APP_DIR_NAME).join("config.toml"))
        .ok_or_else(|| LibraryError::Config("could not find config directory".to_string()))
}

/// Reads the config file, writing defaults first when it does not exist.
/// Unparseable files fall back to defaults rather than failing startup.
pub fn load_or_create(config_file: &Path) -> Result<Config> {
    if !config_file.exists() {
        info!(
            "Config file not found. Creating default config. path={}",
            config_file.display()
        );
        if let Some(parent) = config_file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let serialized = toml::to_string(&Config::default())
            .map_err(|error| LibraryError::Config(error.to_string()))?;
        std::fs::write(config_file, serialized)?;
    }

    let content = std::fs::read_to_string(config_file)?;
    let parsed = match toml::from_str::<Config>(&content) {
        Ok(config) => config,
        Err(error) => {
            log::warn!(
                "Config file {} is invalid, using defaults: {}",
                config_file.display(),
                error
            );
            Config::default()
        }
    };
    Ok(sanitize_config(parsed))
}
