//! Scanning, live observation, artwork, and the service that composes them.

use std::time::{SystemTime, UNIX_EPOCH};

pub mod art_resolver;
pub mod change_observer;
pub mod library_scanner;
pub mod library_service;

pub use art_resolver::{ArtResolver, CoverArtArchiveClient, CoverArtSource};
pub use change_observer::{ChangeObserver, ObserverMode, PendingChanges};
pub use library_scanner::LibraryScanner;
pub use library_service::MusicLibrary;

pub(crate) fn unix_now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as i64)
        .unwrap_or(0)
}
