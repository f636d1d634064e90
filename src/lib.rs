//! Local music catalog: indexing, live change observation, fuzzy track
//! resolution, and tiered cover-art lookup.

pub mod art_cache;
pub mod catalog_store;
pub mod config;
pub mod error;
pub mod library;
pub mod media_file_discovery;
pub mod metadata;
pub mod protocol;

pub use error::{LibraryError, Result};
pub use library::MusicLibrary;
