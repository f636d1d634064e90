//! Tag-extraction collaborator seam and its `lofty` implementation.

use std::path::Path;

use crate::error::Result;
use crate::protocol::{EmbeddedArt, TrackTags};

pub mod metadata_tags;

pub use metadata_tags::LoftyTagExtractor;

/// Reads tags and embedded pictures from audio files.
pub trait TagExtractor: Send + Sync {
    /// Whether the file's container is one the extractor understands.
    fn is_supported(&self, path: &Path) -> bool;

    fn read_file(&self, path: &Path) -> Result<TrackTags>;

    /// First embedded picture, preferring the front cover. `None` when the
    /// file has no picture or cannot be read.
    fn extract_embedded_art(&self, path: &Path) -> Option<EmbeddedArt>;
}
