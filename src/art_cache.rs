//! Content-addressed artwork cache on disk.
//!
//! File existence is the hit signal. Names are derived either from a hash of
//! the track path (embedded art) or from the remote release identifier.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use image::ImageFormat;
use log::{debug, warn};

/// Extensions a cached image may carry, in lookup order.
pub const CACHE_EXTENSIONS: [&str; 2] = ["jpg", "png"];

pub fn hash_string(value: &str) -> String {
    format!("{:x}", md5::compute(value.as_bytes()))
}

/// Cache stem for a track's embedded picture.
pub fn embedded_art_stem(track_path: &str) -> String {
    format!("embedded-{}", hash_string(track_path))
}

/// Cache stem for a release's remote front cover. Identifiers that are not
/// already filename-safe are hashed so distinct ids never share a file.
pub fn release_art_stem(release_id: &str) -> String {
    let is_safe = !release_id.is_empty()
        && release_id
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '-');
    if is_safe {
        format!("release-{release_id}")
    } else {
        format!("release-{}", hash_string(release_id))
    }
}

pub fn extension_for_mime(mime_type: &str) -> &'static str {
    if mime_type.trim().eq_ignore_ascii_case("image/png") {
        "png"
    } else {
        "jpg"
    }
}

/// Sniffs image bytes. `None` when the payload is not a recognizable image.
pub fn extension_for_bytes(bytes: &[u8]) -> Option<&'static str> {
    match image::guess_format(bytes).ok()? {
        ImageFormat::Png => Some("png"),
        _ => Some("jpg"),
    }
}

#[derive(Debug, Clone)]
pub struct ArtCache {
    dir: PathBuf,
}

impl ArtCache {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, stem: &str, extension: &str) -> PathBuf {
        self.dir.join(format!("{stem}.{extension}"))
    }

    pub fn exists(&self, stem: &str) -> bool {
        self.get(stem).is_some()
    }

    pub fn get(&self, stem: &str) -> Option<PathBuf> {
        CACHE_EXTENSIONS
            .iter()
            .map(|extension| self.path_for(stem, extension))
            .find(|candidate| candidate.is_file())
    }

    /// Writes through a temp file and rename so readers never see a partial image.
    pub fn put(&self, stem: &str, extension: &str, bytes: &[u8]) -> std::io::Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        let target_path = self.path_for(stem, extension);
        let temp_path = self.dir.join(format!("{stem}.{extension}.tmp"));
        if temp_path.exists() {
            let _ = fs::remove_file(&temp_path);
        }
        fs::write(&temp_path, bytes)?;
        fs::rename(&temp_path, &target_path)?;
        Ok(target_path)
    }

    /// Deletes cache files last modified more than `max_age` ago.
    /// Returns how many were removed.
    pub fn clean_older_than(&self, max_age: Duration) -> usize {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) => {
                debug!("Art cache: cannot list {}: {}", self.dir.display(), err);
                return 0;
            }
        };
        let now = SystemTime::now();
        let mut removed = 0usize;
        for entry in entries.flatten() {
            let path = entry.path();
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            if !metadata.is_file() {
                continue;
            }
            let age = metadata
                .modified()
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .unwrap_or_default();
            if age <= max_age {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(err) => warn!("Art cache: failed to delete {}: {}", path.display(), err),
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::{
        embedded_art_stem, extension_for_bytes, extension_for_mime, hash_string,
        release_art_stem, ArtCache,
    };
    use image::{DynamicImage, ImageBuffer, ImageFormat, Rgba};
    use std::fs;
    use std::io::Cursor;
    use std::path::PathBuf;
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    fn unique_temp_dir(name: &str) -> PathBuf {
        let nonce = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time should be valid")
            .as_nanos();
        std::env::temp_dir().join(format!("music_catalog_{name}_{nonce}"))
    }

    #[test]
    fn test_hash_string_is_deterministic() {
        assert_eq!(hash_string("abc"), hash_string("abc"));
        assert_ne!(hash_string("abc"), hash_string("abcd"));
        assert_eq!(hash_string("abc"), "900150983cd24fb0d6963f7d28e17f72");
    }

    #[test]
    fn test_stems_are_filename_safe() {
        assert!(embedded_art_stem("/music/a b/c.mp3").starts_with("embedded-"));
        assert_eq!(
            release_art_stem("76df3287-6cda-33eb-8e9a-044b5e15ffdd"),
            "release-76df3287-6cda-33eb-8e9a-044b5e15ffdd"
        );
        assert_eq!(
            release_art_stem("../../etc"),
            format!("release-{}", hash_string("../../etc"))
        );
        assert!(release_art_stem("///").starts_with("release-"));
        assert!(!release_art_stem("x/y").contains('/'));
    }

    #[test]
    fn test_release_stems_do_not_collide_after_sanitizing() {
        assert_ne!(release_art_stem("a b"), release_art_stem("ab"));
        assert_ne!(release_art_stem("x/y"), release_art_stem("xy"));
        assert_ne!(release_art_stem(""), release_art_stem("-"));
    }

    #[test]
    fn test_extension_for_mime_defaults_to_jpg() {
        assert_eq!(extension_for_mime("image/png"), "png");
        assert_eq!(extension_for_mime("image/jpeg"), "jpg");
        assert_eq!(extension_for_mime(""), "jpg");
    }

    #[test]
    fn test_extension_for_bytes_sniffs_png_and_rejects_garbage() {
        let source = DynamicImage::ImageRgba8(ImageBuffer::from_pixel(3, 2, Rgba([1, 2, 3, 255])));
        let mut cursor = Cursor::new(Vec::<u8>::new());
        source
            .write_to(&mut cursor, ImageFormat::Png)
            .expect("png encoding should succeed");
        assert_eq!(extension_for_bytes(&cursor.into_inner()), Some("png"));
        assert_eq!(extension_for_bytes(&[0xFF, 0xD8, 0xFF, 0xE0, 0, 0]), Some("jpg"));
        assert_eq!(extension_for_bytes(b"<html>not found</html>"), None);
    }

    #[test]
    fn test_put_then_get_checks_both_extensions() {
        let dir = unique_temp_dir("art_cache_put");
        let cache = ArtCache::new(dir.clone());
        assert!(!cache.exists("stem"));
        let written = cache.put("stem", "png", b"bytes").expect("write should succeed");
        assert_eq!(written, dir.join("stem.png"));
        assert_eq!(cache.get("stem"), Some(dir.join("stem.png")));
        assert!(!dir.join("stem.png.tmp").exists());
        fs::remove_dir_all(dir).expect("cleanup");
    }

    #[test]
    fn test_clean_older_than_keeps_fresh_entries() {
        let dir = unique_temp_dir("art_cache_clean");
        let cache = ArtCache::new(dir.clone());
        cache.put("fresh", "jpg", b"x").expect("write");
        assert_eq!(cache.clean_older_than(Duration::from_secs(3600)), 0);
        assert!(cache.exists("fresh"));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cache.clean_older_than(Duration::from_millis(1)), 1);
        assert!(!cache.exists("fresh"));
        fs::remove_dir_all(dir).expect("cleanup");
    }

    #[test]
    fn test_clean_older_than_tolerates_missing_directory() {
        let cache = ArtCache::new(unique_temp_dir("art_cache_missing"));
        assert_eq!(cache.clean_older_than(Duration::ZERO), 0);
    }
}
