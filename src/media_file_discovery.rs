use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use log::debug;

use crate::protocol::FileScanState;

pub const SUPPORTED_AUDIO_EXTENSIONS: [&str; 9] = [
    "mp3", "wav", "ogg", "opus", "flac", "aac", "m4a", "mp4", "aiff",
];

const FOLDER_ART_STEMS: [&str; 4] = ["cover", "folder", "album", "front"];
const FOLDER_ART_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// Bytes read from the head of a file for its change fingerprint.
const FINGERPRINT_PREFIX_BYTES: u64 = 64 * 1024;

pub fn is_supported_audio_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            SUPPORTED_AUDIO_EXTENSIONS
                .iter()
                .any(|supported| ext.eq_ignore_ascii_case(supported))
        })
        .unwrap_or(false)
}

pub fn is_hidden_name(name: &str) -> bool {
    name.starts_with('.')
}

/// True when any component of `path` below `root` is hidden.
pub fn is_hidden_below(root: &Path, path: &Path) -> bool {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .any(|component| component.as_os_str().to_string_lossy().starts_with('.'))
}

/// Depth-first walk yielding supported audio files below a root.
///
/// Directories are read one at a time as the iterator advances. Hidden
/// entries are skipped. Unreadable directories are logged and counted in
/// `unreadable_directories` and the walk continues with the next one.
pub struct AudioFileWalk {
    pending_directories: Vec<PathBuf>,
    pending_files: VecDeque<PathBuf>,
    unreadable_directories: usize,
}

impl AudioFileWalk {
    pub fn new(root: &Path) -> Self {
        Self {
            pending_directories: vec![root.to_path_buf()],
            pending_files: VecDeque::new(),
            unreadable_directories: 0,
        }
    }

    pub fn unreadable_directories(&self) -> usize {
        self.unreadable_directories
    }

    fn visit_directory(&mut self, directory: &Path) {
        let entries = match fs::read_dir(directory) {
            Ok(entries) => entries,
            Err(err) => {
                debug!("Library scan: failed to read {}: {}", directory.display(), err);
                self.unreadable_directories += 1;
                return;
            }
        };

        let mut subdirectories = Vec::new();
        let mut files = Vec::new();
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    debug!(
                        "Library scan: failed to read entry in {}: {}",
                        directory.display(),
                        err
                    );
                    continue;
                }
            };
            if is_hidden_name(&entry.file_name().to_string_lossy()) {
                continue;
            }

            let path = entry.path();
            let file_type = match entry.file_type() {
                Ok(file_type) => file_type,
                Err(err) => {
                    debug!("Library scan: failed to inspect {}: {}", path.display(), err);
                    continue;
                }
            };

            if file_type.is_dir() {
                subdirectories.push(path);
            } else if file_type.is_file() && is_supported_audio_file(&path) {
                files.push(path);
            }
        }

        files.sort_unstable();
        self.pending_files.extend(files);
        // Reverse so the alphabetically first subdirectory is popped next.
        subdirectories.sort_unstable_by(|left, right| right.cmp(left));
        self.pending_directories.extend(subdirectories);
    }
}

impl Iterator for AudioFileWalk {
    type Item = PathBuf;

    fn next(&mut self) -> Option<PathBuf> {
        loop {
            if let Some(file) = self.pending_files.pop_front() {
                return Some(file);
            }
            let directory = self.pending_directories.pop()?;
            self.visit_directory(&directory);
        }
    }
}

/// Looks for a well-known cover image next to `track_path`.
pub fn find_folder_art(track_path: &Path) -> Option<PathBuf> {
    let directory = track_path.parent()?;
    for stem in FOLDER_ART_STEMS {
        let capitalized = format!("{}{}", stem[..1].to_ascii_uppercase(), &stem[1..]);
        for name_stem in [stem.to_string(), capitalized] {
            for extension in FOLDER_ART_EXTENSIONS {
                let candidate = directory.join(format!("{name_stem}.{extension}"));
                if candidate.is_file() {
                    return Some(candidate);
                }
            }
        }
    }
    None
}

pub fn modified_unix_ms(metadata: &fs::Metadata) -> i64 {
    metadata
        .modified()
        .ok()
        .and_then(|modified| modified.duration_since(UNIX_EPOCH).ok())
        .map(|duration| duration.as_millis() as i64)
        .unwrap_or(0)
}

/// Hash over the first 64 KiB plus the declared size.
pub fn content_fingerprint(path: &Path, file_size_bytes: u64) -> std::io::Result<String> {
    let mut prefix = Vec::with_capacity(FINGERPRINT_PREFIX_BYTES as usize + 8);
    File::open(path)?
        .take(FINGERPRINT_PREFIX_BYTES)
        .read_to_end(&mut prefix)?;
    prefix.extend_from_slice(&file_size_bytes.to_le_bytes());
    Ok(format!("{:x}", md5::compute(&prefix)))
}

pub fn file_scan_state(path: &Path) -> std::io::Result<FileScanState> {
    let metadata = fs::metadata(path)?;
    Ok(FileScanState {
        modified_unix_ms: modified_unix_ms(&metadata),
        file_size_bytes: metadata.len() as i64,
        content_hash: content_fingerprint(path, metadata.len())?,
    })
}

#[cfg(test)]
mod tests {
    use super::{
        content_fingerprint, find_folder_art, is_hidden_below, is_supported_audio_file,
        AudioFileWalk,
    };
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::time::{SystemTime, UNIX_EPOCH};

    fn unique_temp_dir(name: &str) -> PathBuf {
        let nonce = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time should be valid")
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("music_catalog_{name}_{nonce}"));
        fs::create_dir_all(&dir).expect("temp dir should be creatable");
        dir
    }

    #[test]
    fn test_is_supported_audio_file_ignores_case() {
        assert!(is_supported_audio_file(Path::new("/a/b.FLAC")));
        assert!(is_supported_audio_file(Path::new("/a/b.m4a")));
        assert!(!is_supported_audio_file(Path::new("/a/cover.jpg")));
        assert!(!is_supported_audio_file(Path::new("/a/noext")));
    }

    #[test]
    fn test_walk_skips_hidden_entries_and_filters_extensions() {
        let root = unique_temp_dir("walk");
        fs::create_dir_all(root.join("b_album")).expect("mkdir");
        fs::create_dir_all(root.join("a_album/disc1")).expect("mkdir");
        fs::create_dir_all(root.join(".hidden_dir")).expect("mkdir");
        fs::write(root.join("top.mp3"), b"x").expect("write");
        fs::write(root.join(".secret.mp3"), b"x").expect("write");
        fs::write(root.join("notes.txt"), b"x").expect("write");
        fs::write(root.join("a_album/disc1/01.flac"), b"x").expect("write");
        fs::write(root.join("b_album/02.ogg"), b"x").expect("write");
        fs::write(root.join(".hidden_dir/03.mp3"), b"x").expect("write");

        let found: Vec<PathBuf> = AudioFileWalk::new(&root).collect();
        assert_eq!(
            found,
            vec![
                root.join("top.mp3"),
                root.join("a_album/disc1/01.flac"),
                root.join("b_album/02.ogg"),
            ]
        );

        fs::remove_dir_all(root).expect("cleanup");
    }

    #[test]
    fn test_walk_counts_unreadable_root_without_panicking() {
        let mut walk = AudioFileWalk::new(Path::new("/definitely/not/a/real/dir"));
        assert!(walk.next().is_none());
        assert_eq!(walk.unreadable_directories(), 1);
    }

    #[test]
    fn test_is_hidden_below_checks_relative_components() {
        let root = Path::new("/home/user/.music");
        assert!(!is_hidden_below(root, Path::new("/home/user/.music/a/b.mp3")));
        assert!(is_hidden_below(root, Path::new("/home/user/.music/.cache/b.mp3")));
        assert!(is_hidden_below(root, Path::new("/home/user/.music/a/.b.mp3.part")));
    }

    #[test]
    fn test_find_folder_art_prefers_list_order() {
        let root = unique_temp_dir("folder_art");
        fs::write(root.join("track.mp3"), b"x").expect("write");
        assert_eq!(find_folder_art(&root.join("track.mp3")), None);

        fs::write(root.join("Front.png"), b"x").expect("write");
        assert_eq!(
            find_folder_art(&root.join("track.mp3")),
            Some(root.join("Front.png"))
        );

        fs::write(root.join("folder.jpg"), b"x").expect("write");
        assert_eq!(
            find_folder_art(&root.join("track.mp3")),
            Some(root.join("folder.jpg"))
        );

        fs::remove_dir_all(root).expect("cleanup");
    }

    #[test]
    fn test_content_fingerprint_tracks_prefix_and_size() {
        let root = unique_temp_dir("fingerprint");
        let path = root.join("a.mp3");
        fs::write(&path, b"abc").expect("write");
        let first = content_fingerprint(&path, 3).expect("hash");
        assert_eq!(first, content_fingerprint(&path, 3).expect("hash"));
        assert_ne!(first, content_fingerprint(&path, 4).expect("hash"));
        fs::write(&path, b"abd").expect("write");
        assert_ne!(first, content_fingerprint(&path, 3).expect("hash"));
        fs::remove_dir_all(root).expect("cleanup");
    }
}
