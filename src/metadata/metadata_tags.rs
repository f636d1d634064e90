//! Tag and embedded-picture reader backed by `lofty`.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use lofty::config::{ParseOptions, ParsingMode};
use lofty::file::{AudioFile, TaggedFile, TaggedFileExt};
use lofty::picture::{Picture, PictureType};
use lofty::prelude::Accessor;
use lofty::probe::Probe;
use lofty::tag::{ItemKey, Tag};
use log::debug;

use crate::error::{LibraryError, Result};
use crate::media_file_discovery::is_supported_audio_file;
use crate::metadata::TagExtractor;
use crate::protocol::{EmbeddedArt, TrackTags};

const DEFAULT_PICTURE_MIME: &str = "image/jpeg";

/// `TagExtractor` implementation for the containers `lofty` can parse.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoftyTagExtractor;

fn first_non_empty_value<F>(primary_tag: Option<&Tag>, tags: &[Tag], extractor: F) -> String
where
    F: FnMut(&Tag) -> Option<String>,
{
    primary_tag
        .into_iter()
        .chain(tags.iter())
        .filter_map(extractor)
        .map(|value| value.trim().to_string())
        .find(|value| !value.is_empty())
        .unwrap_or_default()
}

fn derive_year_from_date(date: &str) -> Option<i32> {
    let mut consecutive_digits = String::with_capacity(4);
    for ch in date.chars() {
        if ch.is_ascii_digit() {
            consecutive_digits.push(ch);
            if consecutive_digits.len() == 4 {
                return consecutive_digits.parse().ok();
            }
        } else {
            consecutive_digits.clear();
        }
    }
    None
}

/// Parses "3", "03/12", or " 3 of 12" into 3.
fn leading_number(value: &str) -> Option<u32> {
    let digits: String = value
        .trim()
        .chars()
        .take_while(|ch| ch.is_ascii_digit())
        .collect();
    digits.parse().ok().filter(|number| *number > 0)
}

fn parse_options(
    read_properties: bool,
    parsing_mode: ParsingMode,
    max_junk_bytes: usize,
) -> ParseOptions {
    ParseOptions::new()
        .read_properties(read_properties)
        .read_cover_art(true)
        .parsing_mode(parsing_mode)
        .max_junk_bytes(max_junk_bytes)
}

/// Strict extension-based probe first, then relaxed content sniffing.
fn read_tagged_file(
    path: &Path,
    read_properties: bool,
) -> std::result::Result<TaggedFile, String> {
    let primary_options = parse_options(read_properties, ParsingMode::BestAttempt, 1024);
    let relaxed_options = parse_options(read_properties, ParsingMode::Relaxed, 64 * 1024);

    match Probe::open(path) {
        Ok(probe) => match probe.options(primary_options).read() {
            Ok(tagged_file) => return Ok(tagged_file),
            Err(primary_error) => {
                debug!(
                    "Tag read primary parse failed for {}: {}",
                    path.display(),
                    primary_error
                );
            }
        },
        Err(open_error) => {
            debug!(
                "Tag read could not open {} with extension-based probe: {}",
                path.display(),
                open_error
            );
        }
    }

    let file = File::open(path).map_err(|error| error.to_string())?;
    let guessed_probe = Probe::new(BufReader::new(file))
        .options(relaxed_options)
        .guess_file_type()
        .map_err(|error| format!("could not guess file type: {error}"))?;
    let tagged_file = guessed_probe
        .read()
        .map_err(|error| format!("relaxed parse failed: {error}"))?;
    debug!("Tag read recovered via relaxed parsing for {}", path.display());
    Ok(tagged_file)
}

fn all_pictures(tagged_file: &TaggedFile) -> impl Iterator<Item = &Picture> {
    tagged_file
        .primary_tag()
        .into_iter()
        .chain(tagged_file.tags().iter())
        .flat_map(|tag| tag.pictures().iter())
}

fn preferred_picture(tagged_file: &TaggedFile) -> Option<&Picture> {
    all_pictures(tagged_file)
        .find(|picture| picture.pic_type() == PictureType::CoverFront)
        .or_else(|| all_pictures(tagged_file).next())
}

fn format_from_path(path: &Path) -> String {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default()
}

impl TagExtractor for LoftyTagExtractor {
    fn is_supported(&self, path: &Path) -> bool {
        is_supported_audio_file(path)
    }

    fn read_file(&self, path: &Path) -> Result<TrackTags> {
        // A damaged audio stream should not cost us the tags.
        let tagged_file = read_tagged_file(path, true)
            .or_else(|properties_error| {
                debug!(
                    "Tag read with audio properties failed for {}: {}",
                    path.display(),
                    properties_error
                );
                read_tagged_file(path, false)
            })
            .map_err(|reason| LibraryError::TagRead {
                path: path.to_path_buf(),
                reason,
            })?;
        let primary_tag = tagged_file.primary_tag();
        let tags = tagged_file.tags();

        let title = first_non_empty_value(primary_tag, tags, |tag| {
            tag.title().map(|value| value.into_owned())
        });
        let artist = first_non_empty_value(primary_tag, tags, |tag| {
            tag.artist().map(|value| value.into_owned())
        });
        let album = first_non_empty_value(primary_tag, tags, |tag| {
            tag.album().map(|value| value.into_owned())
        });
        let album_artist = first_non_empty_value(primary_tag, tags, |tag| {
            tag.get_string(ItemKey::AlbumArtist).map(str::to_string)
        });
        let genre = first_non_empty_value(primary_tag, tags, |tag| {
            tag.genre().map(|value| value.into_owned())
        });
        let date = first_non_empty_value(primary_tag, tags, |tag| {
            tag.get_string(ItemKey::Year)
                .or_else(|| tag.get_string(ItemKey::RecordingDate))
                .or_else(|| tag.get_string(ItemKey::ReleaseDate))
                .or_else(|| tag.get_string(ItemKey::OriginalReleaseDate))
                .map(str::to_string)
        });
        let track_number = first_non_empty_value(primary_tag, tags, |tag| {
            tag.get_string(ItemKey::TrackNumber)
                .map(str::to_string)
                .or_else(|| tag.track().map(|value| value.to_string()))
        });
        let disc_number = first_non_empty_value(primary_tag, tags, |tag| {
            tag.get_string(ItemKey::DiscNumber).map(str::to_string)
        });

        let properties = tagged_file.properties();
        let duration = properties.duration();
        let has_embedded_art = all_pictures(&tagged_file).next().is_some();

        Ok(TrackTags {
            title,
            artist,
            album,
            album_artist,
            track_number: leading_number(&track_number),
            disc_number: leading_number(&disc_number),
            year: derive_year_from_date(&date),
            genre,
            duration_secs: (!duration.is_zero()).then(|| duration.as_secs_f64()),
            format: format_from_path(path),
            bitrate_kbps: properties.audio_bitrate(),
            sample_rate_hz: properties.sample_rate(),
            has_embedded_art,
        })
    }

    fn extract_embedded_art(&self, path: &Path) -> Option<EmbeddedArt> {
        let tagged_file = match read_tagged_file(path, false) {
            Ok(tagged_file) => tagged_file,
            Err(reason) => {
                debug!("Embedded art read failed for {}: {}", path.display(), reason);
                return None;
            }
        };
        let picture = preferred_picture(&tagged_file)?;
        if picture.data().is_empty() {
            return None;
        }
        let mime_type = picture
            .mime_type()
            .map(|mime| mime.as_str().to_string())
            .unwrap_or_else(|| DEFAULT_PICTURE_MIME.to_string());
        Some(EmbeddedArt {
            data: picture.data().to_vec(),
            mime_type,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{derive_year_from_date, leading_number, LoftyTagExtractor};
    use crate::metadata::TagExtractor;
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::time::{SystemTime, UNIX_EPOCH};

    fn unique_temp_mp3_path(name: &str) -> PathBuf {
        let nonce = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time should be valid")
            .as_nanos();
        std::env::temp_dir().join(format!("music_catalog_{name}_{nonce}.mp3"))
    }

    fn write_mp3_with_album_frame(path: &PathBuf) {
        let mut bytes = Vec::new();
        // ID3v2.3 header with payload size 0x23 (35 bytes)
        bytes.extend_from_slice(&[0x49, 0x44, 0x33, 0x03, 0x00, 0x00, 0x00, 0x00, 0x00, 0x23]);
        // TALB frame content (UTF-16LE "aaaaaaaaaaa")
        bytes.extend_from_slice(&[
            0x54, 0x41, 0x4C, 0x42, 0x00, 0x00, 0x00, 0x19, 0x00, 0x00, 0x01, 0xFF, 0xFE, 0x61,
            0x00, 0x61, 0x00, 0x61, 0x00, 0x61, 0x00, 0x61, 0x00, 0x61, 0x00, 0x61, 0x00, 0x61,
            0x00, 0x61, 0x00, 0x61, 0x00, 0x61, 0x00,
        ]);
        bytes.extend(std::iter::repeat_n(0x20, 2_048));
        // Start of an MPEG frame (minimal bytes, enough for tag reader context)
        bytes.extend_from_slice(&[
            0xFF, 0xFB, 0x50, 0xC4, 0x00, 0x03, 0xC0, 0x00, 0x01, 0xA4, 0x00, 0x00, 0x00, 0x20,
            0x00, 0x00, 0x34, 0x80, 0x00, 0x00, 0x04,
        ]);

        fs::write(path, bytes).expect("should write mp3 fixture");
    }

    #[test]
    fn test_derive_year_from_date_variants() {
        assert_eq!(derive_year_from_date("1998-10-31"), Some(1998));
        assert_eq!(derive_year_from_date("99"), None);
        assert_eq!(derive_year_from_date("released 2003-04-01"), Some(2003));
    }

    #[test]
    fn test_leading_number_handles_totals() {
        assert_eq!(leading_number("03/12"), Some(3));
        assert_eq!(leading_number(" 7 of 9"), Some(7));
        assert_eq!(leading_number("0"), None);
        assert_eq!(leading_number(""), None);
    }

    #[test]
    fn test_read_file_reads_album_from_id3_frame() {
        let path = unique_temp_mp3_path("album_frame");
        write_mp3_with_album_frame(&path);

        let tags = LoftyTagExtractor
            .read_file(path.as_path())
            .expect("tags should be readable with relaxed fallback parsing");
        assert_eq!(tags.album, "aaaaaaaaaaa");
        assert_eq!(tags.format, "mp3");
        assert!(!tags.has_embedded_art);
        assert!(LoftyTagExtractor.extract_embedded_art(path.as_path()).is_none());

        fs::remove_file(path).expect("fixture should be removable");
    }

    #[test]
    fn test_read_file_reports_unreadable_files() {
        let result = LoftyTagExtractor.read_file(Path::new("/definitely/missing/file.mp3"));
        assert!(result.is_err());
    }
}
