//! Error type shared by the catalog, scanner, observer, and library service.

use std::path::PathBuf;

use thiserror::Error;

/// Failures surfaced by library operations.
///
/// Only store failures during `init` are fatal. Everything per-file is caught
/// by the scanner and reported as a counted error or an `Error` change entry.
#[derive(Debug, Error)]
pub enum LibraryError {
    #[error("catalog store error: {0}")]
    Store(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("file watch error: {0}")]
    Watch(#[from] notify::Error),
    #[error("scan already in progress")]
    ScanInProgress,
    #[error("failed to read tags from {path}: {reason}")]
    TagRead { path: PathBuf, reason: String },
    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, LibraryError>;
