//! Manifest Error Types

use derive_more::{Display, Error};
use std::io::Error as IoError;
use std::path::PathBuf;

/// A manifest error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for manifest operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// The directory to scan does not exist.
    #[display("scan root not found: {}", _0.display())]
    RootNotFound(#[error(not(source))] PathBuf),
    /// The scan root exists but is a file.
    #[display("scan root is not a directory: {}", _0.display())]
    NotADirectory(#[error(not(source))] PathBuf),
    /// A persisted manifest could not be parsed. Callers fall back to an
    /// older copy or a fresh scan.
    #[display("manifest is corrupt: {_0}")]
    Corrupt(#[error(not(source))] String),
    /// A record path is empty or escapes the tree root.
    #[display("invalid record path: {_0}")]
    InvalidPath(#[error(not(source))] String),
    #[display("storage operation failed")]
    Storage,
    #[display("I/O error while copying: {_0}")]
    Io(IoError),
    #[display("background hashing task failed")]
    Task,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}
