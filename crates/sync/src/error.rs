//! Sync Error Types

use derive_more::{Display, Error};
use vlt_manifest::Fingerprint;

/// A sync error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for sync operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// The bytes that arrived are not the bytes the manifest promised.
    /// Never retried.
    #[display("checksum mismatch for `{path}`: expected {expected}, got {actual}")]
    ChecksumMismatch { path: String, expected: Fingerprint, actual: Fingerprint },
    /// No usable manifest could be loaded, nor one rebuilt by scanning.
    #[display("manifest is corrupt: {_0}")]
    ManifestCorrupt(#[error(not(source))] String),
    /// The remote side has no patch index to pull from.
    #[display("remote index `{_0}` not found")]
    MissingIndex(#[error(not(source))] String),
    /// A record needed from a patch archive names no archive.
    #[display("record `{_0}` has no archive reference")]
    MissingArchiveRef(#[error(not(source))] String),
    /// A patch archive did not contain a member it should have.
    #[display("archive `{archive}` is missing `{member}`")]
    Extraction { archive: String, member: String },
    /// Reading, writing or renaming a file failed.
    #[display("storage operation on `{_0}` failed")]
    Storage(#[error(not(source))] String),
    #[display("manifest operation failed")]
    Manifest,
    /// A setup or teardown hook failed.
    #[display("update hook `{_0}` failed")]
    Hook(#[error(not(source))] &'static str),
    #[display("background task failed")]
    Task,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage(_))
    }
}
