//! Storage backend trait and implementations.
//!
//! This module defines the `StorageBackend` trait, the byte-source/byte-sink
//! contract every tier satisfies (local directories, assets embedded in the
//! binary, packaged archives, the in-memory test double).

mod archive;
mod embedded;
mod local;
#[cfg(feature = "mock")]
mod mock;
mod ro;

pub use self::archive::ArchiveBackend;
pub use self::embedded::EmbeddedBackend;
pub use self::local::LocalBackend;
#[cfg(feature = "mock")]
pub use self::mock::MockBackend;
pub use self::ro::ReadOnlyBackend;
use crate::error::{ErrorKind, Result};
use crate::file::FileInfo;
use async_trait::async_trait;
use futures::{Stream, TryStreamExt};
use std::io::{Read, Write};
use std::ops::Deref;
use std::path::Path;
use std::pin::Pin;

pub type FileInfoStream<'a> = Pin<Box<dyn Stream<Item = Result<FileInfo>> + Send + 'a>>;
pub type BoxSyncRead = Box<dyn Read + Send + 'static>;
pub type BoxSyncWrite = Box<dyn Write + Send + 'static>;

/// Unified interface for storage backends.
///
/// All storage operations are asynchronous so that a tier backed by a slow
/// disk or a remote mirror never blocks the caller's runtime. Streaming
/// readers and writers are plain [`std::io`] objects, meant to be moved into
/// [`spawn_blocking`](tokio::task::spawn_blocking) for hashing copies.
///
/// # Path Handling
/// All paths are relative to the storage root and must be validated using
/// [`validate_path`](crate::validate_path) before use. Implementations should
/// enforce this validation.
///
/// # Examples
///
/// ```
/// use std::path::Path;
/// use vlt_storage::{backend::StorageBackend, error::Result};
///
/// async fn size_or_zero(backend: &dyn StorageBackend) -> Result<u64> {
///     let path = Path::new("textures/stone.png.vlt");
///     if backend.exists(path).await? {
///         Ok(backend.stat(path).await?.size)
///     } else {
///         Ok(0)
///     }
/// }
/// ```
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Name of the backend, used for logging only.
    fn name(&self) -> &str;

    /// List all files matching an optional prefix.
    ///
    /// Default implementation collects [`list_stream()`](Self::list_stream)
    /// into a [`Vec`].
    async fn list(&self, prefix: Option<&Path>) -> Result<Vec<FileInfo>> {
        self.list_stream(prefix).try_collect().await
    }

    /// Stream file metadata matching an optional prefix.
    ///
    /// Prefix matching is component based: `textures/ui` matches
    /// `textures/ui/button.png` but not `textures/uix/button.png`. Asking
    /// for a prefix that doesn't exist yields an empty stream, not an error.
    fn list_stream<'a>(&'a self, prefix: Option<&'a Path>) -> FileInfoStream<'a>;

    /// Check if a file exists.
    async fn exists(&self, path: &Path) -> Result<bool>;

    /// Read file contents.
    ///
    /// Returns [`NotFound`](crate::error::ErrorKind::NotFound) if the file
    /// does not exist.
    async fn read(&self, path: &Path) -> Result<Vec<u8>>;

    /// Open a file for streaming reads.
    ///
    /// Returns a `'static` boxed [`Read`] suitable for use inside
    /// [`spawn_blocking`](tokio::task::spawn_blocking). The async setup
    /// (opening the file) happens before returning.
    async fn reader(&self, path: &Path) -> Result<BoxSyncRead>;

    /// Write file contents, creating parent directories as needed and
    /// overwriting any existing file.
    async fn write(&self, path: &Path, data: &[u8]) -> Result<()>;

    /// Open a file for streaming writes.
    ///
    /// # Notes
    /// - Implementations should create parent directories as needed.
    /// - Callers should call `flush()` before dropping so that errors are
    ///   observed. Buffering backends only commit data on `flush()`.
    async fn writer(&self, path: &Path) -> Result<BoxSyncWrite>;

    /// Append to a file, creating it if it does not exist.
    ///
    /// The default implementation rewrites the whole file; backends with a
    /// native append should override it.
    async fn append(&self, path: &Path, data: &[u8]) -> Result<()> {
        let mut existing = match self.read(path).await {
            Ok(existing) => existing,
            Err(e) if e.is_not_found() => Vec::new(),
            Err(e) => return Err(e),
        };
        existing.extend_from_slice(data);
        self.write(path, &existing).await
    }

    /// Delete a file.
    ///
    /// Returns [`NotFound`](crate::error::ErrorKind::NotFound) if the file
    /// does not exist.
    async fn delete(&self, path: &Path) -> Result<()>;

    /// Rename/move a file within the same backend, overwriting the
    /// destination. Local backends do this atomically.
    async fn rename(&self, from: &Path, to: &Path) -> Result<()>;

    /// Get file metadata without reading contents.
    async fn stat(&self, path: &Path) -> Result<FileInfo>;

    /// Remove directories left empty (deepest first), never the root itself.
    /// Returns how many were removed. Backends without real directories
    /// have nothing to prune.
    async fn prune_empty_dirs(&self) -> Result<u64> {
        Ok(0)
    }
}

/// Delete a file, treating "already gone" as success.
pub async fn delete_if_exists(backend: &dyn StorageBackend, path: &Path) -> Result<bool> {
    match backend.delete(path).await {
        Ok(()) => Ok(true),
        Err(e) if matches!(e.deref(), ErrorKind::NotFound(_)) => Ok(false),
        Err(e) => Err(e),
    }
}
