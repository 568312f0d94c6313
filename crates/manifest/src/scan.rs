//! Building a manifest from what is actually on a tier.

use std::path::Path;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use vlt_storage::backend::LocalBackend;
use vlt_storage::error::ErrorKind as StorageErrorKind;
use vlt_storage::{STAGING_SUFFIX, StorageBackend};

use crate::copy::{DEFAULT_CHUNK_SIZE, copy_between};
use crate::error::{ErrorKind, Result};
use crate::index::RecordIndex;
use crate::record::{Record, normalize_path};

#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Relative path prefixes to leave out (e.g. the manifest directory).
    /// Matched case-insensitively on whole path components.
    pub exclude: Vec<String>,
    pub chunk_size: usize,
}
impl Default for ScanOptions {
    fn default() -> Self {
        Self { exclude: Vec::new(), chunk_size: DEFAULT_CHUNK_SIZE }
    }
}
impl ScanOptions {
    pub fn excluding(mut self, prefix: impl Into<String>) -> Self {
        self.exclude.push(prefix.into());
        self
    }

    fn is_excluded(&self, key: &str) -> bool {
        if key.ends_with(STAGING_SUFFIX) {
            return true;
        }
        self.exclude.iter().any(|prefix| {
            let prefix = prefix.trim_matches('/').to_lowercase();
            key == prefix || key.strip_prefix(&prefix).is_some_and(|rest| rest.starts_with('/'))
        })
    }
}

/// Hash every file under a local directory.
///
/// Fails if `root` is missing or not a directory. Returns `Ok(None)` if the
/// scan was cancelled.
pub async fn scan_directory(
    root: &Path,
    options: &ScanOptions,
    cancel: &CancellationToken,
) -> Result<Option<RecordIndex>> {
    let backend = LocalBackend::open_existing(root.display().to_string(), root).map_err(|e| match &*e {
        StorageErrorKind::NotADirectory(p) => ErrorKind::NotADirectory(p.clone()),
        _ => ErrorKind::RootNotFound(root.to_path_buf()),
    })?;
    scan_backend(&backend, options, cancel).await
}

/// Hash every file on a tier.
///
/// A file that can't be listed or read is logged and left out.
#[tracing::instrument(skip_all, fields(backend = backend.name()))]
pub async fn scan_backend(
    backend: &dyn StorageBackend,
    options: &ScanOptions,
    cancel: &CancellationToken,
) -> Result<Option<RecordIndex>> {
    let mut index = RecordIndex::new(backend.name());
    let mut files = backend.list_stream(None);
    let mut skipped = 0usize;
    while let Some(file) = files.next().await {
        if cancel.is_cancelled() {
            tracing::info!(records = index.len(), "Scan cancelled");
            return Ok(None);
        }
        let file = match file {
            Ok(file) => file,
            Err(e) => {
                tracing::warn!(error = ?e, "Skipping unlistable entry");
                skipped += 1;
                continue;
            },
        };
        let relative = match normalize_path(&file.path) {
            Ok(relative) => relative,
            Err(e) => {
                tracing::warn!(path = %file.path.display(), error = ?e, "Skipping file with unusable path");
                skipped += 1;
                continue;
            },
        };
        if options.is_excluded(&relative.to_lowercase()) {
            continue;
        }
        let copied = match copy_between(backend, &file.path, None, cancel, options.chunk_size, |_| {}).await {
            Ok(Some(copied)) => copied,
            Ok(None) => return Ok(None),
            Err(e) => {
                tracing::warn!(path = %file.path.display(), error = ?e, "Skipping unreadable file");
                skipped += 1;
                continue;
            },
        };
        let record = Record::new(&relative, copied.hash, copied.bytes, file.modified)?;
        if let Some(previous) = index.insert(record) {
            tracing::warn!(path = %relative, other = %previous.path, "Paths differ only by case; keeping the last one");
        }
    }
    tracing::info!(records = index.len(), skipped, "Scan complete");
    Ok(Some(index))
}
