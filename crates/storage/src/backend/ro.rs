//! Read-only storage wrapper.
//!
//! Wraps another backend and turns every mutation into a logged no-op. Used
//! for trees that must never be written: sync sources, pull remotes and both
//! sides of a dry run.

use async_trait::async_trait;
use std::io::sink;
use std::path::Path;

use crate::backend::{BoxSyncRead, BoxSyncWrite};
use crate::{BackendHandle, StorageBackend, backend::FileInfoStream, error::Result, file::FileInfo};

/// Read-only storage backend.
///
/// Wraps another backend and silently drops all write operations, logging an
/// [`info event`](tracing::Event).
#[derive(Clone)]
pub struct ReadOnlyBackend {
    inner: BackendHandle,
}
impl ReadOnlyBackend {
    pub fn new(inner: BackendHandle) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl StorageBackend for ReadOnlyBackend {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn list_stream<'a>(&'a self, prefix: Option<&'a Path>) -> FileInfoStream<'a> {
        self.inner.list_stream(prefix)
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        self.inner.exists(path).await
    }

    async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        self.inner.read(path).await
    }

    async fn reader(&self, path: &Path) -> Result<BoxSyncRead> {
        self.inner.reader(path).await
    }

    async fn write(&self, path: &Path, data: &[u8]) -> Result<()> {
        tracing::info!(path = %path.display(), bytes = data.len(), "Skipping write during read-only mode");
        Ok(())
    }

    async fn writer(&self, path: &Path) -> Result<BoxSyncWrite> {
        tracing::info!(path = %path.display(), "Discarding streamed write during read-only mode");
        Ok(Box::new(sink()))
    }

    async fn append(&self, path: &Path, data: &[u8]) -> Result<()> {
        tracing::info!(path = %path.display(), bytes = data.len(), "Skipping append during read-only mode");
        Ok(())
    }

    async fn delete(&self, path: &Path) -> Result<()> {
        tracing::info!(path = %path.display(), "Skipping delete during read-only mode");
        Ok(())
    }

    async fn rename(&self, from: &Path, _to: &Path) -> Result<()> {
        tracing::info!(path = %from.display(), "Skipping rename/move during read-only mode");
        Ok(())
    }

    async fn stat(&self, path: &Path) -> Result<FileInfo> {
        self.inner.stat(path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LocalBackend;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_reads_pass_through_and_writes_are_dropped() {
        let temp_dir = tempfile::tempdir().unwrap();
        std::fs::write(temp_dir.path().join("kept.txt"), b"kept").unwrap();
        let inner = Arc::new(LocalBackend::new("tree", temp_dir.path()).unwrap());
        let backend = ReadOnlyBackend::new(inner);

        assert_eq!(backend.read(Path::new("kept.txt")).await.unwrap(), b"kept");
        backend.write(Path::new("new.txt"), b"new").await.unwrap();
        backend.append(Path::new("kept.txt"), b"more").await.unwrap();
        backend.rename(Path::new("kept.txt"), Path::new("moved.txt")).await.unwrap();
        backend.delete(Path::new("kept.txt")).await.unwrap();

        assert!(!temp_dir.path().join("new.txt").exists());
        assert!(!temp_dir.path().join("moved.txt").exists());
        assert_eq!(std::fs::read(temp_dir.path().join("kept.txt")).unwrap(), b"kept");
    }
}
