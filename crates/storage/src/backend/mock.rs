//! In-memory storage backend for testing.

use super::{BoxSyncRead, BoxSyncWrite, FileInfoStream};
use crate::error::{ErrorKind, Result};
use crate::file::FileInfo;
use crate::path::validate as validate_path;
use async_stream::stream;
use async_trait::async_trait;
use std::collections::HashMap;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use time::OffsetDateTime;

use crate::StorageBackend;

type Files = HashMap<PathBuf, (OffsetDateTime, Vec<u8>)>;

/// In-memory storage backend for testing.
///
/// Files are stored in a `HashMap` behind a [`RwLock`], so all trait methods
/// can operate on `&self` without external synchronisation. The lock is a
/// blocking one because streaming writers commit from synchronous
/// [`Write::flush`] calls; it is never held across an await point.
///
/// # Examples
///
/// ```
/// use vlt_storage::backend::{MockBackend, StorageBackend};
/// use std::path::Path;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = MockBackend::with_files([
///     ("textures/stone.png", b"not really a png"),
/// ]);
/// assert!(backend.exists(Path::new("textures/stone.png")).await?);
///
/// backend.write(Path::new("sounds/click.ogg"), b"data...").await?;
/// assert!(backend.exists(Path::new("sounds/click.ogg")).await?);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct MockBackend {
    name: String,
    storage: Arc<RwLock<Files>>,
}

impl MockBackend {
    /// Create a mock backend pre-populated with files.
    ///
    /// Panics if any path fails validation (e.g. path traversal). If test
    /// setup is wrong, then test should not pass.
    pub fn with_files(files: impl IntoIterator<Item = (impl Into<PathBuf>, impl Into<Vec<u8>>)>) -> Self {
        let mut map = HashMap::new();
        let now = OffsetDateTime::now_utc();
        for (path, data) in files {
            let path = path.into();
            let Ok(validated) = validate_path(&path) else {
                panic!("MockBackend::with_files: invalid path {}", path.display());
            };
            map.insert(validated, (now, data.into()));
        }
        Self {
            name: "mock".to_string(),
            storage: Arc::new(RwLock::new(map)),
        }
    }

    /// Change the name of the mock backend.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Every stored path, sorted. Handy for asserting on a whole tree.
    pub fn paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self.files().keys().cloned().collect();
        paths.sort();
        paths
    }

    fn files(&self) -> RwLockReadGuard<'_, Files> {
        self.storage.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn files_mut(&self) -> RwLockWriteGuard<'_, Files> {
        self.storage.write().unwrap_or_else(PoisonError::into_inner)
    }
}
impl Default for MockBackend {
    fn default() -> Self {
        let files: [(&str, &str); 0] = [];
        Self::with_files(files)
    }
}

/// Buffers writes and publishes them to the backing map on flush or drop.
struct MockWriter {
    storage: Arc<RwLock<Files>>,
    path: PathBuf,
    buffer: Vec<u8>,
}
impl MockWriter {
    fn commit(&mut self) {
        let mut files = self.storage.write().unwrap_or_else(PoisonError::into_inner);
        files.insert(self.path.clone(), (OffsetDateTime::now_utc(), self.buffer.clone()));
    }
}
impl Write for MockWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.commit();
        Ok(())
    }
}
impl Drop for MockWriter {
    fn drop(&mut self) {
        self.commit();
    }
}

#[async_trait]
impl StorageBackend for MockBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn list_stream<'a>(&'a self, prefix: Option<&'a Path>) -> FileInfoStream<'a> {
        let validated_prefix = match prefix.map(validate_path).transpose() {
            Ok(pfx) => pfx,
            Err(e) => return Box::pin(futures::stream::once(async { Err(e) })),
        };

        Box::pin(stream! {
            // Snapshot matching entries, then release the lock before yielding.
            let entries: Vec<FileInfo> = {
                self.files()
                    .iter()
                    .filter(|(path, _)| match &validated_prefix {
                        Some(pfx) => path.starts_with(pfx),
                        None => true,
                    })
                    .map(|(path, (modified, data))| FileInfo::new(path.clone(), data.len() as u64, *modified))
                    .collect()
            };
            for info in entries {
                yield Ok(info);
            }
        })
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        let path = validate_path(path)?;
        Ok(self.files().contains_key(&path))
    }

    async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        let path = validate_path(path)?;
        let data = self.files().get(&path).map(|(_, data)| data.clone());
        data.ok_or_else(|| exn::Exn::from(ErrorKind::NotFound(path)))
    }

    async fn reader(&self, path: &Path) -> Result<BoxSyncRead> {
        let data = self.read(path).await?;
        Ok(Box::new(Cursor::new(data)))
    }

    async fn write(&self, path: &Path, data: &[u8]) -> Result<()> {
        let path = validate_path(path)?;
        self.files_mut().insert(path, (OffsetDateTime::now_utc(), data.to_vec()));
        Ok(())
    }

    async fn writer(&self, path: &Path) -> Result<BoxSyncWrite> {
        let path = validate_path(path)?;
        Ok(Box::new(MockWriter {
            storage: Arc::clone(&self.storage),
            path,
            buffer: Vec::new(),
        }))
    }

    async fn append(&self, path: &Path, data: &[u8]) -> Result<()> {
        let path = validate_path(path)?;
        let mut files = self.files_mut();
        let entry = files.entry(path).or_insert_with(|| (OffsetDateTime::now_utc(), Vec::new()));
        entry.0 = OffsetDateTime::now_utc();
        entry.1.extend_from_slice(data);
        Ok(())
    }

    async fn delete(&self, path: &Path) -> Result<()> {
        let path = validate_path(path)?;
        let removed = self.files_mut().remove(&path);
        removed.map(|_| ()).ok_or_else(|| exn::Exn::from(ErrorKind::NotFound(path)))
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let from = validate_path(from)?;
        let to = validate_path(to)?;
        let mut files = self.files_mut();
        let data = files.remove(&from).ok_or_else(|| exn::Exn::from(ErrorKind::NotFound(from)))?;
        files.insert(to, data);
        Ok(())
    }

    async fn stat(&self, path: &Path) -> Result<FileInfo> {
        let path = validate_path(path)?;
        let found = self.files().get(&path).map(|(modified, data)| (*modified, data.len() as u64));
        let (modified, size) = found.ok_or_else(|| exn::Exn::from(ErrorKind::NotFound(path.clone())))?;
        Ok(FileInfo::new(path, size, modified))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[tokio::test]
    async fn test_write_and_read() {
        let backend = MockBackend::default();
        backend.write(Path::new("test.txt"), b"hello").await.unwrap();
        assert_eq!(backend.read(Path::new("test.txt")).await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_read_not_found() {
        let backend = MockBackend::default();
        let err = backend.read(Path::new("missing.txt")).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotFound(_)));
    }

    #[tokio::test]
    async fn test_writer_commits_on_flush() {
        let backend = MockBackend::default();
        let mut writer = backend.writer(Path::new("a/b.bin")).await.unwrap();
        writer.write_all(b"abc").unwrap();
        assert!(!backend.exists(Path::new("a/b.bin")).await.unwrap());
        writer.flush().unwrap();
        drop(writer);
        let mut reader = backend.reader(Path::new("a/b.bin")).await.unwrap();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"abc");
    }

    #[tokio::test]
    async fn test_append() {
        let backend = MockBackend::default();
        backend.append(Path::new("log"), b"a").await.unwrap();
        backend.append(Path::new("log"), b"b").await.unwrap();
        assert_eq!(backend.read(Path::new("log")).await.unwrap(), b"ab");
    }

    #[tokio::test]
    async fn test_delete_and_rename() {
        let backend = MockBackend::default();
        backend.write(Path::new("old.txt"), b"data").await.unwrap();
        backend.rename(Path::new("old.txt"), Path::new("new.txt")).await.unwrap();
        assert_eq!(backend.paths(), vec![PathBuf::from("new.txt")]);
        backend.delete(Path::new("new.txt")).await.unwrap();
        let err = backend.delete(Path::new("new.txt")).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotFound(_)));
        let err = backend.rename(Path::new("missing.txt"), Path::new("x.txt")).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotFound(_)));
    }

    #[tokio::test]
    async fn test_list_with_prefix() {
        let backend = MockBackend::with_files([
            ("mods/elves/bow.mdt", Vec::from(*b"a")),
            ("mods/elves/arrow.mdt", Vec::from(*b"b")),
            ("mods/dwarves/axe.mdt", Vec::from(*b"c")),
        ]);
        assert_eq!(backend.list(Some(Path::new("mods/elves"))).await.unwrap().len(), 2);
        assert_eq!(backend.list(None).await.unwrap().len(), 3);
        assert_eq!(backend.stat(Path::new("mods/dwarves/axe.mdt")).await.unwrap().size, 1);
    }

    #[test]
    #[should_panic(expected = "invalid path")]
    fn test_with_files_panics_on_bad_path() {
        MockBackend::with_files([("../escape", Vec::from(*b"bad"))]);
    }
}
