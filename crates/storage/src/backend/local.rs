//! Local filesystem storage backend.
//!
//! This module provides a storage backend implementation for the local filesystem.
//! Files are stored in a configured directory and accessed using standard filesystem
//! operations via `tokio::fs` for async I/O.

use crate::backend::{BoxSyncRead, BoxSyncWrite, FileInfoStream};
use crate::error::ErrorKind;
use crate::{FileInfo, StorageBackend, error::Result, path::validate as validate_path};
use async_stream::stream;
use async_trait::async_trait;
use exn::ResultExt;
use std::fs::{Metadata, create_dir_all as sync_create_dir};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tokio::fs::{self, DirEntry, OpenOptions};
use tokio::io::AsyncWriteExt;

enum WalkEntry {
    File(FileInfo),
    Descend(PathBuf),
    Skip,
}

/// Local filesystem storage backend.
///
/// Stores files in a directory on the local filesystem. All paths are relative
/// to the configured root directory.
///
/// # Examples
///
/// ```no_run
/// use vlt_storage::backend::LocalBackend;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = LocalBackend::new("cache/base", "/var/cache/game/base")?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct LocalBackend {
    name: String,
    /// Root directory of the tier
    root: PathBuf,
}
impl LocalBackend {
    /// Create a new local filesystem backend, creating the root directory if
    /// it doesn't exist yet (cache tiers start out empty).
    ///
    /// # Errors
    ///
    /// Returns an error if the path is not absolute or exists but is not a
    /// directory.
    pub fn new(name: impl Into<String>, root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.is_absolute() {
            exn::bail!(ErrorKind::InvalidPath(root));
        }
        if root.exists() {
            if !root.is_dir() {
                exn::bail!(ErrorKind::NotADirectory(root));
            }
        } else {
            // Use non-async here; it'll only happen once on tier setup and
            // it's not worth the hassle of making the constructor async.
            sync_create_dir(&root).map_err(|e| Self::map_io_error(e, &root))?;
        }
        Ok(Self { name: name.into(), root })
    }

    /// Open a backend over a directory that must already exist. Used for
    /// trees that are scanned rather than written (design folders, sync
    /// sources).
    pub fn open_existing(name: impl Into<String>, root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.is_absolute() {
            exn::bail!(ErrorKind::InvalidPath(root));
        }
        let metadata = std::fs::metadata(&root).map_err(|e| Self::map_io_error(e, &root))?;
        if !metadata.is_dir() {
            exn::bail!(ErrorKind::NotADirectory(root));
        }
        Ok(Self { name: name.into(), root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Get the absolute path for a relative storage path.
    ///
    /// Validates the path and joins it with the root directory.
    fn absolute_path(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        let validated = validate_path(path.as_ref())?;
        Ok(self.root.join(validated))
    }

    /// Convert an absolute path back to a relative storage path.
    fn relative_path(&self, absolute: impl AsRef<Path>) -> Result<PathBuf> {
        let absolute = absolute.as_ref();
        if !absolute.is_absolute() {
            exn::bail!(ErrorKind::BackendError(format!(
                "attempting to get relative path of non-absolute path `{:?}`",
                absolute
            )))
        }
        let relative = absolute.strip_prefix(&self.root).or_raise(|| {
            ErrorKind::BackendError(format!("path `{:?}` is not within root `{:?}`", absolute, self.root))
        })?;
        validate_path(relative)
    }

    /// Re-use same data collection from file metadata for both list and stat functions
    fn metadata(path: &Path, metadata: Metadata) -> Result<FileInfo> {
        let modified = metadata.modified().map_err(ErrorKind::Io)?.into();
        Ok(FileInfo::new(PathBuf::from(path), metadata.len(), modified))
    }

    fn map_io_error(e: std::io::Error, path: &Path) -> ErrorKind {
        match e.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::NotFound(path.to_path_buf()),
            std::io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied(path.to_path_buf()),
            std::io::ErrorKind::NotADirectory => ErrorKind::NotADirectory(path.to_path_buf()),
            _ => ErrorKind::Io(e),
        }
    }

    async fn create_parent(&self, absolute: &Path, relative: &Path) -> Result<()> {
        if let Some(parent) = absolute.parent() {
            fs::create_dir_all(parent).await.map_err(|e| Self::map_io_error(e, relative))?;
        }
        Ok(())
    }

    /// Classify a single directory entry for the listing walk. Errors come
    /// back as values so the stream loop can yield them and carry on.
    async fn process_entry(&self, entry: DirEntry, prefix: Option<&Path>) -> Result<WalkEntry> {
        let path = entry.path();
        let metadata = entry.metadata().await.map_err(|e| Self::map_io_error(e, &path))?;
        let relative = self.relative_path(&path)?;
        if metadata.is_dir() {
            // Descend if the directory could contain prefixed entries.
            return match prefix {
                Some(pfx) if !(relative.starts_with(pfx) || pfx.starts_with(&relative)) => Ok(WalkEntry::Skip),
                _ => Ok(WalkEntry::Descend(path)),
            };
        }
        if let Some(pfx) = prefix
            && !relative.starts_with(pfx)
        {
            return Ok(WalkEntry::Skip);
        }
        if metadata.is_file() {
            return Ok(WalkEntry::File(Self::metadata(&relative, metadata)?));
        }
        // Note: silently drop what is most likely a broken symlink.
        Ok(WalkEntry::Skip)
    }

    /// Every directory below the root, deepest first.
    async fn directories_deepest_first(&self) -> Result<Vec<PathBuf>> {
        let mut found = Vec::new();
        let mut stack = vec![self.root.clone()];
        while let Some(current) = stack.pop() {
            let mut entries = match fs::read_dir(&current).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => exn::bail!(Self::map_io_error(err, &current)),
            };
            while let Some(entry) = entries.next_entry().await.map_err(|e| Self::map_io_error(e, &current))? {
                if entry.file_type().await.map_err(ErrorKind::Io)?.is_dir() {
                    let path = entry.path();
                    stack.push(path.clone());
                    found.push(path);
                }
            }
        }
        found.sort_by_key(|p| std::cmp::Reverse(p.components().count()));
        Ok(found)
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn list_stream<'a>(&'a self, prefix: Option<&'a Path>) -> FileInfoStream<'a> {
        let validated_prefix = match prefix.map(validate_path).transpose() {
            Ok(pfx) => pfx,
            Err(e) => return Box::pin(futures::stream::once(async { Result::Err(e) })),
        };
        let mut stack = vec![self.root.clone()];

        Box::pin(stream! {
            'dirs: while let Some(current) = stack.pop() {
                let mut entries = match fs::read_dir(&current).await {
                    Ok(entries) => entries,
                    // A directory that doesn't exist lists as empty.
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                    Err(err) => {
                        yield Err(exn::Exn::from(Self::map_io_error(err, &current)));
                        continue 'dirs;
                    }
                };

                'entries: loop {
                    let entry = match entries.next_entry().await {
                        Ok(Some(entry)) => entry,
                        Ok(None) => break 'entries,
                        Err(e) => { yield Err(exn::Exn::from(Self::map_io_error(e, &current))); continue 'entries; },
                    };
                    match self.process_entry(entry, validated_prefix.as_deref()).await {
                        Ok(WalkEntry::File(f)) => yield Ok(f),
                        Ok(WalkEntry::Descend(d)) => stack.push(d),
                        Ok(WalkEntry::Skip) => {},
                        Err(e) => yield Err(e),
                    };
                }
            }
        })
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        let abs_path = self.absolute_path(path)?;
        Ok(fs::try_exists(&abs_path).await.map_err(ErrorKind::Io)?)
    }

    async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        let abs_path = self.absolute_path(path)?;
        Ok(fs::read(&abs_path).await.map_err(|e| Self::map_io_error(e, path))?)
    }

    async fn reader(&self, path: &Path) -> Result<BoxSyncRead> {
        let abs_path = self.absolute_path(path)?;
        let file = fs::File::open(&abs_path).await.map_err(|e| Self::map_io_error(e, path))?;
        Ok(Box::new(file.into_std().await))
    }

    async fn write(&self, path: &Path, data: &[u8]) -> Result<()> {
        let abs_path = self.absolute_path(path)?;
        self.create_parent(&abs_path, path).await?;
        Ok(fs::write(&abs_path, data).await.map_err(|e| Self::map_io_error(e, path))?)
    }

    async fn writer(&self, path: &Path) -> Result<BoxSyncWrite> {
        let abs_path = self.absolute_path(path)?;
        self.create_parent(&abs_path, path).await?;
        let file = fs::File::create(&abs_path).await.map_err(|e| Self::map_io_error(e, path))?;
        Ok(Box::new(BufWriter::new(file.into_std().await)))
    }

    async fn append(&self, path: &Path, data: &[u8]) -> Result<()> {
        let abs_path = self.absolute_path(path)?;
        self.create_parent(&abs_path, path).await?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&abs_path)
            .await
            .map_err(|e| Self::map_io_error(e, path))?;
        file.write_all(data).await.map_err(ErrorKind::Io)?;
        // Journals are appended to precisely so they survive a crash.
        file.sync_data().await.map_err(ErrorKind::Io)?;
        Ok(())
    }

    async fn delete(&self, path: &Path) -> Result<()> {
        let abs_path = self.absolute_path(path)?;
        Ok(fs::remove_file(&abs_path).await.map_err(|e| Self::map_io_error(e, path))?)
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let from_path = self.absolute_path(from)?;
        let to_path = self.absolute_path(to)?;
        self.create_parent(&to_path, to).await?;
        Ok(fs::rename(&from_path, &to_path).await.map_err(|e| Self::map_io_error(e, from))?)
    }

    async fn stat(&self, path: &Path) -> Result<FileInfo> {
        let abs_path = self.absolute_path(path)?;
        let metadata = fs::metadata(&abs_path).await.map_err(|e| Self::map_io_error(e, path))?;
        if !metadata.is_file() {
            exn::bail!(ErrorKind::NotFound(path.to_path_buf()));
        }
        Self::metadata(path, metadata)
    }

    async fn prune_empty_dirs(&self) -> Result<u64> {
        let mut removed = 0;
        for dir in self.directories_deepest_first().await? {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => exn::bail!(Self::map_io_error(err, &dir)),
            };
            if entries.next_entry().await.map_err(ErrorKind::Io)?.is_some() {
                continue;
            }
            fs::remove_dir(&dir).await.map_err(|e| Self::map_io_error(e, &dir))?;
            tracing::debug!(backend = %self.name, dir = %dir.display(), "Removed empty directory");
            removed += 1;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use crate::error::ErrorKind;
    use std::io::{Read, Write};

    use super::*;

    fn backend(temp_dir: &tempfile::TempDir) -> LocalBackend {
        LocalBackend::new("name", temp_dir.path()).unwrap()
    }

    #[test]
    fn test_new_requires_absolute_path() {
        let temp_dir = tempfile::tempdir().unwrap();
        assert!(LocalBackend::new("name", temp_dir.path()).is_ok());
        assert!(LocalBackend::new("name", "relative/path").is_err());
        assert!(LocalBackend::new("name", "./relative").is_err());
    }

    #[test]
    fn test_open_existing_rejects_missing_and_files() {
        let temp_dir = tempfile::tempdir().unwrap();
        let missing = temp_dir.path().join("missing");
        let err = LocalBackend::open_existing("name", &missing).err().unwrap();
        assert!(matches!(&*err, ErrorKind::NotFound(_)));
        assert!(!missing.exists(), "open_existing must not create the root");

        let file = temp_dir.path().join("file.txt");
        std::fs::write(&file, b"x").unwrap();
        let err = LocalBackend::open_existing("name", &file).err().unwrap();
        assert!(matches!(&*err, ErrorKind::NotADirectory(_)));
    }

    #[test]
    fn test_absolute_and_relative_path() {
        let temp_dir = tempfile::tempdir().unwrap();
        let backend = backend(&temp_dir);
        let expected = temp_dir.path().join("textures/stone.png");
        assert_eq!(backend.absolute_path(Path::new("textures/stone.png")).unwrap(), expected);
        assert!(backend.absolute_path(Path::new("../etc/passwd")).is_err());
        assert_eq!(backend.relative_path(&expected).unwrap(), Path::new("textures/stone.png"));
        assert!(backend.relative_path(PathBuf::from("/other/file.png")).is_err());
    }

    #[tokio::test]
    async fn test_write_and_read() {
        let temp_dir = tempfile::tempdir().unwrap();
        let backend = backend(&temp_dir);
        backend.write(Path::new("a/b/c/file.txt"), b"Hello, world!").await.unwrap();
        assert_eq!(backend.read(Path::new("a/b/c/file.txt")).await.unwrap(), b"Hello, world!");
    }

    #[tokio::test]
    async fn test_streaming_reader_and_writer() {
        let temp_dir = tempfile::tempdir().unwrap();
        let backend = backend(&temp_dir);
        let mut writer = backend.writer(Path::new("deep/dir/stream.bin")).await.unwrap();
        tokio::task::spawn_blocking(move || {
            writer.write_all(b"streamed bytes").unwrap();
            writer.flush().unwrap();
        })
        .await
        .unwrap();
        let mut reader = backend.reader(Path::new("deep/dir/stream.bin")).await.unwrap();
        let content = tokio::task::spawn_blocking(move || {
            let mut buf = Vec::new();
            reader.read_to_end(&mut buf).unwrap();
            buf
        })
        .await
        .unwrap();
        assert_eq!(content, b"streamed bytes");
    }

    #[tokio::test]
    async fn test_append_creates_and_extends() {
        let temp_dir = tempfile::tempdir().unwrap();
        let backend = backend(&temp_dir);
        backend.append(Path::new(".vlt/log"), b"one\n").await.unwrap();
        backend.append(Path::new(".vlt/log"), b"two\n").await.unwrap();
        assert_eq!(backend.read(Path::new(".vlt/log")).await.unwrap(), b"one\ntwo\n");
    }

    #[tokio::test]
    async fn test_delete_and_rename() {
        let temp_dir = tempfile::tempdir().unwrap();
        let backend = backend(&temp_dir);
        backend.write(Path::new("old.txt"), b"data").await.unwrap();
        backend.rename(Path::new("old.txt"), Path::new("x/y/new.txt")).await.unwrap();
        assert!(!backend.exists(Path::new("old.txt")).await.unwrap());
        assert_eq!(backend.read(Path::new("x/y/new.txt")).await.unwrap(), b"data");
        backend.delete(Path::new("x/y/new.txt")).await.unwrap();
        let err = backend.delete(Path::new("x/y/new.txt")).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotFound(_)));
    }

    #[tokio::test]
    async fn test_stat() {
        let temp_dir = tempfile::tempdir().unwrap();
        let backend = backend(&temp_dir);
        backend.write(Path::new("file.txt"), b"Hello, world!").await.unwrap();
        let info = backend.stat(Path::new("file.txt")).await.unwrap();
        assert_eq!(info.path, PathBuf::from("file.txt"));
        assert_eq!(info.size, 13);
    }

    #[tokio::test]
    async fn test_list_with_prefix() {
        let temp_dir = tempfile::tempdir().unwrap();
        let backend = backend(&temp_dir);
        backend.write(Path::new("textures/ui/button.png"), b"a").await.unwrap();
        backend.write(Path::new("textures/uix/button.png"), b"b").await.unwrap();
        backend.write(Path::new("textures/stone.png"), b"c").await.unwrap();
        assert_eq!(backend.list(None).await.unwrap().len(), 3);
        let mut files = backend.list(Some(Path::new("textures/ui"))).await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files.pop().unwrap().path, Path::new("textures/ui/button.png"));
        assert!(backend.list(Some(Path::new("nonexistent/"))).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_prune_empty_dirs() {
        let temp_dir = tempfile::tempdir().unwrap();
        let backend = backend(&temp_dir);
        backend.write(Path::new("keep/file.txt"), b"data").await.unwrap();
        backend.write(Path::new("gone/deeper/file.txt"), b"data").await.unwrap();
        backend.delete(Path::new("gone/deeper/file.txt")).await.unwrap();
        assert_eq!(backend.prune_empty_dirs().await.unwrap(), 2);
        assert!(!temp_dir.path().join("gone").exists());
        assert!(temp_dir.path().join("keep").exists());
        assert!(temp_dir.path().exists());
    }

    #[tokio::test]
    async fn test_path_security() {
        let temp_dir = tempfile::tempdir().unwrap();
        let backend = backend(&temp_dir);
        assert!(backend.read(Path::new("../etc/passwd")).await.is_err());
        assert!(backend.read(Path::new("etc/../../passwd")).await.is_err());
        assert!(backend.write(Path::new("../etc/passwd"), b"data").await.is_err());
        assert!(backend.delete(Path::new("../../file")).await.is_err());
    }
}
