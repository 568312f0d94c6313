//! Packaged (`.tar.gz`) tiers.
//!
//! A packaged tier is loaded into memory once when it is opened; listings
//! and reads are served from that snapshot. Archives are immutable, so every
//! mutation is rejected.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_stream::stream;
use async_trait::async_trait;
use time::OffsetDateTime;

use crate::archive::unpack;
use crate::backend::{BoxSyncRead, BoxSyncWrite, FileInfoStream};
use crate::error::{ErrorKind, Result};
use crate::file::FileInfo;
use crate::path::validate as validate_path;
use crate::StorageBackend;

#[derive(Clone)]
pub struct ArchiveBackend {
    name: String,
    members: Arc<BTreeMap<PathBuf, (OffsetDateTime, Arc<[u8]>)>>,
}
impl ArchiveBackend {
    /// Load an archive from its raw bytes.
    pub fn from_bytes(name: impl Into<String>, bytes: &[u8]) -> Result<Self> {
        let members = unpack(bytes, None)?
            .into_iter()
            .map(|member| (member.path, (member.modified, Arc::from(member.data))))
            .collect();
        Ok(Self { name: name.into(), members: Arc::new(members) })
    }

    /// Load an archive from the local filesystem.
    #[tracing::instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub async fn open(name: impl Into<String>, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::NotFound(path.to_path_buf()),
            _ => ErrorKind::Io(e),
        })?;
        let name = name.into();
        let backend = tokio::task::spawn_blocking(move || Self::from_bytes(name, &bytes))
            .await
            .map_err(|e| ErrorKind::BackendError(format!("archive loader panicked: {e}")))??;
        tracing::debug!(members = backend.members.len(), "Loaded packaged tier");
        Ok(backend)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    fn member(&self, path: &Path) -> Result<(&OffsetDateTime, &Arc<[u8]>)> {
        let validated = validate_path(path)?;
        self.members
            .get(&validated)
            .map(|(modified, data)| (modified, data))
            .ok_or_else(|| exn::Exn::from(ErrorKind::NotFound(path.to_path_buf())))
    }

    fn read_only(&self) -> exn::Exn<ErrorKind> {
        exn::Exn::from(ErrorKind::ReadOnly(self.name.clone()))
    }
}

#[async_trait]
impl StorageBackend for ArchiveBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn list_stream<'a>(&'a self, prefix: Option<&'a Path>) -> FileInfoStream<'a> {
        let validated_prefix = match prefix.map(validate_path).transpose() {
            Ok(pfx) => pfx,
            Err(e) => return Box::pin(futures::stream::once(async { Err(e) })),
        };
        Box::pin(stream! {
            for (path, (modified, data)) in self.members.iter() {
                if let Some(pfx) = &validated_prefix
                    && !path.starts_with(pfx)
                {
                    continue;
                }
                yield Ok(FileInfo::new(path.clone(), data.len() as u64, *modified));
            }
        })
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        Ok(self.members.contains_key(&validate_path(path)?))
    }

    async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        Ok(self.member(path)?.1.to_vec())
    }

    async fn reader(&self, path: &Path) -> Result<BoxSyncRead> {
        let data = Arc::clone(self.member(path)?.1);
        Ok(Box::new(std::io::Cursor::new(data)))
    }

    async fn write(&self, _path: &Path, _data: &[u8]) -> Result<()> {
        Err(self.read_only())
    }

    async fn writer(&self, _path: &Path) -> Result<BoxSyncWrite> {
        Err(self.read_only())
    }

    async fn append(&self, _path: &Path, _data: &[u8]) -> Result<()> {
        Err(self.read_only())
    }

    async fn delete(&self, _path: &Path) -> Result<()> {
        Err(self.read_only())
    }

    async fn rename(&self, _from: &Path, _to: &Path) -> Result<()> {
        Err(self.read_only())
    }

    async fn stat(&self, path: &Path) -> Result<FileInfo> {
        let (modified, data) = self.member(path)?;
        Ok(FileInfo::new(validate_path(path)?, data.len() as u64, *modified))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::pack;
    use std::io::Read;

    fn backend() -> ArchiveBackend {
        let bytes = pack([("models/Bow.mdt", b"bow".to_vec()), ("textures/bow.png", b"png".to_vec())]).unwrap();
        ArchiveBackend::from_bytes("packs/elves", &bytes).unwrap()
    }

    #[tokio::test]
    async fn test_read_and_list() {
        let backend = backend();
        assert_eq!(backend.len(), 2);
        assert_eq!(backend.read(Path::new("models/Bow.mdt")).await.unwrap(), b"bow");
        assert_eq!(backend.list(Some(Path::new("textures"))).await.unwrap().len(), 1);
        let mut buf = Vec::new();
        backend.reader(Path::new("textures/bow.png")).await.unwrap().read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"png");
    }

    #[tokio::test]
    async fn test_open_from_disk() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("elves.tar.gz");
        std::fs::write(&path, pack([("a.txt", b"a".to_vec())]).unwrap()).unwrap();
        let backend = ArchiveBackend::open("elves", &path).await.unwrap();
        assert!(backend.exists(Path::new("a.txt")).await.unwrap());
        let err = ArchiveBackend::open("missing", temp_dir.path().join("nope.tar.gz")).await.err().unwrap();
        assert!(matches!(&*err, ErrorKind::NotFound(_)));
    }

    #[tokio::test]
    async fn test_archives_are_read_only() {
        let backend = backend();
        let err = backend.write(Path::new("x"), b"x").await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::ReadOnly(_)));
        let err = backend.read(Path::new("models/missing.mdt")).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotFound(_)));
    }
}
