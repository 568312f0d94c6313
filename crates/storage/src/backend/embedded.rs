//! Assets compiled into the binary.
//!
//! The embedded tier is the last resort of every lookup: whatever a build
//! ships with via [`rust-embed`](rust_embed) is served from here, already in
//! its final form. It cannot be written to.

use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use async_stream::stream;
use async_trait::async_trait;
use rust_embed::RustEmbed;
use time::OffsetDateTime;

use crate::backend::{BoxSyncRead, BoxSyncWrite, FileInfoStream};
use crate::error::{ErrorKind, Result};
use crate::file::FileInfo;
use crate::path::validate as validate_path;
use crate::StorageBackend;

/// Read-only backend over a [`RustEmbed`] folder.
///
/// ```ignore
/// #[derive(rust_embed::RustEmbed)]
/// #[folder = "assets/"]
/// struct BuiltinAssets;
///
/// let tier = EmbeddedBackend::<BuiltinAssets>::new("embedded");
/// ```
pub struct EmbeddedBackend<E> {
    name: String,
    _assets: PhantomData<fn() -> E>,
}
impl<E: RustEmbed> EmbeddedBackend<E> {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), _assets: PhantomData }
    }

    /// Embedded names always use forward slashes.
    fn embedded_name(path: &Path) -> Result<String> {
        let validated = validate_path(path)?;
        let parts: Vec<_> = validated.components().map(|c| c.as_os_str().to_string_lossy().into_owned()).collect();
        Ok(parts.join("/"))
    }

    fn info(name: &str) -> Option<FileInfo> {
        let file = E::get(name)?;
        let modified = file
            .metadata
            .last_modified()
            .and_then(|secs| OffsetDateTime::from_unix_timestamp(secs as i64).ok())
            .unwrap_or(OffsetDateTime::UNIX_EPOCH);
        Some(FileInfo::new(PathBuf::from(name), file.data.len() as u64, modified))
    }

    fn read_only(&self) -> exn::Exn<ErrorKind> {
        exn::Exn::from(ErrorKind::ReadOnly(self.name.clone()))
    }
}

#[async_trait]
impl<E: RustEmbed + 'static> StorageBackend for EmbeddedBackend<E> {
    fn name(&self) -> &str {
        &self.name
    }

    fn list_stream<'a>(&'a self, prefix: Option<&'a Path>) -> FileInfoStream<'a> {
        let validated_prefix = match prefix.map(validate_path).transpose() {
            Ok(pfx) => pfx,
            Err(e) => return Box::pin(futures::stream::once(async { Err(e) })),
        };
        let names: Vec<_> = E::iter().collect();
        Box::pin(stream! {
            for name in names {
                if let Some(pfx) = &validated_prefix
                    && !Path::new(name.as_ref()).starts_with(pfx)
                {
                    continue;
                }
                if let Some(info) = Self::info(&name) {
                    yield Ok(info);
                }
            }
        })
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        Ok(E::get(&Self::embedded_name(path)?).is_some())
    }

    async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        let name = Self::embedded_name(path)?;
        let file = E::get(&name).ok_or_else(|| exn::Exn::from(ErrorKind::NotFound(path.to_path_buf())))?;
        Ok(file.data.into_owned())
    }

    async fn reader(&self, path: &Path) -> Result<BoxSyncRead> {
        Ok(Box::new(std::io::Cursor::new(self.read(path).await?)))
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
        let name = Self::embedded_name(path)?;
        Self::info(&name).ok_or_else(|| exn::Exn::from(ErrorKind::NotFound(path.to_path_buf())))
    }
}
