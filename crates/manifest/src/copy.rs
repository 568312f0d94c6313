//! Hashing copies.
//!
//! Every byte that moves between tiers passes through [`copy_with_md5`], so
//! a transfer and its fingerprint are computed in one pass.

use std::io::{Read, Write};
use std::path::Path;

use exn::ResultExt;
use tokio_util::sync::CancellationToken;
use vlt_storage::StorageBackend;

use crate::error::{ErrorKind, Result};
use crate::fingerprint::Fingerprint;

pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Outcome of a completed hashing copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Copied {
    pub hash: Fingerprint,
    pub bytes: u64,
}

/// Stream `reader` into `writer` (if any) in `chunk_size` pieces, hashing as
/// it goes.
///
/// The cancellation token is checked before every chunk; a cancelled copy
/// returns `Ok(None)`. `progress` receives the size of each chunk written.
/// Both ends are dropped on every exit path. A failing final flush is logged
/// rather than returned, so callers that need the bytes on disk must check
/// the result themselves (e.g. by comparing sizes).
///
/// This is blocking; run it on [`spawn_blocking`](tokio::task::spawn_blocking)
/// or use [`copy_between`].
pub fn copy_with_md5<R: Read, W: Write>(
    mut reader: R,
    mut writer: Option<W>,
    cancel: &CancellationToken,
    chunk_size: usize,
    mut progress: impl FnMut(u64),
) -> Result<Option<Copied>> {
    let mut context = md5::Context::new();
    let mut buffer = vec![0u8; chunk_size.max(1)];
    let mut bytes = 0u64;
    loop {
        if cancel.is_cancelled() {
            return Ok(None);
        }
        let read = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(read) => read,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => exn::bail!(ErrorKind::Io(e)),
        };
        let chunk = &buffer[..read];
        context.consume(chunk);
        if let Some(writer) = writer.as_mut() {
            writer.write_all(chunk).map_err(ErrorKind::Io)?;
        }
        bytes += read as u64;
        progress(read as u64);
        std::thread::yield_now();
    }
    if let Some(mut writer) = writer
        && let Err(e) = writer.flush()
    {
        tracing::warn!(error = %e, "Could not flush destination after copy");
    }
    Ok(Some(Copied { hash: context.compute().into(), bytes }))
}

/// Hash a file on a tier, optionally copying it to `dest` at the same time.
///
/// The blocking copy runs on the blocking pool; the async setup (opening
/// both ends) happens here first.
pub async fn copy_between(
    source: &dyn StorageBackend,
    source_path: &Path,
    dest: Option<(&dyn StorageBackend, &Path)>,
    cancel: &CancellationToken,
    chunk_size: usize,
    progress: impl FnMut(u64) + Send + 'static,
) -> Result<Option<Copied>> {
    let reader = source.reader(source_path).await.or_raise(|| ErrorKind::Storage)?;
    let writer = match dest {
        Some((backend, path)) => Some(backend.writer(path).await.or_raise(|| ErrorKind::Storage)?),
        None => None,
    };
    let cancel = cancel.clone();
    tokio::task::spawn_blocking(move || copy_with_md5(reader, writer, &cancel, chunk_size, progress))
        .await
        .or_raise(|| ErrorKind::Task)?
}
