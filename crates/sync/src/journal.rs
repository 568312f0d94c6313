//! Durable manifest storage for a synced tree.
//!
//! Three files live in the tree's manifest directory:
//!
//! - `manifest`: the manifest as of the last completed run;
//! - `manifest.bak`: the manifest a running pass started from;
//! - `manifest.patch`: an append-only log of what the pass has done since.
//!
//! A pass moves `manifest` to `manifest.bak` before touching any file, logs
//! `begin <record>` before and `done <path>` after every copy (`drop <path>`
//! for removals), and on success writes a new `manifest` and deletes the
//! other two. Whatever point a run dies at, one of the loading fallbacks
//! gives a manifest that matches the tree.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use exn::ResultExt;
use tokio_util::sync::CancellationToken;
use vlt_manifest::format::{self, ManifestFormat, decode_record, encode_record};
use vlt_manifest::{Record, RecordIndex, ScanOptions, scan_backend};
use vlt_storage::backend::delete_if_exists;
use vlt_storage::BackendHandle;

use crate::error::{ErrorKind, Result};

pub const MANIFEST_FILE: &str = "manifest";
pub const BACKUP_FILE: &str = "manifest.bak";
pub const PATCH_LOG_FILE: &str = "manifest.patch";

const BEGIN: &str = "begin";
const DONE: &str = "done";
const DROP: &str = "drop";

/// Which fallback produced a loaded manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadSource {
    Primary,
    Backup,
    /// Backup with the patch log replayed on top.
    Patched,
    /// Rebuilt by hashing the tree.
    Scanned,
}

#[derive(Debug, Clone)]
pub struct Loaded {
    pub index: RecordIndex,
    pub source: LoadSource,
    /// Copies that were begun but never finished. Their files are in an
    /// unknown state and are not part of `index`.
    pub in_flight: Vec<Record>,
}

/// One journal line.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Entry {
    Begin(Record),
    Done(String),
    Drop(String),
}

impl Entry {
    fn encode(&self) -> String {
        match self {
            Self::Begin(record) => format!("{BEGIN} {}", encode_record(record)),
            Self::Done(path) => format!("{DONE} {path}"),
            Self::Drop(path) => format!("{DROP} {path}"),
        }
    }

    fn decode(line: &str) -> Option<Self> {
        let (tag, rest) = line.split_once(' ')?;
        match tag {
            BEGIN => decode_record(rest).ok().map(Self::Begin),
            DONE if !rest.is_empty() => Some(Self::Done(rest.to_string())),
            DROP if !rest.is_empty() => Some(Self::Drop(rest.to_string())),
            _ => None,
        }
    }
}

/// The manifest files of one tree.
pub struct ManifestStore {
    backend: BackendHandle,
    dir: PathBuf,
    /// Lines written to the patch log during this pass.
    log: Vec<Entry>,
}

impl ManifestStore {
    pub fn new(backend: BackendHandle, dir: impl Into<PathBuf>) -> Self {
        Self { backend, dir: dir.into(), log: Vec::new() }
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.dir.join(MANIFEST_FILE)
    }

    pub fn backup_path(&self) -> PathBuf {
        self.dir.join(BACKUP_FILE)
    }

    pub fn patch_log_path(&self) -> PathBuf {
        self.dir.join(PATCH_LOG_FILE)
    }

    fn storage_error(path: &Path) -> impl FnOnce() -> ErrorKind {
        let path = path.display().to_string();
        move || ErrorKind::Storage(path)
    }

    async fn read_manifest(&self, path: &Path) -> Option<RecordIndex> {
        match format::load(self.backend.as_ref(), path, ManifestFormat::Lines).await {
            Ok(index) => index,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = ?e, "Unreadable manifest");
                None
            },
        }
    }

    /// Load the tree's manifest, falling back from the primary to the backup
    /// (with the patch log replayed when there is one) to a scan of the tree.
    ///
    /// Returns `Ok(None)` if a fallback scan was cancelled.
    #[tracing::instrument(skip_all, fields(backend = self.backend.name()))]
    pub async fn load(&self, options: &ScanOptions, cancel: &CancellationToken) -> Result<Option<Loaded>> {
        let log_path = self.patch_log_path();
        if let Some(index) = self.read_manifest(&self.manifest_path()).await {
            if delete_if_exists(self.backend.as_ref(), &log_path).await.unwrap_or(false) {
                tracing::info!("Discarded stale patch log");
            }
            return Ok(Some(Loaded { index, source: LoadSource::Primary, in_flight: Vec::new() }));
        }
        if let Some(mut index) = self.read_manifest(&self.backup_path()).await {
            let log = match self.backend.read(&log_path).await {
                Ok(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
                Err(e) if e.is_not_found() => None,
                Err(e) => {
                    tracing::warn!(error = ?e, "Unreadable patch log; using the backup alone");
                    None
                },
            };
            let Some(log) = log else {
                tracing::info!("Recovered manifest from backup");
                return Ok(Some(Loaded { index, source: LoadSource::Backup, in_flight: Vec::new() }));
            };
            let in_flight = replay(&mut index, &log);
            tracing::info!(in_flight = in_flight.len(), "Recovered manifest from backup and patch log");
            return Ok(Some(Loaded { index, source: LoadSource::Patched, in_flight }));
        }
        tracing::info!("No usable manifest; scanning the tree");
        let scanned = scan_backend(self.backend.as_ref(), options, cancel).await.or_raise(|| {
            ErrorKind::ManifestCorrupt(format!("could not rebuild manifest of `{}`", self.backend.name()))
        })?;
        Ok(scanned.map(|index| Loaded { index, source: LoadSource::Scanned, in_flight: Vec::new() }))
    }

    /// Set up for a pass that starts from `index`: move the primary aside
    /// as the backup (or write the backup from memory when the manifest did
    /// not come from the primary) and start an empty patch log.
    pub async fn prepare(&mut self, index: &RecordIndex, source: LoadSource) -> Result<()> {
        let backup = self.backup_path();
        match source {
            LoadSource::Primary => {
                self.backend
                    .rename(&self.manifest_path(), &backup)
                    .await
                    .or_raise(Self::storage_error(&backup))?;
            },
            _ => {
                format::save(self.backend.as_ref(), &backup, index, ManifestFormat::Lines)
                    .await
                    .or_raise(|| ErrorKind::Manifest)?;
            },
        }
        let log_path = self.patch_log_path();
        self.backend.write(&log_path, b"").await.or_raise(Self::storage_error(&log_path))?;
        self.log.clear();
        Ok(())
    }

    async fn append(&mut self, entry: Entry) -> Result<()> {
        let log_path = self.patch_log_path();
        let line = format!("{}\n", entry.encode());
        self.backend.append(&log_path, line.as_bytes()).await.or_raise(Self::storage_error(&log_path))?;
        self.log.push(entry);
        Ok(())
    }

    pub async fn begin(&mut self, record: &Record) -> Result<()> {
        self.append(Entry::Begin(record.clone())).await
    }

    pub async fn done(&mut self, path: &str) -> Result<()> {
        self.append(Entry::Done(path.to_string())).await
    }

    pub async fn drop_file(&mut self, path: &str) -> Result<()> {
        self.append(Entry::Drop(path.to_string())).await
    }

    /// Take back the `begin` of a copy that failed cleanly, leaving the
    /// file as the backup describes it.
    pub async fn abandon(&mut self, path: &str) -> Result<()> {
        let key = path.to_lowercase();
        let Some(position) =
            self.log.iter().rposition(|entry| matches!(entry, Entry::Begin(record) if record.key() == key))
        else {
            return Ok(());
        };
        self.log.remove(position);
        let text: String = self.log.iter().map(|entry| format!("{}\n", entry.encode())).collect();
        let log_path = self.patch_log_path();
        let staging = vlt_storage::staging_path(&log_path);
        self.backend.write(&staging, text.as_bytes()).await.or_raise(Self::storage_error(&staging))?;
        self.backend.rename(&staging, &log_path).await.or_raise(Self::storage_error(&log_path))?;
        Ok(())
    }

    /// Persist `index` as the primary and drop the backup and patch log.
    pub async fn commit(&mut self, index: &RecordIndex) -> Result<()> {
        format::save(self.backend.as_ref(), &self.manifest_path(), index, ManifestFormat::Lines)
            .await
            .or_raise(|| ErrorKind::Manifest)?;
        for path in [self.patch_log_path(), self.backup_path()] {
            delete_if_exists(self.backend.as_ref(), &path).await.or_raise(Self::storage_error(&path))?;
        }
        self.log.clear();
        tracing::debug!(records = index.len(), "Committed manifest");
        Ok(())
    }
}

/// Apply a patch log to `index`, returning the copies that never finished.
/// Unparseable lines (a torn final write) are skipped.
fn replay(index: &mut RecordIndex, log: &str) -> Vec<Record> {
    let mut pending: BTreeMap<String, Record> = BTreeMap::new();
    for line in log.lines().filter(|line| !line.trim().is_empty()) {
        match Entry::decode(line) {
            Some(Entry::Begin(record)) => {
                index.remove(&record.path);
                pending.insert(record.key(), record);
            },
            Some(Entry::Done(path)) => match pending.remove(&path.to_lowercase()) {
                Some(record) => {
                    index.insert(record);
                },
                None => tracing::warn!(%path, "Patch log finishes a copy it never began"),
            },
            Some(Entry::Drop(path)) => {
                index.remove(&path);
                pending.remove(&path.to_lowercase());
            },
            None => tracing::warn!(%line, "Skipping unreadable patch log line"),
        }
    }
    pending.into_values().collect()
}
