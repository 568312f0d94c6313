//! Publishing and applying changes as patch archives.
//!
//! A remote holds a JSON index (`index.json`) and the archives it refers to
//! (`patches/patch-<unix-seconds>.tar.gz`). Each live index record names the
//! archive carrying its current content; removed files stay as tombstones.
//! Pulled archives are kept under the local manifest directory so they are
//! only ever downloaded once.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use exn::ResultExt;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use vlt_config::{PatchConfig, SyncConfig};
use vlt_manifest::format::{self, ManifestFormat};
use vlt_manifest::{Fingerprint, Record, RecordIndex, ScanOptions, find_difference, scan_backend};
use vlt_storage::archive::{self, ArchiveMember};
use vlt_storage::backend::delete_if_exists;
use vlt_storage::{BackendHandle, normalize_key, staging_path};

use crate::error::{ErrorKind, Result};
use crate::journal::{LoadSource, ManifestStore};

/// Local subdirectory (of the manifest directory) caching pulled archives.
pub const ARCHIVE_CACHE_DIR: &str = "patches";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushReport {
    /// Name of the uploaded archive, if anything needed packaging.
    pub archive: Option<String>,
    pub packaged: usize,
    pub removed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullReport {
    pub downloaded: usize,
    /// Archives already in the local cache.
    pub reused: usize,
    pub extracted: usize,
    pub removed: usize,
}

fn storage_error(path: &Path) -> impl FnOnce() -> ErrorKind {
    let path = path.display().to_string();
    move || ErrorKind::Storage(path)
}

/// Moves changes between a local tree and a remote patch store.
pub struct Patcher {
    local: BackendHandle,
    remote: BackendHandle,
    sync: SyncConfig,
    patch: PatchConfig,
    cancel: CancellationToken,
}

impl Patcher {
    pub fn new(local: BackendHandle, remote: BackendHandle, sync: SyncConfig, patch: PatchConfig) -> Self {
        Self { local, remote, sync, patch, cancel: CancellationToken::new() }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn scan_options(&self) -> ScanOptions {
        let mut options = ScanOptions { exclude: self.sync.exclude.clone(), chunk_size: self.sync.chunk_size };
        options.exclude.push(self.sync.manifest_dir.clone());
        options
    }

    fn index_path(&self) -> PathBuf {
        PathBuf::from(&self.patch.index_name)
    }

    fn remote_archive_path(&self, archive: &str) -> PathBuf {
        Path::new(&self.patch.archive_dir).join(archive)
    }

    fn cached_archive_path(&self, archive: &str) -> PathBuf {
        Path::new(&self.sync.manifest_dir).join(ARCHIVE_CACHE_DIR).join(archive)
    }

    async fn remote_index(&self) -> Result<Option<RecordIndex>> {
        format::load(self.remote.as_ref(), &self.index_path(), ManifestFormat::Json)
            .await
            .or_raise(|| ErrorKind::ManifestCorrupt(self.patch.index_name.clone()))
    }

    /// Publish the local tree: package every new or changed file into one
    /// archive, upload it, and update the remote index. `None` if cancelled
    /// before anything was uploaded.
    #[tracing::instrument(skip_all, fields(local = self.local.name(), remote = self.remote.name()))]
    pub async fn push(&self) -> Result<Option<PushReport>> {
        let Some(local) = scan_backend(self.local.as_ref(), &self.scan_options(), &self.cancel)
            .await
            .or_raise(|| ErrorKind::Manifest)?
        else {
            return Ok(None);
        };
        let mut index = self.remote_index().await?.unwrap_or_else(|| RecordIndex::new(self.remote.name()));
        let plan = find_difference(&index, &local);
        if plan.is_empty() {
            tracing::info!("Remote is up to date");
            return Ok(Some(PushReport::default()));
        }

        let mut report = PushReport::default();
        let packaged: Vec<&Record> = plan.add.iter().chain(plan.replace.iter()).collect();
        if !packaged.is_empty() {
            let mut entries = Vec::with_capacity(packaged.len());
            for record in &packaged {
                if self.cancel.is_cancelled() {
                    return Ok(None);
                }
                let path = record.rel_path();
                let data = self.local.read(&path).await.or_raise(storage_error(&path))?;
                let actual = Fingerprint::of(&data);
                if actual != record.hash {
                    // Changed since the scan.
                    exn::bail!(ErrorKind::ChecksumMismatch { path: record.path.clone(), expected: record.hash, actual });
                }
                entries.push((path, data));
            }
            let bytes = tokio::task::spawn_blocking(move || archive::pack(entries))
                .await
                .or_raise(|| ErrorKind::Task)?
                .or_raise(|| ErrorKind::Storage("patch archive".to_string()))?;
            let name = self.free_archive_name().await?;
            let path = self.remote_archive_path(&name);
            self.remote.write(&path, &bytes).await.or_raise(storage_error(&path))?;
            tracing::info!(archive = %name, files = packaged.len(), bytes = bytes.len(), "Uploaded patch archive");
            report.packaged = packaged.len();
            for record in packaged {
                index.insert(record.clone().with_archive(&name));
            }
            report.archive = Some(name);
        }
        for record in plan.remove.iter() {
            index.insert(record.clone().tombstone());
        }
        report.removed = plan.remove.len();
        format::save(self.remote.as_ref(), &self.index_path(), &index, ManifestFormat::Json)
            .await
            .or_raise(|| ErrorKind::Manifest)?;
        Ok(Some(report))
    }

    /// `patch-<unix-seconds>.tar.gz`, moved a second on if that name is taken.
    async fn free_archive_name(&self) -> Result<String> {
        let mut seconds = OffsetDateTime::now_utc().unix_timestamp();
        loop {
            let name = format!("patch-{seconds}.tar.gz");
            let path = self.remote_archive_path(&name);
            if !self.remote.exists(&path).await.or_raise(storage_error(&path))? {
                return Ok(name);
            }
            seconds += 1;
        }
    }

    /// Bring the local tree up to the remote index. Nothing local changes
    /// unless every needed file was extracted and verified. `None` if
    /// cancelled.
    #[tracing::instrument(skip_all, fields(local = self.local.name(), remote = self.remote.name()))]
    pub async fn pull(&self) -> Result<Option<PullReport>> {
        let Some(remote) = self.remote_index().await? else {
            exn::bail!(ErrorKind::MissingIndex(self.patch.index_name.clone()));
        };
        let mut store = ManifestStore::new(Arc::clone(&self.local), &self.sync.manifest_dir);
        let Some(loaded) = store.load(&self.scan_options(), &self.cancel).await? else {
            return Ok(None);
        };
        let mut local = loaded.index;
        let plan = find_difference(&local, &remote);
        let mut report = PullReport::default();
        if plan.is_empty() && loaded.in_flight.is_empty() {
            tracing::info!("Local tree is up to date");
            if loaded.source != LoadSource::Primary {
                store.commit(&local).await?;
            }
            self.prune_archive_cache(&remote).await;
            return Ok(Some(report));
        }

        let mut by_archive: BTreeMap<&str, Vec<&Record>> = BTreeMap::new();
        for record in plan.add.iter().chain(plan.replace.iter()) {
            let archive = record.archive.as_deref().ok_or_else(|| ErrorKind::MissingArchiveRef(record.path.clone()))?;
            by_archive.entry(archive).or_default().push(record);
        }

        let mut staged: Vec<(&Record, PathBuf)> = Vec::new();
        let extracted = self.stage(&by_archive, &mut staged, &mut report).await;
        if let Err(e) = extracted {
            self.discard(&staged).await;
            return Err(e);
        }
        if self.cancel.is_cancelled() {
            self.discard(&staged).await;
            return Ok(None);
        }

        store.prepare(&local, loaded.source).await?;
        for record in &loaded.in_flight {
            if !plan.writes(&record.path) {
                delete_if_exists(self.local.as_ref(), &record.rel_path())
                    .await
                    .or_raise(storage_error(&record.rel_path()))?;
            }
        }
        for (record, staging) in &staged {
            let path = record.rel_path();
            store.begin(record).await?;
            self.local.rename(staging, &path).await.or_raise(storage_error(&path))?;
            store.done(&record.path).await?;
            local.insert(Record { archive: None, ..(*record).clone() });
        }
        report.extracted = staged.len();
        for record in plan.remove.iter() {
            let path = record.rel_path();
            delete_if_exists(self.local.as_ref(), &path).await.or_raise(storage_error(&path))?;
            store.drop_file(&record.path).await?;
            local.remove(&record.path);
        }
        report.removed = plan.remove.len();
        if let Err(e) = self.local.prune_empty_dirs().await {
            tracing::warn!(error = ?e, "Could not prune empty directories");
        }
        store.commit(&local).await?;
        self.prune_archive_cache(&remote).await;
        tracing::info!(?report, "Pulled patches");
        Ok(Some(report))
    }

    /// Fetch (or reuse) each archive and write the members it should carry
    /// to their staging paths, verifying each one.
    async fn stage<'a>(
        &self,
        by_archive: &BTreeMap<&str, Vec<&'a Record>>,
        staged: &mut Vec<(&'a Record, PathBuf)>,
        report: &mut PullReport,
    ) -> Result<()> {
        for (&archive, records) in by_archive {
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            let cached = self.cached_archive_path(archive);
            let reused = self.local.exists(&cached).await.or_raise(storage_error(&cached))?;
            if reused {
                tracing::debug!(%archive, "Using cached archive");
                report.reused += 1;
            } else {
                self.download(archive, &cached).await?;
                report.downloaded += 1;
            }

            let wanted: HashSet<String> = records.iter().filter_map(|r| normalize_key(&r.path).ok()).collect();
            let members = match self.unpack(&cached, wanted.clone()).await {
                Ok(members) => members,
                Err(e) if reused => {
                    tracing::warn!(%archive, error = ?e, "Cached archive is unreadable; downloading it again");
                    self.download(archive, &cached).await?;
                    report.reused -= 1;
                    report.downloaded += 1;
                    self.unpack(&cached, wanted).await?
                },
                Err(e) => return Err(e),
            };
            let mut members: BTreeMap<String, ArchiveMember> =
                members.into_iter().filter_map(|m| Some((normalize_key(&m.path).ok()?, m))).collect();
            for record in records {
                let Some(member) = members.remove(&record.key()) else {
                    exn::bail!(ErrorKind::Extraction { archive: archive.to_string(), member: record.path.clone() });
                };
                let actual = Fingerprint::of(&member.data);
                if actual != record.hash {
                    exn::bail!(ErrorKind::ChecksumMismatch { path: record.path.clone(), expected: record.hash, actual });
                }
                let staging = staging_path(record.rel_path());
                self.local.write(&staging, &member.data).await.or_raise(storage_error(&staging))?;
                staged.push((*record, staging));
            }
        }
        Ok(())
    }

    /// Fetch an archive into the local cache. Only a complete download ever
    /// lands under the cached name.
    async fn download(&self, archive: &str, cached: &Path) -> Result<()> {
        let remote_path = self.remote_archive_path(archive);
        let bytes = self.remote.read(&remote_path).await.or_raise(storage_error(&remote_path))?;
        let staging = staging_path(cached);
        self.local.write(&staging, &bytes).await.or_raise(storage_error(&staging))?;
        self.local.rename(&staging, cached).await.or_raise(storage_error(cached))?;
        tracing::info!(%archive, bytes = bytes.len(), "Downloaded archive");
        Ok(())
    }

    /// Delete cached archives (and stray partial downloads) that no live
    /// record of `remote` still points at.
    async fn prune_archive_cache(&self, remote: &RecordIndex) {
        let referenced: HashSet<&str> = remote.live().filter_map(|r| r.archive.as_deref()).collect();
        let dir = Path::new(&self.sync.manifest_dir).join(ARCHIVE_CACHE_DIR);
        let cached = match self.local.list(Some(&dir)).await {
            Ok(cached) => cached,
            Err(e) => {
                tracing::warn!(error = ?e, "Could not list cached archives");
                return;
            },
        };
        for file in cached {
            let name = file.path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
            if referenced.contains(name.as_str()) {
                continue;
            }
            match self.local.delete(&file.path).await {
                Ok(()) => tracing::debug!(archive = %name, "Pruned cached archive"),
                Err(e) => tracing::warn!(archive = %name, error = ?e, "Could not prune cached archive"),
            }
        }
    }

    async fn unpack(&self, path: &Path, wanted: HashSet<String>) -> Result<Vec<ArchiveMember>> {
        let reader = self.local.reader(path).await.or_raise(storage_error(path))?;
        tokio::task::spawn_blocking(move || archive::unpack(reader, Some(&wanted)))
            .await
            .or_raise(|| ErrorKind::Task)?
            .or_raise(storage_error(path))
    }

    async fn discard(&self, staged: &[(&Record, PathBuf)]) {
        for (_, staging) in staged {
            if let Err(e) = delete_if_exists(self.local.as_ref(), staging).await {
                tracing::warn!(staging = %staging.display(), error = ?e, "Could not remove staging file");
            }
        }
    }
}
