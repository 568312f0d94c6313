//! Bringing a destination tree up to date with a source tree.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use exn::ResultExt;
use tokio_util::sync::CancellationToken;
use vlt_config::SyncConfig;
use vlt_manifest::format::{self, ManifestFormat};
use vlt_manifest::{Record, RecordIndex, ScanOptions, SyncPlan, copy_between, find_difference, scan_backend};
use vlt_storage::backend::delete_if_exists;
use vlt_storage::{BackendHandle, StorageBackend, staging_path};

use crate::error::{ErrorKind, Result};
use crate::journal::{LoadSource, MANIFEST_FILE, ManifestStore};
use crate::status::{Phase, SyncStatus};

/// How a run that didn't fail ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Nothing differed.
    UpToDate,
    Completed,
    /// Stopped early; everything finished so far is recorded.
    Cancelled,
}

/// Setup and teardown around a run (mounting a share, fetching temporary
/// credentials, ...).
#[async_trait]
pub trait UpdateHooks: Send + Sync {
    /// Runs before anything is read. An error aborts the run.
    async fn pre_update(&self) -> Result<()> {
        Ok(())
    }

    /// Runs on every exit path once `pre_update` has been attempted, with
    /// the phase the run is about to end in.
    async fn post_update(&self, _ending: Phase) {}
}

/// Hooks that do nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

impl UpdateHooks for NoHooks {}

/// Why a pass stopped before the end.
enum Stop {
    Cancelled,
    Failed(crate::error::Error),
}

impl From<crate::error::Error> for Stop {
    fn from(e: crate::error::Error) -> Self {
        Self::Failed(e)
    }
}

/// Makes `dest` hold exactly the files of `source`.
///
/// Which files to copy comes from comparing the manifests of both trees; the
/// destination's manifest is kept up to date (and crash-safe, see
/// [`ManifestStore`]) as files arrive.
pub struct Updater {
    source: BackendHandle,
    dest: BackendHandle,
    config: SyncConfig,
    status: Arc<SyncStatus>,
    cancel: CancellationToken,
    hooks: Arc<dyn UpdateHooks>,
}

impl Updater {
    pub fn new(source: BackendHandle, dest: BackendHandle, config: SyncConfig) -> Self {
        Self {
            source,
            dest,
            config,
            status: Arc::new(SyncStatus::new()),
            cancel: CancellationToken::new(),
            hooks: Arc::new(NoHooks),
        }
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn UpdateHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Use an externally owned token (e.g. one cancelled on Ctrl-C).
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Progress of the current (or last) run.
    pub fn status(&self) -> Arc<SyncStatus> {
        Arc::clone(&self.status)
    }

    /// Ask the running pass to stop after the current chunk.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn scan_options(&self) -> ScanOptions {
        let mut options = ScanOptions { exclude: self.config.exclude.clone(), chunk_size: self.config.chunk_size };
        options.exclude.push(self.config.manifest_dir.clone());
        options
    }

    /// Run one pass.
    #[tracing::instrument(skip_all, fields(source = self.source.name(), dest = self.dest.name()))]
    pub async fn run(&self) -> Result<SyncOutcome> {
        self.status.reset();
        self.status.set_phase(Phase::PreUpdate);
        let result = match self.hooks.pre_update().await {
            Ok(()) => self.pass().await,
            Err(e) => Err(e).or_raise(|| ErrorKind::Hook("pre_update")),
        };
        let ending = match &result {
            Ok(SyncOutcome::Cancelled) => Phase::Cancelled,
            Ok(_) => Phase::Complete,
            Err(_) => Phase::Error,
        };
        self.status.set_phase(Phase::PostUpdate);
        self.hooks.post_update(ending).await;
        self.status.set_phase(ending);
        match &result {
            Ok(outcome) => tracing::info!(?outcome, "Sync finished"),
            Err(e) => tracing::error!(error = ?e, "Sync failed"),
        }
        result
    }

    async fn pass(&self) -> Result<SyncOutcome> {
        let options = self.scan_options();
        let mut store = ManifestStore::new(Arc::clone(&self.dest), &self.config.manifest_dir);
        let Some(loaded) = store.load(&options, &self.cancel).await? else {
            return Ok(SyncOutcome::Cancelled);
        };
        let Some(remote) = self.remote_manifest(&options).await? else {
            return Ok(SyncOutcome::Cancelled);
        };
        let mut local = loaded.index;
        let plan = find_difference(&local, &remote);
        if plan.is_empty() && loaded.in_flight.is_empty() {
            self.status.set_phase(Phase::UpToDate);
            if loaded.source != LoadSource::Primary {
                store.commit(&local).await?;
            }
            return Ok(SyncOutcome::UpToDate);
        }

        self.status.set_phase(Phase::DiffComputed);
        self.status.set_totals(plan.transfer_count() as u64, plan.transfer_bytes());
        tracing::info!(
            add = plan.add.len(),
            replace = plan.replace.len(),
            remove = plan.remove.len(),
            in_flight = loaded.in_flight.len(),
            "Applying sync plan"
        );
        store.prepare(&local, loaded.source).await?;
        for record in &loaded.in_flight {
            if !plan.writes(&record.path) {
                tracing::info!(path = %record.path, "Removing file left by an interrupted copy");
                self.remove_file(&record.rel_path()).await?;
            }
        }

        match self.apply(&plan, &mut local, &mut store).await {
            Ok(()) => {
                store.commit(&local).await?;
                Ok(SyncOutcome::Completed)
            },
            Err(Stop::Cancelled) => {
                store.commit(&local).await?;
                Ok(SyncOutcome::Cancelled)
            },
            // Backup and patch log stay behind; the next load rebuilds from them.
            Err(Stop::Failed(e)) => Err(e),
        }
    }

    async fn apply(
        &self,
        plan: &SyncPlan,
        local: &mut RecordIndex,
        store: &mut ManifestStore,
    ) -> std::result::Result<(), Stop> {
        for (phase, records) in [(Phase::Adding, &plan.add), (Phase::Updating, &plan.replace)] {
            self.status.set_phase(phase);
            for record in records.iter() {
                if self.cancel.is_cancelled() {
                    return Err(Stop::Cancelled);
                }
                self.transfer(record, store).await?;
                local.insert(record.clone());
            }
        }

        self.status.set_phase(Phase::CleaningUp);
        for record in plan.remove.iter() {
            if self.cancel.is_cancelled() {
                return Err(Stop::Cancelled);
            }
            self.remove_file(&record.rel_path()).await?;
            store.drop_file(&record.path).await?;
            local.remove(&record.path);
        }
        match self.dest.prune_empty_dirs().await {
            Ok(pruned) if pruned > 0 => tracing::debug!(pruned, "Pruned empty directories"),
            Ok(_) => {},
            Err(e) => tracing::warn!(error = ?e, "Could not prune empty directories"),
        }
        Ok(())
    }

    /// Copy one file through its staging path, verifying it on the way.
    #[tracing::instrument(skip_all, fields(path = %record.path))]
    async fn transfer(&self, record: &Record, store: &mut ManifestStore) -> std::result::Result<(), Stop> {
        let path = record.rel_path();
        let staging = staging_path(&path);
        self.status.file_started(&record.path);
        store.begin(record).await?;

        let status = Arc::clone(&self.status);
        let copied = copy_between(
            self.source.as_ref(),
            &path,
            Some((self.dest.as_ref() as &dyn StorageBackend, staging.as_path())),
            &self.cancel,
            self.config.chunk_size,
            move |bytes| status.add_bytes(bytes),
        )
        .await;
        let failure = match copied {
            Ok(Some(copied)) if copied.hash != record.hash => Stop::Failed(exn::Exn::from(ErrorKind::ChecksumMismatch {
                path: record.path.clone(),
                expected: record.hash,
                actual: copied.hash,
            })),
            Ok(Some(copied)) => match self.commit_staged(&staging, &path, copied.bytes).await {
                Ok(()) => {
                    store.done(&record.path).await?;
                    self.status.file_finished();
                    return Ok(());
                },
                Err(e) => Stop::Failed(e),
            },
            Ok(None) => Stop::Cancelled,
            Err(e) => Stop::Failed(e.raise(ErrorKind::Storage(record.path.clone()))),
        };
        if let Err(e) = delete_if_exists(self.dest.as_ref(), &staging).await {
            tracing::warn!(staging = %staging.display(), error = ?e, "Could not remove staging file");
        }
        store.abandon(&record.path).await?;
        Err(failure)
    }

    /// Check the staged file is complete and move it into place.
    async fn commit_staged(&self, staging: &Path, path: &Path, expected_bytes: u64) -> Result<()> {
        let error = || ErrorKind::Storage(path.display().to_string());
        let staged = self.dest.stat(staging).await.or_raise(error)?;
        // A failed final flush only shows up as a short file.
        if staged.size != expected_bytes {
            exn::bail!(ErrorKind::Storage(format!(
                "{}: staged {} of {expected_bytes} bytes",
                path.display(),
                staged.size
            )));
        }
        self.dest.rename(staging, path).await.or_raise(error)
    }

    async fn remove_file(&self, path: &Path) -> Result<()> {
        for target in [path.to_path_buf(), staging_path(path)] {
            delete_if_exists(self.dest.as_ref(), &target)
                .await
                .or_raise(|| ErrorKind::Storage(target.display().to_string()))?;
        }
        Ok(())
    }

    /// The source's own manifest if it has a usable one, otherwise a scan of
    /// the source. `None` if the scan was cancelled.
    async fn remote_manifest(&self, options: &ScanOptions) -> Result<Option<RecordIndex>> {
        let path = PathBuf::from(&self.config.manifest_dir).join(MANIFEST_FILE);
        match format::load(self.source.as_ref(), &path, ManifestFormat::Lines).await {
            Ok(Some(index)) => return Ok(Some(index)),
            Ok(None) => tracing::debug!("Source has no manifest; scanning it"),
            Err(e) => tracing::warn!(error = ?e, "Source manifest unusable; scanning the source"),
        }
        scan_backend(self.source.as_ref(), options, &self.cancel).await.or_raise(|| {
            ErrorKind::ManifestCorrupt(format!("could not build manifest of `{}`", self.source.name()))
        })
    }
}
