//! vlt: tiered asset cache and manifest-based file sync.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use miette::IntoDiagnostic;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use vlt_config::Config;
use vlt_manifest::format::{self, ManifestFormat};
use vlt_manifest::{RecordIndex, ScanOptions, SyncPlan, find_difference, scan_backend, scan_directory};
use vlt_resource::{BytesLoader, PassthroughCreator, ResourceFinder, ResourceKind, ResourceRequest};
use vlt_storage::backend::{EmbeddedBackend, LocalBackend, ReadOnlyBackend};
use vlt_storage::BackendHandle;
use vlt_sync::{Patcher, SyncOutcome, Updater};

/// Assets shipped inside the binary; the last tier of every lookup.
#[derive(rust_embed::RustEmbed)]
#[folder = "assets/"]
struct BuiltinAssets;

#[derive(Parser)]
#[command(name = "vlt", version, about = "Tiered asset cache and manifest-based file sync")]
struct Cli {
    /// Configuration file (TOML, YAML or JSON).
    #[arg(short, long, global = true, env = "VLT_CONFIG")]
    config: Option<PathBuf>,

    /// Enable debug logging (overridden by `RUST_LOG`).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Hash a directory and print its manifest
    Index {
        dir: PathBuf,

        /// Write the manifest here instead (`.json` for JSON).
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Compare two manifest files
    Diff { local: PathBuf, remote: PathBuf },

    /// Make `dest` hold exactly the files of `source`
    Sync {
        source: PathBuf,
        dest: PathBuf,

        /// Print what would change without touching either tree.
        #[arg(long)]
        dry_run: bool,
    },

    /// Publish changes in `dir` as a patch archive to `remote`
    Push { dir: PathBuf, remote: PathBuf },

    /// Apply the patches published at `remote` to `dir`
    Pull { remote: PathBuf, dir: PathBuf },

    /// Show which tier serves a resource
    Resolve {
        name: String,

        /// Mod namespace of the request.
        #[arg(long = "mod")]
        mod_tag: Option<String>,

        /// Also load it (converting if needed) and report its size.
        #[arg(long)]
        load: bool,
    },
}

fn report<E>(e: exn::Exn<E>) -> miette::Report
where
    E: std::error::Error + Send + Sync + 'static,
{
    miette::miette!("{e:?}")
}

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).with_writer(std::io::stderr).init();
}

/// Cancelled on the first Ctrl-C.
fn interrupt_token() -> CancellationToken {
    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted; stopping after the current file");
            cancel.cancel();
        }
    });
    token
}

fn local_backend(path: &Path, must_exist: bool) -> miette::Result<BackendHandle> {
    let root = std::path::absolute(path).into_diagnostic()?;
    let name = path.display().to_string();
    let backend = if must_exist { LocalBackend::open_existing(name, root) } else { LocalBackend::new(name, root) };
    Ok(Arc::new(backend.map_err(report)?))
}

fn read_only(backend: BackendHandle) -> BackendHandle {
    Arc::new(ReadOnlyBackend::new(backend))
}

fn scan_options(config: &Config) -> ScanOptions {
    let options = ScanOptions { exclude: config.sync.exclude.clone(), chunk_size: config.sync.chunk_size };
    options.excluding(config.sync.manifest_dir.clone())
}

fn print_plan(plan: &SyncPlan) {
    for (mark, records) in [('+', &plan.add), ('~', &plan.replace), ('-', &plan.remove)] {
        for record in records.iter() {
            println!("{mark} {}", record.path);
        }
    }
    println!(
        "{} to add, {} to replace, {} to remove ({} bytes to transfer)",
        plan.add.len(),
        plan.replace.len(),
        plan.remove.len(),
        plan.transfer_bytes()
    );
}

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let config = Config::load(cli.config.as_deref()).map_err(report)?;

    match cli.command {
        Command::Index { dir, output } => index_command(&config, &dir, output.as_deref()).await,
        Command::Diff { local, remote } => diff_command(&local, &remote).await,
        Command::Sync { source, dest, dry_run: true } => dry_run_command(&config, &source, &dest).await,
        Command::Sync { source, dest, dry_run: false } => sync_command(&config, &source, &dest).await,
        Command::Push { dir, remote } => push_command(&config, &dir, &remote).await,
        Command::Pull { remote, dir } => pull_command(&config, &remote, &dir).await,
        Command::Resolve { name, mod_tag, load } => resolve_command(&config, &name, mod_tag, load).await,
    }
}

async fn index_command(config: &Config, dir: &Path, output: Option<&Path>) -> miette::Result<()> {
    let cancel = interrupt_token();
    let Some(index) = scan_directory(dir, &scan_options(config), &cancel).await.map_err(report)? else {
        miette::bail!("Scan of {} was interrupted", dir.display());
    };
    match output {
        Some(path) => {
            let bytes = format::encode(&index, ManifestFormat::from_path(path)).map_err(report)?;
            tokio::fs::write(path, bytes).await.into_diagnostic()?;
            tracing::info!(records = index.len(), path = %path.display(), "Wrote manifest");
        },
        None => print!("{}", format::render_lines(&index)),
    }
    Ok(())
}

async fn read_manifest(path: &Path) -> miette::Result<RecordIndex> {
    let bytes = tokio::fs::read(path).await.into_diagnostic()?;
    let name = path.display().to_string();
    format::decode(&bytes, ManifestFormat::from_path(path), &name).map_err(report)
}

async fn diff_command(local: &Path, remote: &Path) -> miette::Result<()> {
    let local = read_manifest(local).await?;
    let remote = read_manifest(remote).await?;
    print_plan(&find_difference(&local, &remote));
    Ok(())
}

/// A tree's stored manifest, or a scan of it.
async fn current_manifest(config: &Config, backend: &BackendHandle) -> miette::Result<RecordIndex> {
    let path = Path::new(&config.sync.manifest_dir).join(vlt_sync::journal::MANIFEST_FILE);
    match format::load(backend.as_ref(), &path, ManifestFormat::Lines).await {
        Ok(Some(index)) => return Ok(index),
        Ok(None) => {},
        Err(e) => tracing::warn!(error = ?e, tree = backend.name(), "Stored manifest unusable; scanning"),
    }
    match scan_backend(backend.as_ref(), &scan_options(config), &interrupt_token()).await.map_err(report)? {
        Some(index) => Ok(index),
        None => miette::bail!("Scan of {} was interrupted", backend.name()),
    }
}

async fn dry_run_command(config: &Config, source: &Path, dest: &Path) -> miette::Result<()> {
    let source = read_only(local_backend(source, true)?);
    let dest = read_only(local_backend(dest, true)?);
    let remote = current_manifest(config, &source).await?;
    let local = current_manifest(config, &dest).await?;
    print_plan(&find_difference(&local, &remote));
    Ok(())
}

async fn sync_command(config: &Config, source: &Path, dest: &Path) -> miette::Result<()> {
    let source = read_only(local_backend(source, true)?);
    let dest = local_backend(dest, false)?;
    let updater = Updater::new(source, dest, config.sync.clone()).with_cancellation(interrupt_token());
    let status = updater.status();

    let run = updater.run();
    tokio::pin!(run);
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let result = loop {
        tokio::select! {
            result = &mut run => break result,
            _ = ticker.tick() => {
                let snapshot = status.snapshot();
                if snapshot.phase.is_active() {
                    tracing::info!(
                        phase = %snapshot.phase,
                        files = format!("{}/{}", snapshot.files_done, snapshot.files_total),
                        bytes = format!("{}/{}", snapshot.bytes_done, snapshot.bytes_total),
                        current = snapshot.current_file.as_deref().unwrap_or("-"),
                        "Progress"
                    );
                }
            },
        }
    };
    match result.map_err(report)? {
        SyncOutcome::UpToDate => println!("Already up to date"),
        SyncOutcome::Completed => {
            let snapshot = status.snapshot();
            println!("Synced {} files ({} bytes)", snapshot.files_done, snapshot.bytes_done);
        },
        SyncOutcome::Cancelled => miette::bail!("Sync cancelled; run it again to continue"),
    }
    Ok(())
}

async fn push_command(config: &Config, dir: &Path, remote: &Path) -> miette::Result<()> {
    let patcher = Patcher::new(local_backend(dir, true)?, local_backend(remote, false)?, config.sync.clone(), config.patch.clone())
        .with_cancellation(interrupt_token());
    let Some(report) = patcher.push().await.map_err(report)? else {
        miette::bail!("Push cancelled; nothing was published");
    };
    match report.archive {
        Some(archive) => println!("Published {archive}: {} files, {} removed", report.packaged, report.removed),
        None if report.removed > 0 => println!("Published {} removals", report.removed),
        None => println!("Remote is up to date"),
    }
    Ok(())
}

async fn pull_command(config: &Config, remote: &Path, dir: &Path) -> miette::Result<()> {
    let patcher = Patcher::new(
        local_backend(dir, false)?,
        read_only(local_backend(remote, true)?),
        config.sync.clone(),
        config.patch.clone(),
    )
    .with_cancellation(interrupt_token());
    let Some(report) = patcher.pull().await.map_err(report)? else {
        miette::bail!("Pull cancelled; nothing was changed");
    };
    println!(
        "Extracted {} files, removed {} ({} archives downloaded, {} reused)",
        report.extracted, report.removed, report.downloaded, report.reused
    );
    Ok(())
}

async fn resolve_command(config: &Config, name: &str, mod_tag: Option<String>, load: bool) -> miette::Result<()> {
    let embedded: BackendHandle = Arc::new(EmbeddedBackend::<BuiltinAssets>::new(vlt_resource::EMBEDDED_TIER));
    let finder = ResourceFinder::bootstrap(
        config.resources.clone(),
        Some(embedded),
        Arc::new(PassthroughCreator),
        Arc::new(BytesLoader),
    )
    .await
    .map_err(report)?;
    tracing::debug!(tiers = ?finder.tier_ids().await, "Tiers");

    let mut request = ResourceRequest::new(name, ResourceKind::Raw);
    if let Some(tag) = mod_tag {
        request = request.with_mod(tag);
    }
    let Some(tier) = finder.resolve(&request).await else {
        miette::bail!("No tier provides `{}`", request.name);
    };
    println!("{} -> {}", request.name, tier.id());
    if load {
        let Some(bytes) = finder.get::<Vec<u8>>(&request).await else {
            miette::bail!("`{}` could not be loaded", request.name);
        };
        println!("loaded {} bytes", bytes.len());
    }
    finder.cleanup().await;
    Ok(())
}
