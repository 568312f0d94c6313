//! Configuration for vlt.
//!
//! Values are layered, later sources overriding earlier ones:
//!
//! 1. built-in defaults,
//! 2. a config file (TOML, YAML or JSON, chosen by extension), either given
//!    explicitly or `vlt.toml` in the platform config directory,
//! 3. environment variables prefixed with `VLT_`, with `__` separating
//!    nested keys (`VLT_SYNC__CHUNK_SIZE=4096`).

pub mod error;

use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use exn::ResultExt;
use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, Result};

pub const ENV_PREFIX: &str = "VLT_";
pub const CONFIG_FILE_NAME: &str = "vlt.toml";

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", "vlt")
}

/// Where the config file is looked for when none is given.
pub fn default_config_path() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub resources: ResourcesConfig,
    pub sync: SyncConfig,
    pub patch: PatchConfig,
}

/// Where resource tiers live on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourcesConfig {
    /// One subdirectory per tier holding loose source files.
    pub design_root: Option<PathBuf>,
    /// One subdirectory per tier holding converted artifacts.
    pub cache_root: PathBuf,
    /// Packaged sources, one `<tier><archive_suffix>` file per tier.
    pub archive_root: Option<PathBuf>,
    pub archive_suffix: String,
}

impl Default for ResourcesConfig {
    fn default() -> Self {
        let cache_root = match project_dirs() {
            Some(dirs) => dirs.cache_dir().join("resources"),
            None => PathBuf::from(".vlt-cache"),
        };
        Self { design_root: None, cache_root, archive_root: None, archive_suffix: ".tar.gz".to_string() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Directory, relative to a synced root, holding the manifest and its
    /// journal. Never synced itself.
    pub manifest_dir: String,
    /// Bytes read per step while copying; cancellation is checked between
    /// steps.
    pub chunk_size: usize,
    /// Path prefixes (relative to the root) left out of scans.
    pub exclude: Vec<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self { manifest_dir: ".vlt".to_string(), chunk_size: 64 * 1024, exclude: Vec::new() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatchConfig {
    /// Name of the remote index, at the remote root.
    pub index_name: String,
    /// Remote directory holding patch archives.
    pub archive_dir: String,
}

impl Default for PatchConfig {
    fn default() -> Self {
        Self { index_name: "index.json".to_string(), archive_dir: "patches".to_string() }
    }
}

impl Config {
    /// Load the layered configuration.
    ///
    /// An explicit `path` must exist. The default location is skipped when
    /// there is nothing there.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) if !path.is_file() => exn::bail!(ErrorKind::NotFound(path.to_path_buf())),
            Some(path) => Some(path.to_path_buf()),
            None => default_config_path().filter(|p| p.is_file()),
        };
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(file) = &file {
            tracing::debug!(path = %file.display(), "Reading config file");
            figment = merge_file(figment, file)?;
        }
        Self::extract(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    fn extract(figment: Figment) -> Result<Self> {
        let config: Config = figment.extract().or_raise(|| ErrorKind::Extract)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sync.chunk_size == 0 {
            exn::bail!(ErrorKind::Invalid("sync.chunk_size must be greater than zero".to_string()));
        }
        let names = [
            ("sync.manifest_dir", &self.sync.manifest_dir),
            ("patch.index_name", &self.patch.index_name),
            ("patch.archive_dir", &self.patch.archive_dir),
            ("resources.archive_suffix", &self.resources.archive_suffix),
        ];
        for (key, value) in names {
            if value.trim().is_empty() {
                exn::bail!(ErrorKind::Invalid(format!("{key} must not be empty")));
            }
        }
        Ok(())
    }
}

fn merge_file(figment: Figment, file: &Path) -> Result<Figment> {
    let extension = file.extension().and_then(|e| e.to_str()).map(str::to_lowercase);
    Ok(match extension.as_deref() {
        Some("toml") => figment.merge(Toml::file(file)),
        Some("yaml" | "yml") => figment.merge(Yaml::file(file)),
        Some("json") => figment.merge(Json::file(file)),
        _ => exn::bail!(ErrorKind::UnsupportedFormat(file.to_path_buf())),
    })
}
