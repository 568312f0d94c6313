//! The ordered set of tiers a lookup walks through.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use exn::ResultExt;
use vlt_config::ResourcesConfig;
use vlt_storage::BackendHandle;
use vlt_storage::backend::{ArchiveBackend, LocalBackend};

use crate::error::{ErrorKind, Result};
use crate::name::ResourceRequest;
use crate::tier::{Capability, Priority, Tier};

/// Directory (under any tier root) whose subdirectories are mod tiers.
pub const MODS_DIR: &str = "mods";
/// Id of the tier holding assets compiled into the binary.
pub const EMBEDDED_TIER: &str = "embedded";

/// Tiers in lookup order: normal before fallback, then more specific
/// (longer) ids first, then by id.
#[derive(Debug, Default)]
pub struct TierRegistry {
    tiers: Vec<Arc<Tier>>,
}

impl TierRegistry {
    /// Build a registry from ready tiers, reading each one's listings.
    pub async fn from_tiers(tiers: impl IntoIterator<Item = Tier>) -> Self {
        let mut tiers: Vec<Arc<Tier>> = tiers.into_iter().map(Arc::new).collect();
        for tier in &tiers {
            tier.read_file_list().await;
        }
        tiers.sort_by(|a, b| {
            a.priority()
                .cmp(&b.priority())
                .then_with(|| b.id().len().cmp(&a.id().len()))
                .then_with(|| a.id().cmp(b.id()))
        });
        Self { tiers }
    }

    pub fn tiers(&self) -> impl Iterator<Item = &Arc<Tier>> {
        self.tiers.iter()
    }

    pub fn len(&self) -> usize {
        self.tiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }

    /// The first tier, in order, that may serve `request` and lists it under
    /// its raw or converted name.
    pub fn resolve(&self, request: &ResourceRequest) -> Option<Arc<Tier>> {
        let converted = request.name.converted();
        self.tiers
            .iter()
            .find(|tier| {
                let allowed = match tier.mod_tag() {
                    None => true,
                    Some(tag) => request.mod_tag.as_deref() == Some(tag),
                };
                allowed && (tier.request_file(&request.name) || tier.request_file(&converted))
            })
            .cloned()
    }

    /// Discover tiers on disk.
    ///
    /// - each directory in `design_root` is a tier with loose sources, and
    ///   each directory in `design_root/mods` a mod tier `mods/<name>`;
    /// - each `<id><archive_suffix>` in `archive_root` (or its `mods`
    ///   directory) adds packaged sources to tier `<id>`;
    /// - every tier caches to `cache_root/<id>`; cache directories with no
    ///   source become cache-only tiers;
    /// - `embedded`, if given, is a fallback tier of ready artifacts.
    ///
    /// Missing roots are skipped. An archive that can't be opened is logged
    /// and skipped.
    #[tracing::instrument(skip_all)]
    pub async fn scan(config: &ResourcesConfig, embedded: Option<BackendHandle>) -> Result<Self> {
        let cache_root = absolute(&config.cache_root)?;
        let mut found: BTreeMap<String, Tier> = BTreeMap::new();

        if let Some(design_root) = &config.design_root {
            let design_root = absolute(design_root)?;
            for dir in tier_entries(&design_root, |p| p.is_dir()).await? {
                let backend = LocalBackend::open_existing(format!("design/{}", dir.id), &dir.path)
                    .or_raise(|| ErrorKind::Layout(dir.path.clone()))?;
                upsert(&mut found, &dir, |tier| tier.with_capability(Capability::Design(Arc::new(backend))));
            }
        }

        if let Some(archive_root) = &config.archive_root {
            let archive_root = absolute(archive_root)?;
            let suffix = config.archive_suffix.to_lowercase();
            let archives = tier_entries(&archive_root, |p| {
                p.is_file() && p.file_name().is_some_and(|n| n.to_string_lossy().to_lowercase().ends_with(&suffix))
            })
            .await?;
            for mut archive in archives {
                archive.id.truncate(archive.id.len() - suffix.len());
                if let Some(tag) = archive.mod_tag.as_mut() {
                    tag.truncate(tag.len() - suffix.len());
                }
                // `<suffix>` alone names no tier.
                if archive.mod_tag.as_ref().map_or(archive.id.is_empty(), String::is_empty) {
                    tracing::warn!(path = %archive.path.display(), "Skipping archive without a tier name");
                    continue;
                }
                match ArchiveBackend::open(format!("archive/{}", archive.id), &archive.path).await {
                    Ok(backend) => {
                        upsert(&mut found, &archive, |tier| tier.with_capability(Capability::Archive(Arc::new(backend))))
                    },
                    Err(e) => tracing::warn!(path = %archive.path.display(), error = ?e, "Skipping unreadable archive"),
                }
            }
        }

        if cache_root.is_dir() {
            for dir in tier_entries(&cache_root, |p| p.is_dir()).await? {
                if !found.contains_key(&dir.id) {
                    upsert(&mut found, &dir, |tier| tier);
                }
            }
        }

        let mut tiers = Vec::with_capacity(found.len() + 1);
        for (id, tier) in found {
            let path = cache_root.join(&id);
            let cache = LocalBackend::new(format!("cache/{id}"), &path).or_raise(|| ErrorKind::Layout(path.clone()))?;
            tiers.push(tier.with_capability(Capability::Cache(Arc::new(cache))));
        }
        if let Some(embedded) = embedded {
            tiers.push(Tier::new(EMBEDDED_TIER, Priority::Fallback).with_capability(Capability::Cache(embedded)));
        }
        let registry = Self::from_tiers(tiers).await;
        tracing::info!(tiers = registry.len(), "Discovered resource tiers");
        Ok(registry)
    }
}

/// A directory entry that names a tier.
struct TierEntry {
    id: String,
    mod_tag: Option<String>,
    path: PathBuf,
}

fn upsert(found: &mut BTreeMap<String, Tier>, entry: &TierEntry, add: impl FnOnce(Tier) -> Tier) {
    let tier = found.remove(&entry.id).unwrap_or_else(|| {
        let tier = Tier::new(&entry.id, Priority::Normal);
        match &entry.mod_tag {
            Some(tag) => tier.with_mod_tag(tag),
            None => tier,
        }
    });
    found.insert(entry.id.clone(), add(tier));
}

fn absolute(path: &Path) -> Result<PathBuf> {
    std::path::absolute(path).or_raise(|| ErrorKind::Layout(path.to_path_buf()))
}

/// Entries of `root` (and of `root/mods`) accepted by `keep`, with their
/// lowercase tier ids. A missing root has no entries.
async fn tier_entries(root: &Path, keep: impl Fn(&Path) -> bool) -> Result<Vec<TierEntry>> {
    let mut entries = Vec::new();
    for (dir, mod_level) in [(root.to_path_buf(), false), (root.join(MODS_DIR), true)] {
        let mut listing = match tokio::fs::read_dir(&dir).await {
            Ok(listing) => listing,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e).or_raise(|| ErrorKind::Layout(dir.clone())),
        };
        while let Some(entry) = listing.next_entry().await.or_raise(|| ErrorKind::Layout(dir.clone()))? {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_lowercase) else {
                tracing::warn!(path = %path.display(), "Skipping tier with a non UTF-8 name");
                continue;
            };
            if (!mod_level && name == MODS_DIR) || !keep(&path) {
                continue;
            }
            let (id, mod_tag) = match mod_level {
                true => (format!("{MODS_DIR}/{name}"), Some(name)),
                false => (name, None),
            };
            entries.push(TierEntry { id, mod_tag, path });
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::name::{ResourceKind, ResourceName};
    use vlt_storage::backend::MockBackend;

    fn tier(id: &str, priority: Priority, files: &[&str]) -> Tier {
        let backend = MockBackend::with_files(files.iter().map(|p| (p.to_string(), b"x".to_vec())));
        Tier::new(id, priority).with_capability(Capability::Cache(Arc::new(backend)))
    }

    #[tokio::test]
    async fn test_ordering() {
        let registry = TierRegistry::from_tiers([
            tier(EMBEDDED_TIER, Priority::Fallback, &[]),
            tier("base", Priority::Normal, &[]),
            tier("mods/elves", Priority::Normal, &[]),
            tier("addon", Priority::Normal, &[]),
        ])
        .await;
        let ids: Vec<_> = registry.tiers().map(|t| t.id().to_string()).collect();
        assert_eq!(ids, vec!["mods/elves", "addon", "base", EMBEDDED_TIER]);
    }

    #[tokio::test]
    async fn test_resolve_respects_mod_tags_and_order() {
        let registry = TierRegistry::from_tiers([
            tier("base", Priority::Normal, &["bow.png.vlt"]),
            tier("mods/elves", Priority::Normal, &["bow.png.vlt"]).with_mod_tag("elves"),
            tier(EMBEDDED_TIER, Priority::Fallback, &["bow.png.vlt", "logo.png.vlt"]),
        ])
        .await;
        let plain = ResourceRequest::new("bow.png", ResourceKind::Texture);
        assert_eq!(registry.resolve(&plain).unwrap().id(), "base");
        let modded = plain.clone().with_mod("Elves");
        assert_eq!(registry.resolve(&modded).unwrap().id(), "mods/elves");
        let logo = ResourceRequest::new("LOGO.png", ResourceKind::Texture);
        assert_eq!(registry.resolve(&logo).unwrap().id(), EMBEDDED_TIER);
        assert!(registry.resolve(&ResourceRequest::new("nope.png", ResourceKind::Texture)).is_none());
    }

    #[tokio::test]
    async fn test_resolve_is_idempotent() {
        let registry = TierRegistry::from_tiers([tier("base", Priority::Normal, &["a.png.vlt"])]).await;
        let request = ResourceRequest::new("a.png", ResourceKind::Texture);
        let first = registry.resolve(&request).unwrap();
        let second = registry.resolve(&request).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(first.request_file(&ResourceName::new("a.png.vlt")));
        assert!(first.live_objects().is_empty());
    }
}
