//! A single resource tier and the roles it can play.

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use futures::StreamExt;
use tokio::sync::{Mutex, OnceCell};
use vlt_storage::{BackendHandle, normalize_key};

use crate::finder::CachedObject;
use crate::name::{CacheKey, ResourceName};

/// Ordering class of a tier. Fallback tiers are consulted after every
/// normal one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Normal,
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Holds converted artifacts, ready to load.
    Cache,
    /// Loose source files.
    Design,
    /// Packaged source files.
    Archive,
}

/// A storage backend in one of the three roles.
#[derive(Clone)]
pub enum Capability {
    Cache(BackendHandle),
    Design(BackendHandle),
    Archive(BackendHandle),
}
impl Capability {
    pub fn role(&self) -> Role {
        match self {
            Self::Cache(_) => Role::Cache,
            Self::Design(_) => Role::Design,
            Self::Archive(_) => Role::Archive,
        }
    }

    pub fn backend(&self) -> &BackendHandle {
        match self {
            Self::Cache(b) | Self::Design(b) | Self::Archive(b) => b,
        }
    }
}

/// Where an authoritative copy of a source file lives.
pub(crate) struct Source {
    pub role: Role,
    pub backend: BackendHandle,
    pub path: PathBuf,
}

/// One place resources can come from.
///
/// Listings (`cached`, `designed`, `archived`) map normalized names to the
/// backend path they were found under. They are snapshots, refreshed only by
/// [`Tier::read_file_list`]; a conversion adds its output to `cached`
/// directly.
pub struct Tier {
    id: String,
    priority: Priority,
    mod_tag: Option<String>,
    capabilities: Vec<Capability>,
    cached: DashMap<String, PathBuf>,
    designed: DashMap<String, PathBuf>,
    archived: DashMap<String, PathBuf>,
    pub(crate) objects: DashMap<CacheKey, Arc<OnceCell<CachedObject>>>,
    pub(crate) conversions: DashMap<ResourceName, Arc<Mutex<()>>>,
}

impl Tier {
    pub fn new(id: impl Into<String>, priority: Priority) -> Self {
        Self {
            id: id.into(),
            priority,
            mod_tag: None,
            capabilities: Vec::new(),
            cached: DashMap::new(),
            designed: DashMap::new(),
            archived: DashMap::new(),
            objects: DashMap::new(),
            conversions: DashMap::new(),
        }
    }

    pub fn with_mod_tag(mut self, tag: impl Into<String>) -> Self {
        self.mod_tag = Some(tag.into().to_lowercase());
        self
    }

    /// Add a role, replacing any existing backend for the same role.
    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capabilities.retain(|c| c.role() != capability.role());
        self.capabilities.push(capability);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn mod_tag(&self) -> Option<&str> {
        self.mod_tag.as_deref()
    }

    pub fn backend(&self, role: Role) -> Option<&BackendHandle> {
        self.capabilities.iter().find(|c| c.role() == role).map(Capability::backend)
    }

    pub fn roles(&self) -> impl Iterator<Item = Role> + '_ {
        self.capabilities.iter().map(Capability::role)
    }

    /// Only holds converted artifacts; nothing here can be (re)converted.
    pub fn is_derived_only(&self) -> bool {
        !self.is_authoritative()
    }

    /// Has loose or packaged source files.
    pub fn is_authoritative(&self) -> bool {
        self.backend(Role::Design).is_some() || self.backend(Role::Archive).is_some()
    }

    fn listing(&self, role: Role) -> &DashMap<String, PathBuf> {
        match role {
            Role::Cache => &self.cached,
            Role::Design => &self.designed,
            Role::Archive => &self.archived,
        }
    }

    /// Re-read every role's listing from its backend. Unlistable entries are
    /// logged and skipped. Returns the number of entries found.
    #[tracing::instrument(skip(self), fields(tier = %self.id))]
    pub async fn read_file_list(&self) -> usize {
        let mut total = 0;
        for capability in &self.capabilities {
            let listing = self.listing(capability.role());
            listing.clear();
            let backend = capability.backend();
            let mut files = backend.list_stream(None);
            while let Some(file) = files.next().await {
                let file = match file {
                    Ok(file) => file,
                    Err(e) => {
                        tracing::warn!(role = ?capability.role(), error = ?e, "Skipping unlistable entry");
                        continue;
                    },
                };
                match normalize_key(&file.path) {
                    Ok(key) => {
                        listing.insert(key, file.path.clone());
                        total += 1;
                    },
                    Err(e) => tracing::warn!(path = %file.path.display(), error = ?e, "Skipping unusable name"),
                }
            }
        }
        tracing::debug!(entries = total, "Read tier listings");
        total
    }

    /// Whether this tier can serve `name`, from any role.
    pub fn request_file(&self, name: &ResourceName) -> bool {
        let key = name.as_str();
        self.cached.contains_key(key) || self.designed.contains_key(key) || self.archived.contains_key(key)
    }

    /// Backend path of a converted artifact, if it is listed.
    pub fn cached_path(&self, name: &ResourceName) -> Option<PathBuf> {
        self.cached.get(name.as_str()).map(|entry| entry.value().clone())
    }

    /// Authoritative source of `name`: loose files win over packaged ones.
    pub(crate) fn source(&self, name: &ResourceName) -> Option<Source> {
        [Role::Design, Role::Archive].into_iter().find_map(|role| {
            let path = self.listing(role).get(name.as_str())?.value().clone();
            let backend = Arc::clone(self.backend(role)?);
            Some(Source { role, backend, path })
        })
    }

    /// Record a freshly written artifact in the cache listing.
    pub(crate) fn register_cached(&self, name: &ResourceName, path: PathBuf) {
        self.cached.insert(name.as_str().to_string(), path);
    }

    /// Drop every listing and every held object.
    pub(crate) fn clear(&self) {
        self.objects.clear();
        self.conversions.clear();
        self.cached.clear();
        self.designed.clear();
        self.archived.clear();
    }

    /// Objects currently alive in this tier.
    pub fn live_objects(&self) -> Vec<CachedObject> {
        self.objects.iter().filter_map(|entry| entry.value().get().cloned()).collect()
    }
}

impl std::fmt::Debug for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tier")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("mod_tag", &self.mod_tag)
            .field("roles", &self.roles().collect::<Vec<_>>())
            .field("cached", &self.cached.len())
            .field("designed", &self.designed.len())
            .field("archived", &self.archived.len())
            .finish()
    }
}
