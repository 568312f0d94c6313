//! Resolving requests to loaded objects, converting on demand.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use exn::ResultExt;
use tokio::sync::RwLock;
use vlt_config::ResourcesConfig;
use vlt_storage::BackendHandle;

use crate::error::{ErrorKind, Result};
use crate::name::{CacheKey, ResourceKind, ResourceName, ResourceRequest};
use crate::registry::TierRegistry;
use crate::tier::{Role, Tier};

/// A loaded resource. What it actually is depends on the loader.
pub type CachedObject = Arc<dyn Any + Send + Sync>;

/// After a conversion the cache is consulted once more; if the artifact
/// still isn't there, the request is a miss.
const MAX_CONVERSION_RETRIES: u32 = 1;

/// Everything a creator or loader is told about the resource it handles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionRequest {
    pub tier: String,
    pub name: ResourceName,
    pub converted: ResourceName,
    pub kind: ResourceKind,
    pub params: BTreeMap<String, String>,
}

impl ConversionRequest {
    fn new(tier: &Tier, request: &ResourceRequest) -> Self {
        Self {
            tier: tier.id().to_string(),
            name: request.name.clone(),
            converted: request.name.converted(),
            kind: request.kind.clone(),
            params: request.params.clone(),
        }
    }
}

/// Turns source bytes into their converted form (e.g. an image into a
/// GPU-ready texture blob).
#[async_trait]
pub trait ResourceCreator: Send + Sync {
    async fn convert(&self, request: &ConversionRequest, source: Vec<u8>) -> Result<Vec<u8>>;
}

/// Turns converted bytes into a live object, and tears it down again.
#[async_trait]
pub trait ResourceLoader: Send + Sync {
    async fn load(&self, request: &ConversionRequest, bytes: Vec<u8>) -> Result<CachedObject>;

    /// Called for every live object when the cache is cleaned up.
    fn release(&self, _object: &CachedObject) {}
}

/// Stores the source bytes unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughCreator;

#[async_trait]
impl ResourceCreator for PassthroughCreator {
    async fn convert(&self, _request: &ConversionRequest, source: Vec<u8>) -> Result<Vec<u8>> {
        Ok(source)
    }
}

/// Loads resources as `Vec<u8>`.
#[derive(Debug, Default, Clone, Copy)]
pub struct BytesLoader;

#[async_trait]
impl ResourceLoader for BytesLoader {
    async fn load(&self, _request: &ConversionRequest, bytes: Vec<u8>) -> Result<CachedObject> {
        Ok(Arc::new(bytes))
    }
}

/// Why a production attempt produced nothing.
enum Miss {
    NotFound,
    Failed(crate::error::Error),
}

impl From<crate::error::Error> for Miss {
    fn from(e: crate::error::Error) -> Self {
        Self::Failed(e)
    }
}

/// What happened when a source file was converted.
enum Converted {
    /// Written to the cache role and listed; look it up again.
    Persisted,
    /// The tier has nowhere to cache it; here are the bytes.
    Direct(Vec<u8>),
}

/// Resolves [`ResourceRequest`]s against a [`TierRegistry`] and keeps the
/// loaded objects.
///
/// Safe to share between tasks. Each object is produced at most once per
/// tier: concurrent requests for the same key wait for the same production,
/// and requests for different keys never wait on each other.
pub struct ResourceFinder {
    registry: RwLock<TierRegistry>,
    layout: Option<(ResourcesConfig, Option<BackendHandle>)>,
    creator: Arc<dyn ResourceCreator>,
    loader: Arc<dyn ResourceLoader>,
}

impl ResourceFinder {
    pub fn new(registry: TierRegistry, creator: Arc<dyn ResourceCreator>, loader: Arc<dyn ResourceLoader>) -> Self {
        Self { registry: RwLock::new(registry), layout: None, creator, loader }
    }

    /// Discover tiers from the configured directories and build a finder
    /// over them. [`rescan`](Self::rescan) repeats the discovery.
    pub async fn bootstrap(
        config: ResourcesConfig,
        embedded: Option<BackendHandle>,
        creator: Arc<dyn ResourceCreator>,
        loader: Arc<dyn ResourceLoader>,
    ) -> Result<Self> {
        let registry = TierRegistry::scan(&config, embedded.clone()).await?;
        Ok(Self { registry: RwLock::new(registry), layout: Some((config, embedded)), creator, loader })
    }

    /// Find the tier that would serve `request`, without loading anything.
    pub async fn resolve(&self, request: &ResourceRequest) -> Option<Arc<Tier>> {
        self.registry.read().await.resolve(request)
    }

    /// Ids of all tiers, in lookup order.
    pub async fn tier_ids(&self) -> Vec<String> {
        self.registry.read().await.tiers().map(|t| t.id().to_string()).collect()
    }

    /// Get a loaded resource, converting it first if only its source exists.
    ///
    /// A miss is `None`. So is a failure: it is logged, not returned.
    pub async fn get_resource(&self, request: &ResourceRequest) -> Option<CachedObject> {
        match self.try_get_resource(request).await {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!(name = %request.name, error = ?e, "Could not provide resource");
                None
            },
        }
    }

    /// [`get_resource`](Self::get_resource), downcast to the loader's type.
    pub async fn get<T: Any + Send + Sync>(&self, request: &ResourceRequest) -> Option<Arc<T>> {
        let object = self.get_resource(request).await?;
        match object.downcast::<T>() {
            Ok(typed) => Some(typed),
            Err(_) => {
                tracing::warn!(name = %request.name, expected = std::any::type_name::<T>(), "Resource has another type");
                None
            },
        }
    }

    #[tracing::instrument(skip_all, fields(name = %request.name))]
    async fn try_get_resource(&self, request: &ResourceRequest) -> Result<Option<CachedObject>> {
        let Some(tier) = self.resolve(request).await else {
            tracing::debug!("No tier has this resource");
            return Ok(None);
        };
        let key = CacheKey::for_request(request);
        let cell = tier.objects.entry(key.clone()).or_default().clone();
        if let Some(object) = cell.get() {
            tracing::debug!(tier = tier.id(), "Object cache hit");
            return Ok(Some(Arc::clone(object)));
        }
        let produced = cell.get_or_try_init(|| self.produce(&tier, request)).await.map(Arc::clone);
        match produced {
            Ok(object) => Ok(Some(object)),
            Err(miss) => {
                // Don't keep empty cells around for misses.
                tier.objects.remove_if(&key, |_, cell| !cell.initialized());
                match miss {
                    Miss::NotFound => Ok(None),
                    Miss::Failed(e) => Err(e),
                }
            },
        }
    }

    async fn produce(&self, tier: &Tier, request: &ResourceRequest) -> std::result::Result<CachedObject, Miss> {
        let converted = request.name.converted();
        let conversion = ConversionRequest::new(tier, request);
        let mut retries = 0;
        loop {
            for name in [&converted, &request.name] {
                if let Some(path) = tier.cached_path(name) {
                    tracing::debug!(tier = tier.id(), cached = %name, "Cache hit");
                    return Ok(self.materialize(tier, &conversion, &path).await?);
                }
            }
            if retries >= MAX_CONVERSION_RETRIES {
                tracing::warn!(tier = tier.id(), "Converted artifact did not appear in the cache");
                return Err(Miss::NotFound);
            }
            if tier.source(&request.name).is_none() {
                return Err(Miss::NotFound);
            }
            retries += 1;
            match self.convert(tier, &conversion).await? {
                Converted::Persisted => continue,
                Converted::Direct(bytes) => return Ok(self.load(&conversion, bytes).await?),
            }
        }
    }

    /// Convert the source of `request`, holding the tier's lock for the
    /// converted name so one artifact is only ever produced once.
    async fn convert(&self, tier: &Tier, request: &ConversionRequest) -> Result<Converted> {
        let lock = tier.conversions.entry(request.converted.clone()).or_default().clone();
        let _guard = lock.lock().await;
        if tier.cached_path(&request.converted).is_some() {
            // Another key with the same artifact got here first.
            return Ok(Converted::Persisted);
        }
        let source = tier.source(&request.name).ok_or_else(|| ErrorKind::Conversion(request.name.to_string()))?;
        let bytes = source.backend.read(&source.path).await.or_raise(|| ErrorKind::Storage(tier.id().to_string()))?;
        tracing::info!(tier = tier.id(), name = %request.name, role = ?source.role, "Converting resource");
        let converted = self
            .creator
            .convert(request, bytes)
            .await
            .or_raise(|| ErrorKind::Conversion(request.name.to_string()))?;
        let Some(cache) = tier.backend(Role::Cache) else {
            tracing::info!(tier = tier.id(), name = %request.name, "Tier has no cache; using conversion directly");
            return Ok(Converted::Direct(converted));
        };
        let path = std::path::PathBuf::from(request.converted.as_str());
        cache.write(&path, &converted).await.or_raise(|| ErrorKind::Storage(tier.id().to_string()))?;
        tier.register_cached(&request.converted, path);
        Ok(Converted::Persisted)
    }

    async fn materialize(&self, tier: &Tier, request: &ConversionRequest, path: &std::path::Path) -> Result<CachedObject> {
        let cache = tier.backend(Role::Cache).ok_or_else(|| ErrorKind::Storage(tier.id().to_string()))?;
        let bytes = cache.read(path).await.or_raise(|| ErrorKind::Storage(tier.id().to_string()))?;
        self.load(request, bytes).await
    }

    async fn load(&self, request: &ConversionRequest, bytes: Vec<u8>) -> Result<CachedObject> {
        self.loader.load(request, bytes).await.or_raise(|| ErrorKind::Load(request.converted.to_string()))
    }

    /// Release every held object through the loader and forget all tier
    /// state. Safe to call repeatedly.
    pub async fn cleanup(&self) {
        let registry = self.registry.read().await;
        let mut released = 0usize;
        for tier in registry.tiers() {
            for object in tier.live_objects() {
                self.loader.release(&object);
                released += 1;
            }
            tier.clear();
        }
        tracing::info!(released, "Cleaned up resource cache");
    }

    /// Re-read every tier's listings.
    pub async fn refresh(&self) {
        let registry = self.registry.read().await;
        for tier in registry.tiers() {
            tier.read_file_list().await;
        }
    }

    /// Rediscover the tier layout. Finders built with [`new`](Self::new)
    /// have no layout and only refresh their listings.
    pub async fn rescan(&self) -> Result<()> {
        let Some((config, embedded)) = &self.layout else {
            self.refresh().await;
            return Ok(());
        };
        let registry = TierRegistry::scan(config, embedded.clone()).await?;
        self.cleanup().await;
        *self.registry.write().await = registry;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tier::{Capability, Priority};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use vlt_storage::StorageBackend;
    use vlt_storage::backend::MockBackend;

    #[derive(Default)]
    struct CountingCreator {
        conversions: AtomicUsize,
    }

    #[async_trait]
    impl ResourceCreator for CountingCreator {
        async fn convert(&self, _request: &ConversionRequest, source: Vec<u8>) -> Result<Vec<u8>> {
            self.conversions.fetch_add(1, Ordering::SeqCst);
            let mut out = b"converted:".to_vec();
            out.extend(source);
            Ok(out)
        }
    }

    #[derive(Default)]
    struct CountingLoader {
        released: AtomicUsize,
    }

    #[async_trait]
    impl ResourceLoader for CountingLoader {
        async fn load(&self, _request: &ConversionRequest, bytes: Vec<u8>) -> Result<CachedObject> {
            Ok(Arc::new(String::from_utf8_lossy(&bytes).into_owned()))
        }

        fn release(&self, _object: &CachedObject) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Fixture {
        finder: ResourceFinder,
        creator: Arc<CountingCreator>,
        loader: Arc<CountingLoader>,
        cache: MockBackend,
    }

    async fn fixture(design: &[(&str, &str)], cached: &[(&str, &str)]) -> Fixture {
        let to_files = |files: &[(&str, &str)]| {
            files.iter().map(|(p, d)| (p.to_string(), d.as_bytes().to_vec())).collect::<Vec<_>>()
        };
        let cache = MockBackend::with_files(to_files(cached));
        let tier = Tier::new("base", Priority::Normal)
            .with_capability(Capability::Design(Arc::new(MockBackend::with_files(to_files(design)))))
            .with_capability(Capability::Cache(Arc::new(cache.clone())));
        let registry = TierRegistry::from_tiers([tier]).await;
        let creator = Arc::new(CountingCreator::default());
        let loader = Arc::new(CountingLoader::default());
        let finder = ResourceFinder::new(registry, creator.clone(), loader.clone());
        Fixture { finder, creator, loader, cache }
    }

    fn texture(name: &str) -> ResourceRequest {
        ResourceRequest::new(name, ResourceKind::Texture)
    }

    #[tokio::test]
    async fn test_cached_artifact_needs_no_conversion() {
        let fx = fixture(&[], &[("foo.png.vlt", "ready")]).await;
        let object = fx.finder.get::<String>(&texture("foo.png")).await.unwrap();
        assert_eq!(object.as_str(), "ready");
        assert_eq!(fx.creator.conversions.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_source_is_converted_once_and_found_on_retry() {
        let fx = fixture(&[("foo.png", "png")], &[]).await;
        let object = fx.finder.get::<String>(&texture("foo.png")).await.unwrap();
        assert_eq!(object.as_str(), "converted:png");
        assert_eq!(fx.creator.conversions.load(Ordering::SeqCst), 1);
        assert_eq!(fx.cache.read(std::path::Path::new("foo.png.vlt")).await.unwrap(), b"converted:png");
        // Different parameters are a different object, but the artifact exists.
        let mipped = texture("FOO.PNG").with_param("mip", "1");
        assert!(fx.finder.get_resource(&mipped).await.is_some());
        assert!(fx.finder.get_resource(&texture("foo.png")).await.is_some());
        assert_eq!(fx.creator.conversions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_raw_cache_entry_is_served() {
        let fx = fixture(&[], &[("sounds/click.ogg", "ogg")]).await;
        let object = fx.finder.get::<String>(&ResourceRequest::new("sounds/click.ogg", ResourceKind::Sound)).await;
        assert_eq!(object.unwrap().as_str(), "ogg");
    }

    #[tokio::test]
    async fn test_missing_resource_is_none() {
        let fx = fixture(&[("a.png", "a")], &[]).await;
        assert!(fx.finder.get_resource(&texture("b.png")).await.is_none());
        assert_eq!(fx.creator.conversions.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_wrong_type_is_none() {
        let fx = fixture(&[], &[("a.png.vlt", "a")]).await;
        assert!(fx.finder.get::<Vec<u8>>(&texture("a.png")).await.is_none());
    }

    #[tokio::test]
    async fn test_tier_without_cache_loads_directly() {
        let design = MockBackend::with_files([("skin.mdt", b"mdt".to_vec())]);
        let tier = Tier::new("loose", Priority::Normal).with_capability(Capability::Design(Arc::new(design)));
        let creator = Arc::new(CountingCreator::default());
        let finder = ResourceFinder::new(TierRegistry::from_tiers([tier]).await, creator.clone(), Arc::new(BytesLoader));
        let object = finder.get::<Vec<u8>>(&texture("skin.mdt")).await.unwrap();
        assert_eq!(object.as_slice(), b"converted:mdt");
        assert!(finder.get_resource(&texture("skin.mdt")).await.is_some());
        assert_eq!(creator.conversions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cleanup_releases_objects_and_is_idempotent() {
        let fx = fixture(&[("a.png", "a")], &[("b.png.vlt", "b")]).await;
        fx.finder.get_resource(&texture("a.png")).await.unwrap();
        fx.finder.get_resource(&texture("b.png")).await.unwrap();
        fx.finder.cleanup().await;
        assert_eq!(fx.loader.released.load(Ordering::SeqCst), 2);
        fx.finder.cleanup().await;
        assert_eq!(fx.loader.released.load(Ordering::SeqCst), 2);
        // Listings are gone until refreshed.
        assert!(fx.finder.get_resource(&texture("b.png")).await.is_none());
        fx.finder.refresh().await;
        assert!(fx.finder.get_resource(&texture("b.png")).await.is_some());
    }

    #[tokio::test]
    async fn test_cleanup_with_no_tiers() {
        let finder = ResourceFinder::new(TierRegistry::default(), Arc::new(PassthroughCreator), Arc::new(BytesLoader));
        finder.cleanup().await;
        assert!(finder.get_resource(&texture("a.png")).await.is_none());
    }
}
