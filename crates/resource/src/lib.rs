//! Tiered resource lookup.
//!
//! A request names a resource; the [`TierRegistry`] picks the first tier
//! allowed to serve it, and the [`ResourceFinder`] hands back a loaded
//! object, converting the source file into the tier's cache first when no
//! converted artifact exists yet.

pub mod error;
mod finder;
mod name;
mod registry;
mod tier;

pub use crate::finder::{
    BytesLoader, CachedObject, ConversionRequest, PassthroughCreator, ResourceCreator, ResourceFinder, ResourceLoader,
};
pub use crate::name::{CONVERTED_SUFFIX, CacheKey, IMAGE_EXTENSIONS, ResourceKind, ResourceName, ResourceRequest};
pub use crate::registry::{EMBEDDED_TIER, MODS_DIR, TierRegistry};
pub use crate::tier::{Capability, Priority, Role, Tier};
