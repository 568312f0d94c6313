//! Storage tiers for vlt.
//!
//! Every place a named resource can live (an on-disk cache directory, an
//! artist's design folder, a packaged archive, assets compiled into the
//! binary, a remote mirror) is exposed through the same [`StorageBackend`]
//! trait. The resource finder and the sync engine only ever talk to this
//! trait, so a tier can be swapped for another without either of them
//! noticing.

pub mod archive;
pub mod backend;
pub mod error;
pub mod file;
mod path;

pub use crate::backend::StorageBackend;
pub use crate::file::FileInfo;
pub use crate::path::{normalize_key, staging_path, validate as validate_path, STAGING_SUFFIX};
use std::sync::Arc;

pub type BackendHandle = Arc<dyn StorageBackend + Send + Sync>;
