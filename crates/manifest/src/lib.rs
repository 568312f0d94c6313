//! File manifests.
//!
//! A manifest ([`RecordIndex`]) lists every file of a tree with its MD5
//! fingerprint, size and modification time. Two manifests are compared with
//! [`find_difference`] to get the [`SyncPlan`] that turns one tree into the
//! other.

pub mod copy;
pub mod diff;
pub mod error;
pub mod fingerprint;
pub mod format;
pub mod index;
pub mod record;
pub mod scan;

pub use crate::copy::{Copied, DEFAULT_CHUNK_SIZE, copy_between, copy_with_md5};
pub use crate::diff::{SyncPlan, find_difference};
pub use crate::fingerprint::Fingerprint;
pub use crate::format::ManifestFormat;
pub use crate::index::RecordIndex;
pub use crate::record::Record;
pub use crate::scan::{ScanOptions, scan_backend, scan_directory};
