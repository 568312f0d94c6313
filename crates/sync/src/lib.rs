//! Keeping file trees in step.
//!
//! Two ways to move files, both driven by manifests (see `vlt-manifest`):
//!
//! - [`Updater`] copies from a source tier to a destination tier file by
//!   file, verifying every copy and journalling progress so an interrupted
//!   run can be picked up again;
//! - [`Patcher`] publishes a tree as compressed patch archives plus an
//!   index, and applies them elsewhere.

pub mod error;
pub mod journal;
mod patcher;
mod status;
mod updater;

pub use crate::journal::{LoadSource, Loaded, ManifestStore};
pub use crate::patcher::{ARCHIVE_CACHE_DIR, Patcher, PullReport, PushReport};
pub use crate::status::{Phase, StatusSnapshot, SyncStatus};
pub use crate::updater::{NoHooks, SyncOutcome, UpdateHooks, Updater};
