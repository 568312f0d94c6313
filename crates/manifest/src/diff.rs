//! Working out what has to change to turn one tree into another.

use crate::index::RecordIndex;

/// The three disjoint sets of work that take a local tree to a remote one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncPlan {
    /// Present remotely, absent locally.
    pub add: RecordIndex,
    /// Present on both sides with different content. Holds the remote record.
    pub replace: RecordIndex,
    /// Present locally only. Holds the local record.
    pub remove: RecordIndex,
}

impl SyncPlan {
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.replace.is_empty() && self.remove.is_empty()
    }

    /// Number of files to fetch.
    pub fn transfer_count(&self) -> usize {
        self.add.len() + self.replace.len()
    }

    /// Bytes to fetch.
    pub fn transfer_bytes(&self) -> u64 {
        self.add.total_bytes() + self.replace.total_bytes()
    }

    /// Whether the plan will (re)write `path`.
    pub fn writes(&self, path: &str) -> bool {
        self.add.get(path).is_some() || self.replace.get(path).is_some()
    }
}

/// Compare two manifests by content hash.
///
/// Tombstoned records on either side count as absent. Sizes and timestamps
/// are ignored: two files with the same hash are the same file.
pub fn find_difference(local: &RecordIndex, remote: &RecordIndex) -> SyncPlan {
    let mut plan = SyncPlan {
        add: RecordIndex::new(format!("{}+add", remote.name())),
        replace: RecordIndex::new(format!("{}+replace", remote.name())),
        remove: RecordIndex::new(format!("{}-remove", local.name())),
    };
    for record in remote.live() {
        match local.get_live(&record.path) {
            None => {
                plan.add.insert(record.clone());
            },
            Some(existing) if existing.hash != record.hash => {
                plan.replace.insert(record.clone());
            },
            Some(_) => {},
        }
    }
    for record in local.live() {
        if !remote.contains_live(&record.path) {
            plan.remove.insert(record.clone());
        }
    }
    tracing::debug!(
        add = plan.add.len(),
        replace = plan.replace.len(),
        remove = plan.remove.len(),
        "Computed difference"
    );
    plan
}
