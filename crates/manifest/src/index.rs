//! In-memory manifest.

use std::collections::BTreeMap;

use crate::fingerprint::Fingerprint;
use crate::record::Record;

/// A named set of [`Record`]s keyed by their lowercase path.
///
/// Iteration order is the key order, so anything rendered from an index is
/// deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordIndex {
    name: String,
    records: BTreeMap<String, Record>,
}

impl RecordIndex {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), records: BTreeMap::new() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// Insert or replace a record, returning the one it displaced.
    pub fn insert(&mut self, record: Record) -> Option<Record> {
        self.records.insert(record.key(), record)
    }

    /// Remove by path (any casing).
    pub fn remove(&mut self, path: &str) -> Option<Record> {
        self.records.remove(&path.to_lowercase())
    }

    /// Look up by path (any casing), tombstones included.
    pub fn get(&self, path: &str) -> Option<&Record> {
        self.records.get(&path.to_lowercase())
    }

    /// Look up a record that is not tombstoned.
    pub fn get_live(&self, path: &str) -> Option<&Record> {
        self.get(path).filter(|r| r.is_live())
    }

    pub fn contains_live(&self, path: &str) -> bool {
        self.get_live(path).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Record> {
        self.records.values()
    }

    pub fn live(&self) -> impl Iterator<Item = &Record> {
        self.records.values().filter(|r| r.is_live())
    }

    /// Number of records, tombstones included.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn live_len(&self) -> usize {
        self.live().count()
    }

    /// Sum of live record sizes.
    pub fn total_bytes(&self) -> u64 {
        self.live().map(|r| r.size).sum()
    }

    /// Live content as key → hash, for comparing two trees by content.
    pub fn fingerprints(&self) -> BTreeMap<String, Fingerprint> {
        self.live().map(|r| (r.key(), r.hash)).collect()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}

impl Extend<Record> for RecordIndex {
    fn extend<I: IntoIterator<Item = Record>>(&mut self, iter: I) {
        for record in iter {
            self.insert(record);
        }
    }
}

impl IntoIterator for RecordIndex {
    type Item = Record;
    type IntoIter = std::collections::btree_map::IntoValues<String, Record>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.into_values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::OffsetDateTime;

    fn record(path: &str, content: &[u8]) -> Record {
        Record::new(path, Fingerprint::of(content), content.len() as u64, OffsetDateTime::UNIX_EPOCH).unwrap()
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        let mut index = RecordIndex::new("local");
        index.insert(record("Textures/Stone.png", b"stone"));
        assert!(index.contains_live("textures/stone.PNG"));
        assert_eq!(index.get("TEXTURES/STONE.PNG").unwrap().path, "Textures/Stone.png");
    }

    #[test]
    fn test_replacing_keeps_one_entry_per_key() {
        let mut index = RecordIndex::new("local");
        index.insert(record("a.txt", b"1"));
        let old = index.insert(record("A.txt", b"2")).unwrap();
        assert_eq!(old.hash, Fingerprint::of(b"1"));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_tombstones_are_not_live() {
        let mut index = RecordIndex::new("remote");
        index.insert(record("a.txt", b"1"));
        index.insert(record("b.txt", b"22").tombstone());
        assert_eq!(index.len(), 2);
        assert_eq!(index.live_len(), 1);
        assert_eq!(index.total_bytes(), 1);
        assert!(!index.contains_live("b.txt"));
        assert_eq!(index.fingerprints().len(), 1);
    }
}
