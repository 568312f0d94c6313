//! A single manifest entry.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::{ErrorKind, Result};
use crate::fingerprint::Fingerprint;

/// What a manifest knows about one file.
///
/// `path` keeps the spelling the file was found under (forward slashes) and
/// is what I/O uses; comparisons go through [`Record::key`], the lowercase
/// form. Records are values: an update replaces the whole record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub path: String,
    pub hash: Fingerprint,
    pub size: u64,
    #[serde(with = "unix_millis")]
    pub modified: OffsetDateTime,
    /// Tombstone: the file was removed upstream. Counts as absent.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
    /// Name of the patch archive carrying this revision of the file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive: Option<String>,
}

impl Record {
    /// Build a record, normalizing `path` to a validated forward-slash form.
    pub fn new(path: impl AsRef<Path>, hash: Fingerprint, size: u64, modified: OffsetDateTime) -> Result<Self> {
        Ok(Self {
            path: normalize_path(path.as_ref())?,
            hash,
            size,
            modified,
            deleted: false,
            archive: None,
        })
    }

    /// Case-insensitive identity of the record.
    pub fn key(&self) -> String {
        self.path.to_lowercase()
    }

    pub fn rel_path(&self) -> PathBuf {
        PathBuf::from(&self.path)
    }

    pub fn is_live(&self) -> bool {
        !self.deleted
    }

    pub fn tombstone(self) -> Self {
        Self { deleted: true, archive: None, ..self }
    }

    pub fn with_archive(self, archive: impl Into<String>) -> Self {
        Self { archive: Some(archive.into()), ..self }
    }

    /// Modification time as unix milliseconds, the precision manifests keep.
    pub fn modified_ms(&self) -> i64 {
        (self.modified.unix_timestamp_nanos() / 1_000_000) as i64
    }
}

/// Validated, forward-slash form of a relative path.
pub(crate) fn normalize_path(path: &Path) -> Result<String> {
    let validated =
        vlt_storage::validate_path(path).map_err(|_| ErrorKind::InvalidPath(path.to_string_lossy().into_owned()))?;
    let parts: Vec<_> = validated.components().map(|c| c.as_os_str().to_string_lossy().into_owned()).collect();
    Ok(parts.join("/"))
}

pub(crate) fn from_unix_millis(ms: i64) -> Option<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(ms as i128 * 1_000_000).ok()
}

mod unix_millis {
    use serde::{Deserialize, Deserializer, Serializer, de};
    use time::OffsetDateTime;

    pub fn serialize<S: Serializer>(value: &OffsetDateTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64((value.unix_timestamp_nanos() / 1_000_000) as i64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<OffsetDateTime, D::Error> {
        let ms = i64::deserialize(deserializer)?;
        super::from_unix_millis(ms).ok_or_else(|| de::Error::custom(format!("timestamp {ms} out of range")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_are_normalized_and_keyed_lowercase() {
        let record = Record::new("./Textures//Stone.PNG", Fingerprint::of(b"x"), 1, OffsetDateTime::UNIX_EPOCH).unwrap();
        assert_eq!(record.path, "Textures/Stone.PNG");
        assert_eq!(record.key(), "textures/stone.png");
    }

    #[test]
    fn test_escaping_paths_are_rejected() {
        let err = Record::new("../x", Fingerprint::of(b"x"), 1, OffsetDateTime::UNIX_EPOCH).unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidPath(_)));
    }

    #[test]
    fn test_json_shape() {
        let modified = from_unix_millis(1_700_000_000_123).unwrap();
        let record = Record::new("a.txt", Fingerprint::of(b"a"), 1, modified).unwrap();
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "path": "a.txt",
                "hash": "0cc175b9c0f1b6a831c399e269772661",
                "size": 1,
                "modified": 1_700_000_000_123i64,
            })
        );
        let tombstone: Record = serde_json::from_value(serde_json::json!({
            "path": "a.txt",
            "hash": "0cc175b9c0f1b6a831c399e269772661",
            "size": 1,
            "modified": 0,
            "deleted": true,
        }))
        .unwrap();
        assert!(!tombstone.is_live());
        assert_eq!(record.modified_ms(), 1_700_000_000_123);
    }
}
