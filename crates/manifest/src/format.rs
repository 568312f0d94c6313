//! Persisted manifest formats.
//!
//! Two encodings are supported:
//!
//! - **lines**: one record per line, `<hash> <modified-ms> <size> <path>`,
//!   with the path running to the end of the line so it may contain spaces.
//!   An optional first line `#vlt-manifest 1 <name>` carries the index name.
//!   Tombstones and archive references are not representable and are
//!   dropped on write.
//! - **json**: `{"name": …, "version": 1, "records": [ … ]}`, used for
//!   remote patch indexes where tombstones and archive references matter.
//!
//! Both reject duplicate paths (compared case-insensitively) as corruption.

use std::path::Path;

use exn::ResultExt;
use serde::{Deserialize, Serialize};
use vlt_storage::StorageBackend;

use crate::error::{ErrorKind, Result};
use crate::fingerprint::Fingerprint;
use crate::index::RecordIndex;
use crate::record::{Record, from_unix_millis};

pub const LINES_HEADER: &str = "#vlt-manifest";
pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestFormat {
    Lines,
    Json,
}
impl ManifestFormat {
    /// `.json` files are JSON documents, everything else is the line format.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => Self::Json,
            _ => Self::Lines,
        }
    }
}

fn corrupt(message: impl Into<String>) -> exn::Exn<ErrorKind> {
    exn::Exn::from(ErrorKind::Corrupt(message.into()))
}

/// Encode one record in the line format (no trailing newline).
pub fn encode_record(record: &Record) -> String {
    format!("{} {} {} {}", record.hash, record.modified_ms(), record.size, record.path)
}

/// Decode one line-format record.
pub fn decode_record(line: &str) -> Result<Record> {
    let mut fields = line.splitn(4, ' ');
    let (Some(hash), Some(modified), Some(size), Some(path)) = (fields.next(), fields.next(), fields.next(), fields.next())
    else {
        return Err(corrupt(format!("expected 4 fields in `{line}`")));
    };
    let hash = hash.parse::<Fingerprint>().or_raise(|| ErrorKind::Corrupt(format!("bad hash in `{line}`")))?;
    let modified = modified
        .parse::<i64>()
        .ok()
        .and_then(from_unix_millis)
        .ok_or_else(|| corrupt(format!("bad timestamp in `{line}`")))?;
    let size = size.parse::<u64>().or_raise(|| ErrorKind::Corrupt(format!("bad size in `{line}`")))?;
    Record::new(path, hash, size, modified).or_raise(|| ErrorKind::Corrupt(format!("bad path in `{line}`")))
}

pub fn parse_lines(text: &str, default_name: &str) -> Result<RecordIndex> {
    let mut index = RecordIndex::new(default_name);
    let mut lines = text.lines().enumerate().peekable();
    if let Some((_, first)) = lines.peek()
        && let Some(header) = first.strip_prefix(LINES_HEADER)
    {
        let mut parts = header.trim_start().splitn(2, ' ');
        match parts.next().map(str::parse::<u32>) {
            Some(Ok(FORMAT_VERSION)) => {},
            _ => return Err(corrupt(format!("unsupported manifest header `{first}`"))),
        }
        if let Some(name) = parts.next().map(str::trim).filter(|n| !n.is_empty()) {
            index.set_name(name);
        }
        lines.next();
    }
    for (number, line) in lines {
        if line.trim().is_empty() {
            continue;
        }
        let record = decode_record(line).or_raise(|| ErrorKind::Corrupt(format!("line {}", number + 1)))?;
        if let Some(previous) = index.insert(record) {
            return Err(corrupt(format!("duplicate path `{}` on line {}", previous.path, number + 1)));
        }
    }
    Ok(index)
}

pub fn render_lines(index: &RecordIndex) -> String {
    let mut out = format!("{LINES_HEADER} {FORMAT_VERSION} {}\n", index.name());
    for record in index.live() {
        out.push_str(&encode_record(record));
        out.push('\n');
    }
    out
}

#[derive(Deserialize)]
struct Document {
    name: String,
    version: u32,
    records: Vec<Record>,
}

#[derive(Serialize)]
struct DocumentRef<'a> {
    name: &'a str,
    version: u32,
    records: Vec<&'a Record>,
}

pub fn parse_json(bytes: &[u8]) -> Result<RecordIndex> {
    let document: Document =
        serde_json::from_slice(bytes).or_raise(|| ErrorKind::Corrupt("invalid JSON manifest".to_string()))?;
    if document.version != FORMAT_VERSION {
        return Err(corrupt(format!("unsupported manifest version {}", document.version)));
    }
    let mut index = RecordIndex::new(document.name);
    for record in document.records {
        let record = Record::new(&record.path, record.hash, record.size, record.modified)
            .map(|r| Record { deleted: record.deleted, archive: record.archive.clone(), ..r })
            .or_raise(|| ErrorKind::Corrupt(format!("bad path `{}`", record.path)))?;
        if let Some(previous) = index.insert(record) {
            return Err(corrupt(format!("duplicate path `{}`", previous.path)));
        }
    }
    Ok(index)
}

pub fn render_json(index: &RecordIndex) -> Result<Vec<u8>> {
    let document = DocumentRef { name: index.name(), version: FORMAT_VERSION, records: index.iter().collect() };
    serde_json::to_vec_pretty(&document).or_raise(|| ErrorKind::Corrupt("could not serialize manifest".to_string()))
}

pub fn decode(bytes: &[u8], format: ManifestFormat, default_name: &str) -> Result<RecordIndex> {
    match format {
        ManifestFormat::Json => parse_json(bytes),
        ManifestFormat::Lines => {
            let text = std::str::from_utf8(bytes).or_raise(|| ErrorKind::Corrupt("manifest is not UTF-8".to_string()))?;
            parse_lines(text, default_name)
        },
    }
}

pub fn encode(index: &RecordIndex, format: ManifestFormat) -> Result<Vec<u8>> {
    match format {
        ManifestFormat::Json => render_json(index),
        ManifestFormat::Lines => Ok(render_lines(index).into_bytes()),
    }
}

/// Load a manifest from a tier. A missing file is `Ok(None)`; an unreadable
/// or unparseable one is an error.
pub async fn load(backend: &dyn StorageBackend, path: &Path, format: ManifestFormat) -> Result<Option<RecordIndex>> {
    let bytes = match backend.read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.is_not_found() => return Ok(None),
        Err(e) => return Err(e).or_raise(|| ErrorKind::Storage),
    };
    decode(&bytes, format, backend.name()).map(Some)
}

/// Persist a manifest atomically: the encoded bytes go to a staging file
/// that is then renamed over `path`, so readers see the old or the new
/// manifest and never a torn one.
#[tracing::instrument(skip(backend, index), fields(backend = backend.name(), records = index.len()))]
pub async fn save(backend: &dyn StorageBackend, path: &Path, index: &RecordIndex, format: ManifestFormat) -> Result<()> {
    let bytes = encode(index, format)?;
    let staging = vlt_storage::staging_path(path);
    backend.write(&staging, &bytes).await.or_raise(|| ErrorKind::Storage)?;
    backend.rename(&staging, path).await.or_raise(|| ErrorKind::Storage)?;
    tracing::debug!(path = %path.display(), "Saved manifest");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use time::OffsetDateTime;
    use vlt_storage::backend::MockBackend;

    fn record(path: &str, content: &[u8]) -> Record {
        Record::new(path, Fingerprint::of(content), content.len() as u64, from_unix_millis(1_000).unwrap()).unwrap()
    }

    #[test]
    fn test_line_with_spaces_in_path() {
        let line = "0cc175b9c0f1b6a831c399e269772661 1500 1 sounds/door open.ogg";
        let record = decode_record(line).unwrap();
        assert_eq!(record.path, "sounds/door open.ogg");
        assert_eq!(record.size, 1);
        assert_eq!(record.modified_ms(), 1500);
        assert_eq!(encode_record(&record), line);
    }

    #[test]
    fn test_lines_document_keeps_name_and_records() {
        let mut index = RecordIndex::new("base");
        index.insert(record("b.txt", b"b"));
        index.insert(record("a.txt", b"a"));
        index.insert(record("gone.txt", b"g").tombstone());
        let text = render_lines(&index);
        assert!(text.starts_with("#vlt-manifest 1 base\n"));
        let parsed = parse_lines(&text, "other").unwrap();
        assert_eq!(parsed.name(), "base");
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed.fingerprints(), index.fingerprints());
    }

    #[test]
    fn test_headerless_lines_use_default_name() {
        let parsed = parse_lines("0cc175b9c0f1b6a831c399e269772661 0 1 a.txt\n\n", "fallback").unwrap();
        assert_eq!(parsed.name(), "fallback");
        assert_eq!(parsed.len(), 1);
    }

    #[rstest]
    #[case("0cc175b9c0f1b6a831c399e269772661 0 1")]
    #[case("nothex 0 1 a.txt")]
    #[case("0cc175b9c0f1b6a831c399e269772661 soon 1 a.txt")]
    #[case("0cc175b9c0f1b6a831c399e269772661 0 -1 a.txt")]
    #[case("0cc175b9c0f1b6a831c399e269772661 0 1 ../a.txt")]
    #[case("0cc175b9c0f1b6a831c399e269772661 0 1 a.txt\n0cc175b9c0f1b6a831c399e269772661 0 1 A.TXT")]
    #[case("#vlt-manifest 9 future\n")]
    fn test_corrupt_lines(#[case] text: &str) {
        let err = parse_lines(text, "x").unwrap_err();
        assert!(matches!(&*err, ErrorKind::Corrupt(_)));
    }

    #[test]
    fn test_json_keeps_tombstones_and_archives() {
        let mut index = RecordIndex::new("remote");
        index.insert(record("a.txt", b"a").with_archive("patches/patch-1.tar.gz"));
        index.insert(record("b.txt", b"b").tombstone());
        let parsed = parse_json(&render_json(&index).unwrap()).unwrap();
        assert_eq!(parsed, index);
    }

    #[test]
    fn test_json_duplicates_are_corrupt() {
        let json = br#"{"name":"r","version":1,"records":[
            {"path":"a.txt","hash":"0cc175b9c0f1b6a831c399e269772661","size":1,"modified":0},
            {"path":"A.txt","hash":"0cc175b9c0f1b6a831c399e269772661","size":1,"modified":0}
        ]}"#;
        let err = parse_json(json).unwrap_err();
        assert!(matches!(&*err, ErrorKind::Corrupt(_)));
    }

    #[tokio::test]
    async fn test_save_then_load_through_backend() {
        let backend = MockBackend::default();
        let path = Path::new(".vlt/manifest");
        assert!(load(&backend, path, ManifestFormat::Lines).await.unwrap().is_none());
        let mut index = RecordIndex::new("dest");
        index.insert(Record::new("x.bin", Fingerprint::of(b"x"), 1, OffsetDateTime::UNIX_EPOCH).unwrap());
        save(&backend, path, &index, ManifestFormat::Lines).await.unwrap();
        assert_eq!(backend.paths(), vec![Path::new(".vlt/manifest").to_path_buf()]);
        let loaded = load(&backend, path, ManifestFormat::Lines).await.unwrap().unwrap();
        assert_eq!(loaded, index);
    }
}
