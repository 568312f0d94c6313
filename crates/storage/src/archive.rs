//! Gzip-compressed tar packaging.
//!
//! Packaged tiers and patch archives share one container format: a plain
//! tar stream of regular files wrapped in gzip. Directories, links and other
//! entry types are skipped on read and never written.

use std::collections::HashSet;
use std::io::Read;
use std::path::{Path, PathBuf};

use exn::ResultExt;
use flate2::{Compression, read::GzDecoder, write::GzEncoder};
use tar::{EntryType, Header};
use time::OffsetDateTime;

use crate::error::{ErrorKind, Result};
use crate::path::{normalize_key, validate as validate_path};

/// A regular file read out of an archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveMember {
    /// Validated relative path, spelled as stored in the archive.
    pub path: PathBuf,
    pub modified: OffsetDateTime,
    pub data: Vec<u8>,
}

fn archive_error(context: impl std::fmt::Display) -> impl FnOnce() -> ErrorKind {
    let message = context.to_string();
    move || ErrorKind::Archive(message)
}

/// Package `entries` (relative path, content) into an in-memory `.tar.gz`.
pub fn pack<P: AsRef<Path>>(entries: impl IntoIterator<Item = (P, Vec<u8>)>) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    let mtime = OffsetDateTime::now_utc().unix_timestamp().max(0) as u64;
    for (path, data) in entries {
        let path = validate_path(path)?;
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_mode(0o644);
        header.set_mtime(mtime);
        header.set_uid(0);
        header.set_gid(0);
        header.set_size(data.len() as u64);
        builder
            .append_data(&mut header, &path, data.as_slice())
            .or_raise(archive_error(format!("could not add `{}`", path.display())))?;
    }
    let encoder = builder.into_inner().or_raise(archive_error("could not finish tar stream"))?;
    Ok(encoder.finish().or_raise(archive_error("could not finish gzip stream"))?)
}

/// Read regular files out of a `.tar.gz` stream.
///
/// With `wanted`, only members whose normalized key is in the set are
/// returned; everything else is skipped without being buffered. Members
/// whose path would escape the extraction root are rejected.
pub fn unpack(reader: impl Read, wanted: Option<&HashSet<String>>) -> Result<Vec<ArchiveMember>> {
    let mut archive = tar::Archive::new(GzDecoder::new(reader));
    let mut members = Vec::new();
    let entries = archive.entries().or_raise(archive_error("could not read archive"))?;
    for entry in entries {
        let mut entry = entry.or_raise(archive_error("corrupt archive entry"))?;
        if entry.header().entry_type() != EntryType::Regular {
            continue;
        }
        let raw = entry.path().or_raise(archive_error("unreadable member name"))?.into_owned();
        let path = validate_path(&raw)?;
        if let Some(wanted) = wanted
            && !wanted.contains(&normalize_key(&path)?)
        {
            continue;
        }
        let modified = entry
            .header()
            .mtime()
            .ok()
            .and_then(|secs| OffsetDateTime::from_unix_timestamp(secs as i64).ok())
            .unwrap_or(OffsetDateTime::UNIX_EPOCH);
        let mut data = Vec::with_capacity(entry.size() as usize);
        entry
            .read_to_end(&mut data)
            .or_raise(archive_error(format!("could not read member `{}`", path.display())))?;
        members.push(ArchiveMember { path, modified, data });
    }
    Ok(members)
}
