//! Path validation and key normalization.
//!
//! Backends address files by paths relative to their root. Those paths must
//! never escape the root, and the resource finder and manifests compare them
//! case-insensitively, so this module also produces the canonical lowercase
//! key form used for lookups.

use std::path::{Component, Path, PathBuf};

use crate::error::{ErrorKind, Result};

/// Suffix appended to a file's path while it is being written and before it
/// has been verified. A file under its final name is always complete.
pub const STAGING_SUFFIX: &str = ".vltpart";

/// Validates a storage path for security and correctness.
/// Ensures that paths don't escape the storage root (no `..` traversal).
///
/// > **Note:** This does **not** normalize backslashes or case. Null bytes are
/// >           explicitly rejected.
///
/// # Examples
///
/// ```
/// use std::path::Path;
/// use vlt_storage::validate_path;
/// assert!(validate_path("textures/stone.png").is_ok());
/// assert!(validate_path("a/../model.mdt").is_ok()); // (never leaves the tier root)
/// assert!(validate_path("../etc/passwd").is_err());
/// assert!(validate_path("a/../../b").is_err());
/// assert!(validate_path("a\0b").is_err());
/// assert_eq!(
///     validate_path("wrong/../sounds/.//click.ogg/").unwrap(),
///     Path::new("sounds/click.ogg")
/// );
/// ```
pub fn validate(path: impl AsRef<Path>) -> Result<PathBuf> {
    let original = path.as_ref();
    let invalid = || exn::Exn::from(ErrorKind::InvalidPath(original.to_path_buf()));
    let mut kept = Vec::new();
    for component in original.components() {
        match component {
            // Null bytes pass through Path::components() on Unix but cause
            // truncation in C-based syscalls.
            Component::Normal(part) if part.as_encoded_bytes().contains(&0) => return Err(invalid()),
            Component::Normal(part) => kept.push(part),
            Component::CurDir | Component::RootDir => {},
            Component::ParentDir => {
                kept.pop().ok_or_else(invalid)?;
            },
            Component::Prefix(_) => return Err(invalid()),
        }
    }
    if kept.is_empty() {
        return Err(invalid());
    }
    Ok(kept.into_iter().collect())
}

/// Canonical lookup key for a relative path: validated, forward slashes,
/// lowercase.
///
/// ```
/// use vlt_storage::normalize_key;
/// assert_eq!(normalize_key("Textures/Stone.PNG").unwrap(), "textures/stone.png");
/// assert_eq!(normalize_key("./a//B.txt").unwrap(), "a/b.txt");
/// ```
pub fn normalize_key(path: impl AsRef<Path>) -> Result<String> {
    let validated = validate(path)?;
    let parts: Vec<String> =
        validated.components().map(|c| c.as_os_str().to_string_lossy().to_lowercase()).collect();
    Ok(parts.join("/"))
}

/// The staging path a file is written to before it is verified and renamed
/// onto `path`.
pub fn staging_path(path: impl AsRef<Path>) -> PathBuf {
    let mut staged = path.as_ref().as_os_str().to_owned();
    staged.push(STAGING_SUFFIX);
    PathBuf::from(staged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("textures/stone.png", "textures/stone.png")]
    #[case("a//b//c", "a/b/c")]
    #[case("a/./b/./c", "a/b/c")]
    #[case("a/b/..", "a")]
    #[case("models/", "models")]
    #[case("/leading/slash.txt", "leading/slash.txt")]
    fn test_valid_paths(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(validate(input).unwrap(), Path::new(expected));
    }

    #[rstest]
    #[case("../etc/passwd")]
    #[case("a/../../b")]
    #[case("..")]
    #[case("a\0b")]
    #[case("")]
    #[case(".")]
    #[case("//")]
    fn test_invalid_paths(#[case] input: &str) {
        let err = validate(input).unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidPath(_)));
    }

    #[test]
    fn test_normalize_key_lowercases() {
        assert_eq!(normalize_key("Mods/Elves/Bow.MDT").unwrap(), "mods/elves/bow.mdt");
    }

    #[test]
    fn test_staging_path() {
        assert_eq!(staging_path("a/b.txt"), Path::new("a/b.txt.vltpart"));
    }
}
