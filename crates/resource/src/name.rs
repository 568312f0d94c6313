//! Resource identities.
//!
//! Names are case-insensitive: a [`ResourceName`] is always lowercase with
//! forward slashes. A name also has a *converted* form, the name its
//! processed artifact is cached under. Both are valid lookup keys.

use std::collections::BTreeMap;
use std::fmt;

/// Extensions whose converted artifact gains a `.vlt` suffix.
pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "tga", "bmp", "gif", "dds"];
/// Suffix of converted image artifacts.
pub const CONVERTED_SUFFIX: &str = "vlt";
/// Legacy texture tag, rewritten to `tga` before conversion.
const LEGACY_TEXTURE_EXTENSION: &str = "mdt";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceName(String);

impl ResourceName {
    /// Normalize a raw name: lowercase, `\` becomes `/`, empty and `.`
    /// segments dropped.
    pub fn new(raw: &str) -> Self {
        let lowered = raw.replace('\\', "/").to_lowercase();
        let parts: Vec<&str> = lowered.split('/').filter(|part| !part.is_empty() && *part != ".").collect();
        Self(parts.join("/"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn split_extension(&self) -> (&str, Option<&str>) {
        let file_start = self.0.rfind('/').map_or(0, |i| i + 1);
        match self.0[file_start..].rfind('.') {
            // A leading dot is a hidden file, not an extension.
            Some(0) | None => (&self.0, None),
            Some(dot) => (&self.0[..file_start + dot], Some(&self.0[file_start + dot + 1..])),
        }
    }

    pub fn extension(&self) -> Option<&str> {
        self.split_extension().1
    }

    /// The name the converted artifact is cached under.
    ///
    /// ```
    /// use vlt_resource::ResourceName;
    /// assert_eq!(ResourceName::new("Foo.PNG").converted().as_str(), "foo.png.vlt");
    /// assert_eq!(ResourceName::new("skin.mdt").converted().as_str(), "skin.tga.vlt");
    /// assert_eq!(ResourceName::new("click.ogg").converted().as_str(), "click.ogg");
    /// ```
    pub fn converted(&self) -> ResourceName {
        let (stem, extension) = self.split_extension();
        match extension {
            Some(LEGACY_TEXTURE_EXTENSION) => Self(format!("{stem}.tga.{CONVERTED_SUFFIX}")),
            Some(ext) if IMAGE_EXTENSIONS.contains(&ext) => Self(format!("{}.{CONVERTED_SUFFIX}", self.0)),
            _ => self.clone(),
        }
    }

    pub fn is_converted_form(&self) -> bool {
        self.converted() == *self
    }
}

impl fmt::Display for ResourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceName {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl AsRef<str> for ResourceName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// What the caller intends to do with a resource; part of the cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum ResourceKind {
    Texture,
    Mesh,
    Sound,
    Shader,
    #[default]
    Raw,
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRequest {
    pub name: ResourceName,
    /// Only tiers without a mod tag, or with this one, may serve the request.
    pub mod_tag: Option<String>,
    pub kind: ResourceKind,
    /// Loader parameters (e.g. mip level); different parameters are cached
    /// separately.
    pub params: BTreeMap<String, String>,
}

impl ResourceRequest {
    pub fn new(name: impl Into<ResourceName>, kind: ResourceKind) -> Self {
        Self { name: name.into(), mod_tag: None, kind, params: BTreeMap::new() }
    }

    pub fn with_mod(mut self, tag: impl Into<String>) -> Self {
        self.mod_tag = Some(tag.into().to_lowercase());
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

/// Identity of a cached object within a tier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub converted: ResourceName,
    pub kind: ResourceKind,
    pub params: BTreeMap<String, String>,
}

impl CacheKey {
    pub fn for_request(request: &ResourceRequest) -> Self {
        Self { converted: request.name.converted(), kind: request.kind.clone(), params: request.params.clone() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("Textures\\Stone.PNG", "textures/stone.png")]
    #[case("/a//b/./c.txt", "a/b/c.txt")]
    #[case("MODS/Elves/Bow.MDT", "mods/elves/bow.mdt")]
    fn test_normalization(#[case] raw: &str, #[case] expected: &str) {
        assert_eq!(ResourceName::new(raw).as_str(), expected);
    }

    #[rstest]
    #[case("foo.png", "foo.png.vlt")]
    #[case("a/b.JPEG", "a/b.jpeg.vlt")]
    #[case("skin.mdt", "skin.tga.vlt")]
    #[case("models/skin.tga", "models/skin.tga.vlt")]
    #[case("foo.png.vlt", "foo.png.vlt")]
    #[case("sounds/click.ogg", "sounds/click.ogg")]
    #[case("noextension", "noextension")]
    #[case("dir.png/.hidden", "dir.png/.hidden")]
    fn test_converted_names(#[case] raw: &str, #[case] expected: &str) {
        assert_eq!(ResourceName::new(raw).converted().as_str(), expected);
    }

    #[test]
    fn test_cache_key_separates_params() {
        let plain = ResourceRequest::new("a.png", ResourceKind::Texture);
        let mipped = plain.clone().with_param("mip", "2");
        assert_ne!(CacheKey::for_request(&plain), CacheKey::for_request(&mipped));
        assert_eq!(CacheKey::for_request(&plain).converted.as_str(), "a.png.vlt");
    }
}
