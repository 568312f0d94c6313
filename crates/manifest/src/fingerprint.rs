//! MD5 content fingerprints.

use std::fmt;
use std::str::FromStr;

use derive_more::{Display, Error};
use serde::{Deserialize, Deserializer, Serialize, Serializer, de};

/// The MD5 digest of a file's content.
///
/// Always rendered as exactly 32 lowercase hex digits, leading zeros kept.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 16]);

impl Fingerprint {
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Fingerprint an in-memory buffer.
    pub fn of(data: impl AsRef<[u8]>) -> Self {
        md5::compute(data).into()
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl From<md5::Digest> for Fingerprint {
    fn from(digest: md5::Digest) -> Self {
        Self(digest.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({self})")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Display, Error)]
#[display("`{_0}` is not a 32 digit hex MD5 digest")]
pub struct InvalidFingerprint(#[error(not(source))] pub String);

impl FromStr for Fingerprint {
    type Err = InvalidFingerprint;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidFingerprint(s.to_string());
        if s.len() != 32 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(invalid());
        }
        let mut bytes = [0u8; 16];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16).map_err(|_| invalid())?;
        }
        Ok(Self(bytes))
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(b"", "d41d8cd98f00b204e9800998ecf8427e")]
    #[case(b"a", "0cc175b9c0f1b6a831c399e269772661")]
    #[case(b"The quick brown fox jumps over the lazy dog", "9e107d9d372bb6826bd81d3542a419d6")]
    fn test_known_digests(#[case] input: &[u8], #[case] expected: &str) {
        assert_eq!(Fingerprint::of(input).to_string(), expected);
    }

    #[test]
    fn test_leading_zeros_are_kept() {
        let fp = Fingerprint::from_bytes([0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15]);
        assert_eq!(fp.to_string(), "000102030405060708090a0b0c0d0e0f");
        assert_eq!("000102030405060708090a0b0c0d0e0f".parse::<Fingerprint>().unwrap(), fp);
    }

    #[rstest]
    #[case("")]
    #[case("abc")]
    #[case("zz1d8cd98f00b204e9800998ecf8427e")]
    #[case("d41d8cd98f00b204e9800998ecf8427e0")]
    fn test_rejects_malformed(#[case] input: &str) {
        assert!(input.parse::<Fingerprint>().is_err());
    }
}
