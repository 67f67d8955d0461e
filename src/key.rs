//! Content keys: BLAKE3 digests naming chunks and files.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::StorageError;

/// Number of hex characters of a key used in URL paths.
pub const KEY_PREFIX_LEN: usize = 16;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentKey([u8; 32]);

impl ContentKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Key of a single buffer.
    pub fn digest(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short form used for routing (`/file/<prefix>`).
    pub fn prefix(&self) -> String {
        hex::encode(&self.0[..KEY_PREFIX_LEN / 2])
    }

    pub fn parse(s: &str) -> Result<Self, StorageError> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s.trim(), &mut bytes)
            .map_err(|_| StorageError::InvalidKey(s.to_string()))?;
        Ok(Self(bytes))
    }
}

impl From<blake3::Hash> for ContentKey {
    fn from(hash: blake3::Hash) -> Self {
        Self(*hash.as_bytes())
    }
}

impl FromStr for ContentKey {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentKey({})", self.prefix())
    }
}

impl Serialize for ContentKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ContentKey::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_roundtrip() {
        let key = ContentKey::digest(b"hello world");
        let hex = key.to_hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(ContentKey::parse(&hex).unwrap(), key);
    }

    #[test]
    fn test_prefix() {
        let key = ContentKey::digest(b"hello world");
        assert_eq!(key.prefix().len(), KEY_PREFIX_LEN);
        assert!(key.to_hex().starts_with(&key.prefix()));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(ContentKey::parse("not-a-key").is_err());
        assert!(ContentKey::parse("abcd").is_err());
    }

    #[test]
    fn test_json_is_hex_string() {
        let key = ContentKey::digest(b"x");
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, format!("\"{}\"", key.to_hex()));
    }
}
