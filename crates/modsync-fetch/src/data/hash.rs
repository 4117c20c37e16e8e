use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Longest hash string accepted from the wire or from callers.
pub const MAX_HASH_LEN: usize = 128;

/// A content hash in its canonical form: trimmed, upper-case hex.
///
/// Hashes are compared case-insensitively everywhere, so normalizing once
/// at the boundary lets the rest of the engine use plain equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentHash(String);

impl ContentHash {
    pub fn parse(s: &str) -> Result<Self, Error> { s.parse() }

    pub fn as_str(&self) -> &str { &self.0 }
}

impl FromStr for ContentHash {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || s.len() > MAX_HASH_LEN {
            return Err(Error::InvalidHash(s.to_string()));
        }
        if !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::InvalidHash(s.to_string()));
        }
        Ok(Self(s.to_ascii_uppercase()))
    }
}

impl TryFrom<String> for ContentHash {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> { value.parse() }
}

impl From<ContentHash> for String {
    fn from(hash: ContentHash) -> Self { hash.0 }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_normalizes_case() {
        let hash: ContentHash = " abCDef01 ".parse().unwrap();
        assert_eq!(hash.as_str(), "ABCDEF01");
        assert_eq!(hash, ContentHash::parse("abcdef01").unwrap());
    }

    #[test]
    fn test_parse_rejects_invalid() {
        assert!(ContentHash::parse("").is_err());
        assert!(ContentHash::parse("xyz").is_err());
        assert!(ContentHash::parse("AB:CD").is_err());
        assert!(ContentHash::parse(&"A".repeat(MAX_HASH_LEN + 1)).is_err());
    }

    #[test]
    fn test_serde_round_trip() {
        let hash: ContentHash = serde_json::from_str("\"ff00\"").unwrap();
        assert_eq!(hash.as_str(), "FF00");
        assert_eq!(serde_json::to_string(&hash).unwrap(), "\"FF00\"");
        assert!(serde_json::from_str::<ContentHash>("\"nothex\"").is_err());
    }
}
