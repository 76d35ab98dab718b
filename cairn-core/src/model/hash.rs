use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};

/// Lowercase hex SHA-256 digest identifying a piece of content.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(try_from = "String", into = "String")]
pub struct ContentHash(String);

impl ContentHash {
    /// Length of the hex encoding.
    pub const HEX_LEN: usize = 64;

    pub fn from_digest(digest: &[u8]) -> Self {
        Self(hex::encode(digest))
    }

    /// Accepts upper or lower case hex and normalises to lower case.
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.len() != Self::HEX_LEN
            || !trimmed.bytes().all(|b| b.is_ascii_hexdigit())
        {
            return Err(SyncError::InvalidInput(format!(
                "not a sha-256 hex digest: {raw:?}"
            )));
        }
        Ok(Self(trimmed.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ContentHash {
    type Error = SyncError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<ContentHash> for String {
    fn from(value: ContentHash) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_normalises_case() {
        let upper = "A".repeat(64);
        let hash = ContentHash::parse(&upper).unwrap();
        assert_eq!(hash.as_str(), "a".repeat(64));
    }

    #[test]
    fn parse_rejects_wrong_length_and_non_hex() {
        assert!(ContentHash::parse("abc").is_err());
        assert!(ContentHash::parse(&"g".repeat(64)).is_err());
    }
}
