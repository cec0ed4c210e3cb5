//! BLAKE3 digests for cache fingerprints and pattern-set keys

use serde::{Deserialize, Serialize};

/// A BLAKE3 digest (32 bytes)
#[derive(Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct Digest([u8; 32]);

impl Digest {
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Full lowercase hex form
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First 16 hex characters, enough for cache keys
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl std::fmt::Debug for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Digest({})", self.short())
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Digest raw bytes
pub fn digest_bytes(data: &[u8]) -> Digest {
    Digest::from_bytes(*blake3::hash(data).as_bytes())
}

/// Digest an ordered list of strings
///
/// Entries are length-prefixed so `["ab", "c"]` and `["a", "bc"]` differ.
pub fn digest_strings<I, S>(items: I) -> Digest
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut hasher = blake3::Hasher::new();
    for item in items {
        let bytes = item.as_ref().as_bytes();
        hasher.update(&(bytes.len() as u64).to_le_bytes());
        hasher.update(bytes);
    }
    Digest::from_bytes(*hasher.finalize().as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_strings_is_boundary_sensitive() {
        assert_ne!(digest_strings(["ab", "c"]), digest_strings(["a", "bc"]));
        assert_eq!(digest_strings(["x", "y"]), digest_strings(vec!["x".to_string(), "y".to_string()]));
    }

    #[test]
    fn test_short_is_prefix_of_hex() {
        let d = digest_bytes(b"locales/en.json");
        assert_eq!(d.to_hex().len(), 64);
        assert!(d.to_hex().starts_with(&d.short()));
        assert_eq!(d.short().len(), 16);
    }
}
