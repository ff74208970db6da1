//! Digest selection for the hash chain.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use std::fmt;

/// Digest algorithm used for record hashes within a segment.
///
/// Hashes are rendered as `"<alg>:<lowercase hex>"`, matching the way
/// the segment header names the algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    #[default]
    Sha256,
    Sha512,
}

impl HashAlgorithm {
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
        }
    }

    fn hex_len(&self) -> usize {
        match self {
            Self::Sha256 => 64,
            Self::Sha512 => 128,
        }
    }

    /// Hash the concatenation of `parts`.
    pub fn digest(&self, parts: &[&[u8]]) -> String {
        let hex = match self {
            Self::Sha256 => {
                let mut hasher = Sha256::new();
                for part in parts {
                    hasher.update(part);
                }
                hex::encode(hasher.finalize())
            }
            Self::Sha512 => {
                let mut hasher = Sha512::new();
                for part in parts {
                    hasher.update(part);
                }
                hex::encode(hasher.finalize())
            }
        };
        format!("{}:{}", self.prefix(), hex)
    }

    /// The all-zero digest seeding the root segment.
    pub fn zero_hash(&self) -> String {
        format!("{}:{}", self.prefix(), "0".repeat(self.hex_len()))
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_format() {
        let hash = HashAlgorithm::Sha256.digest(&[b"abc"]);
        assert_eq!(
            hash,
            "sha256:ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(HashAlgorithm::Sha512.digest(&[b"abc"]).len(), "sha512:".len() + 128);
    }

    #[test]
    fn test_digest_concatenates_parts() {
        let alg = HashAlgorithm::Sha256;
        assert_eq!(alg.digest(&[b"ab", b"c"]), alg.digest(&[b"abc"]));
    }

    #[test]
    fn test_zero_hash() {
        assert_eq!(HashAlgorithm::Sha256.zero_hash().len(), 71);
        assert!(HashAlgorithm::Sha512.zero_hash().starts_with("sha512:000"));
    }
}
