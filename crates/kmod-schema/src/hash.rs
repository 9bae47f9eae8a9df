//! Content addresses.
//!
//! A [`ContentDigest`] is written `<algorithm>:<hex>`. The algorithm travels with
//! the digest, so a blob addressed with BLAKE3 is still verified with BLAKE3 by a
//! store configured for SHA-256.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256};

use crate::SchemaError;

/// Length of a hex-encoded 32-byte digest.
const HEX_LEN: usize = 64;

/// Hash function used to derive content addresses.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum DigestAlgorithm {
    /// SHA-256 (default).
    #[default]
    Sha256,
    /// BLAKE3. Roughly 7x faster than SHA-256 on modern CPUs.
    Blake3,
}

impl DigestAlgorithm {
    /// Algorithm label used as the digest prefix.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Blake3 => "blake3",
        }
    }

    /// Hash `data` in one shot.
    pub fn compute(self, data: &[u8]) -> ContentDigest {
        let mut hasher = self.hasher();
        hasher.update(data);
        hasher.finalize()
    }

    /// Start an incremental hash, for streamed downloads.
    pub fn hasher(self) -> DigestHasher {
        match self {
            Self::Sha256 => DigestHasher::Sha256(Sha256::new()),
            Self::Blake3 => DigestHasher::Blake3(Box::new(blake3::Hasher::new())),
        }
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DigestAlgorithm {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sha256" => Ok(Self::Sha256),
            "blake3" => Ok(Self::Blake3),
            other => Err(SchemaError::UnknownAlgorithm(other.to_string())),
        }
    }
}

/// Incremental hasher producing a [`ContentDigest`].
#[derive(Debug, Clone)]
pub enum DigestHasher {
    /// SHA-256 state.
    Sha256(Sha256),
    /// BLAKE3 state (boxed, the state is large).
    Blake3(Box<blake3::Hasher>),
}

impl DigestHasher {
    /// Feed more bytes.
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha256(h) => h.update(data),
            Self::Blake3(h) => {
                h.update(data);
            }
        }
    }

    /// Finish and return the digest.
    pub fn finalize(self) -> ContentDigest {
        match self {
            Self::Sha256(h) => ContentDigest {
                algorithm: DigestAlgorithm::Sha256,
                hex: hex::encode(h.finalize()),
            },
            Self::Blake3(h) => ContentDigest {
                algorithm: DigestAlgorithm::Blake3,
                hex: h.finalize().to_hex().to_string(),
            },
        }
    }
}

/// A validated content address.
///
/// Validation happens at parse and deserialization time, so an invalid hex
/// string never propagates past the wire boundary.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentDigest {
    algorithm: DigestAlgorithm,
    hex: String,
}

impl ContentDigest {
    /// Parse `sha256:<hex>`, `blake3:<hex>` or a bare 64-char hex string (SHA-256).
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::UnknownAlgorithm`] for an unrecognized prefix and
    /// [`SchemaError::InvalidDigest`] if the hex part is not exactly 64 hex characters.
    pub fn parse(s: &str) -> Result<Self, SchemaError> {
        let (algorithm, hex) = match s.split_once(':') {
            Some((algo, hex)) => (algo.parse()?, hex),
            None => (DigestAlgorithm::Sha256, s),
        };

        if hex.len() != HEX_LEN {
            return Err(SchemaError::InvalidDigest {
                value: s.to_string(),
                reason: "expected 64 hex characters",
            });
        }
        if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(SchemaError::InvalidDigest {
                value: s.to_string(),
                reason: "contains non-hex characters",
            });
        }

        Ok(Self {
            algorithm,
            hex: hex.to_ascii_lowercase(),
        })
    }

    /// The hash function this digest was produced with.
    pub fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }

    /// The lowercase hex part, without the algorithm prefix.
    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// First 12 hex characters, for log lines.
    pub fn short(&self) -> &str {
        &self.hex[..12]
    }

    /// Recompute the digest of `data` with this digest's algorithm.
    pub fn recompute(&self, data: &[u8]) -> Self {
        self.algorithm.compute(data)
    }

    /// Check that `data` hashes to this digest.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::DigestMismatch`] carrying the recomputed digest.
    pub fn verify(&self, data: &[u8]) -> Result<(), SchemaError> {
        let actual = self.recompute(data);
        if &actual == self {
            Ok(())
        } else {
            Err(SchemaError::DigestMismatch {
                expected: self.clone(),
                actual,
            })
        }
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

impl FromStr for ContentDigest {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for ContentDigest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ContentDigest {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_known_vector() {
        let digest = DigestAlgorithm::Sha256.compute(b"hello");
        assert_eq!(
            digest.to_string(),
            "sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn blake3_deterministic() {
        let h1 = DigestAlgorithm::Blake3.compute(b"test data");
        let h2 = DigestAlgorithm::Blake3.compute(b"test data");
        assert_eq!(h1, h2);
        assert_eq!(h1.algorithm(), DigestAlgorithm::Blake3);
        assert_eq!(h1.hex().len(), 64);
    }

    #[test]
    fn different_inputs_different_digests() {
        let h1 = DigestAlgorithm::Sha256.compute(b"input 1");
        let h2 = DigestAlgorithm::Sha256.compute(b"input 2");
        assert_ne!(h1, h2);
    }

    #[test]
    fn streaming_matches_one_shot() {
        for algo in [DigestAlgorithm::Sha256, DigestAlgorithm::Blake3] {
            let mut hasher = algo.hasher();
            hasher.update(b"hello ");
            hasher.update(b"world");
            assert_eq!(hasher.finalize(), algo.compute(b"hello world"));
        }
    }

    #[test]
    fn parse_accepts_bare_hex_as_sha256() {
        let hex = "AB".repeat(32);
        let digest = ContentDigest::parse(&hex).unwrap();
        assert_eq!(digest.algorithm(), DigestAlgorithm::Sha256);
        assert_eq!(digest.hex(), "ab".repeat(32));
    }

    #[test]
    fn parse_rejects_bad_input() {
        assert!(ContentDigest::parse("sha256:abc").is_err());
        assert!(ContentDigest::parse(&format!("md5:{}", "a".repeat(64))).is_err());
        assert!(ContentDigest::parse(&format!("sha256:{}", "g".repeat(64))).is_err());
    }

    #[test]
    fn verify_reports_actual_digest() {
        let digest = DigestAlgorithm::Sha256.compute(b"original");
        assert!(digest.verify(b"original").is_ok());

        match digest.verify(b"tampered") {
            Err(SchemaError::DigestMismatch { expected, actual }) => {
                assert_eq!(expected, digest);
                assert_eq!(actual, DigestAlgorithm::Sha256.compute(b"tampered"));
            }
            other => panic!("expected mismatch, got {other:?}"),
        }
    }

    #[test]
    fn serde_uses_prefixed_string() {
        let digest = DigestAlgorithm::Blake3.compute(b"x");
        let json = serde_json::to_string(&digest).unwrap();
        assert_eq!(json, format!("\"{digest}\""));
        let back: ContentDigest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, digest);

        let bad: Result<ContentDigest, _> = serde_json::from_str("\"sha256:nothex\"");
        assert!(bad.is_err());
    }
}
