//! The module manifest and its canonical encoding.
//!
//! The manifest digest is computed over a fixed binary encoding of every field
//! except the signature. Payload entries and prerequisites are sorted before
//! encoding, so two manifests that differ only in declaration order share a
//! digest, while any change to a covered field changes it.

use std::collections::BTreeSet;

use chrono::{DateTime, SecondsFormat, Utc};
use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};

use crate::{ContentDigest, DigestAlgorithm, ModuleName, SchemaError};

/// Domain separation tag prepended to the canonical encoding.
pub const MANIFEST_DOMAIN: &[u8] = b"kmod-manifest/v1";

/// One logical payload file and the blob holding its bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadEntry {
    /// Logical file name, `/`-separated and relative.
    pub name: String,
    /// Address of the blob.
    pub digest: ContentDigest,
    /// Blob length in bytes.
    pub size: u64,
}

/// A declared dependency on another module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prerequisite {
    /// Required module.
    pub name: ModuleName,
    /// Acceptable versions.
    pub constraint: VersionReq,
}

impl Prerequisite {
    /// Build a prerequisite from a name and a constraint.
    pub fn new(name: ModuleName, constraint: VersionReq) -> Self {
        Self { name, constraint }
    }

    fn sort_key(&self) -> (&str, String) {
        (self.name.as_str(), self.constraint.to_string())
    }
}

impl std::fmt::Display for Prerequisite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.name, self.constraint)
    }
}

/// Descriptive metadata. Covered by the manifest digest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleMetadata {
    /// Human readable summary.
    #[serde(default)]
    pub description: String,
    /// Origin of the knowledge (e.g. `memory_export`, `crawl`).
    #[serde(default)]
    pub kind: String,
    /// Capabilities a consumer gains by installing the module.
    #[serde(default)]
    pub skills: BTreeSet<String>,
    /// Build time, if the producer recorded one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
}

/// Ed25519 signature over the manifest digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestSignature {
    /// Base64 encoded 32-byte verifying key.
    pub public_key: String,
    /// Base64 encoded 64-byte signature.
    pub signature: String,
}

impl ManifestSignature {
    /// Short fingerprint of the public key, for logs and trust lists.
    pub fn key_id(&self) -> String {
        key_id(&self.public_key)
    }
}

/// Short fingerprint of a base64 public key.
pub fn key_id(public_key_b64: &str) -> String {
    let hash = blake3::hash(public_key_b64.trim().as_bytes());
    hash.to_hex().as_str()[..16].to_string()
}

/// Metadata for one module version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Module name.
    pub name: ModuleName,
    /// Module version.
    pub version: Version,
    /// Descriptive metadata.
    #[serde(default)]
    pub metadata: ModuleMetadata,
    /// Payload files, sorted by logical name.
    pub payload: Vec<PayloadEntry>,
    /// Declared prerequisites, sorted and deduplicated.
    #[serde(default)]
    pub prerequisites: Vec<Prerequisite>,
    /// Digest of the canonical encoding.
    pub digest: ContentDigest,
    /// Optional signature over `digest`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<ManifestSignature>,
}

/// Borrowed view serialized for digest computation. Field order is the wire order.
#[derive(Serialize)]
struct CanonicalManifest<'a> {
    name: &'a str,
    version: String,
    algorithm: &'static str,
    payload: Vec<(&'a str, String, u64)>,
    prerequisites: Vec<(&'a str, String)>,
    description: &'a str,
    kind: &'a str,
    skills: Vec<&'a str>,
    created: Option<String>,
}

impl Manifest {
    /// Assemble an unsigned manifest, normalizing order and computing its digest.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::Encoding`] if the canonical encoding fails.
    pub fn seal(
        name: ModuleName,
        version: Version,
        metadata: ModuleMetadata,
        mut payload: Vec<PayloadEntry>,
        mut prerequisites: Vec<Prerequisite>,
        algorithm: DigestAlgorithm,
    ) -> Result<Self, SchemaError> {
        payload.sort_by(|a, b| a.name.cmp(&b.name));
        prerequisites.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        prerequisites.dedup();

        let mut manifest = Self {
            name,
            version,
            metadata,
            payload,
            prerequisites,
            // Placeholder; only the algorithm is read by the encoder.
            digest: algorithm.compute(&[]),
            signature: None,
        };
        manifest.digest = manifest.compute_digest()?;
        Ok(manifest)
    }

    /// Canonical bytes for `algorithm`: domain tag followed by the postcard encoding.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::Encoding`] if postcard fails.
    pub fn canonical_bytes(&self, algorithm: DigestAlgorithm) -> Result<Vec<u8>, SchemaError> {
        let mut payload: Vec<(&str, String, u64)> = self
            .payload
            .iter()
            .map(|e| (e.name.as_str(), e.digest.to_string(), e.size))
            .collect();
        payload.sort();

        let mut prerequisites: Vec<(&str, String)> =
            self.prerequisites.iter().map(Prerequisite::sort_key).collect();
        prerequisites.sort();
        prerequisites.dedup();

        let canonical = CanonicalManifest {
            name: self.name.as_str(),
            version: self.version.to_string(),
            algorithm: algorithm.as_str(),
            payload,
            prerequisites,
            description: &self.metadata.description,
            kind: &self.metadata.kind,
            skills: self.metadata.skills.iter().map(String::as_str).collect(),
            created: self
                .metadata
                .created
                .map(|t| t.to_rfc3339_opts(SecondsFormat::Nanos, true)),
        };

        let mut bytes = MANIFEST_DOMAIN.to_vec();
        bytes.extend(postcard::to_allocvec(&canonical)?);
        Ok(bytes)
    }

    /// Recompute the digest with the algorithm named by the stored digest.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::Encoding`] if the canonical encoding fails.
    pub fn compute_digest(&self) -> Result<ContentDigest, SchemaError> {
        let algorithm = self.digest.algorithm();
        Ok(algorithm.compute(&self.canonical_bytes(algorithm)?))
    }

    /// Whether the stored digest matches the covered fields.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::Encoding`] if the canonical encoding fails.
    pub fn digest_matches(&self) -> Result<bool, SchemaError> {
        Ok(self.compute_digest()? == self.digest)
    }

    /// Bytes a signer signs: the textual digest.
    pub fn signing_message(&self) -> Vec<u8> {
        self.digest.to_string().into_bytes()
    }

    /// Serialize the full manifest, signature included, as a JSON document.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::Document`] if serialization fails.
    pub fn to_document(&self) -> Result<Vec<u8>, SchemaError> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Parse a JSON manifest document.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::Document`] if the bytes are not a valid manifest.
    pub fn from_document(bytes: &[u8]) -> Result<Self, SchemaError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Address of the manifest document when stored as a blob.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::Document`] if serialization fails.
    pub fn document_digest(&self) -> Result<ContentDigest, SchemaError> {
        Ok(self.digest.algorithm().compute(&self.to_document()?))
    }

    /// Look up a payload entry by logical name.
    pub fn entry(&self, name: &str) -> Option<&PayloadEntry> {
        self.payload.iter().find(|e| e.name == name)
    }

    /// Sum of payload sizes.
    pub fn total_size(&self) -> u64 {
        self.payload.iter().map(|e| e.size).sum()
    }

    /// `name@version`, for messages.
    pub fn id(&self) -> String {
        format!("{}@{}", self.name, self.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> ModuleName {
        ModuleName::parse(s).unwrap()
    }

    fn entry(file: &str, data: &[u8]) -> PayloadEntry {
        PayloadEntry {
            name: file.to_string(),
            digest: DigestAlgorithm::Sha256.compute(data),
            size: data.len() as u64,
        }
    }

    fn sample(payload: Vec<PayloadEntry>, prerequisites: Vec<Prerequisite>) -> Manifest {
        Manifest::seal(
            name("demo"),
            Version::new(1, 0, 0),
            ModuleMetadata::default(),
            payload,
            prerequisites,
            DigestAlgorithm::Sha256,
        )
        .unwrap()
    }

    #[test]
    fn digest_is_order_independent() {
        let a = entry("a.txt", b"hello");
        let b = entry("b.txt", b"world");
        let p1 = Prerequisite::new(name("base"), VersionReq::parse("^1").unwrap());
        let p2 = Prerequisite::new(name("graph"), VersionReq::parse("~0.3").unwrap());

        let m1 = sample(vec![a.clone(), b.clone()], vec![p1.clone(), p2.clone()]);
        let m2 = sample(vec![b, a], vec![p2, p1]);

        assert_eq!(m1.digest, m2.digest);
        assert_eq!(m1.payload[0].name, "a.txt");
        assert_eq!(m1.prerequisites[0].name.as_str(), "base");
    }

    #[test]
    fn any_covered_field_changes_digest() {
        let base = sample(vec![entry("a.txt", b"hello")], vec![]);

        let mut renamed = base.clone();
        renamed.payload[0].name = "z.txt".into();
        assert!(!renamed.digest_matches().unwrap());

        let mut bumped = base.clone();
        bumped.version = Version::new(1, 0, 1);
        assert!(!bumped.digest_matches().unwrap());

        let mut described = base.clone();
        described.metadata.description = "changed".into();
        assert!(!described.digest_matches().unwrap());

        assert!(base.digest_matches().unwrap());
    }

    #[test]
    fn signature_is_not_covered() {
        let mut manifest = sample(vec![entry("a.txt", b"hello")], vec![]);
        manifest.signature = Some(ManifestSignature {
            public_key: "key".into(),
            signature: "sig".into(),
        });
        assert!(manifest.digest_matches().unwrap());
    }

    #[test]
    fn algorithm_is_part_of_the_digest() {
        let sha = sample(vec![entry("a.txt", b"hello")], vec![]);
        let blake = Manifest::seal(
            sha.name.clone(),
            sha.version.clone(),
            ModuleMetadata::default(),
            sha.payload.clone(),
            vec![],
            DigestAlgorithm::Blake3,
        )
        .unwrap();

        assert_eq!(blake.digest.algorithm(), DigestAlgorithm::Blake3);
        assert!(blake.digest_matches().unwrap());
        assert_ne!(sha.digest.hex(), blake.digest.hex());
    }

    #[test]
    fn duplicate_prerequisites_collapse() {
        let p = Prerequisite::new(name("base"), VersionReq::parse("^1").unwrap());
        let manifest = sample(vec![entry("a.txt", b"x")], vec![p.clone(), p]);
        assert_eq!(manifest.prerequisites.len(), 1);
    }

    #[test]
    fn document_keeps_signature_and_digest() {
        let mut manifest = sample(vec![entry("a.txt", b"hello")], vec![]);
        manifest.signature = Some(ManifestSignature {
            public_key: "pk".into(),
            signature: "sig".into(),
        });

        let doc = manifest.to_document().unwrap();
        let parsed = Manifest::from_document(&doc).unwrap();
        assert_eq!(parsed, manifest);
        assert_eq!(
            manifest.document_digest().unwrap(),
            DigestAlgorithm::Sha256.compute(&doc)
        );
    }
}
