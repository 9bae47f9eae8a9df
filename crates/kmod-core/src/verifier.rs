//! Manifest and payload verification.
//!
//! Verification runs in three steps:
//! 1. Recompute the manifest digest from the covered fields.
//! 2. Check the signature, or apply the unsigned policy.
//! 3. Fetch every payload blob and check its digest and size.
//!
//! Steps 1 and 2 need no storage and are exposed on their own through
//! [`Verifier::verify_manifest`].

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use kmod_schema::{ContentDigest, Manifest, PayloadEntry, SchemaError};
use thiserror::Error;

use crate::signing::verify_signature;
use crate::store::{ContentStore, StoreError};

#[derive(Error, Debug)]
pub enum VerifyError {
    #[error("Manifest for {module} was modified: declares {declared}, content hashes to {actual}")]
    TamperedManifest {
        module: String,
        declared: ContentDigest,
        actual: ContentDigest,
    },

    #[error("Invalid signature on {module}: {reason}")]
    InvalidSignature { module: String, reason: String },

    #[error("{module} is unsigned and the trust policy requires signatures")]
    UnsignedRejected { module: String },

    #[error("{module} is signed by untrusted key {key_id}")]
    UntrustedKey { module: String, key_id: String },

    #[error("{module}: payload '{file}' ({digest}) is missing")]
    MissingPayload {
        module: String,
        file: String,
        digest: ContentDigest,
    },

    #[error("{module}: payload '{file}' failed integrity check (expected {expected}, got {actual})")]
    IntegrityMismatch {
        module: String,
        file: String,
        expected: ContentDigest,
        actual: ContentDigest,
    },

    #[error("{module}: payload '{file}' is {actual} bytes, manifest says {expected}")]
    SizeMismatch {
        module: String,
        file: String,
        expected: u64,
        actual: u64,
    },

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Which signatures are acceptable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrustPolicy {
    /// Accept manifests without a signature.
    pub allow_unsigned: bool,
    /// Accepted keys, as base64 public keys or key ids. Empty accepts any valid signature.
    pub trusted_keys: BTreeSet<String>,
}

impl TrustPolicy {
    /// Accept unsigned manifests and any valid signature.
    pub fn permissive() -> Self {
        Self {
            allow_unsigned: true,
            trusted_keys: BTreeSet::new(),
        }
    }

    /// Require a valid signature from one of `keys`.
    pub fn signed_by<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allow_unsigned: false,
            trusted_keys: keys.into_iter().map(Into::into).collect(),
        }
    }

    fn trusts(&self, public_key: &str, key_id: &str) -> bool {
        self.trusted_keys.is_empty()
            || self.trusted_keys.contains(public_key.trim())
            || self.trusted_keys.contains(key_id)
    }
}

/// How a verified manifest was vouched for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TrustLevel {
    Signed { key_id: String },
    Unsigned,
}

impl fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Signed { key_id } => write!(f, "signed:{key_id}"),
            Self::Unsigned => f.write_str("unsigned"),
        }
    }
}

impl FromStr for TrustLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some(("signed", key_id)) if !key_id.is_empty() => Ok(Self::Signed {
                key_id: key_id.to_string(),
            }),
            None if s == "unsigned" => Ok(Self::Unsigned),
            _ => Err(format!("unknown trust level '{s}'")),
        }
    }
}

/// Outcome of a successful verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verified {
    pub digest: ContentDigest,
    pub trust: TrustLevel,
}

#[derive(Debug, Clone, Default)]
pub struct Verifier {
    policy: TrustPolicy,
}

impl Verifier {
    pub fn new(policy: TrustPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &TrustPolicy {
        &self.policy
    }

    /// Digest and signature checks. Touches no storage.
    pub fn verify_manifest(&self, manifest: &Manifest) -> Result<Verified, VerifyError> {
        let module = manifest.id();

        let actual = manifest.compute_digest()?;
        if actual != manifest.digest {
            return Err(VerifyError::TamperedManifest {
                module,
                declared: manifest.digest.clone(),
                actual,
            });
        }

        let trust = match &manifest.signature {
            Some(sig) => {
                verify_signature(manifest, sig).map_err(|e| VerifyError::InvalidSignature {
                    module: module.clone(),
                    reason: e.to_string(),
                })?;
                let key_id = sig.key_id();
                if !self.policy.trusts(&sig.public_key, &key_id) {
                    return Err(VerifyError::UntrustedKey { module, key_id });
                }
                TrustLevel::Signed { key_id }
            }
            None if self.policy.allow_unsigned => TrustLevel::Unsigned,
            None => return Err(VerifyError::UnsignedRejected { module }),
        };

        Ok(Verified {
            digest: actual,
            trust,
        })
    }

    /// Like [`verify_manifest`](Self::verify_manifest), and the manifest must be the
    /// one the registry named.
    pub fn verify_against(
        &self,
        manifest: &Manifest,
        expected: &ContentDigest,
    ) -> Result<Verified, VerifyError> {
        let verified = self.verify_manifest(manifest)?;
        if &verified.digest != expected {
            return Err(VerifyError::TamperedManifest {
                module: manifest.id(),
                declared: expected.clone(),
                actual: verified.digest,
            });
        }
        Ok(verified)
    }

    /// Full verification, payload blobs included.
    pub async fn verify(
        &self,
        manifest: &Manifest,
        store: &dyn ContentStore,
    ) -> Result<Verified, VerifyError> {
        let verified = self.verify_manifest(manifest)?;
        for entry in &manifest.payload {
            let data = store
                .get(&entry.digest)
                .await
                .map_err(|e| payload_error(manifest, entry, e))?;
            Self::check_payload(manifest, entry, &data)?;
        }
        Ok(verified)
    }

    /// Check one fetched payload blob against its manifest entry.
    pub fn check_payload(
        manifest: &Manifest,
        entry: &PayloadEntry,
        data: &[u8],
    ) -> Result<(), VerifyError> {
        let actual = entry.digest.recompute(data);
        if actual != entry.digest {
            return Err(VerifyError::IntegrityMismatch {
                module: manifest.id(),
                file: entry.name.clone(),
                expected: entry.digest.clone(),
                actual,
            });
        }
        if data.len() as u64 != entry.size {
            return Err(VerifyError::SizeMismatch {
                module: manifest.id(),
                file: entry.name.clone(),
                expected: entry.size,
                actual: data.len() as u64,
            });
        }
        Ok(())
    }
}

/// Attach payload context to a store failure.
pub fn payload_error(manifest: &Manifest, entry: &PayloadEntry, err: StoreError) -> VerifyError {
    match err {
        StoreError::NotFound(digest) => VerifyError::MissingPayload {
            module: manifest.id(),
            file: entry.name.clone(),
            digest,
        },
        StoreError::IntegrityMismatch { expected, actual } => VerifyError::IntegrityMismatch {
            module: manifest.id(),
            file: entry.name.clone(),
            expected,
            actual,
        },
        other => VerifyError::Store(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signing::ModuleSigner;
    use crate::store::MemoryStore;
    use bytes::Bytes;
    use kmod_schema::{DigestAlgorithm, ModuleMetadata, ModuleName, Version};

    async fn sample(store: &MemoryStore) -> Manifest {
        let digest = store.put(Bytes::from_static(b"facts")).await.unwrap();
        Manifest::seal(
            ModuleName::parse("demo").unwrap(),
            Version::new(1, 0, 0),
            ModuleMetadata::default(),
            vec![PayloadEntry {
                name: "a.txt".into(),
                digest,
                size: 5,
            }],
            Vec::new(),
            DigestAlgorithm::Sha256,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn unsigned_follows_policy() {
        let store = MemoryStore::default();
        let m = sample(&store).await;

        let verified = Verifier::new(TrustPolicy::permissive())
            .verify(&m, &store)
            .await
            .unwrap();
        assert_eq!(verified.trust, TrustLevel::Unsigned);

        assert!(matches!(
            Verifier::default().verify_manifest(&m),
            Err(VerifyError::UnsignedRejected { .. })
        ));
    }

    #[tokio::test]
    async fn tampered_field_is_detected() {
        let store = MemoryStore::default();
        let mut m = sample(&store).await;
        m.metadata.description = "edited after sealing".into();

        assert!(matches!(
            Verifier::new(TrustPolicy::permissive()).verify_manifest(&m),
            Err(VerifyError::TamperedManifest { .. })
        ));
    }

    #[tokio::test]
    async fn trusted_and_untrusted_keys() {
        let store = MemoryStore::default();
        let mut m = sample(&store).await;
        let signer = ModuleSigner::generate();
        signer.sign(&mut m);

        let by_id = Verifier::new(TrustPolicy::signed_by([signer.key_id()]));
        assert_eq!(
            by_id.verify_manifest(&m).unwrap().trust,
            TrustLevel::Signed {
                key_id: signer.key_id()
            }
        );

        let by_key = Verifier::new(TrustPolicy::signed_by([signer.public_key_base64()]));
        assert!(by_key.verify_manifest(&m).is_ok());

        let other = Verifier::new(TrustPolicy::signed_by([ModuleSigner::generate().key_id()]));
        assert!(matches!(
            other.verify_manifest(&m),
            Err(VerifyError::UntrustedKey { .. })
        ));
    }

    #[tokio::test]
    async fn forged_signature_is_invalid() {
        let store = MemoryStore::default();
        let mut m = sample(&store).await;
        ModuleSigner::generate().sign(&mut m);
        let impostor = ModuleSigner::generate();
        if let Some(sig) = m.signature.as_mut() {
            sig.public_key = impostor.public_key_base64();
        }

        assert!(matches!(
            Verifier::new(TrustPolicy::default()).verify_manifest(&m),
            Err(VerifyError::InvalidSignature { .. })
        ));
    }

    #[tokio::test]
    async fn missing_payload() {
        let store = MemoryStore::default();
        let m = sample(&store).await;
        let empty = MemoryStore::default();

        assert!(matches!(
            Verifier::new(TrustPolicy::permissive()).verify(&m, &empty).await,
            Err(VerifyError::MissingPayload { .. })
        ));
    }

    #[tokio::test]
    async fn verify_against_expected_digest() {
        let store = MemoryStore::default();
        let m = sample(&store).await;
        let verifier = Verifier::new(TrustPolicy::permissive());

        assert!(verifier.verify_against(&m, &m.digest).is_ok());
        let other = DigestAlgorithm::Sha256.compute(b"someone else");
        assert!(matches!(
            verifier.verify_against(&m, &other),
            Err(VerifyError::TamperedManifest { .. })
        ));
    }

    #[test]
    fn trust_level_text() {
        for level in [
            TrustLevel::Unsigned,
            TrustLevel::Signed {
                key_id: "abc123".into(),
            },
        ] {
            assert_eq!(level.to_string().parse::<TrustLevel>().unwrap(), level);
        }
        assert!("signed:".parse::<TrustLevel>().is_err());
    }
}
