//! Ed25519 keys and manifest signatures.
//!
//! Keys and signatures travel as standard base64. The signed message is the
//! textual manifest digest, so re-encoding a manifest never invalidates its
//! signature as long as the covered fields are unchanged.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use kmod_schema::{Manifest, ManifestSignature, manifest::key_id};
use rand::RngCore;
use thiserror::Error;

/// Environment variable holding a base64 secret key.
pub const SIGNING_KEY_ENV: &str = "KMOD_SIGNING_KEY";

#[derive(Error, Debug)]
pub enum KeyError {
    #[error("Invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Expected a {expected}-byte {what}, got {actual} bytes")]
    Length {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Invalid key: {0}")]
    Invalid(#[from] ed25519_dalek::SignatureError),

    #[error("{0} not set")]
    MissingEnv(&'static str),
}

fn decode_fixed<const N: usize>(what: &'static str, b64: &str) -> Result<[u8; N], KeyError> {
    let bytes = STANDARD.decode(b64.trim())?;
    let actual = bytes.len();
    bytes.try_into().map_err(|_| KeyError::Length {
        what,
        expected: N,
        actual,
    })
}

/// Holds a secret key and signs manifests with it.
#[derive(Clone)]
pub struct ModuleSigner {
    key: SigningKey,
}

impl std::fmt::Debug for ModuleSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleSigner")
            .field("key_id", &self.key_id())
            .finish_non_exhaustive()
    }
}

impl ModuleSigner {
    /// Fresh random keypair.
    pub fn generate() -> Self {
        let mut secret = [0u8; 32];
        rand::rng().fill_bytes(&mut secret);
        Self {
            key: SigningKey::from_bytes(&secret),
        }
    }

    /// Load a 32-byte secret key from base64.
    pub fn from_base64(secret_b64: &str) -> Result<Self, KeyError> {
        let secret = decode_fixed::<32>("Ed25519 secret key", secret_b64)?;
        Ok(Self {
            key: SigningKey::from_bytes(&secret),
        })
    }

    /// Load the secret key from `KMOD_SIGNING_KEY`.
    pub fn from_env() -> Result<Self, KeyError> {
        let secret = std::env::var(SIGNING_KEY_ENV).map_err(|_| KeyError::MissingEnv(SIGNING_KEY_ENV))?;
        Self::from_base64(&secret)
    }

    pub fn secret_base64(&self) -> String {
        STANDARD.encode(self.key.to_bytes())
    }

    pub fn public_key_base64(&self) -> String {
        STANDARD.encode(self.key.verifying_key().to_bytes())
    }

    /// Fingerprint of the public key, as listed in trust policies.
    pub fn key_id(&self) -> String {
        key_id(&self.public_key_base64())
    }

    /// Sign the manifest digest and attach the signature.
    pub fn sign(&self, manifest: &mut Manifest) {
        let signature = self.key.sign(&manifest.signing_message());
        manifest.signature = Some(ManifestSignature {
            public_key: self.public_key_base64(),
            signature: STANDARD.encode(signature.to_bytes()),
        });
    }
}

/// Check `signature` against the manifest's signing message.
pub fn verify_signature(manifest: &Manifest, signature: &ManifestSignature) -> Result<(), KeyError> {
    let public = decode_fixed::<32>("Ed25519 public key", &signature.public_key)?;
    let sig = decode_fixed::<64>("Ed25519 signature", &signature.signature)?;

    let key = VerifyingKey::from_bytes(&public)?;
    let sig = Signature::from_bytes(&sig);
    key.verify(&manifest.signing_message(), &sig)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kmod_schema::{DigestAlgorithm, ModuleMetadata, ModuleName, Version};

    fn manifest() -> Manifest {
        Manifest::seal(
            ModuleName::parse("demo").unwrap(),
            Version::new(1, 0, 0),
            ModuleMetadata::default(),
            Vec::new(),
            Vec::new(),
            DigestAlgorithm::Sha256,
        )
        .unwrap()
    }

    #[test]
    fn sign_and_verify() {
        let signer = ModuleSigner::generate();
        let mut m = manifest();
        signer.sign(&mut m);

        let sig = m.signature.clone().unwrap();
        assert_eq!(sig.key_id(), signer.key_id());
        verify_signature(&m, &sig).unwrap();
    }

    #[test]
    fn signature_bound_to_digest() {
        let signer = ModuleSigner::generate();
        let mut m = manifest();
        signer.sign(&mut m);
        let sig = m.signature.clone().unwrap();

        m.version = Version::new(1, 0, 1);
        m.digest = m.compute_digest().unwrap();

        assert!(matches!(
            verify_signature(&m, &sig),
            Err(KeyError::Invalid(_))
        ));
    }

    #[test]
    fn secret_round_trips_through_base64() {
        let signer = ModuleSigner::generate();
        let restored = ModuleSigner::from_base64(&signer.secret_base64()).unwrap();
        assert_eq!(restored.public_key_base64(), signer.public_key_base64());
    }

    #[test]
    fn rejects_short_keys() {
        let err = ModuleSigner::from_base64(&STANDARD.encode([0u8; 16])).unwrap_err();
        assert!(matches!(
            err,
            KeyError::Length {
                expected: 32,
                actual: 16,
                ..
            }
        ));
    }
}
