//! Content-addressed blob storage.
//!
//! Every backend implements [`ContentStore`]. Whatever the backend, `get` only
//! ever returns bytes that hash to the requested digest; corrupted data surfaces
//! as [`StoreError::IntegrityMismatch`].

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use kmod_schema::{ContentDigest, DigestAlgorithm, SchemaError};
use thiserror::Error;

#[cfg(feature = "network")]
pub mod http;
pub mod local;
pub mod memory;
#[cfg(feature = "object-store")]
pub mod object;
pub mod tiered;

#[cfg(feature = "network")]
pub use http::HttpStore;
pub use local::{LocalStore, PruneStats};
pub use memory::MemoryStore;
#[cfg(feature = "object-store")]
pub use object::ObjectStore;
pub use tiered::TieredStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Blob not found: {0}")]
    NotFound(ContentDigest),

    #[error("Integrity mismatch: expected {expected}, got {actual}")]
    IntegrityMismatch {
        expected: ContentDigest,
        actual: ContentDigest,
    },

    #[error("Timed out after {after:?} during {op}")]
    Timeout { op: &'static str, after: Duration },

    #[error("Network error: {0}")]
    Network(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{backend} does not support {op}")]
    Unsupported {
        backend: &'static str,
        op: &'static str,
    },

    #[error("Backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Transport failures the caller may retry. Integrity failures never are.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_) | Self::Timeout { .. } | Self::Network(_)
        )
    }
}

/// Check `data` against `digest`, mapping a mismatch to [`StoreError::IntegrityMismatch`].
pub fn check_integrity(digest: &ContentDigest, data: &[u8]) -> Result<(), StoreError> {
    digest.verify(data).map_err(|e| match e {
        SchemaError::DigestMismatch { expected, actual } => {
            StoreError::IntegrityMismatch { expected, actual }
        }
        other => StoreError::Backend(other.to_string()),
    })
}

/// Immutable, content-addressed blob storage.
///
/// `put` is idempotent: storing identical bytes twice yields the same digest and
/// the second call writes nothing.
#[async_trait]
pub trait ContentStore: Send + Sync + fmt::Debug {
    /// Short backend label for logs.
    fn backend(&self) -> &'static str;

    /// Algorithm used to address blobs written through `put`.
    fn algorithm(&self) -> DigestAlgorithm;

    /// Store `data` under a digest the caller already knows.
    ///
    /// Fails with [`StoreError::IntegrityMismatch`] if `data` does not hash to `digest`.
    async fn insert(&self, digest: &ContentDigest, data: Bytes) -> Result<(), StoreError>;

    /// Fetch a blob, verifying it against `digest`.
    async fn get(&self, digest: &ContentDigest) -> Result<Bytes, StoreError>;

    /// Whether the blob is present.
    async fn has(&self, digest: &ContentDigest) -> Result<bool, StoreError>;

    /// Store `data`, returning its address.
    async fn put(&self, data: Bytes) -> Result<ContentDigest, StoreError> {
        let digest = self.algorithm().compute(&data);
        self.insert(&digest, data).await?;
        Ok(digest)
    }
}
