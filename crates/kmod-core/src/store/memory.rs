//! In-process blob store.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use kmod_schema::{ContentDigest, DigestAlgorithm};

use super::{ContentStore, StoreError, check_integrity};

/// Blobs held in a map. Useful for tests and short-lived pipelines.
#[derive(Debug, Default)]
pub struct MemoryStore {
    algorithm: DigestAlgorithm,
    blobs: RwLock<HashMap<ContentDigest, Bytes>>,
}

impl MemoryStore {
    pub fn new(algorithm: DigestAlgorithm) -> Self {
        Self {
            algorithm,
            blobs: RwLock::default(),
        }
    }

    /// Number of blobs held.
    pub fn len(&self) -> usize {
        self.blobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ContentStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }

    async fn insert(&self, digest: &ContentDigest, data: Bytes) -> Result<(), StoreError> {
        check_integrity(digest, &data)?;
        self.blobs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(digest.clone())
            .or_insert(data);
        Ok(())
    }

    async fn get(&self, digest: &ContentDigest) -> Result<Bytes, StoreError> {
        let data = self
            .blobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(digest)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(digest.clone()))?;
        check_integrity(digest, &data)?;
        Ok(data)
    }

    async fn has(&self, digest: &ContentDigest) -> Result<bool, StoreError> {
        Ok(self
            .blobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(digest))
    }
}
