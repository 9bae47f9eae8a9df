//! Local cache in front of an optional remote store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use kmod_schema::{ContentDigest, DigestAlgorithm};

use super::{ContentStore, StoreError, check_integrity};

/// Reads hit the local store first and fall back to the remote, writing fetched
/// blobs through to the local store. Remote calls are bounded by a timeout.
#[derive(Debug, Clone)]
pub struct TieredStore {
    local: Arc<dyn ContentStore>,
    remote: Option<Arc<dyn ContentStore>>,
    timeout: Duration,
}

impl TieredStore {
    pub fn new(local: Arc<dyn ContentStore>) -> Self {
        Self {
            local,
            remote: None,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_remote(mut self, remote: Arc<dyn ContentStore>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn local(&self) -> &Arc<dyn ContentStore> {
        &self.local
    }

    async fn bounded<T>(
        &self,
        op: &'static str,
        fut: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| StoreError::Timeout {
                op,
                after: self.timeout,
            })?
    }
}

#[async_trait]
impl ContentStore for TieredStore {
    fn backend(&self) -> &'static str {
        "tiered"
    }

    fn algorithm(&self) -> DigestAlgorithm {
        self.local.algorithm()
    }

    async fn insert(&self, digest: &ContentDigest, data: Bytes) -> Result<(), StoreError> {
        self.local.insert(digest, data.clone()).await?;
        if let Some(remote) = &self.remote {
            match self.bounded("remote insert", remote.insert(digest, data)).await {
                Ok(()) => {}
                Err(StoreError::Unsupported { backend, .. }) => {
                    tracing::debug!(backend, digest = %digest, "Remote is read-only, kept local copy");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn get(&self, digest: &ContentDigest) -> Result<Bytes, StoreError> {
        match self.local.get(digest).await {
            Ok(data) => return Ok(data),
            Err(StoreError::NotFound(_)) => {}
            Err(StoreError::IntegrityMismatch { .. }) => {
                tracing::warn!(digest = %digest, "Local copy corrupted, refetching");
            }
            Err(e) => return Err(e),
        }

        let Some(remote) = &self.remote else {
            return Err(StoreError::NotFound(digest.clone()));
        };

        tracing::debug!(backend = remote.backend(), digest = %digest, "Cache miss");
        let data = self.bounded("remote fetch", remote.get(digest)).await?;
        check_integrity(digest, &data)?;
        self.local.insert(digest, data.clone()).await?;
        Ok(data)
    }

    async fn has(&self, digest: &ContentDigest) -> Result<bool, StoreError> {
        if self.local.has(digest).await? {
            return Ok(true);
        }
        match &self.remote {
            Some(remote) => self.bounded("remote probe", remote.has(digest)).await,
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[derive(Debug, Default)]
    struct Stalled;

    #[async_trait]
    impl ContentStore for Stalled {
        fn backend(&self) -> &'static str {
            "stalled"
        }

        fn algorithm(&self) -> DigestAlgorithm {
            DigestAlgorithm::Sha256
        }

        async fn insert(&self, _: &ContentDigest, _: Bytes) -> Result<(), StoreError> {
            std::future::pending().await
        }

        async fn get(&self, _: &ContentDigest) -> Result<Bytes, StoreError> {
            std::future::pending().await
        }

        async fn has(&self, _: &ContentDigest) -> Result<bool, StoreError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn remote_hit_is_written_through() {
        let local = Arc::new(MemoryStore::default());
        let remote = Arc::new(MemoryStore::default());
        let digest = remote.put(Bytes::from_static(b"from afar")).await.unwrap();

        let tiered = TieredStore::new(local.clone()).with_remote(remote);
        assert_eq!(tiered.get(&digest).await.unwrap().as_ref(), b"from afar");
        assert!(local.has(&digest).await.unwrap());
    }

    #[tokio::test]
    async fn miss_without_remote() {
        let tiered = TieredStore::new(Arc::new(MemoryStore::default()));
        let digest = DigestAlgorithm::Sha256.compute(b"nowhere");

        assert!(matches!(
            tiered.get(&digest).await,
            Err(StoreError::NotFound(_))
        ));
        assert!(!tiered.has(&digest).await.unwrap());
    }

    #[tokio::test]
    async fn slow_remote_times_out() {
        let tiered = TieredStore::new(Arc::new(MemoryStore::default()))
            .with_remote(Arc::new(Stalled))
            .with_timeout(Duration::from_millis(20));
        let digest = DigestAlgorithm::Sha256.compute(b"late");

        let err = tiered.get(&digest).await.unwrap_err();
        assert!(matches!(err, StoreError::Timeout { .. }));
        assert!(err.is_retryable());
    }
}
