//! Remote blob store backed by any OpenDAL service (S3, R2, GCS, ...).
//!
//! Layout: `cas/<algo>/<hex>`.

use async_trait::async_trait;
use bytes::Bytes;
use kmod_schema::{ContentDigest, DigestAlgorithm};
use opendal::{ErrorKind, Operator, services};

use super::{ContentStore, StoreError, check_integrity};

/// Connection settings for an S3-compatible bucket.
#[derive(Debug, Clone)]
pub struct ObjectStoreConfig {
    /// Endpoint (e.g., `https://<account>.r2.cloudflarestorage.com`)
    pub endpoint: String,
    pub bucket: String,
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
    /// Key prefix inside the bucket.
    pub root: String,
}

impl ObjectStoreConfig {
    /// Load configuration from environment variables.
    ///
    /// Returns `None` unless `KMOD_OBJECT_STORE_ENDPOINT` and both credentials are set.
    pub fn from_env() -> Option<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Option<Self> {
        Some(Self {
            endpoint: lookup("KMOD_OBJECT_STORE_ENDPOINT")?,
            access_key: lookup("KMOD_OBJECT_STORE_ACCESS_KEY")?,
            secret_key: lookup("KMOD_OBJECT_STORE_SECRET_KEY")?,
            bucket: lookup("KMOD_OBJECT_STORE_BUCKET").unwrap_or_else(|| "kmod-blobs".to_string()),
            region: lookup("KMOD_OBJECT_STORE_REGION").unwrap_or_else(|| "auto".to_string()),
            root: lookup("KMOD_OBJECT_STORE_ROOT").unwrap_or_else(|| "/".to_string()),
        })
    }
}

/// Content store on top of an OpenDAL [`Operator`].
#[derive(Debug, Clone)]
pub struct ObjectStore {
    op: Operator,
    algorithm: DigestAlgorithm,
}

impl ObjectStore {
    pub fn new(op: Operator, algorithm: DigestAlgorithm) -> Self {
        Self { op, algorithm }
    }

    /// Connect to an S3-compatible bucket.
    pub fn s3(config: &ObjectStoreConfig, algorithm: DigestAlgorithm) -> Result<Self, StoreError> {
        let mut builder = services::S3::default();
        builder.endpoint(&config.endpoint);
        builder.bucket(&config.bucket);
        builder.region(&config.region);
        builder.access_key_id(&config.access_key);
        builder.secret_access_key(&config.secret_key);
        builder.root(&config.root);

        let op = Operator::new(builder).map_err(backend)?.finish();
        Ok(Self::new(op, algorithm))
    }

    /// In-memory OpenDAL service. Behaves like a bucket without the network.
    pub fn in_memory(algorithm: DigestAlgorithm) -> Result<Self, StoreError> {
        let op = Operator::new(services::Memory::default())
            .map_err(backend)?
            .finish();
        Ok(Self::new(op, algorithm))
    }

    fn key(digest: &ContentDigest) -> String {
        format!("cas/{}/{}", digest.algorithm(), digest.hex())
    }
}

fn backend(e: opendal::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn classify(digest: &ContentDigest, e: opendal::Error) -> StoreError {
    match e.kind() {
        ErrorKind::NotFound => StoreError::NotFound(digest.clone()),
        _ if e.is_temporary() => StoreError::Network(e.to_string()),
        _ => backend(e),
    }
}

#[async_trait]
impl ContentStore for ObjectStore {
    fn backend(&self) -> &'static str {
        "object"
    }

    fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }

    async fn insert(&self, digest: &ContentDigest, data: Bytes) -> Result<(), StoreError> {
        check_integrity(digest, &data)?;
        if self.has(digest).await? {
            return Ok(());
        }
        self.op
            .write(&Self::key(digest), data.to_vec())
            .await
            .map_err(|e| classify(digest, e))?;
        Ok(())
    }

    async fn get(&self, digest: &ContentDigest) -> Result<Bytes, StoreError> {
        let data = self
            .op
            .read(&Self::key(digest))
            .await
            .map_err(|e| classify(digest, e))?
            .to_vec();
        check_integrity(digest, &data)?;
        Ok(Bytes::from(data))
    }

    async fn has(&self, digest: &ContentDigest) -> Result<bool, StoreError> {
        self.op
            .is_exist(&Self::key(digest))
            .await
            .map_err(|e| classify(digest, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trip_through_operator() {
        let store = ObjectStore::in_memory(DigestAlgorithm::Sha256).unwrap();
        let digest = store.put(Bytes::from_static(b"remote bytes")).await.unwrap();

        assert!(store.has(&digest).await.unwrap());
        assert_eq!(store.get(&digest).await.unwrap().as_ref(), b"remote bytes");
    }

    #[tokio::test]
    async fn tampered_object_is_rejected() {
        let op = Operator::new(services::Memory::default()).unwrap().finish();
        let store = ObjectStore::new(op.clone(), DigestAlgorithm::Sha256);
        let digest = store.put(Bytes::from_static(b"clean")).await.unwrap();

        op.write(&ObjectStore::key(&digest), b"dirty".to_vec())
            .await
            .unwrap();

        assert!(matches!(
            store.get(&digest).await,
            Err(StoreError::IntegrityMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn missing_object_is_not_found() {
        let store = ObjectStore::in_memory(DigestAlgorithm::Sha256).unwrap();
        let digest = DigestAlgorithm::Sha256.compute(b"absent");

        assert!(!store.has(&digest).await.unwrap());
        assert!(matches!(
            store.get(&digest).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn config_requires_endpoint_and_credentials() {
        assert!(ObjectStoreConfig::from_lookup(|_| None).is_none());

        let config = ObjectStoreConfig::from_lookup(|key| match key {
            "KMOD_OBJECT_STORE_ENDPOINT" => Some("https://s3.example.com".into()),
            "KMOD_OBJECT_STORE_ACCESS_KEY" => Some("id".into()),
            "KMOD_OBJECT_STORE_SECRET_KEY" => Some("secret".into()),
            _ => None,
        })
        .unwrap();
        assert_eq!(config.bucket, "kmod-blobs");
        assert_eq!(config.region, "auto");
    }
}
