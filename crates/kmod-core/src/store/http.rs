//! Read-only HTTP mirror.
//!
//! Serves `GET <base>/cas/<algo>/<hex>`. Bodies are hashed while streaming and
//! rejected if they do not match the requested digest.

use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use kmod_schema::{ContentDigest, DigestAlgorithm};
use reqwest::{Client, StatusCode};

use super::{ContentStore, StoreError};

/// Blob store served by a static HTTP mirror.
#[derive(Debug, Clone)]
pub struct HttpStore {
    client: Client,
    base_url: String,
    algorithm: DigestAlgorithm,
    timeout: Duration,
}

impl HttpStore {
    /// Mirror at `base_url` with a per-request timeout.
    pub fn new(
        base_url: &str,
        timeout: Duration,
        algorithm: DigestAlgorithm,
    ) -> Result<Self, StoreError> {
        let client = Client::builder()
            .user_agent(crate::USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            algorithm,
            timeout,
        })
    }

    /// `{base_url}/cas/{algo}/{hex}`
    pub fn blob_url(&self, digest: &ContentDigest) -> String {
        format!(
            "{}/cas/{}/{}",
            self.base_url,
            digest.algorithm(),
            digest.hex()
        )
    }
}

fn transport(e: reqwest::Error, after: Duration) -> StoreError {
    if e.is_timeout() {
        StoreError::Timeout {
            op: "http fetch",
            after,
        }
    } else {
        StoreError::Network(e.to_string())
    }
}

#[async_trait]
impl ContentStore for HttpStore {
    fn backend(&self) -> &'static str {
        "http"
    }

    fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }

    async fn insert(&self, _digest: &ContentDigest, _data: Bytes) -> Result<(), StoreError> {
        Err(StoreError::Unsupported {
            backend: "http",
            op: "insert",
        })
    }

    async fn get(&self, digest: &ContentDigest) -> Result<Bytes, StoreError> {
        let url = self.blob_url(digest);
        tracing::debug!(url = %url, "Fetching blob");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| transport(e, self.timeout))?;

        match response.status() {
            StatusCode::NOT_FOUND => return Err(StoreError::NotFound(digest.clone())),
            status if !status.is_success() => {
                return Err(StoreError::Network(format!("{url}: HTTP {status}")));
            }
            _ => {}
        }

        let mut buf = BytesMut::with_capacity(response.content_length().unwrap_or(0) as usize);
        let mut hasher = digest.algorithm().hasher();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| transport(e, self.timeout))?;
            hasher.update(&chunk);
            buf.extend_from_slice(&chunk);
        }

        let actual = hasher.finalize();
        if &actual != digest {
            return Err(StoreError::IntegrityMismatch {
                expected: digest.clone(),
                actual,
            });
        }
        Ok(buf.freeze())
    }

    async fn has(&self, digest: &ContentDigest) -> Result<bool, StoreError> {
        let url = self.blob_url(digest);
        let response = self
            .client
            .head(&url)
            .send()
            .await
            .map_err(|e| transport(e, self.timeout))?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            status => Err(StoreError::Network(format!("{url}: HTTP {status}"))),
        }
    }
}
