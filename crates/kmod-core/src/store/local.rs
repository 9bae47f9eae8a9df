//! Local filesystem blob store.
//!
//! Blobs live at `<root>/<algo>/<2-hex prefix>/<hex>`. Writes go through a temp
//! file in the staging directory and are renamed into place, so a reader never
//! observes a partial blob.

use std::collections::HashSet;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use kmod_schema::{ContentDigest, DigestAlgorithm};
use tempfile::NamedTempFile;
use walkdir::WalkDir;

use super::{ContentStore, StoreError, check_integrity};
use crate::paths::Layout;

/// Result of a garbage-collection pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneStats {
    pub kept: usize,
    pub removed: usize,
    pub bytes_freed: u64,
}

/// Content-addressed store rooted on the local disk.
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
    tmp: PathBuf,
    algorithm: DigestAlgorithm,
}

impl LocalStore {
    /// Open a store at `root`, staging writes in `tmp`.
    ///
    /// `tmp` must be on the same volume as `root` for renames to be atomic.
    pub fn open(
        root: impl Into<PathBuf>,
        tmp: impl Into<PathBuf>,
        algorithm: DigestAlgorithm,
    ) -> io::Result<Self> {
        let root = root.into();
        let tmp = tmp.into();
        fs::create_dir_all(&root)?;
        fs::create_dir_all(&tmp)?;
        Ok(Self {
            root,
            tmp,
            algorithm,
        })
    }

    /// Open the store of a home layout.
    pub fn from_layout(layout: &Layout, algorithm: DigestAlgorithm) -> io::Result<Self> {
        Self::open(layout.blobs(), layout.tmp(), algorithm)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of a blob: `<root>/<algo>/ab/abcdef...`
    pub fn blob_path(&self, digest: &ContentDigest) -> PathBuf {
        let hex = digest.hex();
        self.root
            .join(digest.algorithm().as_str())
            .join(&hex[..2])
            .join(hex)
    }

    /// Remove one blob. Returns whether it existed.
    pub async fn evict(&self, digest: &ContentDigest) -> Result<bool, StoreError> {
        match tokio::fs::remove_file(self.blob_path(digest)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Every digest currently on disk.
    pub async fn list(&self) -> Result<Vec<ContentDigest>, StoreError> {
        let root = self.root.clone();
        let blobs = tokio::task::spawn_blocking(move || scan(&root))
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))??;
        Ok(blobs.into_iter().map(|(digest, _, _)| digest).collect())
    }

    /// Delete every blob not in `keep`.
    pub async fn retain(&self, keep: &HashSet<ContentDigest>) -> Result<PruneStats, StoreError> {
        let root = self.root.clone();
        let keep = keep.clone();
        tokio::task::spawn_blocking(move || {
            let mut stats = PruneStats::default();
            for (digest, path, size) in scan(&root)? {
                if keep.contains(&digest) {
                    stats.kept += 1;
                    continue;
                }
                match fs::remove_file(&path) {
                    Ok(()) => {
                        stats.removed += 1;
                        stats.bytes_freed += size;
                    }
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(StoreError::Io(e)),
                }
            }
            Ok(stats)
        })
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?
    }

    fn write_blob(&self, digest: &ContentDigest, data: &[u8]) -> io::Result<()> {
        let path = self.blob_path(digest);
        if path.exists() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut temp = NamedTempFile::new_in(&self.tmp)?;
        temp.write_all(data)?;
        temp.as_file().sync_all()?;
        temp.persist(&path).map_err(|e| e.error)?;
        Ok(())
    }
}

/// Walk the store, yielding `(digest, path, size)` for every well-formed blob file.
fn scan(root: &Path) -> Result<Vec<(ContentDigest, PathBuf, u64)>, StoreError> {
    let mut out = Vec::new();
    for entry in WalkDir::new(root).min_depth(3).max_depth(3) {
        let entry = entry.map_err(|e| StoreError::Io(e.into()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(algo) = entry
            .path()
            .parent()
            .and_then(Path::parent)
            .and_then(Path::file_name)
            .and_then(|s| s.to_str())
        else {
            continue;
        };
        let Some(hex) = entry.file_name().to_str() else {
            continue;
        };
        if let Ok(digest) = ContentDigest::parse(&format!("{algo}:{hex}")) {
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            out.push((digest, entry.into_path(), size));
        }
    }
    Ok(out)
}

#[async_trait]
impl ContentStore for LocalStore {
    fn backend(&self) -> &'static str {
        "local"
    }

    fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }

    async fn insert(&self, digest: &ContentDigest, data: Bytes) -> Result<(), StoreError> {
        check_integrity(digest, &data)?;
        let store = self.clone();
        let digest = digest.clone();
        tokio::task::spawn_blocking(move || store.write_blob(&digest, &data))
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))??;
        Ok(())
    }

    async fn get(&self, digest: &ContentDigest) -> Result<Bytes, StoreError> {
        let data = match tokio::fs::read(self.blob_path(digest)).await {
            Ok(data) => Bytes::from(data),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(digest.clone()));
            }
            Err(e) => return Err(e.into()),
        };

        if let Err(e) = check_integrity(digest, &data) {
            tracing::warn!(digest = %digest, "Evicting corrupted blob");
            self.evict(digest).await?;
            return Err(e);
        }
        Ok(data)
    }

    async fn has(&self, digest: &ContentDigest) -> Result<bool, StoreError> {
        Ok(tokio::fs::try_exists(self.blob_path(digest)).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store(dir: &Path) -> LocalStore {
        LocalStore::open(dir.join("blobs"), dir.join("tmp"), DigestAlgorithm::Sha256).unwrap()
    }

    #[tokio::test]
    async fn test_store_and_retrieve() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());

        let digest = store.put(Bytes::from_static(b"hello, kmod!")).await.unwrap();

        assert!(store.has(&digest).await.unwrap());
        assert_eq!(store.get(&digest).await.unwrap().as_ref(), b"hello, kmod!");
        assert!(store.blob_path(&digest).starts_with(dir.path().join("blobs/sha256")));
    }

    #[tokio::test]
    async fn test_deduplication() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());

        let d1 = store.put(Bytes::from_static(b"duplicate")).await.unwrap();
        let d2 = store.put(Bytes::from_static(b"duplicate")).await.unwrap();

        assert_eq!(d1, d2);
        assert_eq!(store.list().await.unwrap(), vec![d1]);
    }

    #[tokio::test]
    async fn test_corrupted_blob_is_evicted() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());

        let digest = store.put(Bytes::from_static(b"original")).await.unwrap();
        fs::write(store.blob_path(&digest), b"tampered").unwrap();

        let err = store.get(&digest).await.unwrap_err();
        assert!(matches!(err, StoreError::IntegrityMismatch { .. }));
        assert!(!store.has(&digest).await.unwrap());
    }

    #[tokio::test]
    async fn test_retain() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());

        let keep = store.put(Bytes::from_static(b"keep me")).await.unwrap();
        let drop = store.put(Bytes::from_static(b"drop me")).await.unwrap();

        let stats = store
            .retain(&HashSet::from([keep.clone()]))
            .await
            .unwrap();

        assert_eq!(stats.kept, 1);
        assert_eq!(stats.removed, 1);
        assert_eq!(stats.bytes_freed, 7);
        assert!(store.has(&keep).await.unwrap());
        assert!(!store.has(&drop).await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_blob() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let digest = DigestAlgorithm::Sha256.compute(b"never stored");

        assert!(matches!(
            store.get(&digest).await,
            Err(StoreError::NotFound(_))
        ));
        assert!(!store.evict(&digest).await.unwrap());
    }
}
