//! Registry persisted as a single JSON index file.
//!
//! The whole index is rewritten on every publish through a temp file and a
//! rename, so readers see either the old or the new index.

use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use kmod_schema::{Manifest, ModuleName, Version, VersionReq};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tokio::sync::Mutex;

use super::{Catalog, Published, Registry, RegistryEntry, RegistryError};

const INDEX_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct IndexFile {
    version: u32,
    modules: Vec<RegistryEntry>,
}

#[derive(Debug)]
pub struct FileRegistry {
    path: PathBuf,
    catalog: Mutex<Catalog>,
}

impl FileRegistry {
    /// Open the index at `path`, starting empty if the file does not exist.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let path = path.into();
        let catalog = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let index: IndexFile = serde_json::from_slice(&bytes)
                    .map_err(|e| RegistryError::Corrupt(format!("{}: {e}", path.display())))?;
                if index.version != INDEX_VERSION {
                    return Err(RegistryError::Corrupt(format!(
                        "{}: unsupported index version {}",
                        path.display(),
                        index.version
                    )));
                }
                Catalog::from_entries(index.modules)?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Catalog::default(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path,
            catalog: Mutex::new(catalog),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, catalog: &Catalog) -> Result<(), RegistryError> {
        let index = IndexFile {
            version: INDEX_VERSION,
            modules: catalog.entries(),
        };
        let bytes = serde_json::to_vec_pretty(&index)
            .map_err(|e| RegistryError::Corrupt(e.to_string()))?;
        let path = self.path.clone();

        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let dir = path.parent().unwrap_or_else(|| Path::new("."));
            std::fs::create_dir_all(dir)?;
            let mut temp = NamedTempFile::new_in(dir)?;
            temp.write_all(&bytes)?;
            temp.as_file().sync_all()?;
            temp.persist(&path).map_err(|e| e.error)?;
            Ok(())
        })
        .await
        .map_err(std::io::Error::other)??;
        Ok(())
    }
}

#[async_trait]
impl Registry for FileRegistry {
    async fn publish(&self, manifest: &Manifest) -> Result<RegistryEntry, RegistryError> {
        let entry = RegistryEntry::from_manifest(manifest)?;
        let mut catalog = self.catalog.lock().await;

        let mut next = catalog.clone();
        let (entry, published) = next.insert(entry)?;
        if published == Published::New {
            self.persist(&next).await?;
            *catalog = next;
            tracing::info!(module = %entry.id(), digest = %entry.digest, path = %self.path.display(), "Published");
        }
        Ok(entry)
    }

    async fn resolve_versions(
        &self,
        name: &ModuleName,
        constraint: &VersionReq,
    ) -> Result<Vec<RegistryEntry>, RegistryError> {
        Ok(self.catalog.lock().await.matching(name, constraint))
    }

    async fn entry(
        &self,
        name: &ModuleName,
        version: &Version,
    ) -> Result<RegistryEntry, RegistryError> {
        self.catalog.lock().await.get(name, version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::manifest;
    use tempfile::tempdir;

    #[tokio::test]
    async fn survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("registry.json");
        let m = manifest("demo", "1.0.0", "facts");

        let registry = FileRegistry::open(&path).await.unwrap();
        let published = registry.publish(&m).await.unwrap();
        drop(registry);

        let reopened = FileRegistry::open(&path).await.unwrap();
        let found = reopened
            .resolve_versions(&m.name, &VersionReq::STAR)
            .await
            .unwrap();
        assert_eq!(found, vec![published]);
    }

    #[tokio::test]
    async fn conflict_leaves_file_untouched() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("registry.json");
        let registry = FileRegistry::open(&path).await.unwrap();

        registry
            .publish(&manifest("demo", "1.0.0", "a"))
            .await
            .unwrap();
        let before = std::fs::read(&path).unwrap();

        assert!(
            registry
                .publish(&manifest("demo", "1.0.0", "b"))
                .await
                .is_err()
        );
        assert_eq!(std::fs::read(&path).unwrap(), before);
    }

    #[tokio::test]
    async fn rejects_garbage_index() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("registry.json");
        std::fs::write(&path, "not json").unwrap();

        assert!(matches!(
            FileRegistry::open(&path).await,
            Err(RegistryError::Corrupt(_))
        ));
    }
}
