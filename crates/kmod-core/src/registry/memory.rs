use async_trait::async_trait;
use kmod_schema::{Manifest, ModuleName, Version, VersionReq};
use tokio::sync::RwLock;

use super::{Catalog, Published, Registry, RegistryEntry, RegistryError};

/// Registry held in process memory.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    catalog: RwLock<Catalog>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn publish(&self, manifest: &Manifest) -> Result<RegistryEntry, RegistryError> {
        let entry = RegistryEntry::from_manifest(manifest)?;
        let (entry, published) = self.catalog.write().await.insert(entry)?;
        if published == Published::New {
            tracing::info!(module = %entry.id(), digest = %entry.digest, "Published");
        }
        Ok(entry)
    }

    async fn resolve_versions(
        &self,
        name: &ModuleName,
        constraint: &VersionReq,
    ) -> Result<Vec<RegistryEntry>, RegistryError> {
        Ok(self.catalog.read().await.matching(name, constraint))
    }

    async fn entry(
        &self,
        name: &ModuleName,
        version: &Version,
    ) -> Result<RegistryEntry, RegistryError> {
        self.catalog.read().await.get(name, version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::manifest;

    #[tokio::test]
    async fn publish_is_idempotent() {
        let registry = MemoryRegistry::new();
        let m = manifest("demo", "1.0.0", "facts");

        let first = registry.publish(&m).await.unwrap();
        let second = registry.publish(&m).await.unwrap();
        assert_eq!(first, second);

        let digest = registry
            .manifest_digest(&m.name, &m.version)
            .await
            .unwrap();
        assert_eq!(digest, m.digest);
    }

    #[tokio::test]
    async fn conflicting_publish_keeps_original() {
        let registry = MemoryRegistry::new();
        let original = manifest("demo", "1.0.0", "facts");
        let rewrite = manifest("demo", "1.0.0", "different facts");

        registry.publish(&original).await.unwrap();
        assert!(matches!(
            registry.publish(&rewrite).await,
            Err(RegistryError::Conflict { .. })
        ));
        assert_eq!(
            registry
                .manifest_digest(&original.name, &original.version)
                .await
                .unwrap(),
            original.digest
        );
    }

    #[tokio::test]
    async fn unknown_version() {
        let registry = MemoryRegistry::new();
        let name = ModuleName::parse("ghost").unwrap();

        assert!(
            registry
                .resolve_versions(&name, &VersionReq::STAR)
                .await
                .unwrap()
                .is_empty()
        );
        assert!(matches!(
            registry.entry(&name, &Version::new(1, 0, 0)).await,
            Err(RegistryError::NotFound { .. })
        ));
    }
}
