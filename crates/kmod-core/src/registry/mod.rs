//! Registry client: maps `(name, version)` to a manifest digest.
//!
//! Published versions are immutable. Re-publishing the same manifest is a no-op;
//! publishing different content under an existing version is a conflict.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kmod_schema::{ContentDigest, Manifest, ModuleName, Prerequisite, SchemaError, Version, VersionReq};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod file;
pub mod memory;

pub use file::FileRegistry;
pub use memory::MemoryRegistry;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("{module} is already published with digest {existing}, refusing {attempted}")]
    Conflict {
        module: String,
        existing: ContentDigest,
        attempted: ContentDigest,
    },

    #[error("{name}@{version} is not published")]
    NotFound { name: ModuleName, version: Version },

    #[error("Registry did not answer within {after:?}")]
    Timeout { after: Duration },

    #[error("Registry unreachable: {0}")]
    Network(String),

    #[error("Registry index is corrupt: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RegistryError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NotFound { .. } | Self::Timeout { .. } | Self::Network(_)
        )
    }
}

/// One published version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub name: ModuleName,
    pub version: Version,
    /// Manifest digest.
    pub digest: ContentDigest,
    /// Address of the manifest document blob.
    pub document: ContentDigest,
    #[serde(default)]
    pub prerequisites: Vec<Prerequisite>,
    pub published_at: DateTime<Utc>,
}

impl RegistryEntry {
    pub fn from_manifest(manifest: &Manifest) -> Result<Self, RegistryError> {
        Ok(Self {
            name: manifest.name.clone(),
            version: manifest.version.clone(),
            digest: manifest.digest.clone(),
            document: manifest.document_digest()?,
            prerequisites: manifest.prerequisites.clone(),
            published_at: Utc::now(),
        })
    }

    pub fn id(&self) -> String {
        format!("{}@{}", self.name, self.version)
    }
}

impl fmt::Display for RegistryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{} ({})", self.name, self.version, self.digest.short())
    }
}

#[async_trait]
pub trait Registry: Send + Sync + fmt::Debug {
    /// Record a manifest under its name and version.
    async fn publish(&self, manifest: &Manifest) -> Result<RegistryEntry, RegistryError>;

    /// Every published version satisfying `constraint`, newest first.
    async fn resolve_versions(
        &self,
        name: &ModuleName,
        constraint: &VersionReq,
    ) -> Result<Vec<RegistryEntry>, RegistryError>;

    /// The entry for an exact version.
    async fn entry(&self, name: &ModuleName, version: &Version)
    -> Result<RegistryEntry, RegistryError>;

    /// The manifest digest recorded for an exact version.
    async fn manifest_digest(
        &self,
        name: &ModuleName,
        version: &Version,
    ) -> Result<ContentDigest, RegistryError> {
        Ok(self.entry(name, version).await?.digest)
    }
}

/// In-memory index shared by the registry backends.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Catalog {
    modules: BTreeMap<ModuleName, BTreeMap<Version, RegistryEntry>>,
}

/// Whether a publish changed the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Published {
    New,
    Unchanged,
}

impl Catalog {
    pub(crate) fn from_entries(entries: Vec<RegistryEntry>) -> Result<Self, RegistryError> {
        let mut catalog = Self::default();
        for entry in entries {
            catalog.insert(entry)?;
        }
        Ok(catalog)
    }

    pub(crate) fn entries(&self) -> Vec<RegistryEntry> {
        self.modules
            .values()
            .flat_map(|versions| versions.values().cloned())
            .collect()
    }

    pub(crate) fn insert(&mut self, entry: RegistryEntry) -> Result<(RegistryEntry, Published), RegistryError> {
        let versions = self.modules.entry(entry.name.clone()).or_default();
        match versions.get(&entry.version) {
            Some(existing) if existing.digest == entry.digest => {
                Ok((existing.clone(), Published::Unchanged))
            }
            Some(existing) => Err(RegistryError::Conflict {
                module: entry.id(),
                existing: existing.digest.clone(),
                attempted: entry.digest,
            }),
            None => {
                versions.insert(entry.version.clone(), entry.clone());
                Ok((entry, Published::New))
            }
        }
    }

    pub(crate) fn matching(&self, name: &ModuleName, constraint: &VersionReq) -> Vec<RegistryEntry> {
        self.modules
            .get(name)
            .map(|versions| {
                versions
                    .values()
                    .rev()
                    .filter(|e| constraint.matches(&e.version))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub(crate) fn get(&self, name: &ModuleName, version: &Version) -> Result<RegistryEntry, RegistryError> {
        self.modules
            .get(name)
            .and_then(|versions| versions.get(version))
            .cloned()
            .ok_or_else(|| RegistryError::NotFound {
                name: name.clone(),
                version: version.clone(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kmod_schema::{DigestAlgorithm, ModuleMetadata};

    pub(crate) fn manifest(name: &str, version: &str, note: &str) -> Manifest {
        let mut metadata = ModuleMetadata::default();
        metadata.description = note.to_string();
        Manifest::seal(
            ModuleName::parse(name).unwrap(),
            Version::parse(version).unwrap(),
            metadata,
            Vec::new(),
            Vec::new(),
            DigestAlgorithm::Sha256,
        )
        .unwrap()
    }

    #[test]
    fn catalog_orders_newest_first() {
        let mut catalog = Catalog::default();
        for v in ["1.0.0", "1.2.0", "2.0.0", "1.10.0"] {
            let entry = RegistryEntry::from_manifest(&manifest("lib", v, "")).unwrap();
            catalog.insert(entry).unwrap();
        }

        let name = ModuleName::parse("lib").unwrap();
        let versions: Vec<String> = catalog
            .matching(&name, &VersionReq::parse("^1").unwrap())
            .iter()
            .map(|e| e.version.to_string())
            .collect();
        assert_eq!(versions, ["1.10.0", "1.2.0", "1.0.0"]);
    }

    #[test]
    fn catalog_rejects_conflicting_content() {
        let mut catalog = Catalog::default();
        let first = RegistryEntry::from_manifest(&manifest("lib", "1.0.0", "a")).unwrap();
        let again = RegistryEntry::from_manifest(&manifest("lib", "1.0.0", "a")).unwrap();
        let other = RegistryEntry::from_manifest(&manifest("lib", "1.0.0", "b")).unwrap();

        assert_eq!(catalog.insert(first).unwrap().1, Published::New);
        assert_eq!(catalog.insert(again).unwrap().1, Published::Unchanged);
        assert!(matches!(
            catalog.insert(other),
            Err(RegistryError::Conflict { .. })
        ));
    }
}
