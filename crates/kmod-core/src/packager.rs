//! Turns source files plus a metadata record into a sealed module.
//!
//! All input is validated before anything is written, so a rejected draft
//! leaves the store untouched.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::try_join_all;
use kmod_schema::{
    Manifest, ModuleMetadata, ModuleName, PayloadEntry, Prerequisite, SchemaError, Version,
    parse_constraint,
};
use thiserror::Error;
use walkdir::WalkDir;

use crate::paths::is_safe_relative;
use crate::signing::ModuleSigner;
use crate::store::{ContentStore, StoreError};

#[derive(Error, Debug)]
pub enum PackageError {
    #[error("Module has no payload files")]
    EmptyPayload,

    #[error("Payload file '{0}' appears more than once")]
    DuplicateFileName(String),

    #[error("Invalid payload file name '{0}'")]
    InvalidFileName(String),

    #[error("Invalid module name: {0}")]
    InvalidName(SchemaError),

    #[error("Invalid version: {0}")]
    InvalidVersion(SchemaError),

    #[error("Invalid prerequisite '{name}': {source}")]
    InvalidConstraint { name: String, source: SchemaError },

    #[error("Module '{0}' lists itself as a prerequisite")]
    SelfPrerequisite(String),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// The metadata record handed to the packager.
#[derive(Debug, Clone, Default)]
pub struct ModuleDraft {
    pub name: String,
    pub version: String,
    /// `(name, constraint)` pairs, unparsed.
    pub prerequisites: Vec<(String, String)>,
    pub metadata: ModuleMetadata,
}

impl ModuleDraft {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            ..Self::default()
        }
    }

    pub fn prerequisite(mut self, name: impl Into<String>, constraint: impl Into<String>) -> Self {
        self.prerequisites.push((name.into(), constraint.into()));
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.metadata.description = description.into();
        self
    }

    pub fn kind(mut self, kind: impl Into<String>) -> Self {
        self.metadata.kind = kind.into();
        self
    }

    pub fn skill(mut self, skill: impl Into<String>) -> Self {
        self.metadata.skills.insert(skill.into());
        self
    }
}

/// A validated draft, ready to be written.
struct Checked {
    name: ModuleName,
    version: Version,
    prerequisites: Vec<Prerequisite>,
}

fn check(draft: &ModuleDraft, files: &[(String, Bytes)]) -> Result<Checked, PackageError> {
    if files.is_empty() {
        return Err(PackageError::EmptyPayload);
    }

    let name = ModuleName::parse(&draft.name).map_err(PackageError::InvalidName)?;
    let version = Version::parse(draft.version.trim()).map_err(|e| {
        PackageError::InvalidVersion(SchemaError::InvalidVersion(draft.version.clone(), e))
    })?;

    let mut seen = HashSet::new();
    for (file, _) in files {
        if !is_safe_relative(file) {
            return Err(PackageError::InvalidFileName(file.clone()));
        }
        if !seen.insert(file.as_str()) {
            return Err(PackageError::DuplicateFileName(file.clone()));
        }
    }

    let mut prerequisites = Vec::with_capacity(draft.prerequisites.len());
    for (prereq, constraint) in &draft.prerequisites {
        let prereq_name =
            ModuleName::parse(prereq).map_err(|source| PackageError::InvalidConstraint {
                name: prereq.clone(),
                source,
            })?;
        if prereq_name == name {
            return Err(PackageError::SelfPrerequisite(name.to_string()));
        }
        let constraint =
            parse_constraint(constraint).map_err(|source| PackageError::InvalidConstraint {
                name: prereq.clone(),
                source,
            })?;
        prerequisites.push(Prerequisite::new(prereq_name, constraint));
    }

    Ok(Checked {
        name,
        version,
        prerequisites,
    })
}

/// Builds modules into a content store.
#[derive(Debug, Clone)]
pub struct Packager {
    store: Arc<dyn ContentStore>,
    signer: Option<ModuleSigner>,
}

impl Packager {
    pub fn new(store: Arc<dyn ContentStore>) -> Self {
        Self {
            store,
            signer: None,
        }
    }

    /// Sign every manifest this packager produces.
    pub fn with_signer(mut self, signer: ModuleSigner) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Store each payload file and the manifest document, returning the sealed manifest.
    pub async fn package(
        &self,
        draft: &ModuleDraft,
        files: Vec<(String, Bytes)>,
    ) -> Result<Manifest, PackageError> {
        let checked = check(draft, &files)?;

        let payload = try_join_all(files.into_iter().map(|(file, data)| async move {
            let size = data.len() as u64;
            let digest = self.store.put(data).await?;
            Ok::<_, StoreError>(PayloadEntry {
                name: file,
                digest,
                size,
            })
        }))
        .await?;

        let mut manifest = Manifest::seal(
            checked.name,
            checked.version,
            draft.metadata.clone(),
            payload,
            checked.prerequisites,
            self.store.algorithm(),
        )?;
        if let Some(signer) = &self.signer {
            signer.sign(&mut manifest);
        }

        let document = self.store.put(Bytes::from(manifest.to_document()?)).await?;
        tracing::info!(
            module = %manifest.id(),
            digest = %manifest.digest,
            document = %document,
            files = manifest.payload.len(),
            bytes = manifest.total_size(),
            signed = manifest.signature.is_some(),
            "Packaged module"
        );
        Ok(manifest)
    }

    /// Package every regular file under `dir`, named by its `/`-separated relative path.
    pub async fn package_dir(
        &self,
        draft: &ModuleDraft,
        dir: &Path,
    ) -> Result<Manifest, PackageError> {
        let dir = dir.to_path_buf();
        let files = tokio::task::spawn_blocking(move || collect_dir(&dir))
            .await
            .map_err(std::io::Error::other)??;
        self.package(draft, files).await
    }
}

/// Read a directory tree into `(logical name, bytes)` pairs, sorted by name.
pub fn collect_dir(dir: &Path) -> Result<Vec<(String, Bytes)>, PackageError> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(std::io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(dir)
            .map_err(|_| PackageError::InvalidFileName(entry.path().display().to_string()))?;
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_str())
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| PackageError::InvalidFileName(relative.display().to_string()))?
            .join("/");
        files.push((name, Bytes::from(std::fs::read(entry.path())?)));
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::verifier::{TrustPolicy, Verifier};

    fn files(pairs: &[(&str, &str)]) -> Vec<(String, Bytes)> {
        pairs
            .iter()
            .map(|(n, b)| ((*n).to_string(), Bytes::copy_from_slice(b.as_bytes())))
            .collect()
    }

    #[tokio::test]
    async fn packages_demo_module() {
        let store = Arc::new(MemoryStore::default());
        let packager = Packager::new(store.clone());
        let draft = ModuleDraft::new("demo", "1.0.0").description("demo facts");

        let m = packager
            .package(&draft, files(&[("a.txt", "hello"), ("b.bin", "\x00\x01\x02")]))
            .await
            .unwrap();

        assert_eq!(m.payload.len(), 2);
        assert_eq!(m.entry("a.txt").unwrap().size, 5);
        assert!(m.prerequisites.is_empty());
        assert!(store.has(&m.document_digest().unwrap()).await.unwrap());
        Verifier::new(TrustPolicy::permissive())
            .verify(&m, store.as_ref())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn declaration_order_does_not_matter() {
        let store = Arc::new(MemoryStore::default());
        let packager = Packager::new(store);
        let draft = ModuleDraft::new("demo", "1.0.0")
            .prerequisite("base", "^1")
            .prerequisite("extra", ">=0.2");
        let reversed = ModuleDraft::new("demo", "1.0.0")
            .prerequisite("extra", ">=0.2")
            .prerequisite("base", "^1");

        let a = packager
            .package(&draft, files(&[("x", "1"), ("y", "2")]))
            .await
            .unwrap();
        let b = packager
            .package(&reversed, files(&[("y", "2"), ("x", "1")]))
            .await
            .unwrap();
        assert_eq!(a.digest, b.digest);
    }

    #[tokio::test]
    async fn rejects_bad_input_before_writing() {
        let store = Arc::new(MemoryStore::default());
        let packager = Packager::new(store.clone());

        let cases = [
            (ModuleDraft::new("demo", "1.0.0"), Vec::new()),
            (
                ModuleDraft::new("demo", "1.0.0"),
                files(&[("a", "1"), ("a", "2")]),
            ),
            (ModuleDraft::new("demo", "1.0.0"), files(&[("../a", "1")])),
            (ModuleDraft::new("Demo!", "1.0.0"), files(&[("a", "1")])),
            (ModuleDraft::new("demo", "one"), files(&[("a", "1")])),
            (
                ModuleDraft::new("demo", "1.0.0").prerequisite("base", "~>nope"),
                files(&[("a", "1")]),
            ),
            (
                ModuleDraft::new("demo", "1.0.0").prerequisite("demo", "^1"),
                files(&[("a", "1")]),
            ),
        ];

        let mut errors = Vec::new();
        for (draft, files) in cases {
            errors.push(packager.package(&draft, files).await.unwrap_err());
        }

        assert!(matches!(errors[0], PackageError::EmptyPayload));
        assert!(matches!(errors[1], PackageError::DuplicateFileName(_)));
        assert!(matches!(errors[2], PackageError::InvalidFileName(_)));
        assert!(matches!(errors[3], PackageError::InvalidName(_)));
        assert!(matches!(errors[4], PackageError::InvalidVersion(_)));
        assert!(matches!(errors[5], PackageError::InvalidConstraint { .. }));
        assert!(matches!(errors[6], PackageError::SelfPrerequisite(_)));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn signed_packages_carry_signature() {
        let store = Arc::new(MemoryStore::default());
        let signer = ModuleSigner::generate();
        let packager = Packager::new(store).with_signer(signer.clone());

        let m = packager
            .package(&ModuleDraft::new("demo", "1.0.0"), files(&[("a", "1")]))
            .await
            .unwrap();
        assert_eq!(m.signature.unwrap().key_id(), signer.key_id());
    }

    #[tokio::test]
    async fn packages_directory_tree() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("notes")).unwrap();
        std::fs::write(dir.path().join("index.md"), "# index").unwrap();
        std::fs::write(dir.path().join("notes/one.md"), "one").unwrap();

        let store = Arc::new(MemoryStore::default());
        let m = Packager::new(store)
            .package_dir(&ModuleDraft::new("notes", "0.1.0"), dir.path())
            .await
            .unwrap();

        let names: Vec<_> = m.payload.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["index.md", "notes/one.md"]);
    }
}
