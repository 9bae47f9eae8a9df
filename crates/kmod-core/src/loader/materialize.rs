//! Writes verified modules to their install directories.
//!
//! ```text
//! modules/<name>/<version>/
//! ├── DIGEST          # manifest digest, written last before the rename
//! ├── manifest.json   # the manifest document
//! └── payload/<files>
//! ```
//!
//! Every module is staged in `tmp/` and renamed into place, so an install
//! directory is either absent or complete.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use kmod_schema::{ContentDigest, Manifest};

use crate::paths::{Layout, is_safe_relative};
use crate::registry::RegistryEntry;
use crate::verifier::TrustLevel;

pub(crate) const PAYLOAD_DIR: &str = "payload";
pub(crate) const MANIFEST_FILE: &str = "manifest.json";
pub(crate) const DIGEST_FILE: &str = "DIGEST";

/// A module whose manifest and payload have been fetched and verified.
#[derive(Debug, Clone)]
pub(crate) struct FetchedModule {
    pub(crate) entry: RegistryEntry,
    pub(crate) manifest: Manifest,
    pub(crate) document: Bytes,
    pub(crate) trust: TrustLevel,
    pub(crate) files: Vec<(String, Bytes)>,
}

fn installed_digest(dir: &Path) -> Option<ContentDigest> {
    let text = fs::read_to_string(dir.join(DIGEST_FILE)).ok()?;
    ContentDigest::parse(text.trim()).ok()
}

/// Outcome of [`materialize`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Placement {
    Created(PathBuf),
    /// A directory with a different or missing `DIGEST` was removed first.
    Replaced(PathBuf),
    /// An identical copy was already in place.
    Existing,
}

impl Placement {
    /// The directory this call wrote, if any.
    pub(crate) fn written(&self) -> Option<&Path> {
        match self {
            Self::Created(dir) | Self::Replaced(dir) => Some(dir),
            Self::Existing => None,
        }
    }
}

/// Place `module` at its install directory.
pub(crate) fn materialize(layout: &Layout, module: &FetchedModule) -> io::Result<Placement> {
    let target = layout.module_dir(module.entry.name.as_str(), &module.entry.version.to_string());

    let mut replaced = false;
    if target.exists() {
        if installed_digest(&target).as_ref() == Some(&module.entry.digest) {
            return Ok(Placement::Existing);
        }
        tracing::warn!(path = %target.display(), "Replacing stale module directory");
        fs::remove_dir_all(&target)?;
        replaced = true;
    }

    fs::create_dir_all(layout.tmp())?;
    let staging = tempfile::Builder::new()
        .prefix("stage-")
        .tempdir_in(layout.tmp())?;

    let payload_root = staging.path().join(PAYLOAD_DIR);
    fs::create_dir_all(&payload_root)?;
    for (name, data) in &module.files {
        if !is_safe_relative(name) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("refusing payload path '{name}'"),
            ));
        }
        let dest = payload_root.join(name);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&dest, data)?;
    }
    fs::write(staging.path().join(MANIFEST_FILE), &module.document)?;
    fs::write(staging.path().join(DIGEST_FILE), module.entry.digest.to_string())?;

    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    let staged = staging.keep();
    if let Err(e) = fs::rename(&staged, &target) {
        fs::remove_dir_all(&staged).ok();
        // Another install of a shared prerequisite won the rename.
        if installed_digest(&target).as_ref() == Some(&module.entry.digest) {
            return Ok(Placement::Existing);
        }
        return Err(e);
    }
    Ok(if replaced {
        Placement::Replaced(target)
    } else {
        Placement::Created(target)
    })
}

/// Best-effort removal of directories created by a failed install.
pub(crate) fn discard(dirs: &[PathBuf]) {
    for dir in dirs {
        if let Err(e) = fs::remove_dir_all(dir) {
            tracing::warn!(path = %dir.display(), error = %e, "Failed to clean up module directory");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kmod_schema::{DigestAlgorithm, ModuleMetadata, ModuleName, PayloadEntry, Version};
    use tempfile::tempdir;

    fn fetched(files: &[(&str, &'static str)]) -> FetchedModule {
        let payload = files
            .iter()
            .map(|(n, d)| PayloadEntry {
                name: (*n).to_string(),
                digest: DigestAlgorithm::Sha256.compute(d.as_bytes()),
                size: d.len() as u64,
            })
            .collect();
        let manifest = Manifest::seal(
            ModuleName::parse("demo").unwrap(),
            Version::new(1, 0, 0),
            ModuleMetadata::default(),
            payload,
            Vec::new(),
            DigestAlgorithm::Sha256,
        )
        .unwrap();
        FetchedModule {
            entry: RegistryEntry::from_manifest(&manifest).unwrap(),
            document: Bytes::from(manifest.to_document().unwrap()),
            manifest,
            trust: TrustLevel::Unsigned,
            files: files
                .iter()
                .map(|(n, d)| ((*n).to_string(), Bytes::from_static(d.as_bytes())))
                .collect(),
        }
    }

    #[test]
    fn writes_payload_and_manifest() {
        let dir = tempdir().unwrap();
        let layout = Layout::new(dir.path());
        let module = fetched(&[("a.txt", "hello"), ("nested/b.txt", "world")]);

        let Placement::Created(created) = materialize(&layout, &module).unwrap() else {
            panic!("expected a fresh directory");
        };
        assert_eq!(created, layout.module_dir("demo", "1.0.0"));
        assert_eq!(
            fs::read_to_string(created.join("payload/nested/b.txt")).unwrap(),
            "world"
        );
        assert_eq!(installed_digest(&created), Some(module.entry.digest.clone()));

        // Leaves nothing behind in the staging area.
        assert_eq!(fs::read_dir(layout.tmp()).unwrap().count(), 0);
    }

    #[test]
    fn identical_copy_is_reused() {
        let dir = tempdir().unwrap();
        let layout = Layout::new(dir.path());
        let module = fetched(&[("a.txt", "hello")]);

        assert!(matches!(materialize(&layout, &module).unwrap(), Placement::Created(_)));
        assert_eq!(materialize(&layout, &module).unwrap(), Placement::Existing);
    }

    #[test]
    fn stale_directory_is_replaced() {
        let dir = tempdir().unwrap();
        let layout = Layout::new(dir.path());
        let stale = layout.module_dir("demo", "1.0.0");
        fs::create_dir_all(&stale).unwrap();
        fs::write(stale.join("leftover"), "junk").unwrap();

        let module = fetched(&[("a.txt", "hello")]);
        assert_eq!(
            materialize(&layout, &module).unwrap(),
            Placement::Replaced(stale.clone())
        );

        assert!(!stale.join("leftover").exists());
        assert!(stale.join("payload/a.txt").exists());
    }
}
