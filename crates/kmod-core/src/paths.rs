use dirs::home_dir;
use std::path::{Path, PathBuf};

/// Returns the module home directory, or None if the user's home cannot be resolved.
pub fn try_kmod_home() -> Option<PathBuf> {
    if let Ok(val) = std::env::var("KMOD_HOME") {
        return Some(PathBuf::from(val));
    }
    home_dir().map(|h| h.join(".kmod"))
}

/// Filesystem layout rooted at one home directory.
///
/// ```text
/// <home>/
/// ├── blobs/      # Local content store: <algo>/<2-hex prefix>/<hex>
/// ├── modules/    # Materialized modules: <name>/<version>/<files>
/// ├── tmp/        # Staging area (same volume as blobs/ and modules/)
/// ├── registry.json
/// ├── config.toml
/// └── state.db    # SQLite install state
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    home: PathBuf,
}

impl Layout {
    /// Layout rooted at `home`.
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self { home: home.into() }
    }

    /// Root directory.
    pub fn home(&self) -> &Path {
        &self.home
    }

    /// Local blob store: `<home>/blobs`
    pub fn blobs(&self) -> PathBuf {
        self.home.join("blobs")
    }

    /// Materialized modules: `<home>/modules`
    pub fn modules(&self) -> PathBuf {
        self.home.join("modules")
    }

    /// Staging area: `<home>/tmp`
    pub fn tmp(&self) -> PathBuf {
        self.home.join("tmp")
    }

    /// `SQLite` install state: `<home>/state.db`
    pub fn db(&self) -> PathBuf {
        self.home.join("state.db")
    }

    /// Flat-file registry index: `<home>/registry.json`
    pub fn registry(&self) -> PathBuf {
        self.home.join("registry.json")
    }

    /// Configuration file: `<home>/config.toml`
    pub fn config(&self) -> PathBuf {
        self.home.join("config.toml")
    }

    /// Directory holding one installed module version.
    pub fn module_dir(&self, name: &str, version: &str) -> PathBuf {
        self.modules().join(name).join(version)
    }

    /// Create every directory of the layout.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if a directory cannot be created.
    pub fn ensure(&self) -> std::io::Result<()> {
        for dir in [self.blobs(), self.modules(), self.tmp()] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

/// Check that a logical payload file name is a safe relative path.
///
/// Accepts `/`-separated names such as `chunks/part-1.bin`. Rejects empty
/// names, absolute paths, backslashes, and `.`/`..` or empty components.
pub fn is_safe_relative(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('/')
        && !name.contains('\\')
        && !name.contains('\0')
        && name
            .split('/')
            .all(|part| !part.is_empty() && part != "." && part != "..")
}
