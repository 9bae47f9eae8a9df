//! Module installation.
//!
//! [`Loader::install`] runs the whole lifecycle for one request:
//!
//! 1. Resolve the request into an install plan.
//! 2. Skip plan steps already installed with the same digest.
//! 3. Fetch and verify every remaining manifest and payload, a bounded number
//!    of modules at a time.
//! 4. Stage each module under `tmp/` and rename it into `modules/`.
//! 5. Commit the plan to the install state in one transaction.
//!
//! A failure at any step removes the directories created by this attempt and
//! leaves the install state untouched. Steps 2 to 5 hold the lock of every
//! module name in the plan, so concurrent installs of the same module fetch
//! once and return equal handles, and an uninstall cannot remove a
//! prerequisite an install is relying on.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt};
use kmod_schema::{ContentDigest, Manifest, ModuleName, ModuleSpec, Version, VersionReq};

use crate::config::Config;
use crate::db::{DbError, DbHandle, HistoryEntry, InstalledRecord};
use crate::paths::Layout;
use crate::registry::{FileRegistry, Registry, RegistryEntry};
use crate::reporter::{NullReporter, Reporter};
use crate::resolver::{InstallPlan, Resolver};
use crate::retry::RetryPolicy;
use crate::store::{ContentStore, LocalStore, PruneStats, StoreError, TieredStore};
use crate::verifier::{TrustLevel, Verified, Verifier, payload_error};

pub mod error;
mod locks;
mod materialize;

pub use error::InstallError;
use locks::NameLocks;
use materialize::{FetchedModule, PAYLOAD_DIR, Placement, discard, materialize};

/// Tuning knobs for the loader.
#[derive(Debug, Clone)]
pub struct LoaderSettings {
    pub retry: RetryPolicy,
    /// Modules fetched concurrently within one install.
    pub max_parallel_fetches: usize,
    /// Bound on each registry query.
    pub registry_timeout: Duration,
}

impl Default for LoaderSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            max_parallel_fetches: 8,
            registry_timeout: Duration::from_secs(10),
        }
    }
}

/// An installed module version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleHandle {
    manifest: Arc<Manifest>,
    path: PathBuf,
    trust: TrustLevel,
    requested: bool,
    installed_at: DateTime<Utc>,
}

impl From<InstalledRecord> for ModuleHandle {
    fn from(record: InstalledRecord) -> Self {
        Self {
            manifest: Arc::new(record.manifest),
            path: record.path,
            trust: record.trust,
            requested: record.requested,
            installed_at: record.installed_at,
        }
    }
}

impl ModuleHandle {
    pub fn name(&self) -> &ModuleName {
        &self.manifest.name
    }

    pub fn version(&self) -> &Version {
        &self.manifest.version
    }

    pub fn digest(&self) -> &ContentDigest {
        &self.manifest.digest
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Install directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn trust(&self) -> &TrustLevel {
        &self.trust
    }

    /// Installed on request rather than as a prerequisite.
    pub fn is_requested(&self) -> bool {
        self.requested
    }

    pub fn installed_at(&self) -> DateTime<Utc> {
        self.installed_at
    }

    /// On-disk location of a payload file, if the manifest lists it.
    pub fn payload_path(&self, file: &str) -> Option<PathBuf> {
        self.manifest
            .entry(file)
            .map(|_| self.path.join(PAYLOAD_DIR).join(file))
    }

    /// Read a payload file, checking it against the manifest.
    pub async fn read(&self, file: &str) -> Result<Bytes, InstallError> {
        let entry = self.manifest.entry(file).ok_or_else(|| {
            InstallError::context("read", format!("{} has no payload '{file}'", self.manifest.id()))
        })?;
        let data = Bytes::from(tokio::fs::read(self.path.join(PAYLOAD_DIR).join(file)).await?);
        Verifier::check_payload(&self.manifest, entry, &data)?;
        Ok(data)
    }
}

pub struct Loader {
    layout: Layout,
    store: Arc<dyn ContentStore>,
    registry: Arc<dyn Registry>,
    db: DbHandle,
    verifier: Verifier,
    settings: LoaderSettings,
    reporter: Arc<dyn Reporter>,
    locks: NameLocks,
}

impl std::fmt::Debug for Loader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Loader")
            .field("home", &self.layout.home())
            .field("store", &self.store)
            .field("registry", &self.registry)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Loader {
    /// Loader with a strict trust policy, default settings, and no progress reporting.
    pub fn new(
        layout: Layout,
        store: Arc<dyn ContentStore>,
        registry: Arc<dyn Registry>,
        db: DbHandle,
    ) -> Self {
        Self {
            layout,
            store,
            registry,
            db,
            verifier: Verifier::default(),
            settings: LoaderSettings::default(),
            reporter: Arc::new(NullReporter),
            locks: NameLocks::default(),
        }
    }

    /// Wire a loader from configuration, with the registry index under the home directory.
    pub async fn open(config: &Config) -> Result<Self, InstallError> {
        let registry = FileRegistry::open(config.layout().registry()).await?;
        Self::open_with_registry(config, Arc::new(registry))
    }

    /// Wire a loader from configuration around an existing registry.
    pub fn open_with_registry(
        config: &Config,
        registry: Arc<dyn Registry>,
    ) -> Result<Self, InstallError> {
        let layout = config.layout();
        layout.ensure()?;

        let local = Arc::new(LocalStore::from_layout(&layout, config.digest)?);
        let mut store = TieredStore::new(local).with_timeout(config.remote_timeout());
        if let Some(remote) = config.remote_store()? {
            store = store.with_remote(remote);
        }

        let db = DbHandle::spawn(layout.db())?;
        tracing::debug!(home = %layout.home().display(), "Loader ready");

        Ok(Self::new(layout, Arc::new(store), registry, db)
            .with_verifier(Verifier::new(config.trust_policy()))
            .with_settings(config.loader_settings()))
    }

    pub fn with_verifier(mut self, verifier: Verifier) -> Self {
        self.verifier = verifier;
        self
    }

    pub fn with_settings(mut self, settings: LoaderSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn store(&self) -> &Arc<dyn ContentStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<dyn Registry> {
        &self.registry
    }

    /// Install from a `name@constraint` spec.
    pub async fn install_spec(&self, spec: &str) -> Result<ModuleHandle, InstallError> {
        let spec = ModuleSpec::parse(spec)?;
        self.install(&spec.name, &spec.constraint).await
    }

    /// Install the newest version of `name` satisfying `constraint`, with its prerequisites.
    pub async fn install(
        &self,
        name: &ModuleName,
        constraint: &VersionReq,
    ) -> Result<ModuleHandle, InstallError> {
        self.reporter.resolving(name, constraint);

        let plan = self.resolve(name, constraint).await?;
        self.reporter.planned(&plan.ids());
        let root = plan.root().clone();

        let _guards = self.locks.lock_all(plan.iter().map(|e| &e.name)).await;

        if let Some(existing) = self.db.get(root.name.as_str(), &root.version).await? {
            if existing.digest == root.digest {
                if !existing.requested {
                    let mut promoted = existing;
                    promoted.requested = true;
                    self.db.commit(vec![promoted]).await?;
                }
                self.reporter
                    .done(&root.name, &root.version, "already installed");
                return self.handle_required(&root).await;
            }
        }

        match self.apply(&plan).await {
            Ok(count) => {
                tracing::info!(module = %root.id(), installed = count, "Installed");
                self.reporter
                    .done(&root.name, &root.version, &format!("{count} module(s) installed"));
                self.handle_required(&root).await
            }
            Err(e) => {
                self.reporter
                    .failed(&root.name, &root.version, &e.to_string());
                if let Err(log_err) = self
                    .db
                    .add_history(root.name.as_str(), "install", Some(&root.version), false)
                    .await
                {
                    tracing::warn!(error = %log_err, "Failed to record install failure");
                }
                Err(e)
            }
        }
    }

    async fn resolve(
        &self,
        name: &ModuleName,
        constraint: &VersionReq,
    ) -> Result<InstallPlan, InstallError> {
        let registry = self.registry.as_ref();
        let timeout = self.settings.registry_timeout;
        let plan = self
            .settings
            .retry
            .run("resolve", self.reporter.as_ref(), move || async move {
                Resolver::new(registry)
                    .with_timeout(timeout)
                    .resolve(name, constraint)
                    .await
            })
            .await?;
        Ok(plan)
    }

    /// Fetch, verify, materialize and commit the steps not yet installed.
    async fn apply(&self, plan: &InstallPlan) -> Result<usize, InstallError> {
        let mut pending = Vec::new();
        for entry in plan.iter() {
            match self.db.get(entry.name.as_str(), &entry.version).await? {
                Some(rec) if rec.digest == entry.digest => {}
                Some(rec) => {
                    return Err(DbError::DigestConflict {
                        module: entry.id(),
                        existing: rec.digest,
                        attempted: entry.digest.clone(),
                    }
                    .into());
                }
                None => pending.push(entry),
            }
        }

        let fetches: Vec<_> = pending.into_iter().map(|entry| self.fetch(entry)).collect();
        let fetched: Vec<FetchedModule> = futures::stream::iter(fetches)
            .buffered(self.settings.max_parallel_fetches.max(1))
            .try_collect()
            .await?;

        let mut created = Vec::new();
        for module in &fetched {
            self.reporter
                .installing(&module.entry.name, &module.entry.version);
            let layout = self.layout.clone();
            let staged = module.clone();
            let result = tokio::task::spawn_blocking(move || materialize(&layout, &staged))
                .await
                .map_err(|e| InstallError::context("materialize", e))
                .and_then(|r| r.map_err(InstallError::from));
            match result {
                Ok(placement) => {
                    if let Placement::Replaced(dir) = &placement {
                        self.reporter.warning(&format!(
                            "Replaced stale directory for {} at {}",
                            module.entry.id(),
                            dir.display()
                        ));
                    }
                    created.extend(placement.written().map(Path::to_path_buf));
                }
                Err(e) => {
                    self.rollback(created).await;
                    return Err(e);
                }
            }
        }

        let root = plan.root();
        let now = Utc::now();
        let records: Vec<InstalledRecord> = fetched
            .iter()
            .map(|m| InstalledRecord {
                name: m.entry.name.clone(),
                version: m.entry.version.clone(),
                digest: m.entry.digest.clone(),
                document: m.entry.document.clone(),
                trust: m.trust.clone(),
                path: self
                    .layout
                    .module_dir(m.entry.name.as_str(), &m.entry.version.to_string()),
                manifest: m.manifest.clone(),
                requested: m.entry.name == root.name,
                installed_at: now,
            })
            .collect();

        if let Err(e) = self.db.commit(records).await {
            self.rollback(created).await;
            return Err(e.into());
        }
        Ok(fetched.len())
    }

    async fn fetch(&self, entry: &RegistryEntry) -> Result<FetchedModule, InstallError> {
        let document = self.get_blob("manifest", &entry.document).await?;
        let manifest = Manifest::from_document(&document)?;
        if manifest.name != entry.name || manifest.version != entry.version {
            return Err(InstallError::ManifestMismatch {
                entry: entry.id(),
                detail: format!("manifest is for {}", manifest.id()),
            });
        }
        // The resolver planned from the entry's prerequisites.
        if manifest.prerequisites != entry.prerequisites {
            return Err(InstallError::ManifestMismatch {
                entry: entry.id(),
                detail: "prerequisites differ".into(),
            });
        }

        self.reporter.verifying(&entry.name, &entry.version);
        let Verified { trust, .. } = self.verifier.verify_against(&manifest, &entry.digest)?;

        let total = manifest.total_size();
        let mut fetched_bytes = 0;
        let mut files = Vec::with_capacity(manifest.payload.len());
        for item in &manifest.payload {
            let data = self
                .get_blob(&item.name, &item.digest)
                .await
                .map_err(|e| payload_error(&manifest, item, e))?;
            Verifier::check_payload(&manifest, item, &data)?;
            fetched_bytes += data.len() as u64;
            self.reporter
                .fetching(&entry.name, &entry.version, fetched_bytes, Some(total));
            files.push((item.name.clone(), data));
        }

        Ok(FetchedModule {
            entry: entry.clone(),
            manifest,
            document,
            trust,
            files,
        })
    }

    async fn get_blob(&self, what: &str, digest: &ContentDigest) -> Result<Bytes, StoreError> {
        let store = self.store.as_ref();
        self.settings
            .retry
            .run(what, self.reporter.as_ref(), move || store.get(digest))
            .await
    }

    /// Remove directories created by a failed attempt, unless a concurrent
    /// install has since recorded them.
    async fn rollback(&self, created: Vec<PathBuf>) {
        let mut orphaned = Vec::new();
        for dir in created {
            let recorded = self
                .db
                .list()
                .await
                .map(|records| records.iter().any(|r| r.path == dir))
                .unwrap_or(false);
            if !recorded {
                orphaned.push(dir);
            }
        }
        if orphaned.is_empty() {
            return;
        }
        tracing::debug!(count = orphaned.len(), "Rolling back module directories");
        tokio::task::spawn_blocking(move || discard(&orphaned))
            .await
            .ok();
    }

    async fn handle_required(&self, entry: &RegistryEntry) -> Result<ModuleHandle, InstallError> {
        self.handle(&entry.name, &entry.version)
            .await?
            .ok_or_else(|| InstallError::context("install", format!("{} vanished after commit", entry.id())))
    }

    /// The installed copy of an exact version.
    pub async fn handle(
        &self,
        name: &ModuleName,
        version: &Version,
    ) -> Result<Option<ModuleHandle>, InstallError> {
        Ok(self
            .db
            .get(name.as_str(), version)
            .await?
            .map(ModuleHandle::from))
    }

    /// Installed versions of `name`, newest first.
    pub async fn installed(&self, name: &ModuleName) -> Result<Vec<ModuleHandle>, InstallError> {
        Ok(self
            .db
            .versions(name.as_str())
            .await?
            .into_iter()
            .map(ModuleHandle::from)
            .collect())
    }

    /// Every installed `(name, version)`, sorted.
    pub async fn list_installed(&self) -> Result<Vec<(ModuleName, Version)>, InstallError> {
        Ok(self
            .db
            .list()
            .await?
            .into_iter()
            .map(|r| (r.name, r.version))
            .collect())
    }

    /// Every installed module.
    pub async fn modules(&self) -> Result<Vec<ModuleHandle>, InstallError> {
        Ok(self
            .db
            .list()
            .await?
            .into_iter()
            .map(ModuleHandle::from)
            .collect())
    }

    /// Remove an installed version. Refuses while another installed module
    /// depends on it and no other installed version satisfies that dependency.
    pub async fn uninstall(&self, name: &ModuleName, version: &Version) -> Result<bool, InstallError> {
        let _guard = self.locks.lock(name).await;

        let installed = self.db.list().await?;
        let alternatives: Vec<&Version> = installed
            .iter()
            .filter(|r| &r.name == name && &r.version != version)
            .map(|r| &r.version)
            .collect();
        let required_by: Vec<String> = installed
            .iter()
            .filter(|r| {
                r.manifest.prerequisites.iter().any(|p| {
                    &p.name == name
                        && p.constraint.matches(version)
                        && !alternatives.iter().any(|v| p.constraint.matches(v))
                })
            })
            .map(InstalledRecord::id)
            .collect();
        if !required_by.is_empty() {
            return Err(InstallError::InUse {
                module: format!("{name}@{version}"),
                required_by,
            });
        }

        let Some(record) = self.db.remove(name.as_str(), version).await? else {
            return Ok(false);
        };
        self.reporter.removing(name, version);

        let path = record.path.clone();
        tokio::task::spawn_blocking(move || match std::fs::remove_dir_all(&path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        })
        .await
        .map_err(|e| InstallError::context("uninstall", e))??;

        self.reporter.done(name, version, "removed");
        Ok(true)
    }

    /// Full verification of a manifest against the loader's store.
    pub async fn verify(&self, manifest: &Manifest) -> Result<Verified, InstallError> {
        Ok(self.verifier.verify(manifest, self.store.as_ref()).await?)
    }

    /// Re-check an installed version's files against its manifest.
    pub async fn check_installed(
        &self,
        name: &ModuleName,
        version: &Version,
    ) -> Result<Verified, InstallError> {
        let handle = self.handle(name, version).await?.ok_or_else(|| {
            InstallError::context("check", format!("{name}@{version} is not installed"))
        })?;
        let verified = self.verifier.verify_manifest(handle.manifest())?;
        for entry in &handle.manifest().payload {
            handle.read(&entry.name).await?;
        }
        Ok(verified)
    }

    /// Delete local blobs no installed module references.
    pub async fn prune_blobs(&self, store: &LocalStore) -> Result<PruneStats, InstallError> {
        let keep: HashSet<ContentDigest> = self.db.referenced_blobs().await?.into_iter().collect();
        let stats = store.retain(&keep).await?;
        tracing::info!(removed = stats.removed, kept = stats.kept, bytes = stats.bytes_freed, "Pruned blobs");
        Ok(stats)
    }

    pub async fn history(&self, name: &ModuleName) -> Result<Vec<HistoryEntry>, InstallError> {
        Ok(self.db.history(name.as_str()).await?)
    }

    /// Stop the install-state actor after pending requests finish.
    pub async fn close(self) {
        self.db.shutdown().await;
    }
}
