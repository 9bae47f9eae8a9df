//! Knowledge module lifecycle engine.
//!
//! Modules are packaged into a content-addressed store, published to a
//! registry, resolved together with their prerequisites, verified and
//! installed under a home directory.
//!
//! ```no_run
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! use kmod_core::{Config, Loader};
//!
//! let config = Config::load()?;
//! let loader = Loader::open(&config).await?;
//! let handle = loader.install_spec("demo@^1.0").await?;
//! println!("{} installed at {}", handle.manifest().id(), handle.path().display());
//! loader.close().await;
//! # Ok(())
//! # }
//! ```

pub mod bundle;
pub mod config;
pub mod db;
pub mod loader;
pub mod packager;
pub mod paths;
pub mod registry;
pub mod reporter;
pub mod resolver;
pub mod retry;
pub mod signing;
pub mod store;
pub mod verifier;

pub use bundle::{BundleError, BundleFormat};
pub use config::Config;
pub use db::{DbError, DbHandle, HistoryEntry, InstalledRecord};
pub use loader::{InstallError, Loader, LoaderSettings, ModuleHandle};
pub use packager::{ModuleDraft, PackageError, Packager};
pub use paths::*;
pub use registry::{FileRegistry, MemoryRegistry, Registry, RegistryEntry, RegistryError};
pub use reporter::{LogReporter, NullReporter, Reporter};
pub use resolver::{InstallPlan, ResolveError, Resolver};
pub use retry::RetryPolicy;
pub use signing::{KeyError, ModuleSigner};
pub use store::{ContentStore, LocalStore, MemoryStore, StoreError, TieredStore};
pub use verifier::{TrustLevel, TrustPolicy, Verified, Verifier, VerifyError};

/// User Agent string for network requests
pub const USER_AGENT: &str = concat!("kmod-core/", env!("CARGO_PKG_VERSION"));
