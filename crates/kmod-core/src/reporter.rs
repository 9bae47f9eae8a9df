//! Reporter trait for dependency injection
//!
//! This trait allows the lifecycle engine to report progress and status without
//! being coupled to a specific UI. Callers that only want logs use [`LogReporter`].

use kmod_schema::{ModuleName, Version, VersionReq};

pub trait Reporter: Send + Sync {
    /// Resolution of a requested module has started.
    fn resolving(&self, name: &ModuleName, constraint: &VersionReq);

    /// The install plan is known, in install order.
    fn planned(&self, steps: &[(ModuleName, Version)]);

    /// Updates the progress of a module fetch, in bytes.
    fn fetching(&self, name: &ModuleName, version: &Version, current: u64, total: Option<u64>);

    /// A module's manifest and payload are being verified.
    fn verifying(&self, name: &ModuleName, version: &Version);

    /// Updates the state of a module to 'installing'.
    fn installing(&self, name: &ModuleName, version: &Version);

    /// Updates the state of a module to 'removing'.
    fn removing(&self, name: &ModuleName, version: &Version);

    /// Marks a module operation as successfully completed.
    fn done(&self, name: &ModuleName, version: &Version, detail: &str);

    /// Marks a module operation as failed with a specific reason.
    fn failed(&self, name: &ModuleName, version: &Version, reason: &str);

    /// A transient failure is about to be retried.
    fn retrying(&self, what: &str, attempt: u32, max_attempts: u32, reason: &str);

    /// Log a warning message.
    fn warning(&self, msg: &str);
}

impl<T: Reporter + ?Sized> Reporter for std::sync::Arc<T> {
    fn resolving(&self, name: &ModuleName, constraint: &VersionReq) {
        (**self).resolving(name, constraint)
    }
    fn planned(&self, steps: &[(ModuleName, Version)]) {
        (**self).planned(steps)
    }
    fn fetching(&self, name: &ModuleName, version: &Version, current: u64, total: Option<u64>) {
        (**self).fetching(name, version, current, total)
    }
    fn verifying(&self, name: &ModuleName, version: &Version) {
        (**self).verifying(name, version)
    }
    fn installing(&self, name: &ModuleName, version: &Version) {
        (**self).installing(name, version)
    }
    fn removing(&self, name: &ModuleName, version: &Version) {
        (**self).removing(name, version)
    }
    fn done(&self, name: &ModuleName, version: &Version, detail: &str) {
        (**self).done(name, version, detail)
    }
    fn failed(&self, name: &ModuleName, version: &Version, reason: &str) {
        (**self).failed(name, version, reason)
    }
    fn retrying(&self, what: &str, attempt: u32, max_attempts: u32, reason: &str) {
        (**self).retrying(what, attempt, max_attempts, reason)
    }
    fn warning(&self, msg: &str) {
        (**self).warning(msg)
    }
}

/// A no-op reporter for silent operations (e.g., verification, testing).
#[derive(Debug, Clone, Copy, Default)]
pub struct NullReporter;

impl Reporter for NullReporter {
    fn resolving(&self, _: &ModuleName, _: &VersionReq) {}
    fn planned(&self, _: &[(ModuleName, Version)]) {}
    fn fetching(&self, _: &ModuleName, _: &Version, _: u64, _: Option<u64>) {}
    fn verifying(&self, _: &ModuleName, _: &Version) {}
    fn installing(&self, _: &ModuleName, _: &Version) {}
    fn removing(&self, _: &ModuleName, _: &Version) {}
    fn done(&self, _: &ModuleName, _: &Version, _: &str) {}
    fn failed(&self, _: &ModuleName, _: &Version, _: &str) {}
    fn retrying(&self, _: &str, _: u32, _: u32, _: &str) {}
    fn warning(&self, _: &str) {}
}

/// Forwards every event to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogReporter;

impl Reporter for LogReporter {
    fn resolving(&self, name: &ModuleName, constraint: &VersionReq) {
        tracing::info!(module = %name, constraint = %constraint, "Resolving");
    }

    fn planned(&self, steps: &[(ModuleName, Version)]) {
        let plan: Vec<String> = steps.iter().map(|(n, v)| format!("{n}@{v}")).collect();
        tracing::info!(steps = steps.len(), plan = %plan.join(", "), "Install plan ready");
    }

    fn fetching(&self, name: &ModuleName, version: &Version, current: u64, total: Option<u64>) {
        tracing::debug!(module = %name, version = %version, current, total, "Fetching");
    }

    fn verifying(&self, name: &ModuleName, version: &Version) {
        tracing::debug!(module = %name, version = %version, "Verifying");
    }

    fn installing(&self, name: &ModuleName, version: &Version) {
        tracing::debug!(module = %name, version = %version, "Installing");
    }

    fn removing(&self, name: &ModuleName, version: &Version) {
        tracing::info!(module = %name, version = %version, "Removing");
    }

    fn done(&self, name: &ModuleName, version: &Version, detail: &str) {
        tracing::info!(module = %name, version = %version, detail, "Done");
    }

    fn failed(&self, name: &ModuleName, version: &Version, reason: &str) {
        tracing::error!(module = %name, version = %version, reason, "Failed");
    }

    fn retrying(&self, what: &str, attempt: u32, max_attempts: u32, reason: &str) {
        tracing::warn!(what, attempt, max_attempts, reason, "Retrying");
    }

    fn warning(&self, msg: &str) {
        tracing::warn!("{msg}");
    }
}
