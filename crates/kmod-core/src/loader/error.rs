//! Domain-specific errors for module operations

use kmod_schema::SchemaError;
use thiserror::Error;

use crate::db::DbError;
use crate::registry::RegistryError;
use crate::resolver::ResolveError;
use crate::store::StoreError;
use crate::verifier::VerifyError;

#[derive(Error, Debug)]
pub enum InstallError {
    #[error("Failed to resolve dependencies: {0}")]
    Resolve(#[from] ResolveError),

    #[error("Verification failed: {0}")]
    Verify(#[from] VerifyError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Install state error: {0}")]
    Db(#[from] DbError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{module} is still required by {}", .required_by.join(", "))]
    InUse {
        module: String,
        required_by: Vec<String>,
    },

    #[error("Registry entry {entry} disagrees with its manifest: {detail}")]
    ManifestMismatch { entry: String, detail: String },

    #[error("{context}: {message}")]
    Context {
        context: &'static str,
        message: String,
    },
}

impl InstallError {
    /// Create an error with context for better debugging.
    pub fn context(ctx: &'static str, msg: impl std::fmt::Display) -> Self {
        Self::Context {
            context: ctx,
            message: msg.to_string(),
        }
    }

    /// Whether fetched content failed its digest check.
    pub fn is_integrity_failure(&self) -> bool {
        matches!(
            self,
            Self::Store(StoreError::IntegrityMismatch { .. })
                | Self::Verify(
                    VerifyError::IntegrityMismatch { .. }
                        | VerifyError::SizeMismatch { .. }
                        | VerifyError::TamperedManifest { .. }
                        | VerifyError::Store(StoreError::IntegrityMismatch { .. })
                )
        )
    }

    /// Transport failures only; never integrity or policy failures.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Resolve(e) => e.is_retryable(),
            Self::Store(e) | Self::Verify(VerifyError::Store(e)) => e.is_retryable(),
            Self::Registry(e) => e.is_retryable(),
            _ => false,
        }
    }
}
