//! Validation and encoding errors for schema types.

use crate::ContentDigest;
use thiserror::Error;

/// Errors raised while parsing, validating or encoding schema types.
#[derive(Error, Debug)]
pub enum SchemaError {
    /// A digest string is malformed.
    #[error("Invalid digest '{value}': {reason}")]
    InvalidDigest {
        /// The rejected input.
        value: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// A digest names an algorithm this build does not know.
    #[error("Unknown digest algorithm '{0}'")]
    UnknownAlgorithm(String),

    /// Bytes do not hash to the digest they were addressed by.
    #[error("Digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch {
        /// The address the bytes were requested under.
        expected: ContentDigest,
        /// The address recomputed from the bytes.
        actual: ContentDigest,
    },

    /// A module name violates the naming rules.
    #[error("Invalid module name '{name}': {reason}")]
    InvalidName {
        /// The rejected input.
        name: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// A version string is not a valid semantic version.
    #[error("Invalid version '{0}': {1}")]
    InvalidVersion(String, semver::Error),

    /// A version constraint does not parse.
    #[error("Invalid version constraint '{0}': {1}")]
    InvalidConstraint(String, semver::Error),

    /// The canonical binary encoding failed.
    #[error("Canonical encoding failed: {0}")]
    Encoding(#[from] postcard::Error),

    /// A manifest document is not valid JSON or misses fields.
    #[error("Malformed manifest document: {0}")]
    Document(#[from] serde_json::Error),
}
