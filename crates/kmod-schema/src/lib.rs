//! Shared types and wire format for knowledge modules.
//!
//! Everything that crosses a process or network boundary lives here: content
//! digests, validated module names, `name@constraint` specs and the
//! [`Manifest`] record together with its canonical encoding.

pub mod error;
pub mod hash;
pub mod manifest;
pub mod types;

// Re-exports
pub use error::SchemaError;
pub use hash::*;
pub use manifest::{Manifest, ManifestSignature, ModuleMetadata, PayloadEntry, Prerequisite};
pub use semver::{Version, VersionReq};
pub use types::*;

/// Magic bytes for ZSTD compression (Little Endian: 0xFD2FB528 -> 28 B5 2F FD)
pub const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

/// Magic bytes for gzip compression.
pub const GZIP_MAGIC: [u8; 2] = [0x1F, 0x8B];
