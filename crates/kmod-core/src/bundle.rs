//! Transport bundles: one module packed into a compressed tar archive.
//!
//! ```text
//! manifest.json
//! blobs/<algo>/<hex>
//! ```
//!
//! Entries are written in manifest order with zeroed timestamps, so exporting
//! the same module twice yields identical bytes.

use std::collections::{BTreeMap, HashSet};
use std::io::{self, Read};

use bytes::Bytes;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use kmod_schema::{ContentDigest, GZIP_MAGIC, Manifest, SchemaError, ZSTD_MAGIC};
use thiserror::Error;
use zstd::stream::Decoder as ZstdDecoder;

use crate::store::{ContentStore, StoreError};
use crate::verifier::{Verifier, VerifyError, payload_error};

const MANIFEST_ENTRY: &str = "manifest.json";
const BLOB_PREFIX: &str = "blobs/";
const ZSTD_LEVEL: i32 = 3;

#[derive(Error, Debug)]
pub enum BundleError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Verification failed: {0}")]
    Verify(#[from] VerifyError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error("Malformed bundle: {0}")]
    Malformed(String),

    #[error("Unrecognized bundle compression")]
    UnknownFormat,
}

/// Compression applied around the tar stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BundleFormat {
    #[default]
    TarGz,
    TarZst,
}

impl BundleFormat {
    /// Sniff the compression from leading magic bytes.
    pub fn detect(bytes: &[u8]) -> Option<Self> {
        if bytes.starts_with(&GZIP_MAGIC) {
            Some(Self::TarGz)
        } else if bytes.starts_with(&ZSTD_MAGIC) {
            Some(Self::TarZst)
        } else {
            None
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::TarGz => "tar.gz",
            Self::TarZst => "tar.zst",
        }
    }
}

/// Pack `manifest` and every payload blob it references.
pub async fn export(
    manifest: &Manifest,
    store: &dyn ContentStore,
    format: BundleFormat,
) -> Result<Vec<u8>, BundleError> {
    let document = manifest.to_document()?;

    let mut seen = HashSet::new();
    let mut blobs = Vec::new();
    for entry in &manifest.payload {
        if !seen.insert(entry.digest.clone()) {
            continue;
        }
        let data = store
            .get(&entry.digest)
            .await
            .map_err(|e| payload_error(manifest, entry, e))?;
        blobs.push((entry.digest.clone(), data));
    }

    tracing::debug!(module = %manifest.id(), blobs = blobs.len(), ?format, "Exporting bundle");
    tokio::task::spawn_blocking(move || write_archive(&document, &blobs, format))
        .await
        .map_err(|e| BundleError::Malformed(e.to_string()))?
}

fn write_archive(
    document: &[u8],
    blobs: &[(ContentDigest, Bytes)],
    format: BundleFormat,
) -> Result<Vec<u8>, BundleError> {
    match format {
        BundleFormat::TarGz => {
            let encoder = GzEncoder::new(Vec::new(), Compression::default());
            let mut builder = tar::Builder::new(encoder);
            append_entries(&mut builder, document, blobs)?;
            Ok(builder.into_inner()?.finish()?)
        }
        BundleFormat::TarZst => {
            let encoder = zstd::stream::Encoder::new(Vec::new(), ZSTD_LEVEL)?;
            let mut builder = tar::Builder::new(encoder);
            append_entries(&mut builder, document, blobs)?;
            Ok(builder.into_inner()?.finish()?)
        }
    }
}

fn append_entries<W: io::Write>(
    builder: &mut tar::Builder<W>,
    document: &[u8],
    blobs: &[(ContentDigest, Bytes)],
) -> io::Result<()> {
    append_file(builder, MANIFEST_ENTRY, document)?;
    for (digest, data) in blobs {
        let path = format!("{BLOB_PREFIX}{}/{}", digest.algorithm(), digest.hex());
        append_file(builder, &path, data)?;
    }
    builder.finish()
}

fn append_file<W: io::Write>(
    builder: &mut tar::Builder<W>,
    path: &str,
    data: &[u8],
) -> io::Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(0);
    header.set_cksum();
    builder.append_data(&mut header, path, data)
}

/// Unpacked but not yet verified bundle contents.
#[derive(Debug, Default)]
struct Unpacked {
    document: Option<Vec<u8>>,
    blobs: BTreeMap<ContentDigest, Bytes>,
}

fn read_archive(bytes: &[u8]) -> Result<Unpacked, BundleError> {
    match BundleFormat::detect(bytes).ok_or(BundleError::UnknownFormat)? {
        BundleFormat::TarGz => read_entries(GzDecoder::new(bytes)),
        BundleFormat::TarZst => read_entries(ZstdDecoder::new(bytes)?),
    }
}

fn read_entries<R: Read>(reader: R) -> Result<Unpacked, BundleError> {
    let mut archive = tar::Archive::new(reader);
    let mut unpacked = Unpacked::default();

    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry.path()?.to_string_lossy().into_owned();
        let mut data = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut data)?;

        if path == MANIFEST_ENTRY {
            unpacked.document = Some(data);
        } else if let Some(rest) = path.strip_prefix(BLOB_PREFIX) {
            let (algo, hex) = rest
                .split_once('/')
                .ok_or_else(|| BundleError::Malformed(format!("unexpected blob path '{path}'")))?;
            let digest = ContentDigest::parse(&format!("{algo}:{hex}"))?;
            unpacked.blobs.insert(digest, Bytes::from(data));
        } else {
            tracing::debug!(path, "Ignoring unknown bundle entry");
        }
    }
    Ok(unpacked)
}

/// Unpack a bundle into `store`, verifying the manifest and every blob first.
///
/// Nothing is written unless the whole bundle verifies.
pub async fn import(
    bytes: Vec<u8>,
    store: &dyn ContentStore,
    verifier: &Verifier,
) -> Result<Manifest, BundleError> {
    let unpacked = tokio::task::spawn_blocking(move || read_archive(&bytes))
        .await
        .map_err(|e| BundleError::Malformed(e.to_string()))??;

    let document = unpacked
        .document
        .ok_or_else(|| BundleError::Malformed(format!("missing {MANIFEST_ENTRY}")))?;
    let manifest = Manifest::from_document(&document)?;
    verifier.verify_manifest(&manifest)?;

    for entry in &manifest.payload {
        let data = unpacked.blobs.get(&entry.digest).ok_or_else(|| {
            VerifyError::MissingPayload {
                module: manifest.id(),
                file: entry.name.clone(),
                digest: entry.digest.clone(),
            }
        })?;
        Verifier::check_payload(&manifest, entry, data)?;
    }

    for entry in &manifest.payload {
        if let Some(data) = unpacked.blobs.get(&entry.digest) {
            store.insert(&entry.digest, data.clone()).await?;
        }
    }
    let document = Bytes::from(manifest.to_document()?);
    store.insert(&manifest.document_digest()?, document).await?;

    tracing::info!(module = %manifest.id(), digest = %manifest.digest, "Imported bundle");
    Ok(manifest)
}
