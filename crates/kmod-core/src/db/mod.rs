//! SQLite install state
//!
//! Tracks installed module versions, their payload files, and an append-only
//! history of install and removal events. A whole install plan is committed in
//! one transaction, so readers see all of it or none of it.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use kmod_schema::{ContentDigest, Manifest, ModuleName, Version};
use rusqlite::{Connection, OptionalExtension, Row, params};
use thiserror::Error;

use crate::verifier::TrustLevel;

pub mod actor;

pub use actor::DbHandle;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Database actor stopped")]
    ActorDied,

    #[error("Corrupt install record: {0}")]
    Corrupt(String),

    #[error("{module} is installed with digest {existing}, refusing {attempted}")]
    DigestConflict {
        module: String,
        existing: ContentDigest,
        attempted: ContentDigest,
    },
}

/// One installed module version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledRecord {
    pub name: ModuleName,
    pub version: Version,
    pub digest: ContentDigest,
    /// Address of the manifest document blob.
    pub document: ContentDigest,
    pub trust: TrustLevel,
    pub path: PathBuf,
    pub manifest: Manifest,
    /// Installed on request rather than as a prerequisite.
    pub requested: bool,
    pub installed_at: DateTime<Utc>,
}

impl InstalledRecord {
    pub fn id(&self) -> String {
        format!("{}@{}", self.name, self.version)
    }
}

/// Installation history entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub name: String,
    pub action: String,
    pub version: Option<String>,
    pub digest: Option<String>,
    pub success: bool,
    pub at: DateTime<Utc>,
}

fn corrupt(what: &str, e: impl std::fmt::Display) -> DbError {
    DbError::Corrupt(format!("{what}: {e}"))
}

fn parse_time(s: &str) -> Result<DateTime<Utc>, DbError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| corrupt("timestamp", e))
}

const RECORD_COLUMNS: &str =
    "name, version, digest, document, trust, path, manifest, requested, installed_at";

/// Raw row, decoded outside the rusqlite row closure.
struct RawRecord {
    name: String,
    version: String,
    digest: String,
    document: String,
    trust: String,
    path: String,
    manifest: String,
    requested: bool,
    installed_at: String,
}

impl RawRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            name: row.get(0)?,
            version: row.get(1)?,
            digest: row.get(2)?,
            document: row.get(3)?,
            trust: row.get(4)?,
            path: row.get(5)?,
            manifest: row.get(6)?,
            requested: row.get(7)?,
            installed_at: row.get(8)?,
        })
    }

    fn decode(self) -> Result<InstalledRecord, DbError> {
        Ok(InstalledRecord {
            name: ModuleName::parse(&self.name).map_err(|e| corrupt("name", e))?,
            version: Version::parse(&self.version).map_err(|e| corrupt("version", e))?,
            digest: ContentDigest::parse(&self.digest).map_err(|e| corrupt("digest", e))?,
            document: ContentDigest::parse(&self.document).map_err(|e| corrupt("document", e))?,
            trust: self.trust.parse().map_err(|e: String| corrupt("trust", e))?,
            path: PathBuf::from(self.path),
            manifest: Manifest::from_document(self.manifest.as_bytes())
                .map_err(|e| corrupt("manifest", e))?,
            requested: self.requested,
            installed_at: parse_time(&self.installed_at)?,
        })
    }
}

/// State database for tracking installations
pub struct StateDb {
    conn: Connection,
}

impl StateDb {
    /// Open or create the database at `path`.
    pub fn open(path: &Path) -> Result<Self, DbError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, DbError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, DbError> {
        conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS modules (
                name TEXT NOT NULL,
                version TEXT NOT NULL,
                digest TEXT NOT NULL,
                document TEXT NOT NULL,
                trust TEXT NOT NULL,
                path TEXT NOT NULL,
                manifest TEXT NOT NULL,
                requested INTEGER NOT NULL DEFAULT 0,
                installed_at TEXT NOT NULL,
                PRIMARY KEY (name, version)
            );

            CREATE TABLE IF NOT EXISTS payloads (
                name TEXT NOT NULL,
                version TEXT NOT NULL,
                file TEXT NOT NULL,
                digest TEXT NOT NULL,
                size INTEGER NOT NULL,
                PRIMARY KEY (name, version, file),
                FOREIGN KEY (name, version) REFERENCES modules(name, version) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_payloads_digest ON payloads(digest);

            CREATE TABLE IF NOT EXISTS history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                action TEXT NOT NULL,
                version TEXT,
                digest TEXT,
                success INTEGER NOT NULL,
                at TEXT NOT NULL
            );
            ",
        )?;
        Ok(Self { conn })
    }

    /// Record every module of a plan atomically.
    ///
    /// Versions already installed with the same digest are kept, and only gain
    /// the `requested` flag if the new record carries it.
    pub fn commit(&mut self, records: &[InstalledRecord]) -> Result<(), DbError> {
        let tx = self.conn.transaction()?;
        for record in records {
            let existing: Option<String> = tx
                .query_row(
                    "SELECT digest FROM modules WHERE name = ?1 AND version = ?2",
                    params![record.name.as_str(), record.version.to_string()],
                    |row| row.get(0),
                )
                .optional()?;

            match existing {
                Some(digest) if digest == record.digest.to_string() => {
                    if record.requested {
                        tx.execute(
                            "UPDATE modules SET requested = 1 WHERE name = ?1 AND version = ?2",
                            params![record.name.as_str(), record.version.to_string()],
                        )?;
                    }
                    continue;
                }
                Some(digest) => {
                    return Err(DbError::DigestConflict {
                        module: record.id(),
                        existing: ContentDigest::parse(&digest)
                            .map_err(|e| corrupt("digest", e))?,
                        attempted: record.digest.clone(),
                    });
                }
                None => {}
            }

            let manifest = record
                .manifest
                .to_document()
                .map_err(|e| corrupt("manifest", e))?;
            tx.execute(
                &format!("INSERT INTO modules ({RECORD_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"),
                params![
                    record.name.as_str(),
                    record.version.to_string(),
                    record.digest.to_string(),
                    record.document.to_string(),
                    record.trust.to_string(),
                    record.path.to_string_lossy(),
                    String::from_utf8_lossy(&manifest),
                    record.requested,
                    record.installed_at.to_rfc3339(),
                ],
            )?;
            for entry in &record.manifest.payload {
                tx.execute(
                    "INSERT INTO payloads (name, version, file, digest, size) VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        record.name.as_str(),
                        record.version.to_string(),
                        entry.name,
                        entry.digest.to_string(),
                        entry.size as i64,
                    ],
                )?;
            }
            insert_history(
                &tx,
                record.name.as_str(),
                "install",
                Some(&record.version.to_string()),
                Some(&record.digest.to_string()),
                true,
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get(&self, name: &str, version: &Version) -> Result<Option<InstalledRecord>, DbError> {
        let raw = self
            .conn
            .query_row(
                &format!("SELECT {RECORD_COLUMNS} FROM modules WHERE name = ?1 AND version = ?2"),
                params![name, version.to_string()],
                RawRecord::from_row,
            )
            .optional()?;
        raw.map(RawRecord::decode).transpose()
    }

    /// Installed versions of one module, newest first.
    pub fn versions(&self, name: &str) -> Result<Vec<InstalledRecord>, DbError> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {RECORD_COLUMNS} FROM modules WHERE name = ?1"))?;
        let raws = stmt
            .query_map(params![name], RawRecord::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        let mut records = raws
            .into_iter()
            .map(RawRecord::decode)
            .collect::<Result<Vec<_>, _>>()?;
        records.sort_by(|a, b| b.version.cmp(&a.version));
        Ok(records)
    }

    /// Every installed version, by name then version.
    pub fn list(&self) -> Result<Vec<InstalledRecord>, DbError> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {RECORD_COLUMNS} FROM modules"))?;
        let raws = stmt
            .query_map([], RawRecord::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        let mut records = raws
            .into_iter()
            .map(RawRecord::decode)
            .collect::<Result<Vec<_>, _>>()?;
        records.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.version.cmp(&b.version)));
        Ok(records)
    }

    /// Remove one version. Returns the removed record, if it was installed.
    pub fn remove(
        &mut self,
        name: &str,
        version: &Version,
    ) -> Result<Option<InstalledRecord>, DbError> {
        let Some(record) = self.get(name, version)? else {
            return Ok(None);
        };

        let tx = self.conn.transaction()?;
        tx.execute(
            "DELETE FROM payloads WHERE name = ?1 AND version = ?2",
            params![name, version.to_string()],
        )?;
        tx.execute(
            "DELETE FROM modules WHERE name = ?1 AND version = ?2",
            params![name, version.to_string()],
        )?;
        insert_history(
            &tx,
            name,
            "remove",
            Some(&version.to_string()),
            Some(&record.digest.to_string()),
            true,
        )?;
        tx.commit()?;
        Ok(Some(record))
    }

    /// Blobs still referenced by an installed module: payloads and manifest documents.
    pub fn referenced_blobs(&self) -> Result<Vec<ContentDigest>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT digest FROM payloads UNION SELECT document FROM modules",
        )?;
        let digests = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        digests
            .iter()
            .map(|d| ContentDigest::parse(d).map_err(|e| corrupt("digest", e)))
            .collect()
    }

    /// Record a failed or out-of-band event.
    pub fn add_history(
        &self,
        name: &str,
        action: &str,
        version: Option<&str>,
        digest: Option<&str>,
        success: bool,
    ) -> Result<(), DbError> {
        insert_history(&self.conn, name, action, version, digest, success)
    }

    /// History for one module, oldest first.
    pub fn history(&self, name: &str) -> Result<Vec<HistoryEntry>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT name, action, version, digest, success, at FROM history WHERE name = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![name], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, bool>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(name, action, version, digest, success, at)| {
                Ok(HistoryEntry {
                    name,
                    action,
                    version,
                    digest,
                    success,
                    at: parse_time(&at)?,
                })
            })
            .collect()
    }
}

fn insert_history(
    conn: &Connection,
    name: &str,
    action: &str,
    version: Option<&str>,
    digest: Option<&str>,
    success: bool,
) -> Result<(), DbError> {
    conn.execute(
        "INSERT INTO history (name, action, version, digest, success, at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![name, action, version, digest, success, Utc::now().to_rfc3339()],
    )?;
    Ok(())
}
