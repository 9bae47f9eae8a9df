//! DB Actor - Thread-safe access to SQLite
//!
//! SQLite connections are not `Sync`, so the database lives on a dedicated
//! background thread and async callers talk to it through message passing.

use std::path::PathBuf;
use std::sync::mpsc;
use std::thread;

use kmod_schema::{ContentDigest, Version};
use tokio::sync::oneshot;

use super::{DbError, HistoryEntry, InstalledRecord, StateDb};

type Reply<T> = oneshot::Sender<Result<T, DbError>>;

/// Events that can be sent to the DB actor
pub enum DbEvent {
    /// Atomically record a resolved plan
    Commit {
        records: Vec<InstalledRecord>,
        resp: Reply<()>,
    },
    /// Get one installed version
    Get {
        name: String,
        version: Version,
        resp: Reply<Option<InstalledRecord>>,
    },
    /// Installed versions of one module
    Versions {
        name: String,
        resp: Reply<Vec<InstalledRecord>>,
    },
    /// Every installed version
    List { resp: Reply<Vec<InstalledRecord>> },
    /// Remove one version
    Remove {
        name: String,
        version: Version,
        resp: Reply<Option<InstalledRecord>>,
    },
    /// Blobs referenced by installed modules
    References { resp: Reply<Vec<ContentDigest>> },
    /// Append a history entry
    AddHistory {
        name: String,
        action: String,
        version: Option<String>,
        success: bool,
        resp: Reply<()>,
    },
    /// History of one module
    History {
        name: String,
        resp: Reply<Vec<HistoryEntry>>,
    },
    /// Drain and stop the actor
    Shutdown { resp: oneshot::Sender<()> },
}

/// A handle to the Database Actor that is Send + Sync and Clone.
#[derive(Debug, Clone)]
pub struct DbHandle {
    sender: mpsc::Sender<DbEvent>,
}

impl DbHandle {
    /// Spawn an actor over the database at `path`.
    pub fn spawn(path: impl Into<PathBuf>) -> Result<Self, DbError> {
        let path = path.into();
        Ok(Self::start(StateDb::open(&path)?))
    }

    /// Spawn an actor over a throwaway in-memory database.
    pub fn spawn_in_memory() -> Result<Self, DbError> {
        Ok(Self::start(StateDb::open_in_memory()?))
    }

    fn start(db: StateDb) -> Self {
        let (sender, receiver) = mpsc::channel();
        thread::spawn(move || {
            run_db_event_loop(db, receiver);
        });
        Self { sender }
    }

    /// Helper to send a request and wait for the response
    async fn request<T, F>(&self, f: F) -> Result<T, DbError>
    where
        F: FnOnce(Reply<T>) -> DbEvent,
    {
        let (tx, rx) = oneshot::channel();
        self.sender.send(f(tx)).map_err(|_| DbError::ActorDied)?;
        rx.await.map_err(|_| DbError::ActorDied)?
    }

    pub async fn commit(&self, records: Vec<InstalledRecord>) -> Result<(), DbError> {
        self.request(|resp| DbEvent::Commit { records, resp }).await
    }

    pub async fn get(
        &self,
        name: &str,
        version: &Version,
    ) -> Result<Option<InstalledRecord>, DbError> {
        let name = name.to_string();
        let version = version.clone();
        self.request(|resp| DbEvent::Get {
            name,
            version,
            resp,
        })
        .await
    }

    pub async fn versions(&self, name: &str) -> Result<Vec<InstalledRecord>, DbError> {
        let name = name.to_string();
        self.request(|resp| DbEvent::Versions { name, resp }).await
    }

    pub async fn list(&self) -> Result<Vec<InstalledRecord>, DbError> {
        self.request(|resp| DbEvent::List { resp }).await
    }

    pub async fn remove(
        &self,
        name: &str,
        version: &Version,
    ) -> Result<Option<InstalledRecord>, DbError> {
        let name = name.to_string();
        let version = version.clone();
        self.request(|resp| DbEvent::Remove {
            name,
            version,
            resp,
        })
        .await
    }

    pub async fn referenced_blobs(&self) -> Result<Vec<ContentDigest>, DbError> {
        self.request(|resp| DbEvent::References { resp }).await
    }

    pub async fn add_history(
        &self,
        name: &str,
        action: &str,
        version: Option<&Version>,
        success: bool,
    ) -> Result<(), DbError> {
        let name = name.to_string();
        let action = action.to_string();
        let version = version.map(ToString::to_string);
        self.request(|resp| DbEvent::AddHistory {
            name,
            action,
            version,
            success,
            resp,
        })
        .await
    }

    pub async fn history(&self, name: &str) -> Result<Vec<HistoryEntry>, DbError> {
        let name = name.to_string();
        self.request(|resp| DbEvent::History { name, resp }).await
    }

    /// Stop the actor once every queued request has been answered.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.sender.send(DbEvent::Shutdown { resp: tx }).is_ok() {
            rx.await.ok();
        }
    }
}

/// The actual event loop running in the background thread
fn run_db_event_loop(mut db: StateDb, receiver: mpsc::Receiver<DbEvent>) {
    while let Ok(event) = receiver.recv() {
        match event {
            DbEvent::Commit { records, resp } => {
                let _ = resp.send(db.commit(&records));
            }
            DbEvent::Get {
                name,
                version,
                resp,
            } => {
                let _ = resp.send(db.get(&name, &version));
            }
            DbEvent::Versions { name, resp } => {
                let _ = resp.send(db.versions(&name));
            }
            DbEvent::List { resp } => {
                let _ = resp.send(db.list());
            }
            DbEvent::Remove {
                name,
                version,
                resp,
            } => {
                let _ = resp.send(db.remove(&name, &version));
            }
            DbEvent::References { resp } => {
                let _ = resp.send(db.referenced_blobs());
            }
            DbEvent::AddHistory {
                name,
                action,
                version,
                success,
                resp,
            } => {
                let _ = resp.send(db.add_history(&name, &action, version.as_deref(), None, success));
            }
            DbEvent::History { name, resp } => {
                let _ = resp.send(db.history(&name));
            }
            DbEvent::Shutdown { resp } => {
                let _ = resp.send(());
                break;
            }
        }
    }
    tracing::debug!("Database actor stopped");
}
