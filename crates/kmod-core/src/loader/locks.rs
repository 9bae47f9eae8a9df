//! Per-name install locks.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use kmod_schema::ModuleName;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Serializes work on the same module name. Different names proceed in parallel.
#[derive(Debug, Default)]
pub(crate) struct NameLocks {
    inner: Mutex<HashMap<ModuleName, Arc<AsyncMutex<()>>>>,
}

impl NameLocks {
    pub(crate) async fn lock(&self, name: &ModuleName) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            // Drop entries nobody holds or waits on.
            map.retain(|_, l| Arc::strong_count(l) > 1);
            map.entry(name.clone()).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Lock every name in `names`. Locks are taken in name order.
    pub(crate) async fn lock_all<'a>(
        &self,
        names: impl IntoIterator<Item = &'a ModuleName>,
    ) -> Vec<OwnedMutexGuard<()>> {
        let names: BTreeSet<&ModuleName> = names.into_iter().collect();
        let mut guards = Vec::with_capacity(names.len());
        for name in names {
            guards.push(self.lock(name).await);
        }
        guards
    }
}
