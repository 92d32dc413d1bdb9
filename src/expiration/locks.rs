//! Per-lease mutual exclusion.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Lazily created locks keyed by lease ID. A lock is dropped from the
/// table once its last holder or waiter releases it.
#[derive(Debug, Default)]
pub(crate) struct LockTable {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

/// Held lock on one lease ID.
pub(crate) struct LeaseGuard<'a> {
    table: &'a LockTable,
    lease_id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, lease_id: &str) -> LeaseGuard<'_> {
        let mutex = self
            .locks
            .entry(lease_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = mutex.lock_owned().await;
        LeaseGuard {
            table: self,
            lease_id: lease_id.to_string(),
            guard: Some(guard),
        }
    }

    /// Number of live lock objects.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.locks.len()
    }
}

impl Drop for LeaseGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Only the table's own reference left: nobody holds or awaits it.
        self.table
            .locks
            .remove_if(&self.lease_id, |_, m| Arc::strong_count(m) == 1);
    }
}
