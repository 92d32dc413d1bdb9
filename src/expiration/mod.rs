//! Lease expiration engine.
//!
//! The [`ExpirationManager`] tracks every secret issued through it. Each
//! lease is persisted as a [`LeaseEntry`] under the manager's storage
//! namespace, indexed in memory, and scheduled for revocation at
//! `issue_time + duration`. One sweep task drains the schedule while the
//! manager is running.
//!
//! ## Locking
//!
//! - Register, renew, revoke and the sweep's auto-revoke serialize on a
//!   per-lease lock, so unrelated leases never wait on each other.
//! - The index is a concurrent map mutated only while the lease's lock is
//!   held.
//! - Start, stop and restore serialize on the lifecycle lock, and take the
//!   operation gate for writing. Lease operations hold the gate for reading,
//!   so stop returns only after in-flight operations have finished.
//! - Stop also waits for the sweep task, including revocations it has
//!   already begun.

mod entry;
mod locks;
mod queue;

pub use entry::LeaseEntry;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex, RwLock, RwLockReadGuard};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, trace, warn};

use crate::config::ExpirationConfig;
use crate::error::{AppError, AppResult};
use crate::logical::secret::ID_SEPARATOR;
use crate::logical::{
    collect_keys, generate_uuid, Operation, Request, Response, Storage, StorageEntry,
};
use crate::router::Router;
use locks::LockTable;
use queue::ExpirationQueue;

const ERR_RESTORE_RUNNING: &str = "cannot restore while running";
const ERR_ALREADY_RUNNING: &str = "expiration manager is already running";
const ERR_NOT_RUNNING: &str = "expiration manager is not running";

/// Default sleep of the sweep when nothing is scheduled.
const DEFAULT_IDLE_POLL: Duration = Duration::from_secs(60);

/// State shared with the sweep task.
struct Shared {
    router: Arc<Router>,
    view: Arc<dyn Storage>,
    index: DashMap<String, LeaseEntry>,
    locks: LockTable,
    queue: ExpirationQueue,
    running: AtomicBool,
}

struct SweepHandle {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Issues, renews and revokes leases, and revokes them automatically when
/// they expire.
pub struct ExpirationManager {
    shared: Arc<Shared>,
    lifecycle: Mutex<Option<SweepHandle>>,
    /// Read-held by lease operations, write-held by lifecycle changes.
    gate: RwLock<()>,
    idle_poll: Duration,
}

impl ExpirationManager {
    /// Create a stopped manager. `view` must be a storage namespace
    /// private to this manager.
    pub fn new(router: Arc<Router>, view: Arc<dyn Storage>) -> Self {
        Self {
            shared: Arc::new(Shared {
                router,
                view,
                index: DashMap::new(),
                locks: LockTable::new(),
                queue: ExpirationQueue::new(),
                running: AtomicBool::new(false),
            }),
            lifecycle: Mutex::new(None),
            gate: RwLock::new(()),
            idle_poll: DEFAULT_IDLE_POLL,
        }
    }

    pub fn with_config(router: Arc<Router>, view: Arc<dyn Storage>, config: &ExpirationConfig) -> Self {
        let mut manager = Self::new(router, view);
        manager.idle_poll = Duration::from_secs(config.idle_poll_secs.max(1));
        manager
    }

    /// Begin sweeping expired leases.
    pub async fn start(&self) -> AppResult<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.is_some() {
            return Err(AppError::Lifecycle(ERR_ALREADY_RUNNING));
        }

        let (shutdown, rx) = oneshot::channel();
        {
            let _gate = self.gate.write().await;
            self.shared.running.store(true, Ordering::SeqCst);
        }
        let task = tokio::spawn(run_sweep(self.shared.clone(), rx, self.idle_poll));
        *lifecycle = Some(SweepHandle { shutdown, task });

        info!(leases = self.shared.index.len(), "Expiration manager started");
        Ok(())
    }

    /// Halt the sweep and wait for it to finish. Stopping a stopped
    /// manager is a no-op.
    pub async fn stop(&self) -> AppResult<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        let Some(handle) = lifecycle.take() else {
            return Ok(());
        };

        {
            // Waits for operations that are already past the running check.
            let _gate = self.gate.write().await;
            self.shared.running.store(false, Ordering::SeqCst);
        }
        let _ = handle.shutdown.send(());
        handle
            .task
            .await
            .map_err(|e| AppError::internal(format!("expiration sweep failed: {}", e)))?;

        info!("Expiration manager stopped");
        Ok(())
    }

    /// Rebuild the in-memory index from persisted lease entries.
    ///
    /// Only valid while stopped. Returns the number of restored leases.
    /// The index is all or nothing: if any entry cannot be read or decoded
    /// the error is returned and the index is left empty.
    pub async fn restore(&self) -> AppResult<usize> {
        let lifecycle = self.lifecycle.lock().await;
        if lifecycle.is_some() {
            return Err(AppError::Lifecycle(ERR_RESTORE_RUNNING));
        }
        let _gate = self.gate.write().await;

        let shared = &self.shared;
        shared.index.clear();
        shared.queue.clear().await;

        let keys = collect_keys(shared.view.as_ref(), "").await?;
        let mut restored = Vec::with_capacity(keys.len());
        for key in keys {
            // Deleted between list and get.
            let Some(raw) = shared.view.get(&key).await? else {
                continue;
            };
            let mut entry = LeaseEntry::decode(&raw.value).inspect_err(|e| {
                error!(key = %key, error = %e, "Failed to decode lease entry");
            })?;
            if entry.lease_id != key {
                warn!(key = %key, lease_id = %entry.lease_id, "Lease entry ID does not match its key");
                entry.lease_id = key.clone();
            }
            restored.push((key, entry));
        }

        for (key, entry) in restored {
            shared.queue.schedule(entry.expire_time(), key.clone()).await;
            shared.index.insert(key, entry);
        }

        let count = shared.index.len();
        info!(count, "Restored leases");
        Ok(count)
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Admit one lease operation. The guard keeps stop and restore out
    /// until the operation completes.
    async fn enter(&self) -> AppResult<RwLockReadGuard<'_, ()>> {
        let gate = self.gate.read().await;
        if self.is_running() {
            Ok(gate)
        } else {
            Err(AppError::Lifecycle(ERR_NOT_RUNNING))
        }
    }

    /// Track a secret response issued for `req`, returning its lease ID.
    ///
    /// The ID is the request path followed by a random UUID, so leases can
    /// later be revoked by path prefix.
    pub async fn register(&self, req: &Request, resp: &Response) -> AppResult<String> {
        let _op = self.enter().await?;
        if !resp.is_secret {
            return Err(AppError::validation("response is not a secret"));
        }
        let lease = resp
            .lease
            .as_ref()
            .ok_or_else(|| AppError::validation("secret response has no lease"))?;
        if req.path.is_empty() {
            return Err(AppError::validation("request path is required"));
        }

        let lease_id = format!("{}{}{}", req.path, ID_SEPARATOR, generate_uuid()?);
        let now = Utc::now();
        let mut lease = lease.clone();
        lease.lease_id = lease_id.clone();
        let entry = LeaseEntry {
            lease_id: lease_id.clone(),
            path: req.path.clone(),
            data: resp.data.clone(),
            lease,
            issue_time: now,
            renew_time: now,
        };

        let shared = &self.shared;
        let _guard = shared.locks.lock(&lease_id).await;
        shared.persist(&entry).await?;

        let expire_time = entry.expire_time();
        shared.index.insert(lease_id.clone(), entry);
        shared.queue.schedule(expire_time, lease_id.clone()).await;

        info!(lease_id = %lease_id, path = %req.path, expires = %expire_time, "Registered lease");
        Ok(lease_id)
    }

    /// Extend a renewable lease by `increment`, returning its new
    /// expiration.
    ///
    /// The new duration (measured from issue time) is the larger of the
    /// current duration and the time already elapsed, plus `increment`,
    /// capped at the lease's maximum duration. A lease may be renewed until
    /// its grace period has elapsed.
    pub async fn renew(&self, lease_id: &str, increment: Duration) -> AppResult<DateTime<Utc>> {
        let _op = self.enter().await?;
        let shared = &self.shared;
        let _guard = shared.locks.lock(lease_id).await;

        let mut entry = shared
            .index
            .get(lease_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| AppError::not_found(lease_id))?;

        if !entry.lease.renewable {
            return Err(AppError::validation(format!("lease {} is not renewable", lease_id)));
        }
        let now = Utc::now();
        if now > entry.grace_deadline() {
            return Err(AppError::validation(format!(
                "lease {} expired and its grace period has elapsed",
                lease_id
            )));
        }

        let renew_req =
            Request::new(Operation::Renew, entry.path.clone()).with_data(entry.data.clone());
        if let Err(source) = shared.router.route(renew_req).await {
            warn!(lease_id = %lease_id, error = %source, "Backend refused renewal");
            return Err(AppError::Dispatch {
                lease_id: lease_id.to_string(),
                source,
            });
        }

        let elapsed = (now - entry.issue_time).to_std().unwrap_or(Duration::ZERO);
        let mut duration = entry.lease.duration.max(elapsed).saturating_add(increment);
        if let Some(max) = entry.lease.max_duration {
            duration = duration.min(max);
        }
        entry.lease.duration = duration;
        entry.renew_time = entry.renew_time.max(now);

        shared.persist(&entry).await?;

        let expire_time = entry.expire_time();
        shared.index.insert(lease_id.to_string(), entry);
        shared.queue.schedule(expire_time, lease_id.to_string()).await;

        info!(lease_id = %lease_id, expires = %expire_time, "Renewed lease");
        Ok(expire_time)
    }

    /// Revoke a lease now. Unknown IDs succeed.
    ///
    /// The backend is notified first; local state is removed even if that
    /// notification fails, in which case a [`AppError::Dispatch`] is
    /// returned.
    pub async fn revoke(&self, lease_id: &str) -> AppResult<()> {
        let _op = self.enter().await?;
        self.shared.revoke(lease_id).await
    }

    /// Revoke every lease whose path starts with `prefix`.
    ///
    /// Each lease is revoked independently; failures are collected into a
    /// single [`AppError::RevokePrefix`].
    pub async fn revoke_prefix(&self, prefix: &str) -> AppResult<()> {
        let _op = self.enter().await?;

        let ids: Vec<String> = self
            .shared
            .index
            .iter()
            .filter(|e| e.value().path.starts_with(prefix))
            .map(|e| e.key().clone())
            .collect();
        debug!(prefix = %prefix, count = ids.len(), "Revoking leases by prefix");

        let results = futures::future::join_all(ids.iter().map(|id| self.shared.revoke(id))).await;
        let failures: Vec<(String, AppError)> = ids
            .into_iter()
            .zip(results)
            .filter_map(|(id, result)| result.err().map(|e| (id, e)))
            .collect();

        if failures.is_empty() {
            Ok(())
        } else {
            Err(AppError::RevokePrefix {
                prefix: prefix.to_string(),
                failures,
            })
        }
    }

    /// Snapshot of a live lease.
    pub fn lease(&self, lease_id: &str) -> Option<LeaseEntry> {
        self.shared.index.get(lease_id).map(|e| e.value().clone())
    }

    pub fn expire_time(&self, lease_id: &str) -> Option<DateTime<Utc>> {
        self.shared.index.get(lease_id).map(|e| e.expire_time())
    }

    /// IDs of all outstanding leases, sorted.
    pub fn lease_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.shared.index.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.shared.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.index.is_empty()
    }
}

impl Shared {
    async fn persist(&self, entry: &LeaseEntry) -> AppResult<()> {
        let value = entry.encode()?;
        self.view
            .put(StorageEntry::new(entry.lease_id.clone(), value))
            .await?;
        Ok(())
    }

    /// Look a lease up in the index, falling back to storage.
    async fn load(&self, lease_id: &str) -> AppResult<Option<LeaseEntry>> {
        if let Some(entry) = self.index.get(lease_id) {
            return Ok(Some(entry.value().clone()));
        }
        match self.view.get(lease_id).await? {
            Some(raw) => Ok(Some(LeaseEntry::decode(&raw.value)?)),
            None => Ok(None),
        }
    }

    async fn revoke(&self, lease_id: &str) -> AppResult<()> {
        let _guard = self.locks.lock(lease_id).await;
        self.revoke_locked(lease_id).await
    }

    /// Revoke with the lease's lock already held.
    async fn revoke_locked(&self, lease_id: &str) -> AppResult<()> {
        let Some(entry) = self.load(lease_id).await? else {
            debug!(lease_id = %lease_id, "Lease already revoked");
            return Ok(());
        };

        let revoke_req =
            Request::new(Operation::Revoke, entry.path.clone()).with_data(entry.data);
        let dispatched = self.router.route(revoke_req).await;
        let deleted = self.view.delete(lease_id).await;
        // Stale schedule entries are skipped by the sweep.
        self.index.remove(lease_id);

        match (dispatched, deleted) {
            (Ok(_), Ok(())) => {
                info!(lease_id = %lease_id, "Revoked lease");
                Ok(())
            }
            (Err(source), deleted) => {
                warn!(lease_id = %lease_id, error = %source, "Backend revocation failed, lease removed locally");
                if let Err(e) = deleted {
                    error!(lease_id = %lease_id, error = %e, "Failed to delete lease entry");
                }
                Err(AppError::Dispatch {
                    lease_id: lease_id.to_string(),
                    source,
                })
            }
            (Ok(_), Err(e)) => {
                error!(lease_id = %lease_id, error = %e, "Failed to delete lease entry");
                Err(e.into())
            }
        }
    }

    /// Sweep callback for one due schedule entry.
    async fn expire(&self, lease_id: &str) {
        let _guard = self.locks.lock(lease_id).await;

        let due = self
            .index
            .get(lease_id)
            .is_some_and(|e| e.expire_time() <= Utc::now());
        if !due {
            trace!(lease_id = %lease_id, "Skipping stale expiration");
            return;
        }

        match self.revoke_locked(lease_id).await {
            Ok(()) => info!(lease_id = %lease_id, "Expired lease revoked"),
            Err(e) => error!(lease_id = %lease_id, error = %e, "Expired lease revocation incomplete"),
        }
    }
}

/// Sweep task: sleeps until the next deadline and revokes what is due.
///
/// Each expiration runs as its own task, so a slow backend only delays its
/// own leases. Pending expirations are drained before the sweep exits.
async fn run_sweep(shared: Arc<Shared>, mut shutdown: oneshot::Receiver<()>, idle_poll: Duration) {
    debug!("Expiration sweep running");
    let mut inflight = JoinSet::new();

    loop {
        let wait = match shared.queue.next_deadline().await {
            Some(at) => (at - Utc::now()).to_std().unwrap_or(Duration::ZERO),
            None => idle_poll,
        };

        tokio::select! {
            biased;
            _ = &mut shutdown => break,
            Some(done) = inflight.join_next(), if !inflight.is_empty() => {
                if let Err(e) = done {
                    error!(error = %e, "Expiration task failed");
                }
                continue;
            }
            _ = shared.queue.changed() => continue,
            _ = tokio::time::sleep(wait) => {}
        }

        for (_, lease_id) in shared.queue.pop_due(Utc::now()).await {
            let shared = shared.clone();
            inflight.spawn(async move { shared.expire(&lease_id).await });
        }
    }

    while let Some(done) = inflight.join_next().await {
        if let Err(e) = done {
            error!(error = %e, "Expiration task failed");
        }
    }
    debug!("Expiration sweep exited");
}

impl Drop for ExpirationManager {
    fn drop(&mut self) {
        if let Some(handle) = self.lifecycle.get_mut().take() {
            handle.task.abort();
        }
    }
}

impl std::fmt::Debug for ExpirationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpirationManager")
            .field("running", &self.is_running())
            .field("leases", &self.shared.index.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logical::{Data, InmemStorage, Lease, StorageError, StorageView};
    use crate::router::{Backend, BackendError};
    use async_trait::async_trait;
    use serde_json::json;

    struct NoopBackend;

    #[async_trait]
    impl Backend for NoopBackend {
        async fn handle_request(&self, _req: Request) -> Result<Option<Response>, BackendError> {
            Ok(None)
        }
    }

    /// Holds every revocation until released.
    #[derive(Default)]
    struct GatedBackend {
        entered: tokio::sync::Notify,
        release: tokio::sync::Notify,
    }

    #[async_trait]
    impl Backend for GatedBackend {
        async fn handle_request(&self, req: Request) -> Result<Option<Response>, BackendError> {
            if req.operation == Operation::Revoke {
                self.entered.notify_one();
                self.release.notified().await;
            }
            Ok(None)
        }
    }

    /// Storage that refuses writes.
    struct ReadOnlyStorage;

    #[async_trait]
    impl Storage for ReadOnlyStorage {
        async fn list(&self, _prefix: &str) -> Result<Vec<String>, StorageError> {
            Ok(Vec::new())
        }
        async fn get(&self, _key: &str) -> Result<Option<StorageEntry>, StorageError> {
            Ok(None)
        }
        async fn put(&self, _entry: StorageEntry) -> Result<(), StorageError> {
            Err(StorageError::Backend("read-only".to_string()))
        }
        async fn delete(&self, _key: &str) -> Result<(), StorageError> {
            Err(StorageError::Backend("read-only".to_string()))
        }
    }

    async fn mock_expiration() -> (ExpirationManager, Arc<InmemStorage>) {
        let router = Arc::new(Router::new());
        router
            .mount("prod/", Arc::new(NoopBackend), Arc::new(InmemStorage::new()))
            .await
            .unwrap();
        let backing = Arc::new(InmemStorage::new());
        let view = Arc::new(StorageView::new(backing.clone() as Arc<dyn Storage>, "expire/"));
        (ExpirationManager::new(router, view), backing)
    }

    /// Manager with `prod/` answered immediately and `slow/` gated.
    async fn gated_expiration() -> (Arc<ExpirationManager>, Arc<GatedBackend>, Arc<InmemStorage>) {
        let gated = Arc::new(GatedBackend::default());
        let router = Arc::new(Router::new());
        router
            .mount("prod/", Arc::new(NoopBackend), Arc::new(InmemStorage::new()))
            .await
            .unwrap();
        router
            .mount("slow/", gated.clone(), Arc::new(InmemStorage::new()))
            .await
            .unwrap();
        let backing = Arc::new(InmemStorage::new());
        let view = Arc::new(StorageView::new(backing.clone() as Arc<dyn Storage>, "expire/"));
        (Arc::new(ExpirationManager::new(router, view)), gated, backing)
    }

    /// Track an entry issued `issued_ago` in the past without scheduling it,
    /// so the sweep leaves it alone.
    async fn track_unscheduled(exp: &ExpirationManager, issued_ago: i64, lease: Lease) -> LeaseEntry {
        let issued = Utc::now() - chrono::Duration::seconds(issued_ago);
        let lease_id = "prod/aws/foo-7f1c".to_string();
        let entry = LeaseEntry {
            lease_id: lease_id.clone(),
            path: "prod/aws/foo".to_string(),
            data: Data::new(),
            lease: Lease {
                lease_id: lease_id.clone(),
                ..lease
            },
            issue_time: issued,
            renew_time: issued,
        };
        exp.shared.persist(&entry).await.unwrap();
        exp.shared.index.insert(lease_id, entry.clone());
        entry
    }

    async fn wait_for(what: &str, mut done: impl FnMut() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while !done() {
            assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {}", what);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn secret_response(lease: Lease) -> Response {
        let mut data = Data::new();
        data.insert("access_key".to_string(), json!("xyz"));
        Response::secret(lease, data)
    }

    #[tokio::test]
    async fn test_start_stop_restore() {
        let (exp, _) = mock_expiration().await;
        exp.start().await.unwrap();
        assert!(exp.is_running());

        let err = exp.restore().await.unwrap_err();
        assert_eq!(err.to_string(), "cannot restore while running");

        let err = exp.start().await.unwrap_err();
        assert!(matches!(err, AppError::Lifecycle(_)));

        exp.stop().await.unwrap();
        assert!(!exp.is_running());
        exp.stop().await.unwrap();
        assert_eq!(exp.restore().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_operations_require_running() {
        let (exp, _) = mock_expiration().await;
        let req = Request::new(Operation::Read, "prod/aws/foo");
        let resp = secret_response(Lease::new(Duration::from_secs(60)));

        let err = exp.register(&req, &resp).await.unwrap_err();
        assert!(matches!(err, AppError::Lifecycle(_)));
        assert!(matches!(exp.revoke("x").await, Err(AppError::Lifecycle(_))));
    }

    #[tokio::test]
    async fn test_register_persists_under_namespace() {
        let (exp, backing) = mock_expiration().await;
        exp.start().await.unwrap();

        let req = Request::new(Operation::Read, "prod/aws/foo");
        let id = exp
            .register(&req, &secret_response(Lease::new(Duration::from_secs(3600))))
            .await
            .unwrap();

        assert!(id.starts_with("prod/aws/foo-"));
        let raw = backing.get(&format!("expire/{}", id)).await.unwrap().unwrap();
        let entry = LeaseEntry::decode(&raw.value).unwrap();
        assert_eq!(entry.lease_id, id);
        assert_eq!(entry.lease.lease_id, id);
        assert_eq!(entry.path, "prod/aws/foo");
        assert_eq!(entry.issue_time, entry.renew_time);
        assert_eq!(exp.lease(&id), Some(entry));
        exp.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_register_rejects_non_secret() {
        let (exp, _) = mock_expiration().await;
        exp.start().await.unwrap();
        let req = Request::new(Operation::Read, "prod/aws/foo");

        let err = exp.register(&req, &Response::with_data(Data::new())).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        let mut no_lease = secret_response(Lease::default());
        no_lease.lease = None;
        let err = exp.register(&req, &no_lease).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert!(exp.is_empty());
    }

    #[tokio::test]
    async fn test_register_storage_failure_leaves_index_untouched() {
        let router = Arc::new(Router::new());
        let exp = ExpirationManager::new(router, Arc::new(ReadOnlyStorage));
        exp.start().await.unwrap();

        let req = Request::new(Operation::Read, "prod/aws/foo");
        let err = exp
            .register(&req, &secret_response(Lease::new(Duration::from_secs(60))))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Storage(_)));
        assert!(exp.is_empty());
        exp.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_renew_not_found_and_not_renewable() {
        let (exp, _) = mock_expiration().await;
        exp.start().await.unwrap();

        let err = exp.renew("prod/missing-1", Duration::from_secs(1)).await.unwrap_err();
        assert!(err.is_not_found());

        let req = Request::new(Operation::Read, "prod/aws/foo");
        let id = exp
            .register(&req, &secret_response(Lease::new(Duration::from_secs(60))))
            .await
            .unwrap();
        let before = exp.expire_time(&id).unwrap();
        let err = exp.renew(&id, Duration::from_secs(60)).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert_eq!(exp.expire_time(&id).unwrap(), before);
        exp.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_renew_extends_and_persists() {
        let (exp, backing) = mock_expiration().await;
        exp.start().await.unwrap();

        let req = Request::new(Operation::Read, "prod/aws/foo");
        let lease = Lease::new(Duration::from_secs(60))
            .renewable(true)
            .with_max_duration(Duration::from_secs(600));
        let id = exp.register(&req, &secret_response(lease)).await.unwrap();
        let issued = exp.lease(&id).unwrap();

        let expires = exp.renew(&id, Duration::from_secs(120)).await.unwrap();
        assert_eq!(expires - issued.issue_time, chrono::Duration::seconds(180));

        let raw = backing.get(&format!("expire/{}", id)).await.unwrap().unwrap();
        let stored = LeaseEntry::decode(&raw.value).unwrap();
        assert_eq!(stored.lease.duration, Duration::from_secs(180));
        assert!(stored.renew_time >= issued.renew_time);

        // capped at max duration
        let expires = exp.renew(&id, Duration::from_secs(10_000)).await.unwrap();
        assert_eq!(expires - issued.issue_time, chrono::Duration::seconds(600));
        exp.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_revoke_is_idempotent() {
        let (exp, backing) = mock_expiration().await;
        exp.start().await.unwrap();

        let req = Request::new(Operation::Read, "prod/aws/foo");
        let id = exp
            .register(&req, &secret_response(Lease::new(Duration::from_secs(60))))
            .await
            .unwrap();

        exp.revoke(&id).await.unwrap();
        exp.revoke(&id).await.unwrap();
        exp.revoke("prod/never-registered").await.unwrap();

        assert!(exp.lease(&id).is_none());
        assert!(backing.is_empty().await);
        assert_eq!(exp.shared.locks.len(), 0);
        exp.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_revoke_unroutable_is_partial_failure() {
        let (exp, backing) = mock_expiration().await;
        exp.start().await.unwrap();

        let req = Request::new(Operation::Read, "unmounted/path");
        let id = exp
            .register(&req, &secret_response(Lease::new(Duration::from_secs(60))))
            .await
            .unwrap();

        let err = exp.revoke(&id).await.unwrap_err();
        assert!(err.is_partial_failure());
        assert!(exp.lease(&id).is_none());
        assert!(backing.is_empty().await);
        exp.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_sweep_revokes_expired_lease() {
        let (exp, backing) = mock_expiration().await;
        exp.start().await.unwrap();

        let req = Request::new(Operation::Read, "prod/aws/foo");
        let lease = Lease::new(Duration::from_millis(50)).with_grace_period(Duration::from_secs(3600));
        let id = exp.register(&req, &secret_response(lease)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(exp.lease(&id).is_none(), "grace period must not delay the sweep");
        assert!(backing.is_empty().await);
        exp.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_sweep_honors_renewal() {
        let (exp, _) = mock_expiration().await;
        exp.start().await.unwrap();

        let req = Request::new(Operation::Read, "prod/aws/foo");
        let lease = Lease::new(Duration::from_millis(200)).renewable(true);
        let id = exp.register(&req, &secret_response(lease)).await.unwrap();

        exp.renew(&id, Duration::from_secs(3600)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(exp.lease(&id).is_some());
        exp.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_restore_failure_leaves_index_empty() {
        let (exp, backing) = mock_expiration().await;
        exp.start().await.unwrap();
        let req = Request::new(Operation::Read, "prod/aws/foo");
        for _ in 0..3 {
            exp.register(&req, &secret_response(Lease::new(Duration::from_secs(3600))))
                .await
                .unwrap();
        }
        exp.stop().await.unwrap();

        backing
            .put(StorageEntry::new("expire/a/x-zzzz", b"{not json".to_vec()))
            .await
            .unwrap();
        let err = exp.restore().await.unwrap_err();
        assert!(matches!(err, AppError::Codec(_)));
        assert!(exp.is_empty());
        assert_eq!(exp.shared.queue.len().await, 0);

        backing.delete("expire/a/x-zzzz").await.unwrap();
        assert_eq!(exp.restore().await.unwrap(), 3);
        assert_eq!(exp.shared.queue.len().await, 3);
    }

    #[tokio::test]
    async fn test_stop_waits_for_in_flight_revoke() {
        let (exp, gated, backing) = gated_expiration().await;
        exp.start().await.unwrap();
        let id = exp
            .register(
                &Request::new(Operation::Read, "slow/creds"),
                &secret_response(Lease::new(Duration::from_secs(3600))),
            )
            .await
            .unwrap();

        let revoke = {
            let (exp, id) = (exp.clone(), id.clone());
            tokio::spawn(async move { exp.revoke(&id).await })
        };
        gated.entered.notified().await;

        let stop = {
            let exp = exp.clone();
            tokio::spawn(async move { exp.stop().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!stop.is_finished());
        assert!(exp.is_running());

        gated.release.notify_one();
        revoke.await.unwrap().unwrap();
        stop.await.unwrap().unwrap();

        // Nothing stale for restore to pick up.
        assert_eq!(exp.restore().await.unwrap(), 0);
        assert!(exp.lease(&id).is_none());
        assert!(backing.is_empty().await);
    }

    #[tokio::test]
    async fn test_operations_after_stop_are_rejected() {
        let (exp, _, _) = gated_expiration().await;
        exp.start().await.unwrap();
        exp.stop().await.unwrap();

        let err = exp.revoke_prefix("prod/").await.unwrap_err();
        assert!(matches!(err, AppError::Lifecycle(_)));
        let err = exp.renew("prod/x-1", Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, AppError::Lifecycle(_)));
    }

    #[tokio::test]
    async fn test_renew_within_grace_period() {
        let (exp, _) = mock_expiration().await;
        exp.start().await.unwrap();

        // Expired 60s ago, grace runs for another hour.
        let lease = Lease::new(Duration::from_secs(60))
            .renewable(true)
            .with_grace_period(Duration::from_secs(3600));
        let entry = track_unscheduled(&exp, 120, lease).await;
        assert!(entry.expire_time() < Utc::now());

        let expires = exp.renew(&entry.lease_id, Duration::from_secs(60)).await.unwrap();
        assert!(expires > Utc::now());
        let renewed = exp.lease(&entry.lease_id).unwrap();
        assert!(renewed.lease.duration >= Duration::from_secs(180));
        assert!(renewed.renew_time > entry.renew_time);
        exp.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_renew_after_grace_period_is_rejected() {
        let (exp, backing) = mock_expiration().await;
        exp.start().await.unwrap();

        // Expired 60s ago, grace ended 50s ago.
        let lease = Lease::new(Duration::from_secs(60))
            .renewable(true)
            .with_grace_period(Duration::from_secs(10));
        let entry = track_unscheduled(&exp, 120, lease).await;

        let err = exp.renew(&entry.lease_id, Duration::from_secs(60)).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert_eq!(exp.lease(&entry.lease_id), Some(entry.clone()));

        let raw = backing
            .get(&format!("expire/{}", entry.lease_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(LeaseEntry::decode(&raw.value).unwrap(), entry);
        exp.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_slow_revocation_does_not_stall_sweep() {
        let (exp, gated, _) = gated_expiration().await;
        exp.start().await.unwrap();

        let short = || secret_response(Lease::new(Duration::from_millis(50)));
        let slow = exp
            .register(&Request::new(Operation::Read, "slow/creds"), &short())
            .await
            .unwrap();
        let fast = exp
            .register(&Request::new(Operation::Read, "prod/aws/foo"), &short())
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(2), gated.entered.notified())
            .await
            .expect("slow lease was never swept");
        wait_for("fast lease to expire", || exp.lease(&fast).is_none()).await;
        assert!(exp.lease(&slow).is_some());

        gated.release.notify_one();
        wait_for("slow lease to expire", || exp.lease(&slow).is_none()).await;
        exp.stop().await.unwrap();
    }
}
