//! Mount table that maps request paths to the backends owning them.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::logical::{Request, Response, Storage};

/// Error returned by a backend while handling a request.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct BackendError {
    pub message: String,
}

impl BackendError {
    pub fn new<S: Into<String>>(message: S) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Router errors.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("no handler for route '{0}'")]
    Unroutable(String),

    #[error("existing mount at '{0}'")]
    AlreadyMounted(String),

    #[error("no mount at '{0}'")]
    NotMounted(String),

    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
}

/// A secret backend reachable through the router.
///
/// The request path is relative to the mount point.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn handle_request(&self, req: Request) -> Result<Option<Response>, BackendError>;
}

#[derive(Clone)]
struct MountEntry {
    backend: Arc<dyn Backend>,
    storage: Arc<dyn Storage>,
}

/// Routes requests to mounted backends by longest matching path prefix.
#[derive(Default)]
pub struct Router {
    mounts: RwLock<BTreeMap<String, MountEntry>>,
}

fn normalize_prefix(prefix: &str) -> String {
    if prefix.ends_with('/') {
        prefix.to_string()
    } else {
        format!("{}/", prefix)
    }
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mount `backend` at `prefix`. `storage` is handed to the backend
    /// with every request it receives.
    pub async fn mount(
        &self,
        prefix: &str,
        backend: Arc<dyn Backend>,
        storage: Arc<dyn Storage>,
    ) -> Result<(), RouterError> {
        let prefix = normalize_prefix(prefix);
        let mut mounts = self.mounts.write().await;
        if mounts.contains_key(&prefix) {
            return Err(RouterError::AlreadyMounted(prefix));
        }
        info!(prefix = %prefix, "Mounted backend");
        mounts.insert(prefix, MountEntry { backend, storage });
        Ok(())
    }

    /// Remove the mount at `prefix`. Callers revoke leases issued under the
    /// prefix before unmounting, since revocation needs the backend.
    pub async fn unmount(&self, prefix: &str) -> Result<(), RouterError> {
        let prefix = normalize_prefix(prefix);
        match self.mounts.write().await.remove(&prefix) {
            Some(_) => {
                info!(prefix = %prefix, "Unmounted backend");
                Ok(())
            }
            None => Err(RouterError::NotMounted(prefix)),
        }
    }

    /// The mount point that would serve `path`, if any.
    pub async fn match_route(&self, path: &str) -> Option<String> {
        let mounts = self.mounts.read().await;
        longest_match(&mounts, path).map(|(prefix, _)| prefix.clone())
    }

    /// Dispatch `req` to the backend owning its path.
    pub async fn route(&self, mut req: Request) -> Result<Option<Response>, RouterError> {
        let (prefix, entry) = {
            let mounts = self.mounts.read().await;
            match longest_match(&mounts, &req.path) {
                Some((prefix, entry)) => (prefix.clone(), entry.clone()),
                None => return Err(RouterError::Unroutable(req.path)),
            }
        };

        debug!(
            operation = %req.operation,
            path = %req.path,
            mount = %prefix,
            "Routing request"
        );

        req.path = req.path[prefix.len()..].to_string();
        req.storage = Some(entry.storage);
        Ok(entry.backend.handle_request(req).await?)
    }
}

fn longest_match<'a>(
    mounts: &'a BTreeMap<String, MountEntry>,
    path: &str,
) -> Option<(&'a String, &'a MountEntry)> {
    mounts
        .iter()
        .filter(|(prefix, _)| path.starts_with(prefix.as_str()))
        .max_by_key(|(prefix, _)| prefix.len())
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router").finish_non_exhaustive()
    }
}
