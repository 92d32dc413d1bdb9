use leasekeeper_types::{Data, Operation};
use std::sync::Arc;

use super::storage::{InmemStorage, Storage};

/// A request routed to a backend.
#[derive(Clone)]
pub struct Request {
    pub operation: Operation,
    /// Path relative to the backend once routed; absolute before routing.
    pub path: String,
    pub data: Data,
    /// Backend-owned storage, attached by the router when it dispatches.
    pub storage: Option<Arc<dyn Storage>>,
}

impl Request {
    pub fn new(operation: Operation, path: impl Into<String>) -> Self {
        Self {
            operation,
            path: path.into(),
            data: Data::new(),
            storage: None,
        }
    }

    pub fn with_data(mut self, data: Data) -> Self {
        self.data = data;
        self
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("operation", &self.operation)
            .field("path", &self.path)
            .field("fields", &self.data.len())
            .field("has_storage", &self.storage.is_some())
            .finish()
    }
}

/// Build a purely in-memory request, for tests.
pub fn test_request(operation: Operation, path: &str) -> Request {
    let mut req = Request::new(operation, path);
    req.storage = Some(Arc::new(InmemStorage::new()));
    req
}
