//! Key/value storage contract consumed by the lease engine and backends.
//!
//! Keys are `/`-separated. [`Storage::list`] is shallow: it returns the
//! immediate children under a prefix, with deeper keys collapsed into a
//! single `segment/` entry. Use [`collect_keys`] to walk a whole subtree.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::RwLock;

/// A flat key / opaque value pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEntry {
    pub key: String,
    pub value: Vec<u8>,
}

impl StorageEntry {
    pub fn new(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Storage errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// Durable, ordered key/value store.
///
/// All operations are fallible and none are retried by callers. Deleting a
/// missing key succeeds.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;
    async fn get(&self, key: &str) -> Result<Option<StorageEntry>, StorageError>;
    async fn put(&self, entry: StorageEntry) -> Result<(), StorageError>;
    async fn delete(&self, key: &str) -> Result<(), StorageError>;
}

/// Reduce full keys under `prefix` to their immediate child segments,
/// deduplicated and in lexicographic order.
pub(crate) fn immediate_children<'a, I>(prefix: &str, keys: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut children = BTreeSet::new();
    for key in keys {
        let Some(rest) = key.strip_prefix(prefix) else {
            continue;
        };
        match rest.find('/') {
            Some(idx) => children.insert(rest[..=idx].to_string()),
            None => children.insert(rest.to_string()),
        };
    }
    children.into_iter().collect()
}

/// Recursively list every leaf key below `prefix`, relative to `prefix`.
pub async fn collect_keys(storage: &dyn Storage, prefix: &str) -> Result<Vec<String>, StorageError> {
    let mut keys = Vec::new();
    let mut pending = vec![String::new()];

    while let Some(dir) = pending.pop() {
        let children = storage.list(&format!("{}{}", prefix, dir)).await?;
        for child in children {
            let relative = format!("{}{}", dir, child);
            if child.ends_with('/') {
                pending.push(relative);
            } else {
                keys.push(relative);
            }
        }
    }

    keys.sort();
    Ok(keys)
}

/// In-memory storage, ordered by key.
#[derive(Debug, Default)]
pub struct InmemStorage {
    data: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl InmemStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries.
    pub async fn len(&self) -> usize {
        self.data.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.data.read().await.is_empty()
    }
}

#[async_trait]
impl Storage for InmemStorage {
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let data = self.data.read().await;
        let keys = data
            .range(prefix.to_string()..)
            .map(|(k, _)| k.as_str())
            .take_while(|k| k.starts_with(prefix));
        Ok(immediate_children(prefix, keys))
    }

    async fn get(&self, key: &str) -> Result<Option<StorageEntry>, StorageError> {
        let data = self.data.read().await;
        Ok(data.get(key).map(|value| StorageEntry::new(key, value.clone())))
    }

    async fn put(&self, entry: StorageEntry) -> Result<(), StorageError> {
        if entry.key.is_empty() {
            return Err(StorageError::InvalidKey("empty key".to_string()));
        }
        self.data.write().await.insert(entry.key, entry.value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.data.write().await.remove(key);
        Ok(())
    }
}

/// A storage namespace: every key is transparently prefixed before it
/// reaches the underlying store.
#[derive(Clone)]
pub struct StorageView {
    inner: Arc<dyn Storage>,
    prefix: String,
}

impl StorageView {
    pub fn new(inner: Arc<dyn Storage>, prefix: impl Into<String>) -> Self {
        Self {
            inner,
            prefix: prefix.into(),
        }
    }

    fn expand(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

impl std::fmt::Debug for StorageView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageView")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Storage for StorageView {
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        // Children are already relative to the listed prefix.
        self.inner.list(&self.expand(prefix)).await
    }

    async fn get(&self, key: &str) -> Result<Option<StorageEntry>, StorageError> {
        let entry = self.inner.get(&self.expand(key)).await?;
        Ok(entry.map(|e| StorageEntry::new(key, e.value)))
    }

    async fn put(&self, entry: StorageEntry) -> Result<(), StorageError> {
        if entry.key.is_empty() {
            return Err(StorageError::InvalidKey("empty key".to_string()));
        }
        let key = self.expand(&entry.key);
        self.inner.put(StorageEntry::new(key, entry.value)).await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.inner.delete(&self.expand(key)).await
    }
}

/// Conformance check for a [`Storage`] implementation. The store must
/// start empty. Panics on the first violation.
pub async fn test_storage(s: &dyn Storage) {
    let keys = s.list("").await.expect("list error");
    assert!(keys.is_empty(), "should have no keys to start: {:?}", keys);

    let entry = StorageEntry::new("foo", b"bar".to_vec());
    s.put(entry.clone()).await.expect("put error");

    let actual = s.get("foo").await.expect("get error");
    assert_eq!(actual, Some(entry), "wrong value");

    let keys = s.list("").await.expect("list error");
    assert_eq!(keys, vec!["foo".to_string()], "bad keys");

    s.delete("foo").await.expect("delete error");
    s.delete("foo").await.expect("second delete should be a no-op");

    let keys = s.list("").await.expect("list error");
    assert!(keys.is_empty(), "should have no keys after delete: {:?}", keys);
    assert!(s.get("foo").await.expect("get error").is_none());
}
