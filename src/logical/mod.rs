//! Request/response protocol shared by backends and the lease engine.
//!
//! This module provides:
//! - `Request`, the envelope a backend receives (`request`)
//! - the `Storage` contract plus in-memory and namespaced stores (`storage`)
//! - `Secret` templates and lease-ID helpers (`secret`)

pub mod request;
pub mod secret;
pub mod storage;

pub use leasekeeper_types::{Data, Lease, Operation, Response, Value};
pub use request::{test_request, Request};
pub use secret::{secret_type, FieldSchema, FieldType, Secret};
pub use storage::{collect_keys, InmemStorage, Storage, StorageEntry, StorageError, StorageView};

use rand::{rngs::OsRng, RngCore};

use crate::error::{AppError, AppResult};

/// Generate a random (v4) UUID string.
///
/// Fails only if the operating system cannot supply randomness.
pub fn generate_uuid() -> AppResult<String> {
    let mut bytes = [0u8; 16];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| AppError::IdGeneration(e.to_string()))?;
    Ok(uuid::Builder::from_random_bytes(bytes).into_uuid().to_string())
}
