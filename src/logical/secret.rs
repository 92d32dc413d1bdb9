//! Secret templates declared by backends.

use leasekeeper_types::{Data, Lease, Response};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use super::generate_uuid;
use crate::error::{AppError, AppResult};

/// Separator between the type (or path) prefix and the UUID in a lease ID.
pub const ID_SEPARATOR: char = '-';

/// Value type of a declared secret field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Int,
    Bool,
    Map,
}

/// Documentation for one field of a secret. Not enforced by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSchema {
    pub field_type: FieldType,
    #[serde(default)]
    pub description: String,
}

impl FieldSchema {
    pub fn new(field_type: FieldType, description: impl Into<String>) -> Self {
        Self {
            field_type,
            description: description.into(),
        }
    }
}

/// A class of credential a backend can issue.
///
/// `secret_type` becomes the lease-ID prefix and must match
/// `[A-Za-z0-9_]+`. Do not change it once leases have been issued.
#[derive(Debug, Clone, Default)]
pub struct Secret {
    pub secret_type: String,
    pub fields: HashMap<String, FieldSchema>,
    pub renewable: bool,
    pub default_duration: Duration,
    pub default_grace_period: Duration,
}

impl Secret {
    pub fn new(secret_type: impl Into<String>) -> Self {
        Self {
            secret_type: secret_type.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> AppResult<()> {
        let valid = !self.secret_type.is_empty()
            && self
                .secret_type
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid {
            return Err(AppError::validation(format!(
                "invalid secret type '{}': must match [A-Za-z0-9_]+",
                self.secret_type
            )));
        }
        Ok(())
    }

    /// Build a secret response carrying `data`, with a fresh lease ID and
    /// this template's lease defaults.
    pub fn response(&self, data: Data) -> AppResult<Response> {
        self.validate()?;
        let uuid = generate_uuid()?;

        let lease = Lease {
            lease_id: format!("{}{}{}", self.secret_type, ID_SEPARATOR, uuid),
            renewable: self.renewable,
            duration: self.default_duration,
            max_duration: None,
            grace_period: self.default_grace_period,
        };
        Ok(Response::secret(lease, data))
    }
}

/// The prefix of `id` before the first separator, or `""` if there is none.
pub fn secret_type(id: &str) -> &str {
    match id.find(ID_SEPARATOR) {
        Some(idx) => &id[..idx],
        None => "",
    }
}
