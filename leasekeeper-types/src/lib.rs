//! Protocol value types shared by secret backends and the lease engine.
//!
//! Every backend and the expiration manager talk through the same shapes:
//! an [`Operation`] names what a request wants, a [`Response`] carries the
//! result, and a [`Lease`] describes how long an issued secret stays valid.

#![allow(clippy::derive_partial_eq_without_eq)]

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

pub use serde_json::Value;

/// Opaque response data: named fields holding a tagged value tree
/// (string, number, bool, null, ordered list, ordered mapping).
pub type Data = serde_json::Map<String, Value>;

/// Kind of operation a request performs against a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Read,
    Write,
    Renew,
    Revoke,
    List,
    Help,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Renew => "renew",
            Self::Revoke => "revoke",
            Self::List => "list",
            Self::Help => "help",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Temporal policy attached to one issued secret.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Unique lease identifier. Assigned by the secret template and
    /// replaced by the path-based ID when the lease is registered.
    #[serde(default)]
    pub lease_id: String,
    pub renewable: bool,
    /// Requested duration, measured from issue time.
    pub duration: Duration,
    /// Upper bound on the cumulative duration reachable through renewals.
    #[serde(default)]
    pub max_duration: Option<Duration>,
    /// Window after expiration during which a renewal is still accepted.
    #[serde(default)]
    pub grace_period: Duration,
}

impl Lease {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            ..Default::default()
        }
    }

    pub fn renewable(mut self, renewable: bool) -> Self {
        self.renewable = renewable;
        self
    }

    pub fn with_max_duration(mut self, max: Duration) -> Self {
        self.max_duration = Some(max);
        self
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }
}

/// Envelope a backend returns for one request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub is_secret: bool,
    /// Present only when `is_secret` is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease: Option<Lease>,
    #[serde(default)]
    pub data: Data,
}

impl Response {
    /// Plain (non-secret) response carrying data only.
    pub fn with_data(data: Data) -> Self {
        Self {
            is_secret: false,
            lease: None,
            data,
        }
    }

    /// Secret response governed by `lease`.
    pub fn secret(lease: Lease, data: Data) -> Self {
        Self {
            is_secret: true,
            lease: Some(lease),
            data,
        }
    }
}
