//! Durable record of one outstanding lease.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::AppResult;
use crate::logical::{Data, Lease};

/// One outstanding lease, as persisted under the manager's namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaseEntry {
    pub lease_id: String,
    /// Request path the secret was issued for.
    pub path: String,
    /// Response data, replayed to the backend on renew and revoke.
    pub data: Data,
    pub lease: Lease,
    pub issue_time: DateTime<Utc>,
    pub renew_time: DateTime<Utc>,
}

/// `at + d`, saturating at the latest representable instant.
fn add_duration(at: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(d)
        .ok()
        .and_then(|delta| at.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

impl LeaseEntry {
    /// Serialize to JSON. Map keys are ordered, so output is deterministic.
    pub fn encode(&self) -> AppResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> AppResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Instant at which the sweep revokes this lease.
    pub fn expire_time(&self) -> DateTime<Utc> {
        add_duration(self.issue_time, self.lease.duration)
    }

    /// Last instant at which a renewal is still accepted.
    pub fn grace_deadline(&self) -> DateTime<Utc> {
        add_duration(self.expire_time(), self.lease.grace_period)
    }
}
