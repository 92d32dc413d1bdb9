use crate::logical::StorageError;
use crate::router::RouterError;
use thiserror::Error;

/// Application-wide error types
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Lease entry encoding error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Lease not found: {0}")]
    NotFound(String),

    #[error("Failed to generate lease ID: {0}")]
    IdGeneration(String),

    /// The owning backend could not be notified. Local bookkeeping for the
    /// lease has still been applied where the operation allows it.
    #[error("Backend notification failed for lease {lease_id}: {source}")]
    Dispatch {
        lease_id: String,
        #[source]
        source: RouterError,
    },

    #[error("{0}")]
    Lifecycle(&'static str),

    #[error("Failed to revoke {} lease(s) under '{prefix}'", .failures.len())]
    RevokePrefix {
        prefix: String,
        failures: Vec<(String, AppError)>,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found<S: Into<String>>(lease_id: S) -> Self {
        Self::NotFound(lease_id.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// True when the lease was cleaned up locally but the backend never
    /// acknowledged the revocation.
    pub fn is_partial_failure(&self) -> bool {
        matches!(self, Self::Dispatch { .. })
    }
}

/// Result type alias using AppError
pub type AppResult<T> = Result<T, AppError>;
