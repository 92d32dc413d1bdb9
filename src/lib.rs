pub mod config;
pub mod db;
pub mod error;
pub mod expiration;
pub mod logical;
pub mod router;

pub use config::AppConfig;
pub use error::{AppError, AppResult};
pub use expiration::{ExpirationManager, LeaseEntry};
pub use router::{Backend, BackendError, Router, RouterError};
