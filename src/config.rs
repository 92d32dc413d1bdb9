use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

/// Durable storage configuration
#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// SQLite connection URL
    #[serde(default = "default_storage_url")]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_storage_url() -> String {
    "sqlite://leasekeeper.db?mode=rwc".to_string()
}

fn default_max_connections() -> u32 {
    5
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            url: default_storage_url(),
            max_connections: default_max_connections(),
        }
    }
}

/// Expiration manager settings
#[derive(Debug, Deserialize, Clone)]
pub struct ExpirationConfig {
    /// Storage prefix under which lease entries are kept.
    /// Must not overlap any backend's storage.
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// How long the sweep sleeps when no lease is scheduled
    #[serde(default = "default_idle_poll_secs")]
    pub idle_poll_secs: u64,
}

fn default_namespace() -> String {
    "expire/".to_string()
}

fn default_idle_poll_secs() -> u64 {
    60
}

impl Default for ExpirationConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            idle_poll_secs: default_idle_poll_secs(),
        }
    }
}

/// Logging output settings
#[derive(Debug, Deserialize, Clone, Default)]
pub struct LogConfig {
    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

/// Root application configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub expiration: ExpirationConfig,
    #[serde(default)]
    pub log: LogConfig,
}

impl AppConfig {
    /// Load configuration from files and environment variables
    pub fn load() -> Result<Self, ConfigError> {
        let config = Config::builder()
            // Start with default config file
            .add_source(File::with_name("config/default").required(false))
            // Override with local config if present
            .add_source(File::with_name("config/local").required(false))
            // Override with environment variables (prefix: LEASEKEEPER_)
            // e.g., LEASEKEEPER_STORAGE__URL, LEASEKEEPER_EXPIRATION__IDLE_POLL_SECS
            .add_source(
                Environment::with_prefix("LEASEKEEPER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }
}
