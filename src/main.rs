use chrono::Utc;
use leasekeeper::{
    config::AppConfig,
    db::SqliteStorage,
    logical::{Storage, StorageView},
    ExpirationManager, Router,
};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "leasekeeper=info".into());
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Report the outstanding leases held in the configured store.
///
/// Revocation needs the owning backends, which are mounted by the
/// embedding service, so this binary never starts the sweep.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env file is fine
    let _ = dotenvy::dotenv();

    let config = AppConfig::load()?;
    init_tracing(config.log.json);

    info!("Starting leasekeeper v{}", env!("CARGO_PKG_VERSION"));

    let storage =
        SqliteStorage::connect(&config.storage.url, config.storage.max_connections).await?;
    let storage: Arc<dyn Storage> = Arc::new(storage);
    let view = Arc::new(StorageView::new(storage, config.expiration.namespace.clone()));

    let manager = ExpirationManager::with_config(Arc::new(Router::new()), view, &config.expiration);
    let restored = manager.restore().await?;
    info!(restored, namespace = %config.expiration.namespace, "Lease index restored");

    let now = Utc::now();
    let mut overdue = 0usize;
    for lease_id in manager.lease_ids() {
        let Some(entry) = manager.lease(&lease_id) else {
            continue;
        };
        let expires = entry.expire_time();
        if expires <= now {
            overdue += 1;
            warn!(
                lease_id = %lease_id,
                path = %entry.path,
                expired = %expires,
                "Lease is past its expiration"
            );
        } else {
            info!(
                lease_id = %lease_id,
                path = %entry.path,
                renewable = entry.lease.renewable,
                expires = %expires,
                "Outstanding lease"
            );
        }
    }

    info!(total = restored, overdue, "Lease report complete");
    Ok(())
}
