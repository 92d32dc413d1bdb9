use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Pool, Sqlite};
use tracing::info;

use crate::logical::storage::immediate_children;
use crate::logical::{Storage, StorageEntry, StorageError};

pub type DbPool = Pool<Sqlite>;

/// [`Storage`] over a single SQLite table.
#[derive(Debug, Clone)]
pub struct SqliteStorage {
    pool: DbPool,
}

impl SqliteStorage {
    /// Connect to `url` and make sure the schema exists.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StorageError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        init_db(&pool).await?;
        info!(url = %url, "Storage database connected");
        Ok(Self { pool })
    }

    /// Wrap an existing pool whose schema is already initialized.
    pub fn from_pool(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let keys: Vec<String> = sqlx::query_scalar(
            "SELECT key FROM storage_entries WHERE substr(key, 1, ?) = ? ORDER BY key",
        )
        .bind(prefix.chars().count() as i64)
        .bind(prefix)
        .fetch_all(&self.pool)
        .await?;

        Ok(immediate_children(prefix, keys.iter().map(String::as_str)))
    }

    async fn get(&self, key: &str) -> Result<Option<StorageEntry>, StorageError> {
        let value: Option<Vec<u8>> =
            sqlx::query_scalar("SELECT value FROM storage_entries WHERE key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;

        Ok(value.map(|v| StorageEntry::new(key, v)))
    }

    async fn put(&self, entry: StorageEntry) -> Result<(), StorageError> {
        if entry.key.is_empty() {
            return Err(StorageError::InvalidKey("empty key".to_string()));
        }

        sqlx::query(
            r#"
            INSERT INTO storage_entries (key, value)
            VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value
            "#,
        )
        .bind(&entry.key)
        .bind(&entry.value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM storage_entries WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
pub async fn setup_test_db() -> DbPool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory database");
    init_db(&pool).await.expect("Failed to init database");
    pool
}

/// Create the storage table if it does not exist.
pub async fn init_db(pool: &DbPool) -> Result<(), StorageError> {
    info!("Running database migrations");

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS storage_entries (
            key TEXT PRIMARY KEY NOT NULL,
            value BLOB NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    info!("Database migrations complete");
    Ok(())
}
