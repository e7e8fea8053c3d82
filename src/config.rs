use crate::storage;
use sqlx::SqlitePool;
use tracing::warn;

/// Named scalar configuration persisted in the store.
///
/// Values are read per use; there is no in-memory cache, so a `config set`
/// takes effect on the next read. Defaults (`max_retries=3`,
/// `backoff_base=2`, `job_timeout=300`) are seeded by
/// [`crate::setup_database`] on first boot.
#[derive(Clone)]
pub struct Config {
    pool: SqlitePool,
}

impl Config {
    /// Wrap a pool for config access.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Read a value, falling back if the key is absent.
    pub async fn get(&self, key: &str, fallback: &str) -> Result<String, sqlx::Error> {
        Ok(storage::get_config(&self.pool, key).await?.unwrap_or_else(|| fallback.to_string()))
    }

    /// Read a value without a fallback.
    pub async fn try_get(&self, key: &str) -> Result<Option<String>, sqlx::Error> {
        storage::get_config(&self.pool, key).await
    }

    /// Read an integer value, falling back if the key is absent or the
    /// stored value does not parse.
    pub async fn get_i64(&self, key: &str, fallback: i64) -> Result<i64, sqlx::Error> {
        match storage::get_config(&self.pool, key).await? {
            Some(value) => match value.parse() {
                Ok(n) => Ok(n),
                Err(_) => {
                    warn!(key, value, "config value is not an integer, using fallback");
                    Ok(fallback)
                }
            },
            None => Ok(fallback),
        }
    }

    /// Upsert a value.
    pub async fn set(&self, key: &str, value: &str) -> Result<(), sqlx::Error> {
        storage::set_config(&self.pool, key, value).await
    }
}
