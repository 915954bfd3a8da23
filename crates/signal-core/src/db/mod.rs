//! Persistence contracts and their in-memory / PostgreSQL implementations.

pub mod orders;
pub mod state;

pub use orders::{MemoryOrderStore, OrderStore, PgOrderStore};
pub use state::{keys, load_snapshot, save_snapshot, MemoryStateStore, PgStateStore, StateStore};

use crate::config::DatabaseConfig;
use crate::{Error, Result};
use sqlx::postgres::{PgPool, PgPoolOptions};

/// Create a PostgreSQL connection pool.
pub async fn create_pool(config: &DatabaseConfig) -> Result<PgPool> {
    let url = config
        .url
        .as_deref()
        .ok_or_else(|| Error::config("database.url is not set"))?;

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(url)
        .await?;

    Ok(pool)
}
