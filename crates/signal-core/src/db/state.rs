//! Snapshot store for singleton state (risk ledger, mode, capital schedule).

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

use crate::Result;

/// Well-known snapshot keys.
pub mod keys {
    pub const RISK_STATE: &str = "risk_state";
    pub const MODE_STATE: &str = "mode_state";
    pub const CAPITAL_SCHEDULE: &str = "capital_schedule";
}

/// Keyed JSON snapshot storage. The latest write for a key wins.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<serde_json::Value>>;

    async fn save(&self, key: &str, value: serde_json::Value) -> Result<()>;
}

/// Load and deserialize a snapshot.
pub async fn load_snapshot<T: DeserializeOwned>(
    store: &dyn StateStore,
    key: &str,
) -> Result<Option<T>> {
    match store.load(key).await? {
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(None),
    }
}

/// Serialize and save a snapshot.
pub async fn save_snapshot<T: Serialize + Sync>(
    store: &dyn StateStore,
    key: &str,
    value: &T,
) -> Result<()> {
    store.save(key, serde_json::to_value(value)?).await
}

/// In-memory snapshot store (tests, development).
#[derive(Default)]
pub struct MemoryStateStore {
    snapshots: RwLock<HashMap<String, serde_json::Value>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self, key: &str) -> Result<Option<serde_json::Value>> {
        Ok(self.snapshots.read().await.get(key).cloned())
    }

    async fn save(&self, key: &str, value: serde_json::Value) -> Result<()> {
        self.snapshots.write().await.insert(key.to_string(), value);
        Ok(())
    }
}

/// PostgreSQL-backed snapshot store (`state_snapshots` table).
pub struct PgStateStore {
    pool: PgPool,
}

impl PgStateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StateStore for PgStateStore {
    async fn load(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let row = sqlx::query("SELECT value FROM state_snapshots WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| r.get::<serde_json::Value, _>("value")))
    }

    async fn save(&self, key: &str, value: serde_json::Value) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO state_snapshots (key, value, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = NOW()
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;

        debug!(key, "Saved state snapshot");
        Ok(())
    }
}
