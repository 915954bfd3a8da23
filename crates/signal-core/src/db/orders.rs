//! Order persistence, used for restart reconciliation and read APIs.

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::types::{IdempotencyKey, Order, OrderStatus};
use crate::Result;

#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Insert or replace the stored copy of an order.
    async fn upsert(&self, order: &Order) -> Result<()>;

    async fn get(&self, id: Uuid) -> Result<Option<Order>>;

    /// Newest first.
    async fn list(&self, status: Option<OrderStatus>, limit: usize) -> Result<Vec<Order>>;

    /// Orders left Pending or Submitted.
    async fn load_open(&self) -> Result<Vec<Order>>;

    /// The order created for a signal, if one was ever created.
    async fn find_by_signal(&self, signal_ref: &IdempotencyKey) -> Result<Option<Order>>;
}

#[derive(Default)]
pub struct MemoryOrderStore {
    orders: RwLock<HashMap<Uuid, Order>>,
}

impl MemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OrderStore for MemoryOrderStore {
    async fn upsert(&self, order: &Order) -> Result<()> {
        self.orders.write().await.insert(order.id, order.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Order>> {
        Ok(self.orders.read().await.get(&id).cloned())
    }

    async fn list(&self, status: Option<OrderStatus>, limit: usize) -> Result<Vec<Order>> {
        let orders = self.orders.read().await;
        let mut matching: Vec<Order> = orders
            .values()
            .filter(|o| status.map_or(true, |s| o.status == s))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        matching.truncate(limit);
        Ok(matching)
    }

    async fn load_open(&self) -> Result<Vec<Order>> {
        let orders = self.orders.read().await;
        Ok(orders.values().filter(|o| !o.is_terminal()).cloned().collect())
    }

    async fn find_by_signal(&self, signal_ref: &IdempotencyKey) -> Result<Option<Order>> {
        let orders = self.orders.read().await;
        Ok(orders
            .values()
            .filter(|o| &o.signal_ref == signal_ref)
            .min_by_key(|o| o.created_at)
            .cloned())
    }
}

/// PostgreSQL-backed order store (`orders` table). The full order is kept as
/// JSON alongside the columns used for filtering.
pub struct PgOrderStore {
    pool: PgPool,
}

impl PgOrderStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn decode(rows: Vec<sqlx::postgres::PgRow>) -> Result<Vec<Order>> {
        rows.into_iter()
            .map(|r| Ok(serde_json::from_value(r.get::<serde_json::Value, _>("body"))?))
            .collect()
    }
}

#[async_trait]
impl OrderStore for PgOrderStore {
    async fn upsert(&self, order: &Order) -> Result<()> {
        let body = serde_json::to_value(order)?;
        sqlx::query(
            r#"
            INSERT INTO orders (id, signal_ref, symbol, status, trading_mode, created_at, updated_at, body)
            VALUES ($1, $2, $3, $4, $5, $6, NOW(), $7)
            ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                updated_at = NOW(),
                body = EXCLUDED.body
            "#,
        )
        .bind(order.id)
        .bind(order.signal_ref.as_str())
        .bind(&order.symbol)
        .bind(order.status.as_str())
        .bind(order.trading_mode.to_string())
        .bind(order.created_at)
        .bind(body)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Order>> {
        let row = sqlx::query("SELECT body FROM orders WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(Self::decode(row.into_iter().collect())?.pop())
    }

    async fn list(&self, status: Option<OrderStatus>, limit: usize) -> Result<Vec<Order>> {
        let rows = sqlx::query(
            r#"
            SELECT body FROM orders
            WHERE ($1::TEXT IS NULL OR status = $1)
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(status.map(|s| s.as_str()))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Self::decode(rows)
    }

    async fn load_open(&self) -> Result<Vec<Order>> {
        let rows = sqlx::query(
            "SELECT body FROM orders WHERE status IN ('pending', 'submitted') ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;
        Self::decode(rows)
    }

    async fn find_by_signal(&self, signal_ref: &IdempotencyKey) -> Result<Option<Order>> {
        let row = sqlx::query(
            "SELECT body FROM orders WHERE signal_ref = $1 ORDER BY created_at LIMIT 1",
        )
        .bind(signal_ref.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(Self::decode(row.into_iter().collect())?.pop())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ExecutionTier, IdempotencyKey, SignalAction, TradingMode};
    use rust_decimal::Decimal;

    fn order(symbol: &str) -> Order {
        Order::new(
            IdempotencyKey::from_raw(symbol),
            "paper",
            symbol,
            SignalAction::Buy,
            Decimal::ONE,
            TradingMode::Paper,
            ExecutionTier::Conservative,
            Decimal::ONE,
        )
    }

    #[tokio::test]
    async fn test_load_open_excludes_terminal() {
        let store = MemoryOrderStore::new();
        let open = order("AAPL");
        let mut done = order("MSFT");
        done.transition(OrderStatus::Failed, Some("test".into()));

        store.upsert(&open).await.unwrap();
        store.upsert(&done).await.unwrap();

        let pending = store.load_open().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, open.id);

        let failed = store.list(Some(OrderStatus::Failed), 10).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(store.list(None, 10).await.unwrap().len(), 2);
        assert!(store.get(done.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_find_by_signal() {
        let store = MemoryOrderStore::new();
        let placed = order("AAPL");
        store.upsert(&placed).await.unwrap();

        let found =
            tokio_test::assert_ok!(store.find_by_signal(&IdempotencyKey::from_raw("AAPL")).await);
        assert_eq!(found.map(|o| o.id), Some(placed.id));
        let missing =
            tokio_test::assert_ok!(store.find_by_signal(&IdempotencyKey::from_raw("MSFT")).await);
        assert!(missing.is_none());
    }
}
