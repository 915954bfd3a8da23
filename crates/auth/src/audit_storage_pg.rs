//! PostgreSQL storage backend for audit logs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use signal_core::{Error, Result};
use sqlx::{PgPool, Postgres, QueryBuilder};

use crate::audit::{AuditAction, AuditEntry, AuditFilter, AuditStorage, Decision};

/// PostgreSQL-backed audit storage (`audit_log` table, insert-only).
pub struct PostgresAuditStorage {
    pool: PgPool,
}

impl PostgresAuditStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Database row for audit entries.
#[derive(Debug, sqlx::FromRow)]
struct AuditRow {
    id: i64,
    timestamp: DateTime<Utc>,
    actor: String,
    action: String,
    resource: String,
    idempotency_key: Option<String>,
    inputs: Option<serde_json::Value>,
    decision: String,
    reason: Option<String>,
}

impl AuditRow {
    fn into_entry(self) -> Result<AuditEntry> {
        let decision = Decision::parse(&self.decision).ok_or_else(|| Error::StateCorruption {
            message: format!("audit row {} has unknown decision '{}'", self.id, self.decision),
        })?;

        Ok(AuditEntry {
            id: self.id,
            timestamp: self.timestamp,
            actor: self.actor,
            action: AuditAction::parse(&self.action),
            resource: self.resource,
            idempotency_key: self.idempotency_key,
            inputs: self.inputs.unwrap_or(serde_json::Value::Null),
            decision,
            reason: self.reason,
        })
    }
}

/// Append `AND ...` clauses for every populated filter field.
fn push_filters(builder: &mut QueryBuilder<'_, Postgres>, filter: &AuditFilter) {
    if let Some(ref actor) = filter.actor {
        builder.push(" AND actor = ").push_bind(actor.clone());
    }
    if let Some(ref action) = filter.action {
        builder
            .push(" AND action = ")
            .push_bind(action.as_str().to_string());
    }
    if let Some(ref key) = filter.idempotency_key {
        builder.push(" AND idempotency_key = ").push_bind(key.clone());
    }
    if let Some(decision) = filter.decision {
        builder.push(" AND decision = ").push_bind(decision.as_str());
    }
    if let Some(ref prefix) = filter.resource_prefix {
        builder
            .push(" AND resource LIKE ")
            .push_bind(format!("{}%", prefix));
    }
    if let Some(from) = filter.from {
        builder.push(" AND timestamp >= ").push_bind(from);
    }
    if let Some(to) = filter.to {
        builder.push(" AND timestamp <= ").push_bind(to);
    }
}

#[async_trait]
impl AuditStorage for PostgresAuditStorage {
    async fn store(&self, entry: &AuditEntry) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO audit_log (timestamp, actor, action, resource, idempotency_key, inputs, decision, reason)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING id
            "#,
        )
        .bind(entry.timestamp)
        .bind(&entry.actor)
        .bind(entry.action.as_str())
        .bind(&entry.resource)
        .bind(&entry.idempotency_key)
        .bind(&entry.inputs)
        .bind(entry.decision.as_str())
        .bind(&entry.reason)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.0)
    }

    async fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>> {
        let mut builder = QueryBuilder::<Postgres>::new(
            "SELECT id, timestamp, actor, action, resource, idempotency_key, inputs, decision, reason \
             FROM audit_log WHERE 1=1",
        );
        push_filters(&mut builder, filter);
        builder
            .push(" ORDER BY id ASC LIMIT ")
            .push_bind(filter.limit.unwrap_or(100) as i64)
            .push(" OFFSET ")
            .push_bind(filter.offset.unwrap_or(0) as i64);

        let rows: Vec<AuditRow> = builder.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter().map(AuditRow::into_entry).collect()
    }

    async fn count(&self, filter: &AuditFilter) -> Result<u64> {
        let mut builder = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM audit_log WHERE 1=1");
        push_filters(&mut builder, filter);

        let (count,): (i64,) = builder.build_query_as().fetch_one(&self.pool).await?;
        Ok(count as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(decision: &str) -> AuditRow {
        AuditRow {
            id: 9,
            timestamp: Utc::now(),
            actor: "system".to_string(),
            action: "risk_evaluation".to_string(),
            resource: "signal/k".to_string(),
            idempotency_key: Some("k".to_string()),
            inputs: None,
            decision: decision.to_string(),
            reason: None,
        }
    }

    #[test]
    fn test_row_conversion() {
        let entry = row("approved").into_entry().unwrap();
        assert_eq!(entry.action, AuditAction::RiskEvaluation);
        assert_eq!(entry.decision, Decision::Approved);
        assert_eq!(entry.inputs, serde_json::Value::Null);
    }

    #[test]
    fn test_unknown_decision_is_corruption() {
        let err = row("perhaps").into_entry().unwrap_err();
        assert!(matches!(err, Error::StateCorruption { .. }));
    }

    #[test]
    fn test_filters_render_placeholders() {
        let mut builder = QueryBuilder::<Postgres>::new("SELECT 1 FROM audit_log WHERE 1=1");
        let filter = AuditFilter::new()
            .actor("alice")
            .action(AuditAction::ModeTransition)
            .decision(Decision::Succeeded);
        push_filters(&mut builder, &filter);
        let sql = builder.sql();
        assert!(sql.contains("actor = $1"));
        assert!(sql.contains("action = $2"));
        assert!(sql.contains("decision = $3"));
    }
}
