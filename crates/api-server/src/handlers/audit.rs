//! Audit log queries.

use axum::extract::{Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::{IntoParams, ToSchema};

use auth::{AuditAction, AuditEntry, AuditFilter, Decision};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

const DEFAULT_PAGE: u32 = 100;
const MAX_PAGE: u32 = 1000;

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct AuditQuery {
    pub actor: Option<String>,
    /// e.g. signal_ingest, risk_evaluation, order_terminal.
    pub action: Option<String>,
    pub idempotency_key: Option<String>,
    /// e.g. accepted, rejected, approved, denied.
    pub decision: Option<String>,
    /// Resource prefix, e.g. `order/`.
    pub resource: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl AuditQuery {
    fn into_filter(self) -> ApiResult<AuditFilter> {
        let mut filter = AuditFilter::new();
        if let Some(actor) = self.actor {
            filter = filter.actor(actor);
        }
        if let Some(action) = self.action {
            filter = filter.action(AuditAction::parse(&action));
        }
        if let Some(key) = self.idempotency_key {
            filter = filter.key(key);
        }
        if let Some(raw) = self.decision {
            let decision = Decision::parse(&raw)
                .ok_or_else(|| ApiError::BadRequest(format!("unknown decision '{}'", raw)))?;
            filter = filter.decision(decision);
        }
        if let Some(prefix) = self.resource {
            filter = filter.resource(prefix);
        }
        match (self.from, self.to) {
            (Some(from), Some(to)) => filter = filter.time_range(from, to),
            (None, None) => {}
            _ => {
                return Err(ApiError::BadRequest(
                    "from and to must be given together".to_string(),
                ))
            }
        }
        Ok(filter)
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct AuditEntryResponse {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    pub action: String,
    pub resource: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    /// Decision inputs with credentials redacted.
    #[schema(value_type = Object)]
    pub inputs: serde_json::Value,
    pub decision: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl From<AuditEntry> for AuditEntryResponse {
    fn from(entry: AuditEntry) -> Self {
        Self {
            id: entry.id,
            timestamp: entry.timestamp,
            actor: entry.actor,
            action: entry.action.as_str().to_string(),
            resource: entry.resource,
            idempotency_key: entry.idempotency_key,
            inputs: entry.inputs,
            decision: entry.decision.as_str().to_string(),
            reason: entry.reason,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct AuditPage {
    pub entries: Vec<AuditEntryResponse>,
    /// Matching entries across all pages.
    pub total: u64,
    pub limit: u32,
    pub offset: u32,
}

/// Query the audit log, newest first.
#[utoipa::path(
    get,
    path = "/api/v1/audit",
    tag = "audit",
    params(AuditQuery),
    responses(
        (status = 200, description = "Audit entries", body = AuditPage),
        (status = 400, description = "Invalid filter")
    ),
    security(("bearer_auth" = []))
)]
pub async fn query_audit(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AuditQuery>,
) -> ApiResult<Json<AuditPage>> {
    let limit = query.limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE);
    let offset = query.offset.unwrap_or(0);
    let filter = query.into_filter()?;

    let total = state.audit.count(&filter).await?;
    let entries = state
        .audit
        .query(&filter.limit(limit).offset(offset))
        .await?;

    Ok(Json(AuditPage {
        entries: entries.into_iter().map(AuditEntryResponse::from).collect(),
        total,
        limit,
        offset,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query() -> AuditQuery {
        AuditQuery {
            actor: None,
            action: None,
            idempotency_key: None,
            decision: None,
            resource: None,
            from: None,
            to: None,
            limit: None,
            offset: None,
        }
    }

    #[test]
    fn test_unknown_decision_is_rejected() {
        let q = AuditQuery {
            decision: Some("maybe".to_string()),
            ..query()
        };
        assert!(matches!(q.into_filter(), Err(ApiError::BadRequest(_))));
    }

    #[test]
    fn test_half_open_time_range_is_rejected() {
        let q = AuditQuery {
            from: Some(Utc::now()),
            ..query()
        };
        assert!(q.into_filter().is_err());
    }

    #[test]
    fn test_filter_built_from_query() {
        let q = AuditQuery {
            actor: Some("webhook".to_string()),
            decision: Some("rejected".to_string()),
            ..query()
        };
        let filter = q.into_filter().unwrap();
        assert_eq!(filter.actor.as_deref(), Some("webhook"));
        assert_eq!(filter.decision, Some(Decision::Rejected));
    }
}
