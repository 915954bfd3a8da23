//! Append-only audit log: the record of why a trade did or did not happen.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use signal_core::Result;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::error;

/// Actor name used for decisions taken by the pipeline itself.
pub const SYSTEM_ACTOR: &str = "system";

/// Types of auditable actions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    // Pipeline
    SignalIngest,
    RiskEvaluation,
    ModeGate,
    OrderSubmit,
    OrderTerminal,
    OrderCancel,

    // Administration
    ModeTransition,
    UnlockAttempt,
    SafeModeAck,

    // Background
    Reconciliation,
    CapitalSchedule,
    DailyReset,

    Custom(String),
}

impl AuditAction {
    pub fn as_str(&self) -> &str {
        match self {
            AuditAction::SignalIngest => "signal_ingest",
            AuditAction::RiskEvaluation => "risk_evaluation",
            AuditAction::ModeGate => "mode_gate",
            AuditAction::OrderSubmit => "order_submit",
            AuditAction::OrderTerminal => "order_terminal",
            AuditAction::OrderCancel => "order_cancel",
            AuditAction::ModeTransition => "mode_transition",
            AuditAction::UnlockAttempt => "unlock_attempt",
            AuditAction::SafeModeAck => "safe_mode_ack",
            AuditAction::Reconciliation => "reconciliation",
            AuditAction::CapitalSchedule => "capital_schedule",
            AuditAction::DailyReset => "daily_reset",
            AuditAction::Custom(s) => s,
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "signal_ingest" => AuditAction::SignalIngest,
            "risk_evaluation" => AuditAction::RiskEvaluation,
            "mode_gate" => AuditAction::ModeGate,
            "order_submit" => AuditAction::OrderSubmit,
            "order_terminal" => AuditAction::OrderTerminal,
            "order_cancel" => AuditAction::OrderCancel,
            "mode_transition" => AuditAction::ModeTransition,
            "unlock_attempt" => AuditAction::UnlockAttempt,
            "safe_mode_ack" => AuditAction::SafeModeAck,
            "reconciliation" => AuditAction::Reconciliation,
            "capital_schedule" => AuditAction::CapitalSchedule,
            "daily_reset" => AuditAction::DailyReset,
            other => AuditAction::Custom(other.to_string()),
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome recorded with an audit entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Accepted,
    Rejected,
    Approved,
    Denied,
    Submitted,
    Filled,
    Cancelled,
    Failed,
    Succeeded,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Accepted => "accepted",
            Decision::Rejected => "rejected",
            Decision::Approved => "approved",
            Decision::Denied => "denied",
            Decision::Submitted => "submitted",
            Decision::Filled => "filled",
            Decision::Cancelled => "cancelled",
            Decision::Failed => "failed",
            Decision::Succeeded => "succeeded",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Some(match raw {
            "accepted" => Decision::Accepted,
            "rejected" => Decision::Rejected,
            "approved" => Decision::Approved,
            "denied" => Decision::Denied,
            "submitted" => Decision::Submitted,
            "filled" => Decision::Filled,
            "cancelled" => Decision::Cancelled,
            "failed" => Decision::Failed,
            "succeeded" => Decision::Succeeded,
            _ => return None,
        })
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An audit record. Never mutated once stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    /// Operator id, source name, or [`SYSTEM_ACTOR`].
    pub actor: String,
    pub action: AuditAction,
    /// What the decision was about (`signal/<key>`, `order/<id>`, `mode`).
    pub resource: String,
    pub idempotency_key: Option<String>,
    /// Inputs to the decision with credentials removed.
    pub inputs: serde_json::Value,
    pub decision: Decision,
    pub reason: Option<String>,
}

impl AuditEntry {
    /// Create a new audit entry builder.
    pub fn builder(action: AuditAction, resource: impl Into<String>) -> AuditEntryBuilder {
        AuditEntryBuilder {
            action,
            resource: resource.into(),
            actor: SYSTEM_ACTOR.to_string(),
            idempotency_key: None,
            inputs: serde_json::Value::Null,
            decision: Decision::Succeeded,
            reason: None,
        }
    }
}

/// Builder for audit entries.
pub struct AuditEntryBuilder {
    action: AuditAction,
    resource: String,
    actor: String,
    idempotency_key: Option<String>,
    inputs: serde_json::Value,
    decision: Decision,
    reason: Option<String>,
}

impl AuditEntryBuilder {
    pub fn actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = actor.into();
        self
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn inputs(mut self, inputs: serde_json::Value) -> Self {
        self.inputs = redact_secrets(inputs);
        self
    }

    pub fn decision(mut self, decision: Decision) -> Self {
        self.decision = decision;
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn build(self) -> AuditEntry {
        AuditEntry {
            id: 0, // Set by storage
            timestamp: Utc::now(),
            actor: self.actor,
            action: self.action,
            resource: self.resource,
            idempotency_key: self.idempotency_key,
            inputs: self.inputs,
            decision: self.decision,
            reason: self.reason,
        }
    }
}

const SECRET_FIELDS: &[&str] = &[
    "token",
    "secret",
    "secret_phrase",
    "phrase",
    "second_factor",
    "code",
    "password",
    "api_key",
    "confirmation_token",
];

/// Replace credential-bearing fields anywhere in a JSON value.
pub fn redact_secrets(value: serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.into_iter()
                .map(|(k, v)| {
                    if SECRET_FIELDS.contains(&k.to_ascii_lowercase().as_str()) {
                        (k, serde_json::Value::String("[redacted]".to_string()))
                    } else {
                        (k, redact_secrets(v))
                    }
                })
                .collect(),
        ),
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.into_iter().map(redact_secrets).collect())
        }
        other => other,
    }
}

/// Storage backend for audit logs. Append and read only.
#[async_trait]
pub trait AuditStorage: Send + Sync {
    /// Durably append an entry, returning its id.
    async fn store(&self, entry: &AuditEntry) -> Result<i64>;

    /// Query entries, oldest first.
    async fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>>;

    /// Count entries matching filter (ignores limit/offset).
    async fn count(&self, filter: &AuditFilter) -> Result<u64>;
}

/// Filter for querying audit entries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditFilter {
    pub actor: Option<String>,
    pub action: Option<AuditAction>,
    pub idempotency_key: Option<String>,
    pub decision: Option<Decision>,
    pub resource_prefix: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl AuditFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn action(mut self, action: AuditAction) -> Self {
        self.action = Some(action);
        self
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn decision(mut self, decision: Decision) -> Self {
        self.decision = Some(decision);
        self
    }

    pub fn resource(mut self, prefix: impl Into<String>) -> Self {
        self.resource_prefix = Some(prefix.into());
        self
    }

    pub fn time_range(mut self, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        self.from = Some(from);
        self.to = Some(to);
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u32) -> Self {
        self.offset = Some(offset);
        self
    }

    fn matches(&self, e: &AuditEntry) -> bool {
        if self.actor.as_ref().is_some_and(|a| &e.actor != a) {
            return false;
        }
        if self.action.as_ref().is_some_and(|a| &e.action != a) {
            return false;
        }
        if let Some(ref key) = self.idempotency_key {
            if e.idempotency_key.as_ref() != Some(key) {
                return false;
            }
        }
        if self.decision.is_some_and(|d| e.decision != d) {
            return false;
        }
        if let Some(ref prefix) = self.resource_prefix {
            if !e.resource.starts_with(prefix) {
                return false;
            }
        }
        if self.from.is_some_and(|from| e.timestamp < from) {
            return false;
        }
        if self.to.is_some_and(|to| e.timestamp > to) {
            return false;
        }
        true
    }
}

/// In-memory audit storage for tests and development.
pub struct MemoryAuditStorage {
    entries: RwLock<Vec<AuditEntry>>,
    next_id: AtomicI64,
}

impl MemoryAuditStorage {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            next_id: AtomicI64::new(1),
        }
    }
}

impl Default for MemoryAuditStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuditStorage for MemoryAuditStorage {
    async fn store(&self, entry: &AuditEntry) -> Result<i64> {
        let mut entries = self.entries.write().await;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut stored = entry.clone();
        stored.id = id;
        entries.push(stored);
        Ok(id)
    }

    async fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>> {
        let entries = self.entries.read().await;
        let offset = filter.offset.unwrap_or(0) as usize;
        let limit = filter.limit.unwrap_or(100) as usize;

        Ok(entries
            .iter()
            .filter(|e| filter.matches(e))
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn count(&self, filter: &AuditFilter) -> Result<u64> {
        let entries = self.entries.read().await;
        Ok(entries.iter().filter(|e| filter.matches(e)).count() as u64)
    }
}

/// Audit logger service. Every write is awaited so callers can rely on the
/// entry existing once `record` returns.
#[derive(Clone)]
pub struct AuditLogger {
    storage: Arc<dyn AuditStorage>,
}

impl AuditLogger {
    pub fn new(storage: Arc<dyn AuditStorage>) -> Self {
        Self { storage }
    }

    /// In-memory logger for tests.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryAuditStorage::new()))
    }

    /// Append an entry, returning it with its assigned id.
    pub async fn record(&self, mut entry: AuditEntry) -> Result<AuditEntry> {
        match self.storage.store(&entry).await {
            Ok(id) => {
                entry.id = id;
                Ok(entry)
            }
            Err(e) => {
                error!(
                    action = %entry.action,
                    resource = %entry.resource,
                    error = %e,
                    "Failed to store audit entry"
                );
                Err(e)
            }
        }
    }

    pub async fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>> {
        self.storage.query(filter).await
    }

    pub async fn count(&self, filter: &AuditFilter) -> Result<u64> {
        self.storage.count(filter).await
    }

    /// Whether a risk approval has been recorded for `key`.
    pub async fn has_risk_approval(&self, key: &str) -> Result<bool> {
        let filter = AuditFilter::new()
            .action(AuditAction::RiskEvaluation)
            .decision(Decision::Approved)
            .key(key);
        Ok(self.count(&filter).await? > 0)
    }

    /// Whether the Risk Guard has ruled on `key` at all, approved or denied.
    pub async fn has_risk_evaluation(&self, key: &str) -> Result<bool> {
        let filter = AuditFilter::new().action(AuditAction::RiskEvaluation).key(key);
        Ok(self.count(&filter).await? > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_audit_entry_builder() {
        let entry = AuditEntry::builder(AuditAction::SignalIngest, "signal/abc")
            .actor("webhook")
            .key("abc")
            .inputs(json!({"symbol": "AAPL", "token": "T1"}))
            .decision(Decision::Accepted)
            .build();

        assert_eq!(entry.action, AuditAction::SignalIngest);
        assert_eq!(entry.actor, "webhook");
        assert_eq!(entry.idempotency_key.as_deref(), Some("abc"));
        assert_eq!(entry.inputs["token"], "[redacted]");
        assert_eq!(entry.inputs["symbol"], "AAPL");
    }

    #[test]
    fn test_redaction_is_recursive() {
        let redacted = redact_secrets(json!({
            "outer": {"secret_phrase": "open sesame", "capital_pct": 10},
            "list": [{"Token": "x"}]
        }));
        assert_eq!(redacted["outer"]["secret_phrase"], "[redacted]");
        assert_eq!(redacted["outer"]["capital_pct"], 10);
        assert_eq!(redacted["list"][0]["Token"], "[redacted]");
    }

    #[tokio::test]
    async fn test_memory_storage_assigns_ids() {
        let storage = MemoryAuditStorage::new();
        let entry = AuditEntry::builder(AuditAction::ModeTransition, "mode")
            .actor("alice")
            .build();

        let first = storage.store(&entry).await.unwrap();
        let second = storage.store(&entry).await.unwrap();
        assert!(second > first);

        let entries = storage.query(&AuditFilter::new()).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].id, first);
    }

    #[tokio::test]
    async fn test_filter_by_key_and_decision() {
        let logger = AuditLogger::in_memory();
        for (key, decision) in [
            ("k1", Decision::Approved),
            ("k1", Decision::Denied),
            ("k2", Decision::Approved),
        ] {
            logger
                .record(
                    AuditEntry::builder(AuditAction::RiskEvaluation, format!("signal/{}", key))
                        .key(key)
                        .decision(decision)
                        .build(),
                )
                .await
                .unwrap();
        }

        let filter = AuditFilter::new().key("k1").decision(Decision::Denied);
        assert_eq!(logger.count(&filter).await.unwrap(), 1);
        assert!(logger.has_risk_approval("k2").await.unwrap());
        assert!(!logger.has_risk_approval("k3").await.unwrap());
    }

    #[tokio::test]
    async fn test_count_ignores_pagination() {
        let logger = AuditLogger::in_memory();
        for _ in 0..5 {
            tokio_test::assert_ok!(
                logger
                    .record(AuditEntry::builder(AuditAction::DailyReset, "risk").build())
                    .await
            );
        }
        let filter = AuditFilter::new().limit(2).offset(1);
        assert_eq!(logger.query(&filter).await.unwrap().len(), 2);
        assert_eq!(logger.count(&filter).await.unwrap(), 5);
    }

    #[test]
    fn test_action_names_round_trip() {
        assert_eq!(AuditAction::parse("unlock_attempt"), AuditAction::UnlockAttempt);
        assert_eq!(AuditAction::OrderTerminal.as_str(), "order_terminal");
        assert_eq!(
            AuditAction::parse("operator_note"),
            AuditAction::Custom("operator_note".to_string())
        );
        assert_eq!(Decision::parse("denied"), Some(Decision::Denied));
        assert_eq!(Decision::parse("maybe"), None);
    }
}
