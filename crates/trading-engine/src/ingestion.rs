//! Signal ingestion: authenticate, validate, normalize, and deduplicate.

use auth::{AuditAction, AuditEntry, AuditLogger, Decision, SharedSecret};
use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use signal_core::config::WebhookConfig;
use signal_core::notify::{EventType, NotificationHub};
use signal_core::types::{IdempotencyKey, Signal, SignalAction, SignalSource};
use signal_core::Result;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, warn};

const MAX_SYMBOL_LEN: usize = 32;
const DEFAULT_STRATEGY: &str = "manual";

/// Why a payload did not become a [`Signal`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason")]
pub enum Rejection {
    /// Missing or invalid shared-secret token.
    AuthFailure,
    Malformed { field: String, message: String },
    /// Same idempotency key seen inside the dedup window.
    Duplicate { idempotency_key: String },
}

impl Rejection {
    pub fn code(&self) -> &'static str {
        match self {
            Rejection::AuthFailure => "AuthFailure",
            Rejection::Malformed { .. } => "Malformed",
            Rejection::Duplicate { .. } => "Duplicate",
        }
    }

    fn malformed(field: &str, message: impl Into<String>) -> Self {
        Rejection::Malformed {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::AuthFailure => f.write_str("AuthFailure"),
            Rejection::Malformed { field, message } => write!(f, "Malformed: {}: {}", field, message),
            Rejection::Duplicate { idempotency_key } => {
                write!(f, "Duplicate: {}", idempotency_key)
            }
        }
    }
}

/// Operator-entered signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManualSignal {
    pub symbol: String,
    pub action: String,
    pub price: Decimal,
    #[serde(default)]
    pub strategy: Option<String>,
    #[serde(default)]
    pub confidence: Option<Decimal>,
}

/// Bounded, time-windowed set of recently seen idempotency keys.
pub struct RecentSignalCache {
    window: Duration,
    capacity: usize,
    seen: DashMap<IdempotencyKey, DateTime<Utc>>,
}

impl RecentSignalCache {
    pub fn new(window_secs: i64, capacity: usize) -> Self {
        Self {
            window: Duration::seconds(window_secs),
            capacity: capacity.max(1),
            seen: DashMap::new(),
        }
    }

    /// Record `key` at `now`. Returns false if it was already seen inside the
    /// window. Check and insert are atomic per key.
    pub fn check_and_insert(&self, key: &IdempotencyKey, now: DateTime<Utc>) -> bool {
        if self.seen.len() >= self.capacity {
            self.evict(now);
        }

        match self.seen.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                if now - *entry.get() < self.window {
                    false
                } else {
                    entry.insert(now);
                    true
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(now);
                true
            }
        }
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    fn evict(&self, now: DateTime<Utc>) {
        let window = self.window;
        self.seen.retain(|_, seen_at| now - *seen_at < window);

        // Still full of live entries: drop the oldest.
        while self.seen.len() >= self.capacity {
            let oldest = self
                .seen
                .iter()
                .min_by_key(|entry| *entry.value())
                .map(|entry| entry.key().clone());
            match oldest {
                Some(key) => {
                    self.seen.remove(&key);
                }
                None => break,
            }
        }
    }
}

/// Turns inbound payloads into signals. Every outcome is audited before
/// returning.
pub struct SignalIngestor {
    webhook_secret: SharedSecret,
    bot_secret: SharedSecret,
    bucket_secs: i64,
    cache: RecentSignalCache,
    audit: AuditLogger,
    notifier: NotificationHub,
}

impl SignalIngestor {
    pub fn new(config: &WebhookConfig, audit: AuditLogger, notifier: NotificationHub) -> Self {
        Self {
            webhook_secret: SharedSecret::new(&config.shared_secret),
            bot_secret: SharedSecret::new(&config.bot_shared_secret),
            bucket_secs: config.time_bucket_secs,
            cache: RecentSignalCache::new(config.dedup_window_secs, config.cache_capacity),
            audit,
            notifier,
        }
    }

    /// Ingest a payload from an external channel. The payload's `token` must
    /// match the channel's shared secret. Manual signals only enter through
    /// [`ingest_manual`](Self::ingest_manual) and are refused here.
    ///
    /// The outer error is reserved for audit storage failures.
    pub async fn ingest(
        &self,
        payload: Value,
        source: SignalSource,
    ) -> Result<std::result::Result<Signal, Rejection>> {
        let secret = match source {
            SignalSource::Webhook => &self.webhook_secret,
            SignalSource::Bot => &self.bot_secret,
            SignalSource::Manual => {
                warn!("Signal rejected: manual source without an operator identity");
                return self
                    .reject(source.as_str(), &payload, None, None, Rejection::AuthFailure)
                    .await;
            }
        };

        let token = payload.get("token").and_then(Value::as_str).unwrap_or_default();
        if !secret.verify(token) {
            warn!(source = %source, "Signal rejected: invalid shared secret");
            return self
                .reject(source.as_str(), &payload, None, None, Rejection::AuthFailure)
                .await;
        }

        self.accept(source.as_str(), payload, source, Utc::now()).await
    }

    /// Ingest an operator-entered signal. The operator is already
    /// authenticated; `actor` is recorded in the audit log.
    pub async fn ingest_manual(
        &self,
        actor: &str,
        manual: ManualSignal,
    ) -> Result<std::result::Result<Signal, Rejection>> {
        let payload = json!({
            "symbol": manual.symbol,
            "action": manual.action,
            "price": manual.price,
            "strategy": manual.strategy.unwrap_or_else(|| DEFAULT_STRATEGY.to_string()),
            "confidence": manual.confidence,
        });
        self.accept(actor, payload, SignalSource::Manual, Utc::now())
            .await
    }

    pub fn cache(&self) -> &RecentSignalCache {
        &self.cache
    }

    async fn accept(
        &self,
        actor: &str,
        payload: Value,
        source: SignalSource,
        received_at: DateTime<Utc>,
    ) -> Result<std::result::Result<Signal, Rejection>> {
        let signal = match parse_signal(&payload, source, received_at, self.bucket_secs) {
            Ok(signal) => signal,
            Err(rejection) => {
                let symbol = payload.get("symbol").and_then(Value::as_str).map(str::to_string);
                return self
                    .reject(actor, &payload, symbol.as_deref(), None, rejection)
                    .await;
            }
        };

        if !self.cache.check_and_insert(&signal.idempotency_key, received_at) {
            debug!(key = %signal.idempotency_key, "Duplicate signal suppressed");
            let rejection = Rejection::Duplicate {
                idempotency_key: signal.idempotency_key.to_string(),
            };
            return self
                .reject(
                    actor,
                    &payload,
                    Some(&signal.symbol),
                    Some(&signal.idempotency_key),
                    rejection,
                )
                .await;
        }

        self.audit
            .record(
                AuditEntry::builder(AuditAction::SignalIngest, format!("signal/{}", signal.symbol))
                    .actor(actor)
                    .key(signal.idempotency_key.as_str())
                    .inputs(payload)
                    .decision(Decision::Accepted)
                    .build(),
            )
            .await?;

        debug!(
            source = %source,
            symbol = %signal.symbol,
            action = %signal.action,
            key = %signal.idempotency_key,
            "Signal accepted"
        );
        Ok(Ok(signal))
    }

    async fn reject(
        &self,
        actor: &str,
        payload: &Value,
        symbol: Option<&str>,
        key: Option<&IdempotencyKey>,
        rejection: Rejection,
    ) -> Result<std::result::Result<Signal, Rejection>> {
        let resource = format!("signal/{}", symbol.unwrap_or("unknown"));
        let mut entry = AuditEntry::builder(AuditAction::SignalIngest, resource)
            .actor(actor)
            .inputs(payload.clone())
            .decision(Decision::Rejected)
            .reason(rejection.code());
        if let Some(key) = key {
            entry = entry.key(key.as_str());
        }
        self.audit.record(entry.build()).await?;

        self.notifier.notify(
            EventType::SignalRejected,
            json!({
                "actor": actor,
                "symbol": symbol,
                "reason": rejection.code(),
                "detail": rejection.to_string(),
            }),
        );
        Ok(Err(rejection))
    }
}

/// Validate and normalize a raw payload.
pub fn parse_signal(
    payload: &Value,
    source: SignalSource,
    received_at: DateTime<Utc>,
    bucket_secs: i64,
) -> std::result::Result<Signal, Rejection> {
    if !payload.is_object() {
        return Err(Rejection::malformed("payload", "expected a JSON object"));
    }

    let symbol = payload
        .get("symbol")
        .and_then(Value::as_str)
        .map(|s| s.trim().to_ascii_uppercase())
        .unwrap_or_default();
    if symbol.is_empty() {
        return Err(Rejection::malformed("symbol", "must be a non-empty string"));
    }
    if symbol.len() > MAX_SYMBOL_LEN
        || !symbol
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '/' | ':' | '_'))
    {
        return Err(Rejection::malformed("symbol", format!("invalid symbol '{}'", symbol)));
    }

    let action = payload
        .get("action")
        .and_then(Value::as_str)
        .ok_or_else(|| Rejection::malformed("action", "missing"))
        .and_then(|raw| {
            SignalAction::from_str(raw)
                .map_err(|_| Rejection::malformed("action", format!("'{}' is not BUY, SELL or CLOSE", raw)))
        })?;

    let price = decimal_field(payload, "price")?
        .ok_or_else(|| Rejection::malformed("price", "missing"))?;
    if price <= Decimal::ZERO {
        return Err(Rejection::malformed("price", "must be positive"));
    }

    let confidence = decimal_field(payload, "confidence")?.unwrap_or(Decimal::ONE);
    if confidence < Decimal::ZERO || confidence > Decimal::ONE {
        return Err(Rejection::malformed("confidence", "must be within [0, 1]"));
    }

    let strategy = payload
        .get("strategy")
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or_default();
    if strategy.is_empty() {
        return Err(Rejection::malformed("strategy", "must be a non-empty string"));
    }

    let mut raw_payload = payload.clone();
    if let Some(object) = raw_payload.as_object_mut() {
        object.remove("token");
    }

    Ok(Signal::new(
        source,
        &symbol,
        action,
        price,
        confidence,
        strategy,
        received_at,
        raw_payload,
        bucket_secs,
    ))
}

/// Read an optional numeric field given as a JSON number or numeric string.
fn decimal_field(payload: &Value, field: &str) -> std::result::Result<Option<Decimal>, Rejection> {
    let parsed = match payload.get(field) {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::Number(n)) => Decimal::from_str(&n.to_string())
            .or_else(|_| Decimal::from_scientific(&n.to_string())),
        Some(Value::String(s)) => Decimal::from_str(s.trim()),
        Some(_) => return Err(Rejection::malformed(field, "must be a number")),
    };
    parsed
        .map(Some)
        .map_err(|_| Rejection::malformed(field, "must be a number"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use auth::AuditFilter;
    use signal_core::config::Config;
    use signal_core::notify::BroadcastSink;
    use std::sync::Arc;

    fn ingestor() -> (SignalIngestor, AuditLogger) {
        let audit = AuditLogger::in_memory();
        let notifier = NotificationHub::spawn(64, vec![Arc::new(BroadcastSink::new(64))]);
        (
            SignalIngestor::new(&Config::test_config().webhook, audit.clone(), notifier),
            audit,
        )
    }

    fn payload(token: &str) -> Value {
        json!({
            "token": token,
            "symbol": "AAPL",
            "action": "BUY",
            "price": 150.50,
            "strategy": "Test"
        })
    }

    #[tokio::test]
    async fn test_valid_webhook_accepted_and_audited() {
        let (ingestor, audit) = ingestor();
        let signal = ingestor
            .ingest(payload("T1"), SignalSource::Webhook)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(signal.symbol, "AAPL");
        assert_eq!(signal.action, SignalAction::Buy);
        assert_eq!(signal.suggested_price, Decimal::new(15050, 2));
        assert_eq!(signal.strategy_tag, "Test");

        let entries = audit
            .query(&AuditFilter::new().key(signal.idempotency_key.as_str()))
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].decision, Decision::Accepted);
        // The token never reaches storage.
        assert_eq!(entries[0].inputs["token"], "[redacted]");
    }

    #[tokio::test]
    async fn test_invalid_token_rejected() {
        let (ingestor, audit) = ingestor();
        let rejection = ingestor
            .ingest(payload("WRONG"), SignalSource::Webhook)
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(rejection, Rejection::AuthFailure);

        let entries = audit
            .query(&AuditFilter::new().decision(Decision::Rejected))
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].reason.as_deref(), Some("AuthFailure"));
    }

    #[tokio::test]
    async fn test_bot_channel_uses_its_own_secret() {
        let (ingestor, _) = ingestor();
        assert!(ingestor
            .ingest(payload("T1"), SignalSource::Bot)
            .await
            .unwrap()
            .is_err());
        assert!(ingestor
            .ingest(payload("B1"), SignalSource::Bot)
            .await
            .unwrap()
            .is_ok());
    }

    #[tokio::test]
    async fn test_duplicate_within_window_rejected() {
        let (ingestor, _) = ingestor();
        ingestor
            .ingest(payload("T1"), SignalSource::Webhook)
            .await
            .unwrap()
            .unwrap();
        let second = ingestor
            .ingest(payload("T1"), SignalSource::Webhook)
            .await
            .unwrap();
        assert!(matches!(second, Err(Rejection::Duplicate { .. })));
    }

    #[tokio::test]
    async fn test_manual_signal() {
        let (ingestor, audit) = ingestor();
        let signal = ingestor
            .ingest_manual(
                "alice",
                ManualSignal {
                    symbol: "msft".to_string(),
                    action: "close".to_string(),
                    price: Decimal::from(400),
                    strategy: None,
                    confidence: None,
                },
            )
            .await
            .unwrap()
            .unwrap();

        assert_eq!(signal.source, SignalSource::Manual);
        assert_eq!(signal.symbol, "MSFT");
        assert_eq!(signal.action, SignalAction::Close);
        assert_eq!(audit.count(&AuditFilter::new().actor("alice")).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_manual_source_refused_on_channel_ingest() {
        let (ingestor, audit) = ingestor();
        let outcome =
            tokio_test::assert_ok!(ingestor.ingest(payload("T1"), SignalSource::Manual).await);
        let rejection = tokio_test::assert_err!(outcome);
        assert_eq!(rejection, Rejection::AuthFailure);

        let entries = tokio_test::assert_ok!(
            audit
                .query(&AuditFilter::new().decision(Decision::Rejected).actor("manual"))
                .await
        );
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].reason.as_deref(), Some("AuthFailure"));
        assert!(ingestor.cache().is_empty());
    }

    #[test]
    fn test_malformed_payloads() {
        let now = Utc::now();
        let cases = [
            (json!({"action": "BUY", "price": 1, "strategy": "s"}), "symbol"),
            (json!({"symbol": "  ", "action": "BUY", "price": 1, "strategy": "s"}), "symbol"),
            (json!({"symbol": "A B", "action": "BUY", "price": 1, "strategy": "s"}), "symbol"),
            (json!({"symbol": "AAPL", "action": "HOLD", "price": 1, "strategy": "s"}), "action"),
            (json!({"symbol": "AAPL", "action": "BUY", "price": "abc", "strategy": "s"}), "price"),
            (json!({"symbol": "AAPL", "action": "BUY", "price": -1, "strategy": "s"}), "price"),
            (json!({"symbol": "AAPL", "action": "BUY", "price": 1}), "strategy"),
            (json!({"symbol": "AAPL", "action": "BUY", "price": 1, "strategy": "s", "confidence": 2}), "confidence"),
            (json!([1, 2, 3]), "payload"),
        ];

        for (payload, expected_field) in cases {
            match parse_signal(&payload, SignalSource::Webhook, now, 60) {
                Err(Rejection::Malformed { field, .. }) => assert_eq!(field, expected_field),
                other => panic!("expected malformed {}, got {:?}", expected_field, other),
            }
        }
    }

    #[test]
    fn test_price_as_string() {
        let payload = json!({"symbol": "EURUSD", "action": "sell", "price": "1.0835", "strategy": "fx"});
        let signal = parse_signal(&payload, SignalSource::Bot, Utc::now(), 60).unwrap();
        assert_eq!(signal.suggested_price, Decimal::new(10835, 4));
    }

    #[test]
    fn test_cache_window_and_capacity() {
        let cache = RecentSignalCache::new(300, 2);
        let now = Utc::now();
        let a = IdempotencyKey::from_raw("a");
        let b = IdempotencyKey::from_raw("b");
        let c = IdempotencyKey::from_raw("c");

        assert!(cache.check_and_insert(&a, now));
        assert!(!cache.check_and_insert(&a, now + Duration::seconds(10)));
        assert!(cache.check_and_insert(&a, now + Duration::seconds(301)));

        assert!(cache.check_and_insert(&b, now + Duration::seconds(302)));
        assert!(cache.check_and_insert(&c, now + Duration::seconds(303)));
        assert!(cache.len() <= 2);
    }
}
