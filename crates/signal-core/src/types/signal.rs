//! Normalized trading signals.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Where a signal came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalSource {
    Webhook,
    Manual,
    Bot,
}

impl SignalSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalSource::Webhook => "webhook",
            SignalSource::Manual => "manual",
            SignalSource::Bot => "bot",
        }
    }
}

impl fmt::Display for SignalSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Requested trading action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalAction {
    Buy,
    Sell,
    Close,
}

impl SignalAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalAction::Buy => "BUY",
            SignalAction::Sell => "SELL",
            SignalAction::Close => "CLOSE",
        }
    }

    /// Entries add exposure; exits only ever reduce it.
    pub fn is_entry(&self) -> bool {
        matches!(self, SignalAction::Buy)
    }
}

impl fmt::Display for SignalAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignalAction {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "BUY" => Ok(SignalAction::Buy),
            "SELL" => Ok(SignalAction::Sell),
            "CLOSE" => Ok(SignalAction::Close),
            other => Err(format!("unsupported action '{}', expected BUY|SELL|CLOSE", other)),
        }
    }
}

/// Deterministic identifier of a logically unique signal.
///
/// Derived from `(source, symbol, action, strategy_tag, time bucket)` so that
/// a re-delivered alert inside the same bucket maps to the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn derive(
        source: SignalSource,
        symbol: &str,
        action: SignalAction,
        strategy_tag: &str,
        received_at: DateTime<Utc>,
        bucket_secs: i64,
    ) -> Self {
        let bucket = time_bucket(received_at, bucket_secs);
        let mut hasher = Sha256::new();
        hasher.update(source.as_str().as_bytes());
        hasher.update(b"|");
        hasher.update(symbol.as_bytes());
        hasher.update(b"|");
        hasher.update(action.as_str().as_bytes());
        hasher.update(b"|");
        hasher.update(strategy_tag.as_bytes());
        hasher.update(b"|");
        hasher.update(bucket.to_le_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    /// Wrap an already-derived key (e.g. loaded from storage).
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Index of the time bucket containing `at`.
pub fn time_bucket(at: DateTime<Utc>, bucket_secs: i64) -> i64 {
    at.timestamp().div_euclid(bucket_secs.max(1))
}

/// A normalized trading instruction. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub source: SignalSource,
    pub symbol: String,
    pub action: SignalAction,
    pub suggested_price: Decimal,
    /// Signal confidence in `[0, 1]`.
    pub confidence: Decimal,
    pub strategy_tag: String,
    pub received_at: DateTime<Utc>,
    /// Inbound payload with credentials stripped.
    pub raw_payload: serde_json::Value,
    pub idempotency_key: IdempotencyKey,
}

impl Signal {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: SignalSource,
        symbol: impl Into<String>,
        action: SignalAction,
        suggested_price: Decimal,
        confidence: Decimal,
        strategy_tag: impl Into<String>,
        received_at: DateTime<Utc>,
        raw_payload: serde_json::Value,
        bucket_secs: i64,
    ) -> Self {
        let symbol = symbol.into();
        let strategy_tag = strategy_tag.into();
        let idempotency_key = IdempotencyKey::derive(
            source,
            &symbol,
            action,
            &strategy_tag,
            received_at,
            bucket_secs,
        );
        Self {
            source,
            symbol,
            action,
            suggested_price,
            confidence,
            strategy_tag,
            received_at,
            raw_payload,
            idempotency_key,
        }
    }
}
