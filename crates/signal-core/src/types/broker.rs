//! Values exchanged with broker adapters.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::mode::TradingMode;

/// Whether an adapter talks to a simulator or a real venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerVenue {
    Paper,
    Live,
}

impl BrokerVenue {
    /// Venue an order declared under `mode` is allowed to reach.
    pub fn for_mode(mode: TradingMode) -> Self {
        match mode {
            TradingMode::Paper => BrokerVenue::Paper,
            TradingMode::Live => BrokerVenue::Live,
        }
    }
}

impl fmt::Display for BrokerVenue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerVenue::Paper => f.write_str("paper"),
            BrokerVenue::Live => f.write_str("live"),
        }
    }
}

/// Id assigned by the broker on acceptance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BrokerOrderId(pub String);

impl fmt::Display for BrokerOrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Broker-authoritative order status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerOrderStatus {
    Open,
    Filled,
    Cancelled,
    Rejected,
}

/// Snapshot of an order as the broker reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerOrderState {
    pub broker_order_id: BrokerOrderId,
    pub status: BrokerOrderStatus,
    pub filled_quantity: Decimal,
    pub average_fill_price: Option<Decimal>,
    pub updated_at: DateTime<Utc>,
}

/// Result of a cancellation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CancelOutcome {
    Cancelled,
    /// The broker filled the order first; the fill stands.
    AlreadyFilled { fill_price: Option<Decimal> },
    NotFound,
}
