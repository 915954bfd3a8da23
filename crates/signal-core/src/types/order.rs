//! Order types owned by the execution coordinator.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::mode::{ExecutionTier, TradingMode};
use super::signal::{IdempotencyKey, SignalAction};

/// Side of the order (buy or sell).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl From<SignalAction> for OrderSide {
    fn from(action: SignalAction) -> Self {
        match action {
            SignalAction::Buy => OrderSide::Buy,
            SignalAction::Sell | SignalAction::Close => OrderSide::Sell,
        }
    }
}

/// Type of order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Market,
    Limit,
}

/// Lifecycle status of an order.
///
/// `Pending -> Submitted -> Filled | Rejected | Cancelled | Failed`. A pending
/// order may also go straight to `Rejected`, `Cancelled` or `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// Created, not yet accepted by the broker.
    Pending,
    /// Accepted by the broker, awaiting fill.
    Submitted,
    Filled,
    Rejected,
    Cancelled,
    Failed,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Submitted => "submitted",
            OrderStatus::Filled => "filled",
            OrderStatus::Rejected => "rejected",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled
                | OrderStatus::Rejected
                | OrderStatus::Cancelled
                | OrderStatus::Failed
        )
    }

    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        match (self, next) {
            (Pending, Submitted) | (Pending, Filled) => true,
            (Pending, Rejected) | (Pending, Cancelled) | (Pending, Failed) => true,
            (Submitted, Filled) | (Submitted, Rejected) | (Submitted, Cancelled) => true,
            (Submitted, Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "pending" => Ok(OrderStatus::Pending),
            "submitted" => Ok(OrderStatus::Submitted),
            "filled" => Ok(OrderStatus::Filled),
            "rejected" => Ok(OrderStatus::Rejected),
            "cancelled" => Ok(OrderStatus::Cancelled),
            "failed" => Ok(OrderStatus::Failed),
            other => Err(format!("unknown order status: {}", other)),
        }
    }
}

/// An order produced from an approved signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    /// System-generated id, also sent to brokers as the client order id.
    pub id: Uuid,
    pub signal_ref: IdempotencyKey,
    pub broker_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub action: SignalAction,
    pub quantity: Decimal,
    /// Price the order was sized at. Simulated fills use it for market orders.
    #[serde(default)]
    pub reference_price: Decimal,
    pub limit_price: Option<Decimal>,
    /// Average entry price of the position an exit closes.
    #[serde(default)]
    pub entry_price: Option<Decimal>,
    pub order_type: OrderType,
    pub status: OrderStatus,
    /// Trading mode the order was declared under. Routing must agree with it.
    pub trading_mode: TradingMode,
    pub tier: ExecutionTier,
    pub broker_order_id: Option<String>,
    /// Exposure held against the risk ledger while the order is open.
    pub reserved_exposure_pct: Decimal,
    pub fill_price: Option<Decimal>,
    pub created_at: DateTime<Utc>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub terminal_at: Option<DateTime<Utc>>,
    pub terminal_reason: Option<String>,
}

impl Order {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        signal_ref: IdempotencyKey,
        broker_id: impl Into<String>,
        symbol: impl Into<String>,
        action: SignalAction,
        quantity: Decimal,
        trading_mode: TradingMode,
        tier: ExecutionTier,
        reserved_exposure_pct: Decimal,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            signal_ref,
            broker_id: broker_id.into(),
            symbol: symbol.into(),
            side: action.into(),
            action,
            quantity,
            reference_price: Decimal::ZERO,
            limit_price: None,
            entry_price: None,
            order_type: OrderType::Market,
            status: OrderStatus::Pending,
            trading_mode,
            tier,
            broker_order_id: None,
            reserved_exposure_pct,
            fill_price: None,
            created_at: Utc::now(),
            submitted_at: None,
            terminal_at: None,
            terminal_reason: None,
        }
    }

    /// Reuse an id allocated before the order existed (the risk reservation).
    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    pub fn with_reference_price(mut self, price: Decimal) -> Self {
        self.reference_price = price;
        self
    }

    pub fn with_limit(mut self, price: Decimal) -> Self {
        self.limit_price = Some(price);
        self.order_type = OrderType::Limit;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Apply a status change, stamping timestamps. Returns false if the
    /// transition is not allowed (terminal orders never change again).
    pub fn transition(&mut self, next: OrderStatus, reason: Option<String>) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        let now = Utc::now();
        if next == OrderStatus::Submitted {
            self.submitted_at = Some(now);
        }
        if next.is_terminal() {
            if self.submitted_at.is_none() && next == OrderStatus::Filled {
                self.submitted_at = Some(now);
            }
            self.terminal_at = Some(now);
            self.terminal_reason = reason;
        }
        self.status = next;
        true
    }

    pub fn notional(&self, price: Decimal) -> Decimal {
        self.quantity * price
    }
}

/// Broker-reported holding for a symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub quantity: Decimal,
    pub average_price: Decimal,
}

impl Position {
    pub fn flat(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            quantity: Decimal::ZERO,
            average_price: Decimal::ZERO,
        }
    }

    pub fn is_open(&self) -> bool {
        self.quantity > Decimal::ZERO
    }

    pub fn market_value(&self, price: Decimal) -> Decimal {
        self.quantity * price
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order() -> Order {
        Order::new(
            IdempotencyKey::from_raw("k"),
            "paper",
            "AAPL",
            SignalAction::Buy,
            Decimal::from(10),
            TradingMode::Paper,
            ExecutionTier::Conservative,
            Decimal::from(2),
        )
    }

    #[test]
    fn test_status_transitions() {
        use OrderStatus::*;
        assert!(Pending.can_transition_to(Submitted));
        assert!(Pending.can_transition_to(Failed));
        assert!(Submitted.can_transition_to(Filled));
        assert!(Submitted.can_transition_to(Cancelled));
        assert!(!Submitted.can_transition_to(Pending));
        assert!(!Filled.can_transition_to(Cancelled));
        assert!(!Cancelled.can_transition_to(Filled));
        assert!(!Failed.can_transition_to(Submitted));
    }

    #[test]
    fn test_order_transition_stamps_timestamps() {
        let mut o = order();
        assert_eq!(o.side, OrderSide::Buy);
        assert!(o.transition(OrderStatus::Submitted, None));
        assert!(o.submitted_at.is_some());
        assert!(o.terminal_at.is_none());

        assert!(o.transition(OrderStatus::Filled, None));
        assert!(o.terminal_at.is_some());
        assert!(o.is_terminal());

        // Terminal orders are frozen.
        assert!(!o.transition(OrderStatus::Cancelled, Some("late".into())));
        assert_eq!(o.status, OrderStatus::Filled);
    }

    #[test]
    fn test_exit_actions_map_to_sell() {
        assert_eq!(OrderSide::from(SignalAction::Close), OrderSide::Sell);
        assert_eq!(OrderSide::from(SignalAction::Sell), OrderSide::Sell);
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            OrderStatus::Pending,
            OrderStatus::Submitted,
            OrderStatus::Filled,
            OrderStatus::Rejected,
            OrderStatus::Cancelled,
            OrderStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<OrderStatus>().unwrap(), status);
        }
    }
}
