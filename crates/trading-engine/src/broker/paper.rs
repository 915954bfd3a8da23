//! Paper trading simulator.

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use signal_core::types::{
    BrokerOrderId, BrokerOrderState, BrokerOrderStatus, BrokerVenue, CancelOutcome, Order,
    OrderSide, Position,
};
use signal_core::BrokerError;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use super::BrokerApi;

#[derive(Debug, Clone)]
struct PaperOrder {
    order: Order,
    state: BrokerOrderState,
}

#[derive(Debug, Default)]
struct PaperAccount {
    cash: Decimal,
    positions: HashMap<String, Position>,
    orders: HashMap<Uuid, PaperOrder>,
    next_id: u64,
}

/// In-process broker that fills against its own cash and positions.
///
/// By default orders fill at submission. A resting simulator keeps them open
/// until [`PaperBroker::fill_open_orders`] is called.
pub struct PaperBroker {
    fee_rate: Decimal,
    fill_on_submit: bool,
    account: Mutex<PaperAccount>,
}

impl PaperBroker {
    pub const ID: &'static str = "paper";

    pub fn new(starting_cash: Decimal, fee_rate: Decimal) -> Self {
        Self {
            fee_rate,
            fill_on_submit: true,
            account: Mutex::new(PaperAccount {
                cash: starting_cash,
                ..Default::default()
            }),
        }
    }

    /// Simulator whose orders rest open until filled explicitly.
    pub fn resting(starting_cash: Decimal, fee_rate: Decimal) -> Self {
        Self {
            fill_on_submit: false,
            ..Self::new(starting_cash, fee_rate)
        }
    }

    pub async fn cash(&self) -> Decimal {
        self.account.lock().await.cash
    }

    /// Fill every open order. Returns the number filled.
    pub async fn fill_open_orders(&self) -> usize {
        let mut account = self.account.lock().await;
        let open: Vec<Uuid> = account
            .orders
            .iter()
            .filter(|(_, o)| o.state.status == BrokerOrderStatus::Open)
            .map(|(id, _)| *id)
            .collect();

        let mut filled = 0;
        for id in open {
            if Self::fill(&mut account, id, self.fee_rate).is_ok() {
                filled += 1;
            }
        }
        filled
    }

    fn fill_price(order: &Order) -> Decimal {
        order.limit_price.unwrap_or(order.reference_price)
    }

    /// Check cash or holdings for an order at its fill price.
    fn check_funds(account: &PaperAccount, order: &Order, fee_rate: Decimal) -> Result<(), BrokerError> {
        let price = Self::fill_price(order);
        if price <= Decimal::ZERO {
            return Err(BrokerError::rejected(format!(
                "no price for {} order {}",
                order.symbol, order.id
            )));
        }
        match order.side {
            OrderSide::Buy => {
                let cost = order.quantity * price * (Decimal::ONE + fee_rate);
                if cost > account.cash {
                    return Err(BrokerError::rejected(format!(
                        "insufficient funds: need {}, have {}",
                        cost, account.cash
                    )));
                }
            }
            OrderSide::Sell => {
                let held = account
                    .positions
                    .get(&order.symbol)
                    .map(|p| p.quantity)
                    .unwrap_or_default();
                if order.quantity > held {
                    return Err(BrokerError::rejected(format!(
                        "insufficient position: sell {}, hold {}",
                        order.quantity, held
                    )));
                }
            }
        }
        Ok(())
    }

    fn fill(account: &mut PaperAccount, id: Uuid, fee_rate: Decimal) -> Result<(), BrokerError> {
        let order = match account.orders.get(&id) {
            Some(paper) => paper.order.clone(),
            None => return Err(BrokerError::rejected("unknown order")),
        };

        if let Err(e) = Self::check_funds(account, &order, fee_rate) {
            if let Some(paper) = account.orders.get_mut(&id) {
                paper.state.status = BrokerOrderStatus::Rejected;
                paper.state.updated_at = Utc::now();
            }
            return Err(e);
        }

        let price = Self::fill_price(&order);
        let gross = order.quantity * price;
        let fees = gross * fee_rate;

        match order.side {
            OrderSide::Buy => {
                account.cash -= gross + fees;
                let position = account
                    .positions
                    .entry(order.symbol.clone())
                    .or_insert_with(|| Position::flat(order.symbol.clone()));
                let total = position.quantity + order.quantity;
                position.average_price =
                    (position.average_price * position.quantity + gross) / total;
                position.quantity = total;
            }
            OrderSide::Sell => {
                account.cash += gross - fees;
                if let Some(position) = account.positions.get_mut(&order.symbol) {
                    position.quantity -= order.quantity;
                    if position.quantity <= Decimal::ZERO {
                        account.positions.remove(&order.symbol);
                    }
                }
            }
        }

        if let Some(paper) = account.orders.get_mut(&id) {
            paper.state.status = BrokerOrderStatus::Filled;
            paper.state.filled_quantity = order.quantity;
            paper.state.average_fill_price = Some(price);
            paper.state.updated_at = Utc::now();
        }

        info!(
            order_id = %id,
            symbol = %order.symbol,
            side = ?order.side,
            quantity = %order.quantity,
            price = %price,
            fees = %fees,
            cash = %account.cash,
            "[PAPER] Simulated fill"
        );
        Ok(())
    }
}

#[async_trait]
impl BrokerApi for PaperBroker {
    fn id(&self) -> &str {
        Self::ID
    }

    fn venue(&self) -> BrokerVenue {
        BrokerVenue::Paper
    }

    async fn place_order(&self, order: &Order) -> Result<BrokerOrderId, BrokerError> {
        let mut account = self.account.lock().await;

        if let Some(existing) = account.orders.get(&order.id) {
            info!(order_id = %order.id, "[PAPER] Duplicate submission, returning original");
            return Ok(existing.state.broker_order_id.clone());
        }

        Self::check_funds(&account, order, self.fee_rate)?;

        account.next_id += 1;
        let broker_order_id = BrokerOrderId(format!("paper-{}", account.next_id));
        account.orders.insert(
            order.id,
            PaperOrder {
                order: order.clone(),
                state: BrokerOrderState {
                    broker_order_id: broker_order_id.clone(),
                    status: BrokerOrderStatus::Open,
                    filled_quantity: Decimal::ZERO,
                    average_fill_price: None,
                    updated_at: Utc::now(),
                },
            },
        );

        info!(
            order_id = %order.id,
            broker_order_id = %broker_order_id,
            symbol = %order.symbol,
            "[PAPER] Order accepted"
        );

        if self.fill_on_submit {
            Self::fill(&mut account, order.id, self.fee_rate)?;
        }

        Ok(broker_order_id)
    }

    async fn cancel_order(&self, client_order_id: Uuid) -> Result<CancelOutcome, BrokerError> {
        let mut account = self.account.lock().await;
        let Some(paper) = account.orders.get_mut(&client_order_id) else {
            warn!(order_id = %client_order_id, "[PAPER] Cancel for unknown order");
            return Ok(CancelOutcome::NotFound);
        };

        match paper.state.status {
            BrokerOrderStatus::Filled => Ok(CancelOutcome::AlreadyFilled {
                fill_price: paper.state.average_fill_price,
            }),
            BrokerOrderStatus::Open | BrokerOrderStatus::Cancelled => {
                paper.state.status = BrokerOrderStatus::Cancelled;
                paper.state.updated_at = Utc::now();
                info!(order_id = %client_order_id, "[PAPER] Order cancelled");
                Ok(CancelOutcome::Cancelled)
            }
            BrokerOrderStatus::Rejected => Ok(CancelOutcome::NotFound),
        }
    }

    async fn order_status(&self, client_order_id: Uuid) -> Result<BrokerOrderState, BrokerError> {
        self.account
            .lock()
            .await
            .orders
            .get(&client_order_id)
            .map(|paper| paper.state.clone())
            .ok_or_else(|| BrokerError::rejected(format!("order {} not found", client_order_id)))
    }

    async fn get_position(&self, symbol: &str) -> Result<Position, BrokerError> {
        Ok(self
            .account
            .lock()
            .await
            .positions
            .get(symbol)
            .cloned()
            .unwrap_or_else(|| Position::flat(symbol)))
    }

    async fn get_available_capital(&self) -> Result<Decimal, BrokerError> {
        Ok(self.account.lock().await.cash)
    }
}
