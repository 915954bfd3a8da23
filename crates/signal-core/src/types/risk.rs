//! Shared risk accounting state.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Exposure held by an open position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Holding {
    pub exposure_pct: Decimal,
    /// Portion of `exposure_pct` opened by the advanced tier.
    pub advanced_exposure_pct: Decimal,
}

/// Rolling risk ledger. Percentages are expressed 0-100 of current equity.
///
/// Owned by the risk guard; everyone else reads snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskState {
    pub daily_pnl: Decimal,
    pub rolling_drawdown_pct: Decimal,
    pub open_exposure_pct: Decimal,
    /// Portion of `open_exposure_pct` deployed by the advanced tier.
    pub advanced_exposure_pct: Decimal,
    /// Cash (notional plus fees) held by approved entries not yet filled.
    #[serde(default)]
    pub reserved_cash: Decimal,
    pub consecutive_losses: u32,
    pub last_reset_at: DateTime<Utc>,
    /// Broker-local trading day the daily counters belong to.
    pub trading_day: NaiveDate,
    pub peak_equity: Decimal,
    pub current_equity: Decimal,
    /// Filled entries by symbol; released when the position is exited.
    #[serde(default)]
    pub holdings: BTreeMap<String, Holding>,
}

impl RiskState {
    pub fn new(starting_capital: Decimal, trading_day: NaiveDate) -> Self {
        Self {
            daily_pnl: Decimal::ZERO,
            rolling_drawdown_pct: Decimal::ZERO,
            open_exposure_pct: Decimal::ZERO,
            advanced_exposure_pct: Decimal::ZERO,
            reserved_cash: Decimal::ZERO,
            consecutive_losses: 0,
            last_reset_at: Utc::now(),
            trading_day,
            peak_equity: starting_capital,
            current_equity: starting_capital,
            holdings: BTreeMap::new(),
        }
    }

    /// Recompute drawdown from peak after an equity change.
    pub fn apply_equity(&mut self, equity: Decimal) {
        self.current_equity = equity;
        if equity > self.peak_equity {
            self.peak_equity = equity;
        }
        self.rolling_drawdown_pct = if self.peak_equity > Decimal::ZERO {
            ((self.peak_equity - equity) / self.peak_equity * Decimal::ONE_HUNDRED)
                .max(Decimal::ZERO)
        } else {
            Decimal::ZERO
        };
    }

    /// Convert a notional amount into a percentage of current equity.
    pub fn exposure_pct_of(&self, notional: Decimal) -> Option<Decimal> {
        if self.current_equity <= Decimal::ZERO {
            return None;
        }
        Some(notional / self.current_equity * Decimal::ONE_HUNDRED)
    }

    /// Broker-reported cash minus what pending entries have already claimed.
    pub fn uncommitted_cash(&self, broker_available: Decimal) -> Decimal {
        (broker_available - self.reserved_cash).max(Decimal::ZERO)
    }
}
