//! Pure pre-trade policy evaluation.
//!
//! [`evaluate`] has no side effects; the [`RiskGuard`](crate::RiskGuard)
//! calls it under its ledger lock and reserves exposure on approval.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use signal_core::config::RiskConfig;
use signal_core::types::{ExecutionTier, ModeState, RiskState, Signal};
use std::fmt;

/// Thresholds the guard enforces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskLimits {
    pub max_trade_exposure_pct: Decimal,
    pub max_open_exposure_pct: Decimal,
    /// Absolute daily loss (currency units).
    pub daily_loss_limit: Decimal,
    pub max_drawdown_pct: Decimal,
    pub max_consecutive_losses: u32,
    /// Max |suggested - market| in price units.
    pub slippage_tolerance: Decimal,
    pub fee_rate: Decimal,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self::from(&RiskConfig::default())
    }
}

impl From<&RiskConfig> for RiskLimits {
    fn from(config: &RiskConfig) -> Self {
        Self {
            max_trade_exposure_pct: config.max_trade_exposure_pct,
            max_open_exposure_pct: config.max_open_exposure_pct,
            daily_loss_limit: config.daily_loss_limit,
            max_drawdown_pct: config.max_drawdown_pct,
            max_consecutive_losses: config.max_consecutive_losses,
            slippage_tolerance: config.slippage_tolerance(),
            fee_rate: config.fee_rate,
        }
    }
}

/// Facts about the prospective order gathered before evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct TradeContext {
    pub quantity: Decimal,
    /// `quantity * suggested_price`.
    pub notional: Decimal,
    /// Broker-reported cash available with no margin.
    pub available_capital: Decimal,
    /// Latest observed market price for the symbol, if any.
    pub market_price: Option<Decimal>,
    /// Broker-reported quantity currently held.
    pub position_quantity: Decimal,
}

/// Why the guard refused a signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DenyReason {
    InvalidSize,
    TradeExposureLimit { requested_pct: Decimal, max_pct: Decimal },
    OpenExposureLimit { projected_pct: Decimal, max_pct: Decimal },
    AdvancedCapitalCap { projected_pct: Decimal, cap_pct: Decimal },
    DailyLossLimit { daily_pnl: Decimal, limit: Decimal },
    DrawdownLimit { drawdown_pct: Decimal, max_pct: Decimal },
    ConsecutiveLosses { count: u32, max: u32 },
    Slippage { suggested: Decimal, market: Decimal, tolerance: Decimal },
    InsufficientCapital { required: Decimal, available: Decimal },
    NoPosition,
}

impl DenyReason {
    /// Stable short code for audit entries and API responses.
    pub fn code(&self) -> &'static str {
        match self {
            DenyReason::InvalidSize => "InvalidSize",
            DenyReason::TradeExposureLimit { .. } => "TradeExposureLimit",
            DenyReason::OpenExposureLimit { .. } => "OpenExposureLimit",
            DenyReason::AdvancedCapitalCap { .. } => "AdvancedCapitalCap",
            DenyReason::DailyLossLimit { .. } => "DailyLossLimit",
            DenyReason::DrawdownLimit { .. } => "DrawdownLimit",
            DenyReason::ConsecutiveLosses { .. } => "ConsecutiveLosses",
            DenyReason::Slippage { .. } => "Slippage",
            DenyReason::InsufficientCapital { .. } => "InsufficientCapital",
            DenyReason::NoPosition => "NoPosition",
        }
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenyReason::InvalidSize => write!(f, "order size is zero or negative"),
            DenyReason::TradeExposureLimit { requested_pct, max_pct } => {
                write!(f, "trade exposure {}% exceeds {}%", requested_pct.round_dp(4), max_pct)
            }
            DenyReason::OpenExposureLimit { projected_pct, max_pct } => write!(
                f,
                "open exposure would reach {}% (max {}%)",
                projected_pct.round_dp(4),
                max_pct
            ),
            DenyReason::AdvancedCapitalCap { projected_pct, cap_pct } => write!(
                f,
                "advanced exposure would reach {}% (unlocked {}%)",
                projected_pct.round_dp(4),
                cap_pct
            ),
            DenyReason::DailyLossLimit { daily_pnl, limit } => {
                write!(f, "daily P&L {} breaches loss limit {}", daily_pnl, limit)
            }
            DenyReason::DrawdownLimit { drawdown_pct, max_pct } => write!(
                f,
                "drawdown {}% breaches {}%",
                drawdown_pct.round_dp(4),
                max_pct
            ),
            DenyReason::ConsecutiveLosses { count, max } => {
                write!(f, "{} consecutive losses (max {})", count, max)
            }
            DenyReason::Slippage { suggested, market, tolerance } => write!(
                f,
                "suggested price {} deviates from market {} beyond {}",
                suggested, market, tolerance
            ),
            DenyReason::InsufficientCapital { required, available } => write!(
                f,
                "order needs {} but only {} is available",
                required.round_dp(2),
                available.round_dp(2)
            ),
            DenyReason::NoPosition => write!(f, "no open position to exit"),
        }
    }
}

/// Outcome of a risk evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", content = "reason", rename_all = "snake_case")]
pub enum RiskDecision {
    Approve,
    Deny(DenyReason),
}

impl RiskDecision {
    pub fn is_approved(&self) -> bool {
        matches!(self, RiskDecision::Approve)
    }
}

/// Cash an entry of `notional` needs, fees included.
pub fn required_cash(notional: Decimal, limits: &RiskLimits) -> Decimal {
    notional * (Decimal::ONE + limits.fee_rate)
}

/// Evaluate a signal against the current ledger and mode.
///
/// Exits (SELL/CLOSE) are allowed in close-only conditions: they skip the
/// exposure, loss, drawdown and capital checks but still need an open
/// position and a price within tolerance.
pub fn evaluate(
    signal: &Signal,
    state: &RiskState,
    mode: &ModeState,
    ctx: &TradeContext,
    limits: &RiskLimits,
) -> RiskDecision {
    use RiskDecision::Deny;

    if !signal.action.is_entry() && ctx.position_quantity <= Decimal::ZERO {
        return Deny(DenyReason::NoPosition);
    }

    if ctx.quantity <= Decimal::ZERO || ctx.notional <= Decimal::ZERO {
        return Deny(DenyReason::InvalidSize);
    }

    if let Some(market) = ctx.market_price {
        let deviation = (signal.suggested_price - market).abs();
        if deviation > limits.slippage_tolerance {
            return Deny(DenyReason::Slippage {
                suggested: signal.suggested_price,
                market,
                tolerance: limits.slippage_tolerance,
            });
        }
    }

    if !signal.action.is_entry() {
        return RiskDecision::Approve;
    }

    if state.daily_pnl < Decimal::ZERO && state.daily_pnl.abs() >= limits.daily_loss_limit {
        return Deny(DenyReason::DailyLossLimit {
            daily_pnl: state.daily_pnl,
            limit: limits.daily_loss_limit,
        });
    }

    if state.rolling_drawdown_pct >= limits.max_drawdown_pct {
        return Deny(DenyReason::DrawdownLimit {
            drawdown_pct: state.rolling_drawdown_pct,
            max_pct: limits.max_drawdown_pct,
        });
    }

    if state.consecutive_losses >= limits.max_consecutive_losses {
        return Deny(DenyReason::ConsecutiveLosses {
            count: state.consecutive_losses,
            max: limits.max_consecutive_losses,
        });
    }

    let Some(requested_pct) = state.exposure_pct_of(ctx.notional) else {
        return Deny(DenyReason::InsufficientCapital {
            required: ctx.notional,
            available: ctx.available_capital,
        });
    };

    if requested_pct > limits.max_trade_exposure_pct {
        return Deny(DenyReason::TradeExposureLimit {
            requested_pct,
            max_pct: limits.max_trade_exposure_pct,
        });
    }

    let projected_pct = state.open_exposure_pct + requested_pct;
    if projected_pct > limits.max_open_exposure_pct {
        return Deny(DenyReason::OpenExposureLimit {
            projected_pct,
            max_pct: limits.max_open_exposure_pct,
        });
    }

    if mode.effective_tier(chrono::Utc::now()) == ExecutionTier::Advanced {
        let projected_advanced = state.advanced_exposure_pct + requested_pct;
        if projected_advanced > mode.advanced_capital_pct {
            return Deny(DenyReason::AdvancedCapitalCap {
                projected_pct: projected_advanced,
                cap_pct: mode.advanced_capital_pct,
            });
        }
    }

    let required = required_cash(ctx.notional, limits);
    let available = state.uncommitted_cash(ctx.available_capital);
    if required > available {
        return Deny(DenyReason::InsufficientCapital { required, available });
    }

    RiskDecision::Approve
}
