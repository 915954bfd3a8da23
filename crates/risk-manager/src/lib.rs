//! Risk Manager
//!
//! Pre-trade policy evaluation, the exposure reservation ledger, and the
//! advanced-tier capital scaling schedule.

pub mod capital;
pub mod evaluation;
pub mod guard;

pub use capital::{CapitalScaler, CapitalScheduleState, ScheduleEvaluation, ScheduleOutcome};
pub use evaluation::{evaluate, required_cash, DenyReason, RiskDecision, RiskLimits, TradeContext};
pub use guard::{trading_day, Breach, EvaluationOutcome, ExitRecord, ObservedPrice, Reservation, RiskGuard};
