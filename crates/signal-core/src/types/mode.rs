//! Execution tier, trading mode and the process-wide mode snapshot.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Execution tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionTier {
    /// Always-on, capital-gated.
    Conservative,
    /// Locked by default, requires an explicit multi-factor unlock.
    Advanced,
}

impl fmt::Display for ExecutionTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionTier::Conservative => f.write_str("conservative"),
            ExecutionTier::Advanced => f.write_str("advanced"),
        }
    }
}

/// Whether orders go to a simulator or a real venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradingMode {
    Paper,
    Live,
}

impl fmt::Display for TradingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradingMode::Paper => f.write_str("paper"),
            TradingMode::Live => f.write_str("live"),
        }
    }
}

/// Lock state of the advanced tier as seen by operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdvancedStatus {
    Locked,
    Active,
}

/// Point-in-time mode snapshot. Mutated only by the mode controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModeState {
    pub tier: ExecutionTier,
    pub trading_mode: TradingMode,
    pub paused: bool,
    pub advanced_unlock_expiry: Option<DateTime<Utc>>,
    /// Share of total capital (0-100) the advanced tier may deploy.
    pub advanced_capital_pct: Decimal,
    /// Set when the system halted on a state mismatch. Cleared only by an
    /// administrative acknowledgement.
    pub safe_mode: Option<String>,
    /// Bumped on every transition that must abort new submissions
    /// (pause, force-conservative, safe mode).
    pub epoch: u64,
    pub updated_at: DateTime<Utc>,
    pub updated_by: String,
}

impl Default for ModeState {
    fn default() -> Self {
        Self {
            tier: ExecutionTier::Conservative,
            trading_mode: TradingMode::Paper,
            paused: false,
            advanced_unlock_expiry: None,
            advanced_capital_pct: Decimal::ZERO,
            safe_mode: None,
            epoch: 0,
            updated_at: Utc::now(),
            updated_by: "system".to_string(),
        }
    }
}

impl ModeState {
    /// Tier actually in force at `now`; an expired unlock counts as conservative.
    pub fn effective_tier(&self, now: DateTime<Utc>) -> ExecutionTier {
        match (self.tier, self.advanced_unlock_expiry) {
            (ExecutionTier::Advanced, Some(expiry)) if expiry > now => ExecutionTier::Advanced,
            _ => ExecutionTier::Conservative,
        }
    }

    pub fn advanced_status(&self, now: DateTime<Utc>) -> AdvancedStatus {
        match self.effective_tier(now) {
            ExecutionTier::Advanced => AdvancedStatus::Active,
            ExecutionTier::Conservative => AdvancedStatus::Locked,
        }
    }

    pub fn unlock_expired(&self, now: DateTime<Utc>) -> bool {
        self.tier == ExecutionTier::Advanced && self.effective_tier(now) == ExecutionTier::Conservative
    }

    pub fn accepts_new_orders(&self) -> bool {
        !self.paused && self.safe_mode.is_none()
    }

    pub fn in_safe_mode(&self) -> bool {
        self.safe_mode.is_some()
    }
}
