//! Advanced-tier capital scaling schedule.
//!
//! The ceiling on advanced capital walks a configured list of stages. A stage
//! advances only on a scheduled evaluation where the tier's profit factor and
//! the rolling drawdown both qualify; a drawdown breach drops back to the
//! first stage.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use signal_core::config::CapitalScheduleConfig;
use signal_core::db::{keys, load_snapshot, save_snapshot, StateStore};
use signal_core::Result;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapitalScheduleState {
    pub stage_index: usize,
    pub stage_started_at: DateTime<Utc>,
    pub last_evaluated_at: Option<DateTime<Utc>>,
    /// Realized results of advanced-tier trades in the current stage.
    pub gross_profit: Decimal,
    pub gross_loss: Decimal,
    pub trades_this_stage: u32,
}

impl CapitalScheduleState {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            stage_index: 0,
            stage_started_at: now,
            last_evaluated_at: None,
            gross_profit: Decimal::ZERO,
            gross_loss: Decimal::ZERO,
            trades_this_stage: 0,
        }
    }

    /// Gross profit over gross loss. `None` when there are no losses.
    pub fn profit_factor(&self) -> Option<Decimal> {
        if self.gross_loss.is_zero() {
            None
        } else {
            Some(self.gross_profit / self.gross_loss)
        }
    }

    fn enter_stage(&mut self, stage_index: usize, now: DateTime<Utc>) {
        self.stage_index = stage_index;
        self.stage_started_at = now;
        self.gross_profit = Decimal::ZERO;
        self.gross_loss = Decimal::ZERO;
        self.trades_this_stage = 0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleOutcome {
    Advanced,
    Held,
    Regressed,
    AtMaximum,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleEvaluation {
    pub outcome: ScheduleOutcome,
    pub previous_ceiling_pct: Decimal,
    pub ceiling_pct: Decimal,
    pub profit_factor: Option<Decimal>,
    pub trades: u32,
    pub drawdown_pct: Decimal,
    pub evaluated_at: DateTime<Utc>,
}

/// Owns the schedule state. The advanced-tier unlock consults [`ceiling`].
///
/// [`ceiling`]: CapitalScaler::ceiling
pub struct CapitalScaler {
    config: CapitalScheduleConfig,
    state: Mutex<CapitalScheduleState>,
    store: Option<Arc<dyn StateStore>>,
}

impl CapitalScaler {
    pub fn new(config: CapitalScheduleConfig) -> Self {
        Self {
            config,
            state: Mutex::new(CapitalScheduleState::new(Utc::now())),
            store: None,
        }
    }

    pub fn with_store(config: CapitalScheduleConfig, store: Arc<dyn StateStore>) -> Self {
        let mut scaler = Self::new(config);
        scaler.store = Some(store);
        scaler
    }

    pub async fn load_state(&self) -> Result<bool> {
        let Some(store) = &self.store else {
            return Ok(false);
        };
        let Some(mut loaded) =
            load_snapshot::<CapitalScheduleState>(store.as_ref(), keys::CAPITAL_SCHEDULE).await?
        else {
            return Ok(false);
        };

        let last = self.config.stages_pct.len().saturating_sub(1);
        if loaded.stage_index > last {
            warn!(
                stage_index = loaded.stage_index,
                stages = self.config.stages_pct.len(),
                "Persisted capital stage beyond configured schedule, clamping"
            );
            loaded.stage_index = last;
        }

        info!(
            stage = loaded.stage_index,
            ceiling_pct = %self.ceiling_for(loaded.stage_index),
            "Loaded capital schedule"
        );
        *self.state.lock().await = loaded;
        Ok(true)
    }

    pub async fn snapshot(&self) -> CapitalScheduleState {
        self.state.lock().await.clone()
    }

    /// Current maximum advanced capital percentage.
    pub async fn ceiling(&self) -> Decimal {
        let state = self.state.lock().await;
        self.ceiling_for(state.stage_index)
    }

    fn ceiling_for(&self, stage_index: usize) -> Decimal {
        self.config
            .stages_pct
            .get(stage_index)
            .copied()
            .unwrap_or(Decimal::ONE_HUNDRED)
    }

    /// Book a closed advanced-tier trade against the current stage.
    pub async fn record_advanced_trade(&self, pnl: Decimal) {
        let mut state = self.state.lock().await;
        if pnl > Decimal::ZERO {
            state.gross_profit += pnl;
        } else if pnl < Decimal::ZERO {
            state.gross_loss += pnl.abs();
        }
        state.trades_this_stage += 1;
        self.persist(&state).await;
    }

    pub async fn evaluation_due(&self, now: DateTime<Utc>) -> bool {
        let state = self.state.lock().await;
        let since = state.last_evaluated_at.unwrap_or(state.stage_started_at);
        now - since >= Duration::hours(self.config.evaluation_interval_hours)
    }

    /// Run one scheduled evaluation against the current rolling drawdown.
    pub async fn evaluate(&self, drawdown_pct: Decimal, now: DateTime<Utc>) -> ScheduleEvaluation {
        let mut state = self.state.lock().await;
        let previous_ceiling_pct = self.ceiling_for(state.stage_index);
        let profit_factor = state.profit_factor();
        let trades = state.trades_this_stage;
        let last = self.config.stages_pct.len().saturating_sub(1);

        let qualifies = trades >= self.config.min_trades
            && match profit_factor {
                Some(pf) => pf >= self.config.min_profit_factor,
                None => state.gross_profit > Decimal::ZERO,
            };

        let outcome = if drawdown_pct > self.config.max_drawdown_pct {
            if state.stage_index > 0 {
                state.enter_stage(0, now);
                ScheduleOutcome::Regressed
            } else {
                ScheduleOutcome::Held
            }
        } else if state.stage_index >= last {
            ScheduleOutcome::AtMaximum
        } else if qualifies {
            let next = state.stage_index + 1;
            state.enter_stage(next, now);
            ScheduleOutcome::Advanced
        } else {
            ScheduleOutcome::Held
        };

        state.last_evaluated_at = Some(now);
        let ceiling_pct = self.ceiling_for(state.stage_index);

        match outcome {
            ScheduleOutcome::Advanced => info!(
                from_pct = %previous_ceiling_pct,
                to_pct = %ceiling_pct,
                "Advanced capital ceiling raised"
            ),
            ScheduleOutcome::Regressed => warn!(
                from_pct = %previous_ceiling_pct,
                to_pct = %ceiling_pct,
                drawdown_pct = %drawdown_pct,
                "Drawdown breach, advanced capital ceiling reset"
            ),
            _ => {}
        }

        self.persist(&state).await;

        ScheduleEvaluation {
            outcome,
            previous_ceiling_pct,
            ceiling_pct,
            profit_factor,
            trades,
            drawdown_pct,
            evaluated_at: now,
        }
    }

    async fn persist(&self, state: &CapitalScheduleState) {
        if let Some(store) = &self.store {
            if let Err(e) = save_snapshot(store.as_ref(), keys::CAPITAL_SCHEDULE, state).await {
                error!(error = %e, "Failed to persist capital schedule");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use signal_core::db::MemoryStateStore;

    fn config() -> CapitalScheduleConfig {
        CapitalScheduleConfig {
            min_trades: 2,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_starts_at_first_stage() {
        let scaler = CapitalScaler::new(config());
        assert_eq!(scaler.ceiling().await, Decimal::from(5));
    }

    #[tokio::test]
    async fn test_advances_when_profitable() {
        let scaler = CapitalScaler::new(config());
        scaler.record_advanced_trade(Decimal::from(300)).await;
        scaler.record_advanced_trade(Decimal::from(-100)).await;

        let eval = scaler.evaluate(Decimal::from(2), Utc::now()).await;
        assert_eq!(eval.outcome, ScheduleOutcome::Advanced);
        assert_eq!(eval.profit_factor, Some(Decimal::from(3)));
        assert_eq!(eval.ceiling_pct, Decimal::from(10));

        // New stage starts with a clean tally.
        let state = scaler.snapshot().await;
        assert_eq!(state.trades_this_stage, 0);
        assert_eq!(state.gross_profit, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_holds_below_profit_factor() {
        let scaler = CapitalScaler::new(config());
        scaler.record_advanced_trade(Decimal::from(120)).await;
        scaler.record_advanced_trade(Decimal::from(-100)).await;

        let eval = scaler.evaluate(Decimal::ZERO, Utc::now()).await;
        assert_eq!(eval.outcome, ScheduleOutcome::Held);
        assert_eq!(scaler.ceiling().await, Decimal::from(5));
    }

    #[tokio::test]
    async fn test_holds_with_too_few_trades() {
        let scaler = CapitalScaler::new(config());
        scaler.record_advanced_trade(Decimal::from(500)).await;

        let eval = scaler.evaluate(Decimal::ZERO, Utc::now()).await;
        assert_eq!(eval.outcome, ScheduleOutcome::Held);
    }

    #[tokio::test]
    async fn test_drawdown_regresses_to_first_stage() {
        let scaler = CapitalScaler::new(config());
        for _ in 0..2 {
            scaler.record_advanced_trade(Decimal::from(100)).await;
            scaler.record_advanced_trade(Decimal::from(100)).await;
            scaler.evaluate(Decimal::ZERO, Utc::now()).await;
        }
        assert_eq!(scaler.ceiling().await, Decimal::from(25));

        let eval = scaler.evaluate(Decimal::from(12), Utc::now()).await;
        assert_eq!(eval.outcome, ScheduleOutcome::Regressed);
        assert_eq!(eval.previous_ceiling_pct, Decimal::from(25));
        assert_eq!(scaler.ceiling().await, Decimal::from(5));
    }

    #[tokio::test]
    async fn test_evaluation_due_after_interval() {
        let scaler = CapitalScaler::new(config());
        let now = Utc::now();
        assert!(!scaler.evaluation_due(now).await);
        assert!(scaler.evaluation_due(now + Duration::hours(25)).await);

        scaler.evaluate(Decimal::ZERO, now + Duration::hours(25)).await;
        assert!(!scaler.evaluation_due(now + Duration::hours(26)).await);
    }

    #[tokio::test]
    async fn test_schedule_persists() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let scaler = CapitalScaler::with_store(config(), store.clone());
        scaler.record_advanced_trade(Decimal::from(50)).await;
        scaler.record_advanced_trade(Decimal::from(50)).await;
        scaler.evaluate(Decimal::ZERO, Utc::now()).await;

        let restarted = CapitalScaler::with_store(config(), store);
        assert!(restarted.load_state().await.unwrap());
        assert_eq!(restarted.ceiling().await, Decimal::from(10));
    }
}
