//! Background jobs: order status polling and periodic housekeeping
//! (daily reset, unlock expiry, capital schedule, dedup pruning).

use auth::{AuditAction, Decision};
use chrono::{DateTime, Utc};
use risk_manager::ScheduleOutcome;
use serde_json::json;
use signal_core::config::ExecutionConfig;
use signal_core::notify::EventType;
use signal_core::types::ExecutionTier;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, warn};

use crate::coordinator::ExecutionCoordinator;

/// Intervals for the background jobs.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub poll_interval_secs: u64,
    pub housekeeping_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
            housekeeping_interval_secs: 30,
        }
    }
}

impl From<&ExecutionConfig> for SchedulerConfig {
    fn from(config: &ExecutionConfig) -> Self {
        Self {
            poll_interval_secs: config.poll_interval_secs.max(1),
            ..Default::default()
        }
    }
}

/// What one housekeeping pass did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HousekeepingReport {
    pub day_rolled: bool,
    pub unlock_expired: bool,
    pub schedule_outcome: Option<ScheduleOutcome>,
    pub processed_pruned: usize,
}

pub struct Scheduler {
    coordinator: Arc<ExecutionCoordinator>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(coordinator: Arc<ExecutionCoordinator>, config: SchedulerConfig) -> Self {
        Self {
            coordinator,
            config,
        }
    }

    /// Start both loops. Handles are returned so the server can abort them
    /// on shutdown.
    pub fn spawn(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(self.clone().run_order_poller()),
            tokio::spawn(self.run_housekeeping()),
        ]
    }

    /// Poll Submitted orders. Keeps running while trading is paused.
    pub async fn run_order_poller(self: Arc<Self>) {
        info!(
            interval_secs = self.config.poll_interval_secs,
            "Order status poller started"
        );
        let mut interval = time::interval(time::Duration::from_secs(self.config.poll_interval_secs));
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            match self.coordinator.poll_open_orders().await {
                Ok(0) => {}
                Ok(changed) => debug!(changed, "Order poll cycle complete"),
                Err(e) => error!(error = %e, "Order poll cycle failed"),
            }
        }
    }

    pub async fn run_housekeeping(self: Arc<Self>) {
        info!(
            interval_secs = self.config.housekeeping_interval_secs,
            "Housekeeping started"
        );
        let mut interval =
            time::interval(time::Duration::from_secs(self.config.housekeeping_interval_secs));
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            let report = self.housekeeping(Utc::now()).await;
            if report != HousekeepingReport::default() {
                debug!(report = ?report, "Housekeeping pass complete");
            }
        }
    }

    /// One housekeeping pass at `now`. Each step logs its own failures so
    /// one failing step never skips the rest.
    pub async fn housekeeping(&self, now: DateTime<Utc>) -> HousekeepingReport {
        let mut report = HousekeepingReport {
            day_rolled: self.roll_day(now).await,
            ..Default::default()
        };

        match self.coordinator.mode.expire_if_due(now).await {
            Ok(expired) => report.unlock_expired = expired,
            Err(e) => error!(error = %e, "Failed to relock expired advanced unlock"),
        }

        report.schedule_outcome = self.evaluate_capital_schedule(now).await;
        report.processed_pruned = self.coordinator.prune_processed(now);
        report
    }

    async fn roll_day(&self, now: DateTime<Utc>) -> bool {
        let coordinator = &self.coordinator;
        let before = coordinator.risk.snapshot().await;
        if !coordinator.risk.roll_day_if_due(now).await {
            return false;
        }
        let after = coordinator.risk.snapshot().await;

        let inputs = json!({
            "previous_day": before.trading_day,
            "trading_day": after.trading_day,
            "daily_pnl": before.daily_pnl,
            "consecutive_losses": before.consecutive_losses,
        });
        if let Err(e) = coordinator
            .audit_system(AuditAction::DailyReset, "risk", inputs.clone(), Decision::Succeeded)
            .await
        {
            error!(error = %e, "Failed to audit daily reset");
        }
        coordinator.notifier().notify(EventType::DailyReset, inputs);
        info!(
            trading_day = %after.trading_day,
            previous_pnl = %before.daily_pnl,
            "Daily risk counters reset"
        );
        true
    }

    async fn evaluate_capital_schedule(&self, now: DateTime<Utc>) -> Option<ScheduleOutcome> {
        let coordinator = &self.coordinator;
        if !coordinator.scaler.evaluation_due(now).await {
            return None;
        }

        let drawdown = coordinator.risk.snapshot().await.rolling_drawdown_pct;
        let evaluation = coordinator.scaler.evaluate(drawdown, now).await;

        let inputs = match serde_json::to_value(&evaluation) {
            Ok(value) => value,
            Err(e) => {
                error!(error = %e, "Failed to serialize capital evaluation");
                serde_json::Value::Null
            }
        };
        if let Err(e) = coordinator
            .audit_system(AuditAction::CapitalSchedule, "capital_schedule", inputs, Decision::Succeeded)
            .await
        {
            error!(error = %e, "Failed to audit capital schedule evaluation");
        }

        if evaluation.ceiling_pct != evaluation.previous_ceiling_pct {
            coordinator.notifier().notify(
                EventType::CapitalScaled,
                json!({
                    "outcome": evaluation.outcome,
                    "previous_ceiling_pct": evaluation.previous_ceiling_pct,
                    "ceiling_pct": evaluation.ceiling_pct,
                    "profit_factor": evaluation.profit_factor,
                }),
            );
        }

        // An active unlock above the new ceiling is revoked.
        if evaluation.outcome == ScheduleOutcome::Regressed {
            let mode = coordinator.mode.snapshot();
            if mode.effective_tier(now) == ExecutionTier::Advanced
                && mode.advanced_capital_pct > evaluation.ceiling_pct
            {
                warn!(
                    capital_pct = %mode.advanced_capital_pct,
                    ceiling_pct = %evaluation.ceiling_pct,
                    "Advanced allocation exceeds regressed ceiling, relocking"
                );
                if let Err(e) = coordinator
                    .mode
                    .force_conservative(auth::SYSTEM_ACTOR)
                    .await
                {
                    error!(error = %e, "Failed to relock after capital regression");
                }
            }
        }

        info!(
            outcome = ?evaluation.outcome,
            ceiling_pct = %evaluation.ceiling_pct,
            trades = evaluation.trades,
            "Capital schedule evaluated"
        );
        Some(evaluation.outcome)
    }
}
