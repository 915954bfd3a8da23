//! Risk ledger, capital schedule and pipeline metrics.

use axum::extract::State;
use axum::Json;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::ToSchema;
use uuid::Uuid;

use trading_engine::MetricsSnapshot;

use crate::state::AppState;

/// Risk ledger snapshot with the limits it is checked against.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct RiskResponse {
    pub daily_pnl: Decimal,
    pub rolling_drawdown_pct: Decimal,
    pub open_exposure_pct: Decimal,
    pub advanced_exposure_pct: Decimal,
    /// Broker cash held by approved entries that have not filled.
    pub reserved_cash: Decimal,
    pub consecutive_losses: u32,
    /// Broker-local trading day the daily counters belong to.
    pub trading_day: String,
    pub last_reset_at: DateTime<Utc>,
    pub peak_equity: Decimal,
    pub current_equity: Decimal,
    pub reservations: Vec<ReservationResponse>,
    pub limits: LimitsResponse,
    pub capital_schedule: CapitalScheduleResponse,
}

/// Exposure held for an order that has not reached a terminal state.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ReservationResponse {
    /// Same as the backing order id.
    pub id: Uuid,
    pub symbol: String,
    pub exposure_pct: Decimal,
    pub cash: Decimal,
    pub tier: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct LimitsResponse {
    pub max_trade_exposure_pct: Decimal,
    pub max_open_exposure_pct: Decimal,
    pub daily_loss_limit: Decimal,
    pub max_drawdown_pct: Decimal,
    pub max_consecutive_losses: u32,
    /// Absolute price tolerance for the slippage guard.
    pub slippage_tolerance: Decimal,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CapitalScheduleResponse {
    pub stage_index: usize,
    /// Current advanced-tier capital ceiling (percent).
    pub ceiling_pct: Decimal,
    pub stage_started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_evaluated_at: Option<DateTime<Utc>>,
    pub trades_this_stage: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profit_factor: Option<Decimal>,
}

/// Pipeline counters.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct MetricsResponse {
    pub signals_executed: u64,
    pub duplicates: u64,
    pub risk_denials: u64,
    pub gate_denials: u64,
    pub orders_submitted: u64,
    pub orders_filled: u64,
    pub orders_rejected: u64,
    pub orders_failed: u64,
    pub orders_cancelled: u64,
    pub avg_broker_latency_us: u64,
    /// Idempotency keys held by the ingestion dedup window.
    pub dedup_cache_size: usize,
}

impl MetricsResponse {
    fn new(metrics: MetricsSnapshot, dedup_cache_size: usize) -> Self {
        Self {
            signals_executed: metrics.signals_executed,
            duplicates: metrics.duplicates,
            risk_denials: metrics.risk_denials,
            gate_denials: metrics.gate_denials,
            orders_submitted: metrics.orders_submitted,
            orders_filled: metrics.orders_filled,
            orders_rejected: metrics.orders_rejected,
            orders_failed: metrics.orders_failed,
            orders_cancelled: metrics.orders_cancelled,
            avg_broker_latency_us: metrics.avg_broker_latency_us,
            dedup_cache_size,
        }
    }
}

/// Get the risk ledger.
#[utoipa::path(
    get,
    path = "/api/v1/risk",
    tag = "risk",
    responses((status = 200, description = "Risk ledger", body = RiskResponse)),
    security(("bearer_auth" = []))
)]
pub async fn get_risk(State(state): State<Arc<AppState>>) -> Json<RiskResponse> {
    let ledger = state.risk.snapshot().await;
    let mut reservations = state.risk.reservations().await;
    reservations.sort_by_key(|r| r.created_at);
    let limits = state.risk.limits();
    let schedule = state.scaler.snapshot().await;
    let ceiling_pct = state.scaler.ceiling().await;

    Json(RiskResponse {
        daily_pnl: ledger.daily_pnl,
        rolling_drawdown_pct: ledger.rolling_drawdown_pct,
        open_exposure_pct: ledger.open_exposure_pct,
        advanced_exposure_pct: ledger.advanced_exposure_pct,
        reserved_cash: ledger.reserved_cash,
        consecutive_losses: ledger.consecutive_losses,
        trading_day: ledger.trading_day.to_string(),
        last_reset_at: ledger.last_reset_at,
        peak_equity: ledger.peak_equity,
        current_equity: ledger.current_equity,
        reservations: reservations
            .into_iter()
            .map(|r| ReservationResponse {
                id: r.id,
                symbol: r.symbol,
                exposure_pct: r.exposure_pct,
                cash: r.cash,
                tier: r.tier.to_string(),
                created_at: r.created_at,
            })
            .collect(),
        limits: LimitsResponse {
            max_trade_exposure_pct: limits.max_trade_exposure_pct,
            max_open_exposure_pct: limits.max_open_exposure_pct,
            daily_loss_limit: limits.daily_loss_limit,
            max_drawdown_pct: limits.max_drawdown_pct,
            max_consecutive_losses: limits.max_consecutive_losses,
            slippage_tolerance: limits.slippage_tolerance,
        },
        capital_schedule: CapitalScheduleResponse {
            stage_index: schedule.stage_index,
            ceiling_pct,
            stage_started_at: schedule.stage_started_at,
            last_evaluated_at: schedule.last_evaluated_at,
            trades_this_stage: schedule.trades_this_stage,
            profit_factor: schedule.profit_factor(),
        },
    })
}

/// Get pipeline metrics.
#[utoipa::path(
    get,
    path = "/api/v1/metrics",
    tag = "risk",
    responses((status = 200, description = "Pipeline counters", body = MetricsResponse)),
    security(("bearer_auth" = []))
)]
pub async fn get_metrics(State(state): State<Arc<AppState>>) -> Json<MetricsResponse> {
    Json(MetricsResponse::new(
        state.coordinator.metrics(),
        state.ingestor.cache().len(),
    ))
}
