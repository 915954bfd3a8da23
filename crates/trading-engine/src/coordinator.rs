//! Execution coordinator: Signal → Risk Guard → mode gate → broker → audit.
//!
//! One pipeline run per idempotency key at a time (serialized per key,
//! parallel across keys). A key that has produced an outcome never produces
//! a second order.

use auth::{AuditAction, AuditEntry, AuditLogger, Decision, SYSTEM_ACTOR};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use risk_manager::{CapitalScaler, DenyReason, RiskDecision, RiskGuard, TradeContext};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;
use serde_json::json;
use signal_core::config::Config;
use signal_core::db::OrderStore;
use signal_core::notify::{EventType, NotificationHub};
use signal_core::types::{
    BrokerOrderId, BrokerOrderState, BrokerOrderStatus, CancelOutcome, ExecutionTier,
    IdempotencyKey, ModeState, Order, OrderStatus, Signal,
};
use signal_core::{BrokerError, Error, Result};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::{BrokerApi, BrokerRegistry};
use crate::mode::{GateDecision, ModeController};

/// Reason recorded when every submission attempt timed out.
pub const BROKER_TIMEOUT_EXHAUSTED: &str = "BrokerTimeoutExhausted";

/// Stage of the pipeline that refused a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialStage {
    Risk,
    Mode,
    /// The broker could not be consulted for sizing.
    Routing,
}

/// Result of running one signal through the pipeline.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    /// Accepted by the broker; the order is Submitted or Filled.
    Executed { order: Order },
    Denied {
        stage: DenialStage,
        code: String,
        reason: String,
        order: Option<Order>,
    },
    /// The broker refused the order or cancelled it on its own.
    Rejected { order: Order, reason: String },
    /// Retries exhausted.
    Failed { order: Order, reason: String },
    Duplicate {
        idempotency_key: String,
        order_id: Option<Uuid>,
    },
}

impl ExecutionOutcome {
    pub fn order(&self) -> Option<&Order> {
        match self {
            ExecutionOutcome::Executed { order }
            | ExecutionOutcome::Rejected { order, .. }
            | ExecutionOutcome::Failed { order, .. } => Some(order),
            ExecutionOutcome::Denied { order, .. } => order.as_ref(),
            ExecutionOutcome::Duplicate { .. } => None,
        }
    }

    pub fn order_id(&self) -> Option<Uuid> {
        match self {
            ExecutionOutcome::Duplicate { order_id, .. } => *order_id,
            other => other.order().map(|o| o.id),
        }
    }

    pub fn is_executed(&self) -> bool {
        matches!(self, ExecutionOutcome::Executed { .. })
    }
}

/// Pipeline counters.
#[derive(Debug, Default)]
pub struct ExecutionMetrics {
    signals_executed: AtomicU64,
    duplicates: AtomicU64,
    risk_denials: AtomicU64,
    gate_denials: AtomicU64,
    orders_submitted: AtomicU64,
    orders_filled: AtomicU64,
    orders_rejected: AtomicU64,
    orders_failed: AtomicU64,
    orders_cancelled: AtomicU64,
    broker_calls: AtomicU64,
    broker_latency_us: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
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
}

impl ExecutionMetrics {
    fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn observe_broker_call(&self, elapsed: Duration) {
        self.broker_calls.fetch_add(1, Ordering::Relaxed);
        self.broker_latency_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let calls = self.broker_calls.load(Ordering::Relaxed);
        MetricsSnapshot {
            signals_executed: self.signals_executed.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            risk_denials: self.risk_denials.load(Ordering::Relaxed),
            gate_denials: self.gate_denials.load(Ordering::Relaxed),
            orders_submitted: self.orders_submitted.load(Ordering::Relaxed),
            orders_filled: self.orders_filled.load(Ordering::Relaxed),
            orders_rejected: self.orders_rejected.load(Ordering::Relaxed),
            orders_failed: self.orders_failed.load(Ordering::Relaxed),
            orders_cancelled: self.orders_cancelled.load(Ordering::Relaxed),
            avg_broker_latency_us: if calls == 0 {
                0
            } else {
                self.broker_latency_us.load(Ordering::Relaxed) / calls
            },
        }
    }
}

#[derive(Debug, Clone)]
struct ProcessedSignal {
    order_id: Option<Uuid>,
    processed_at: DateTime<Utc>,
}

/// Sizing inputs gathered before risk evaluation.
struct Sizing {
    broker: Arc<dyn BrokerApi>,
    ctx: TradeContext,
    tier: ExecutionTier,
    entry_price: Option<rust_decimal::Decimal>,
}

/// Retry and timeout policy for broker calls.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub broker_timeout: Duration,
}

impl RetryPolicy {
    /// Delay after failed attempt `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Components the coordinator drives.
pub struct ExecutionServices {
    pub risk: Arc<RiskGuard>,
    pub scaler: Arc<CapitalScaler>,
    pub mode: Arc<ModeController>,
    pub brokers: Arc<BrokerRegistry>,
    pub orders: Arc<dyn OrderStore>,
    pub audit: AuditLogger,
    pub notifier: NotificationHub,
}

pub struct ExecutionCoordinator {
    pub(crate) policy: RetryPolicy,
    position_size_pct: Decimal,
    processed_retention: ChronoDuration,
    pub(crate) risk: Arc<RiskGuard>,
    pub(crate) scaler: Arc<CapitalScaler>,
    pub(crate) mode: Arc<ModeController>,
    pub(crate) brokers: Arc<BrokerRegistry>,
    pub(crate) orders: Arc<dyn OrderStore>,
    pub(crate) audit: AuditLogger,
    notifier: NotificationHub,
    key_locks: DashMap<IdempotencyKey, Arc<Mutex<()>>>,
    processed: DashMap<IdempotencyKey, ProcessedSignal>,
    metrics: ExecutionMetrics,
}

impl ExecutionCoordinator {
    pub fn new(config: &Config, services: ExecutionServices) -> Self {
        let execution = &config.execution;
        Self {
            policy: RetryPolicy {
                max_attempts: execution.max_attempts.max(1),
                base_backoff: Duration::from_millis(execution.base_backoff_ms),
                max_backoff: Duration::from_millis(execution.max_backoff_ms),
                broker_timeout: Duration::from_secs(execution.broker_timeout_secs),
            },
            position_size_pct: config.risk.position_size_pct,
            processed_retention: ChronoDuration::seconds(
                config
                    .webhook
                    .dedup_window_secs
                    .max(config.webhook.time_bucket_secs * 2),
            ),
            risk: services.risk,
            scaler: services.scaler,
            mode: services.mode,
            brokers: services.brokers,
            orders: services.orders,
            audit: services.audit,
            notifier: services.notifier,
            key_locks: DashMap::new(),
            processed: DashMap::new(),
            metrics: ExecutionMetrics::default(),
        }
    }

    /// Override the retry policy (tests use millisecond timeouts).
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn orders(&self) -> &Arc<dyn OrderStore> {
        &self.orders
    }

    /// Run a signal through the pipeline.
    pub async fn execute(&self, signal: Signal) -> Result<ExecutionOutcome> {
        let key = signal.idempotency_key.clone();
        let lock = self.key_lock(&key);
        let guard = lock.lock().await;
        let result = self.execute_locked(&signal).await;
        drop(guard);
        self.release_key_lock(&key, &lock);
        result
    }

    async fn execute_locked(&self, signal: &Signal) -> Result<ExecutionOutcome> {
        let key = &signal.idempotency_key;

        let previous = match self.processed.get(key).map(|p| p.clone()) {
            Some(previous) => Some(previous),
            None => self.persisted_outcome(key).await?,
        };
        if let Some(previous) = previous {
            debug!(key = %key, order_id = ?previous.order_id, "Signal already processed");
            ExecutionMetrics::inc(&self.metrics.duplicates);
            self.processed.entry(key.clone()).or_insert(previous.clone());
            return Ok(ExecutionOutcome::Duplicate {
                idempotency_key: key.to_string(),
                order_id: previous.order_id,
            });
        }

        let outcome = self.run_pipeline(signal).await?;
        ExecutionMetrics::inc(&self.metrics.signals_executed);
        self.processed.insert(
            key.clone(),
            ProcessedSignal {
                order_id: outcome.order_id(),
                processed_at: Utc::now(),
            },
        );
        Ok(outcome)
    }

    /// Outcome recorded for `key` by an earlier process: an order in the
    /// store, or at least a Risk Guard ruling in the audit log.
    async fn persisted_outcome(&self, key: &IdempotencyKey) -> Result<Option<ProcessedSignal>> {
        if let Some(order) = self.orders.find_by_signal(key).await? {
            return Ok(Some(ProcessedSignal {
                order_id: Some(order.id),
                processed_at: order.created_at,
            }));
        }
        if self.audit.has_risk_evaluation(key.as_str()).await? {
            return Ok(Some(ProcessedSignal {
                order_id: None,
                processed_at: Utc::now(),
            }));
        }
        Ok(None)
    }

    fn key_lock(&self, key: &IdempotencyKey) -> Arc<Mutex<()>> {
        self.key_locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the lock entry once nobody else is waiting on it.
    fn release_key_lock(&self, key: &IdempotencyKey, lock: &Arc<Mutex<()>>) {
        self.key_locks
            .remove_if(key, |_, held| Arc::ptr_eq(held, lock) && Arc::strong_count(held) <= 2);
    }

    /// Forget processed keys older than the retention window. Their time
    /// bucket has passed, so they cannot be derived again.
    pub fn prune_processed(&self, now: DateTime<Utc>) -> usize {
        let before = self.processed.len();
        let retention = self.processed_retention;
        self.processed
            .retain(|_, processed| now - processed.processed_at < retention);
        before - self.processed.len()
    }

    async fn run_pipeline(&self, signal: &Signal) -> Result<ExecutionOutcome> {
        let mode = self.mode.snapshot();
        let key = signal.idempotency_key.as_str();

        if !mode.accepts_new_orders() {
            let reason = match &mode.safe_mode {
                Some(reason) => format!("safe mode: {}", reason),
                None => "trading is paused".to_string(),
            };
            let code = if mode.safe_mode.is_some() { "safe_mode" } else { "paused" };
            self.audit
                .record(
                    AuditEntry::builder(AuditAction::ModeGate, format!("signal/{}", signal.symbol))
                        .key(key)
                        .inputs(json!({ "epoch": mode.epoch }))
                        .decision(Decision::Denied)
                        .reason(code)
                        .build(),
                )
                .await?;
            ExecutionMetrics::inc(&self.metrics.gate_denials);
            info!(symbol = %signal.symbol, key = %key, reason = %reason, "Signal refused by mode gate");
            return Ok(ExecutionOutcome::Denied {
                stage: DenialStage::Mode,
                code: code.to_string(),
                reason,
                order: None,
            });
        }

        let sizing = match self.size(signal, &mode).await {
            Ok(sizing) => sizing,
            Err(message) => {
                self.audit
                    .record(
                        AuditEntry::builder(
                            AuditAction::RiskEvaluation,
                            format!("signal/{}", signal.symbol),
                        )
                        .key(key)
                        .inputs(json!({ "trading_mode": mode.trading_mode }))
                        .decision(Decision::Denied)
                        .reason(format!("broker_unavailable: {}", message))
                        .build(),
                    )
                    .await?;
                ExecutionMetrics::inc(&self.metrics.risk_denials);
                self.notifier.notify(
                    EventType::RiskDenied,
                    json!({ "symbol": signal.symbol, "idempotency_key": key, "reason": "broker_unavailable" }),
                );
                return Ok(ExecutionOutcome::Denied {
                    stage: DenialStage::Routing,
                    code: "broker_unavailable".to_string(),
                    reason: message,
                    order: None,
                });
            }
        };

        let reservation_id = Uuid::new_v4();
        let evaluation = self
            .risk
            .evaluate_and_reserve(reservation_id, signal, &mode, &sizing.ctx)
            .await;
        let exposure_pct = evaluation
            .reservation
            .as_ref()
            .map(|r| r.exposure_pct)
            .unwrap_or_default();

        let mut entry = AuditEntry::builder(
            AuditAction::RiskEvaluation,
            format!("signal/{}", signal.symbol),
        )
        .key(key)
        .inputs(json!({
            "action": signal.action,
            "suggested_price": signal.suggested_price,
            "quantity": sizing.ctx.quantity,
            "notional": sizing.ctx.notional,
            "market_price": sizing.ctx.market_price,
            "available_capital": sizing.ctx.available_capital,
            "exposure_pct": exposure_pct,
            "tier": sizing.tier,
            "trading_mode": mode.trading_mode,
            "risk_state": serde_json::to_value(&evaluation.state).unwrap_or_default(),
        }));
        entry = match &evaluation.decision {
            RiskDecision::Approve => entry.decision(Decision::Approved),
            RiskDecision::Deny(reason) => entry
                .decision(Decision::Denied)
                .reason(format!("{}: {}", reason.code(), reason)),
        };
        if let Err(e) = self.audit.record(entry.build()).await {
            if let Some(reservation) = &evaluation.reservation {
                self.risk.release(reservation.id).await;
            }
            return Err(e);
        }

        if let RiskDecision::Deny(reason) = evaluation.decision {
            return Ok(self.risk_denied(signal, reason));
        }

        let mut order = Order::new(
            signal.idempotency_key.clone(),
            sizing.broker.id(),
            &signal.symbol,
            signal.action,
            sizing.ctx.quantity,
            mode.trading_mode,
            sizing.tier,
            exposure_pct,
        )
        .with_id(reservation_id)
        .with_reference_price(signal.suggested_price);
        order.entry_price = sizing.entry_price;

        if let Err(e) = self.orders.upsert(&order).await {
            self.risk.release(order.id).await;
            return Err(e);
        }

        Ok(self.dispatch(order, sizing.broker).await)
    }

    fn risk_denied(&self, signal: &Signal, reason: DenyReason) -> ExecutionOutcome {
        ExecutionMetrics::inc(&self.metrics.risk_denials);
        self.notifier.notify(
            EventType::RiskDenied,
            json!({
                "symbol": signal.symbol,
                "action": signal.action,
                "idempotency_key": signal.idempotency_key,
                "reason": reason.code(),
                "detail": reason.to_string(),
            }),
        );
        ExecutionOutcome::Denied {
            stage: DenialStage::Risk,
            code: reason.code().to_string(),
            reason: reason.to_string(),
            order: None,
        }
    }

    /// Quantity and broker facts for a signal. Entries are sized from
    /// equity; exits take the full broker-reported position.
    async fn size(&self, signal: &Signal, mode: &ModeState) -> std::result::Result<Sizing, String> {
        let broker = self
            .brokers
            .route(mode.trading_mode)
            .map_err(|e| e.to_string())?;
        let market_price = self.risk.latest_price(&signal.symbol);
        let price = signal.suggested_price;

        if signal.action.is_entry() {
            let tier = mode.effective_tier(Utc::now());
            let available_capital = self
                .call(broker.get_available_capital())
                .await
                .map_err(|e| e.to_string())?;
            let equity = self.risk.snapshot().await.current_equity;
            let size_pct = match tier {
                ExecutionTier::Conservative => self.position_size_pct,
                ExecutionTier::Advanced => self.risk.limits().max_trade_exposure_pct,
            };
            let quantity = (equity * size_pct / Decimal::ONE_HUNDRED / price)
                .round_dp_with_strategy(4, RoundingStrategy::ToZero);

            Ok(Sizing {
                broker,
                ctx: TradeContext {
                    quantity,
                    notional: quantity * price,
                    available_capital,
                    market_price,
                    position_quantity: Decimal::ZERO,
                },
                tier,
                entry_price: None,
            })
        } else {
            let position = self
                .call(broker.get_position(&signal.symbol))
                .await
                .map_err(|e| e.to_string())?;
            let quantity = position.quantity.max(Decimal::ZERO);

            Ok(Sizing {
                broker,
                ctx: TradeContext {
                    quantity,
                    notional: quantity * price,
                    available_capital: Decimal::ZERO,
                    market_price,
                    position_quantity: position.quantity,
                },
                // Exits never consume advanced capital and stay allowed after a relock.
                tier: ExecutionTier::Conservative,
                entry_price: Some(position.average_price),
            })
        }
    }

    /// Broker call under the hard timeout.
    pub(crate) async fn call<T, F>(&self, fut: F) -> std::result::Result<T, BrokerError>
    where
        F: Future<Output = std::result::Result<T, BrokerError>>,
    {
        let started = Instant::now();
        let result = match tokio::time::timeout(self.policy.broker_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(BrokerError::timeout(format!(
                "no response within {:?}",
                self.policy.broker_timeout
            ))),
        };
        self.metrics.observe_broker_call(started.elapsed());
        result
    }

    /// Submit with bounded retries. Each attempt runs under a mode permit.
    async fn dispatch(&self, order: Order, broker: Arc<dyn BrokerApi>) -> ExecutionOutcome {
        let key = order.signal_ref.clone();
        match self.audit.has_risk_approval(key.as_str()).await {
            Ok(true) => {}
            Ok(false) => {
                let reason = format!("order {} has no recorded risk approval", order.id);
                error!(order_id = %order.id, key = %key, "Submission without risk approval blocked");
                if let Err(e) = self.mode.enter_safe_mode(&reason).await {
                    error!(error = %e, "Failed to enter safe mode");
                }
                let order = self.finish(order, OrderStatus::Failed, reason.clone()).await;
                return ExecutionOutcome::Failed { order, reason };
            }
            Err(e) => {
                let reason = format!("audit log unavailable: {}", e);
                let order = self.finish(order, OrderStatus::Failed, reason.clone()).await;
                return ExecutionOutcome::Failed { order, reason };
            }
        }

        let max_attempts = self.policy.max_attempts;
        let mut last_error: Option<BrokerError> = None;
        let mut all_timeouts = true;

        for attempt in 1..=max_attempts {
            let permit = match self.mode.gate(order.trading_mode, order.tier).await {
                GateDecision::Open(permit) => permit,
                GateDecision::Closed(denial) => {
                    warn!(order_id = %order.id, reason = %denial, "Mode gate closed before submission");
                    ExecutionMetrics::inc(&self.metrics.gate_denials);
                    let entry = AuditEntry::builder(AuditAction::ModeGate, format!("order/{}", order.id))
                        .key(key.as_str())
                        .inputs(json!({ "declared_mode": order.trading_mode, "declared_tier": order.tier }))
                        .decision(Decision::Denied)
                        .reason(denial.code())
                        .build();
                    if let Err(e) = self.audit.record(entry).await {
                        error!(error = %e, order_id = %order.id, "Failed to audit gate denial");
                    }
                    let order = self
                        .finish(order, OrderStatus::Cancelled, format!("mode_gate: {}", denial))
                        .await;
                    return ExecutionOutcome::Denied {
                        stage: DenialStage::Mode,
                        code: denial.code().to_string(),
                        reason: denial.to_string(),
                        order: Some(order),
                    };
                }
            };

            debug!(order_id = %order.id, attempt, epoch = permit.state().epoch, "Submitting order");
            let result = self.call(broker.place_order(&order)).await;
            drop(permit);

            match result {
                Ok(broker_order_id) => {
                    return self.on_submitted(order, &broker, broker_order_id, attempt).await;
                }
                Err(e) if !e.is_retryable() => {
                    warn!(order_id = %order.id, error = %e, "Broker rejected order");
                    let reason = e.to_string();
                    let order = self.finish(order, OrderStatus::Rejected, reason.clone()).await;
                    return ExecutionOutcome::Rejected { order, reason };
                }
                Err(e) => {
                    all_timeouts &= e.is_timeout();
                    warn!(
                        order_id = %order.id,
                        attempt,
                        max_attempts,
                        error = %e,
                        "Broker submission failed"
                    );
                    last_error = Some(e);
                    if attempt < max_attempts {
                        tokio::time::sleep(self.policy.backoff(attempt)).await;
                    }
                }
            }
        }

        // A timed-out submission may still have landed.
        if let Ok(state) = self.call(broker.order_status(order.id)).await {
            if matches!(state.status, BrokerOrderStatus::Open | BrokerOrderStatus::Filled) {
                info!(order_id = %order.id, "Broker holds order after failed attempts, treating as submitted");
                let broker_order_id = state.broker_order_id.clone();
                return self
                    .on_submitted(order, &broker, broker_order_id, max_attempts)
                    .await;
            }
        }

        let reason = if all_timeouts {
            BROKER_TIMEOUT_EXHAUSTED.to_string()
        } else {
            format!(
                "BrokerRetriesExhausted: {}",
                last_error.map(|e| e.to_string()).unwrap_or_default()
            )
        };
        error!(order_id = %order.id, reason = %reason, "Order failed after retries");
        let order = self.finish(order, OrderStatus::Failed, reason.clone()).await;
        ExecutionOutcome::Failed { order, reason }
    }

    async fn on_submitted(
        &self,
        mut order: Order,
        broker: &Arc<dyn BrokerApi>,
        broker_order_id: BrokerOrderId,
        attempt: u32,
    ) -> ExecutionOutcome {
        order.broker_order_id = Some(broker_order_id.0.clone());
        order.transition(OrderStatus::Submitted, None);
        self.persist(&order).await;
        ExecutionMetrics::inc(&self.metrics.orders_submitted);

        let entry = AuditEntry::builder(AuditAction::OrderSubmit, format!("order/{}", order.id))
            .key(order.signal_ref.as_str())
            .inputs(json!({
                "broker": broker.id(),
                "venue": broker.venue(),
                "broker_order_id": broker_order_id,
                "symbol": order.symbol,
                "side": order.side,
                "quantity": order.quantity,
                "trading_mode": order.trading_mode,
                "tier": order.tier,
                "attempt": attempt,
            }))
            .decision(Decision::Submitted)
            .build();
        if let Err(e) = self.audit.record(entry).await {
            error!(error = %e, order_id = %order.id, "Failed to audit submission");
        }

        info!(
            order_id = %order.id,
            broker = %broker.id(),
            broker_order_id = %broker_order_id,
            symbol = %order.symbol,
            quantity = %order.quantity,
            trading_mode = %order.trading_mode,
            "Order submitted"
        );
        self.notifier.notify(
            EventType::OrderSubmitted,
            json!({
                "order_id": order.id,
                "symbol": order.symbol,
                "side": order.side,
                "quantity": order.quantity,
                "trading_mode": order.trading_mode,
            }),
        );

        let order = match self.call(broker.order_status(order.id)).await {
            Ok(state) => self.apply_broker_state(order, state).await,
            Err(e) => {
                debug!(order_id = %order.id, error = %e, "Status unavailable after submit, poller will follow up");
                order
            }
        };

        match order.status {
            OrderStatus::Rejected | OrderStatus::Cancelled => ExecutionOutcome::Rejected {
                reason: order.terminal_reason.clone().unwrap_or_default(),
                order,
            },
            _ => ExecutionOutcome::Executed { order },
        }
    }

    /// Apply a broker-authoritative status to a submitted order.
    pub(crate) async fn apply_broker_state(&self, order: Order, state: BrokerOrderState) -> Order {
        match state.status {
            BrokerOrderStatus::Open => order,
            BrokerOrderStatus::Filled => self.on_filled(order, &state).await,
            BrokerOrderStatus::Cancelled => {
                self.finish(order, OrderStatus::Cancelled, "cancelled by broker".to_string())
                    .await
            }
            BrokerOrderStatus::Rejected => {
                self.finish(order, OrderStatus::Rejected, "rejected by broker".to_string())
                    .await
            }
        }
    }

    async fn on_filled(&self, mut order: Order, state: &BrokerOrderState) -> Order {
        let price = state.average_fill_price.unwrap_or(order.reference_price);
        if !order.transition(OrderStatus::Filled, None) {
            return order;
        }
        order.fill_price = Some(price);
        if order.broker_order_id.is_none() {
            order.broker_order_id = Some(state.broker_order_id.0.clone());
        }
        self.persist(&order).await;
        self.risk.observe_price(&order.symbol, price);

        let mut realized_pnl = None;
        if order.action.is_entry() {
            self.risk.confirm_entry(order.id).await;
        } else {
            let basis = order.entry_price.unwrap_or(price);
            let fees = price * order.quantity * self.risk.limits().fee_rate;
            let pnl = (price - basis) * order.quantity - fees;
            let record = self.risk.record_exit(&order.symbol, pnl).await;
            let advanced_share = record.advanced_share();
            if advanced_share > Decimal::ZERO {
                self.scaler.record_advanced_trade(pnl * advanced_share).await;
            }
            if let Some(breach) = record.breach {
                warn!(breach = ?breach, symbol = %order.symbol, "Exit realized a risk breach");
            }
            realized_pnl = Some(pnl);
        }

        ExecutionMetrics::inc(&self.metrics.orders_filled);
        self.record_terminal(&order).await;
        info!(
            order_id = %order.id,
            symbol = %order.symbol,
            price = %price,
            realized_pnl = ?realized_pnl.and_then(|p| p.to_f64()),
            "Order filled"
        );
        self.notifier.notify(
            EventType::OrderFilled,
            json!({
                "order_id": order.id,
                "symbol": order.symbol,
                "side": order.side,
                "quantity": order.quantity,
                "fill_price": price,
                "realized_pnl": realized_pnl,
            }),
        );
        order
    }

    /// Move an order to a non-fill terminal status, release its reservation,
    /// and record the single terminal audit entry.
    pub(crate) async fn finish(&self, mut order: Order, status: OrderStatus, reason: String) -> Order {
        if !order.transition(status, Some(reason.clone())) {
            warn!(order_id = %order.id, from = %order.status, to = %status, "Ignoring invalid order transition");
            return order;
        }
        self.persist(&order).await;
        self.risk.release(order.id).await;
        self.record_terminal(&order).await;

        let (counter, event) = match status {
            OrderStatus::Rejected => (&self.metrics.orders_rejected, EventType::OrderRejected),
            OrderStatus::Cancelled => (&self.metrics.orders_cancelled, EventType::OrderCancelled),
            _ => (&self.metrics.orders_failed, EventType::OrderFailed),
        };
        ExecutionMetrics::inc(counter);
        self.notifier.notify(
            event,
            json!({
                "order_id": order.id,
                "symbol": order.symbol,
                "status": order.status,
                "reason": reason,
            }),
        );
        order
    }

    async fn record_terminal(&self, order: &Order) {
        let decision = match order.status {
            OrderStatus::Filled => Decision::Filled,
            OrderStatus::Rejected => Decision::Rejected,
            OrderStatus::Cancelled => Decision::Cancelled,
            _ => Decision::Failed,
        };
        let mut entry = AuditEntry::builder(AuditAction::OrderTerminal, format!("order/{}", order.id))
            .key(order.signal_ref.as_str())
            .inputs(serde_json::to_value(order).unwrap_or_default())
            .decision(decision);
        if let Some(reason) = &order.terminal_reason {
            entry = entry.reason(reason.clone());
        }
        if let Err(e) = self.audit.record(entry.build()).await {
            error!(error = %e, order_id = %order.id, "Failed to audit terminal order state");
        }
    }

    async fn persist(&self, order: &Order) {
        if let Err(e) = self.orders.upsert(order).await {
            error!(error = %e, order_id = %order.id, "Failed to persist order");
        }
    }

    /// Cancel an open order. If the broker filled it first, the fill stands
    /// and the cancel is refused.
    pub async fn cancel(&self, actor: &str, order_id: Uuid) -> Result<Order> {
        let order = self
            .orders
            .get(order_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("order {}", order_id)))?;

        let lock = self.key_lock(&order.signal_ref);
        let guard = lock.lock().await;
        let result = self.cancel_locked(actor, order_id).await;
        drop(guard);
        self.release_key_lock(&order.signal_ref, &lock);
        result
    }

    async fn cancel_locked(&self, actor: &str, order_id: Uuid) -> Result<Order> {
        let order = self
            .orders
            .get(order_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("order {}", order_id)))?;
        let resource = format!("order/{}", order.id);
        let key = order.signal_ref.to_string();
        let audit_cancel = |decision: Decision, reason: String| {
            AuditEntry::builder(AuditAction::OrderCancel, resource.clone())
                .actor(actor)
                .key(key.clone())
                .decision(decision)
                .reason(reason)
                .build()
        };

        if order.is_terminal() {
            self.audit
                .record(audit_cancel(Decision::Denied, format!("already {}", order.status)))
                .await?;
            return Err(Error::Conflict(format!("order is already {}", order.status)));
        }

        if order.status == OrderStatus::Pending {
            self.audit
                .record(audit_cancel(Decision::Succeeded, "not yet submitted".to_string()))
                .await?;
            return Ok(self
                .finish(order, OrderStatus::Cancelled, format!("cancelled by {}", actor))
                .await);
        }

        let broker = self.brokers.for_order(&order)?;
        match self.call(broker.cancel_order(order.id)).await {
            Ok(CancelOutcome::Cancelled) | Ok(CancelOutcome::NotFound) => {
                self.audit
                    .record(audit_cancel(Decision::Succeeded, "broker confirmed".to_string()))
                    .await?;
                Ok(self
                    .finish(order, OrderStatus::Cancelled, format!("cancelled by {}", actor))
                    .await)
            }
            Ok(CancelOutcome::AlreadyFilled { fill_price }) => {
                let entry = audit_cancel(Decision::Denied, "already_filled".to_string());
                let state = match self.call(broker.order_status(order.id)).await {
                    Ok(state) if state.status == BrokerOrderStatus::Filled => state,
                    _ => BrokerOrderState {
                        broker_order_id: BrokerOrderId(order.broker_order_id.clone().unwrap_or_default()),
                        status: BrokerOrderStatus::Filled,
                        filled_quantity: order.quantity,
                        average_fill_price: fill_price,
                        updated_at: Utc::now(),
                    },
                };
                let filled = self.on_filled(order, &state).await;
                self.audit.record(entry).await?;
                warn!(order_id = %filled.id, actor = %actor, "Cancel lost to fill");
                Err(Error::Conflict(format!("order {} filled before cancel", filled.id)))
            }
            Err(e) => {
                self.audit
                    .record(audit_cancel(Decision::Failed, e.to_string()))
                    .await?;
                Err(Error::Broker(e))
            }
        }
    }

    /// Poll Submitted orders and apply broker-authoritative transitions.
    /// Runs while paused. Returns the number of orders that changed.
    pub async fn poll_open_orders(&self) -> Result<usize> {
        let open = self.orders.load_open().await?;
        let mut changed = 0;

        for order in open.into_iter().filter(|o| o.status == OrderStatus::Submitted) {
            let key = order.signal_ref.clone();
            let lock = self.key_lock(&key);
            // A pipeline or cancel holding the key is already handling it.
            let Ok(guard) = lock.try_lock() else {
                continue;
            };

            match self.brokers.for_order(&order) {
                Ok(broker) => match self.call(broker.order_status(order.id)).await {
                    Ok(state) => {
                        let before = order.status;
                        let updated = self.apply_broker_state(order, state).await;
                        if updated.status != before {
                            changed += 1;
                        }
                    }
                    Err(e) => {
                        warn!(order_id = %order.id, error = %e, "Order status poll failed");
                    }
                },
                Err(e) => {
                    error!(order_id = %order.id, error = %e, "No broker for open order");
                }
            }

            drop(guard);
            self.release_key_lock(&key, &lock);
        }

        if changed > 0 {
            debug!(changed, "Order poll applied transitions");
        }
        Ok(changed)
    }

    /// Audit entry with the system actor, used by startup and schedule tasks.
    pub(crate) async fn audit_system(
        &self,
        action: AuditAction,
        resource: &str,
        inputs: serde_json::Value,
        decision: Decision,
    ) -> Result<()> {
        self.audit
            .record(
                AuditEntry::builder(action, resource)
                    .actor(SYSTEM_ACTOR)
                    .inputs(inputs)
                    .decision(decision)
                    .build(),
            )
            .await?;
        Ok(())
    }

    pub(crate) fn notifier(&self) -> &NotificationHub {
        &self.notifier
    }
}
