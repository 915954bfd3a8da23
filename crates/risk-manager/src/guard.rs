//! Risk guard: single-writer owner of the risk ledger.
//!
//! All mutation of [`RiskState`] goes through one `Mutex`. Evaluation and
//! reservation happen under the same lock, so two concurrent signals can never
//! both pass a limit that only one of them fits under.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use signal_core::config::RiskConfig;
use signal_core::db::{keys, load_snapshot, save_snapshot, StateStore};
use signal_core::types::{ExecutionTier, Holding, ModeState, RiskState, Signal};
use signal_core::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::evaluation::{evaluate, required_cash, RiskDecision, RiskLimits, TradeContext};

/// Threshold crossed by a realized result. Entries are denied until it clears.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Breach {
    DailyLossLimit,
    MaxDrawdown,
    ConsecutiveLosses,
}

/// What a filled exit released from the ledger.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExitRecord {
    pub breach: Option<Breach>,
    pub released_exposure_pct: Decimal,
    /// Portion of the released exposure opened by the advanced tier.
    pub advanced_exposure_pct: Decimal,
}

impl ExitRecord {
    /// Share of the exit attributable to the advanced tier, 0 to 1.
    pub fn advanced_share(&self) -> Decimal {
        if self.released_exposure_pct.is_zero() {
            Decimal::ZERO
        } else {
            self.advanced_exposure_pct / self.released_exposure_pct
        }
    }
}

/// Provisional hold against risk capacity pending order outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    /// Same as the id of the order the reservation backs.
    pub id: Uuid,
    pub symbol: String,
    pub exposure_pct: Decimal,
    /// Notional plus fees held against broker cash until the entry settles.
    #[serde(default)]
    pub cash: Decimal,
    pub tier: ExecutionTier,
    pub created_at: DateTime<Utc>,
}

/// Result of [`RiskGuard::evaluate_and_reserve`].
#[derive(Debug, Clone)]
pub struct EvaluationOutcome {
    pub decision: RiskDecision,
    /// Present for approved entries.
    pub reservation: Option<Reservation>,
    /// Ledger as evaluated (before reservation).
    pub state: RiskState,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ObservedPrice {
    pub price: Decimal,
    pub observed_at: DateTime<Utc>,
}

/// Persisted form of the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LedgerSnapshot {
    state: RiskState,
    #[serde(default)]
    reservations: Vec<Reservation>,
}

struct Ledger {
    state: RiskState,
    reservations: HashMap<Uuid, Reservation>,
}

impl Ledger {
    fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            state: self.state.clone(),
            reservations: self.reservations.values().cloned().collect(),
        }
    }
}

/// Broker-local trading day for `now` given a fixed UTC offset.
pub fn trading_day(now: DateTime<Utc>, utc_offset_hours: i32) -> NaiveDate {
    (now + Duration::hours(utc_offset_hours as i64)).date_naive()
}

pub struct RiskGuard {
    config: RiskConfig,
    limits: RiskLimits,
    ledger: Mutex<Ledger>,
    prices: DashMap<String, ObservedPrice>,
    store: Option<Arc<dyn StateStore>>,
}

impl RiskGuard {
    /// Create a guard without persistence.
    pub fn new(config: RiskConfig) -> Self {
        let state = RiskState::new(
            config.starting_capital,
            trading_day(Utc::now(), config.trading_day_utc_offset_hours),
        );
        Self {
            limits: RiskLimits::from(&config),
            config,
            ledger: Mutex::new(Ledger {
                state,
                reservations: HashMap::new(),
            }),
            prices: DashMap::new(),
            store: None,
        }
    }

    /// Create a guard that snapshots the ledger after every mutation.
    pub fn with_store(config: RiskConfig, store: Arc<dyn StateStore>) -> Self {
        let mut guard = Self::new(config);
        guard.store = Some(store);
        guard
    }

    /// Restore the ledger from the store. Returns true if a snapshot existed.
    pub async fn load_state(&self) -> Result<bool> {
        let Some(store) = &self.store else {
            warn!("Cannot load risk state: no state store configured");
            return Ok(false);
        };

        let Some(snapshot) = load_snapshot::<LedgerSnapshot>(store.as_ref(), keys::RISK_STATE).await?
        else {
            return Ok(false);
        };

        {
            let mut ledger = self.ledger.lock().await;
            ledger.state = snapshot.state;
            ledger.reservations = snapshot
                .reservations
                .into_iter()
                .map(|r| (r.id, r))
                .collect();

            info!(
                daily_pnl = %ledger.state.daily_pnl,
                open_exposure_pct = %ledger.state.open_exposure_pct,
                reservations = ledger.reservations.len(),
                "Loaded risk state"
            );
        }

        self.roll_day_if_due(Utc::now()).await;
        Ok(true)
    }

    pub fn limits(&self) -> &RiskLimits {
        &self.limits
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    pub async fn snapshot(&self) -> RiskState {
        self.ledger.lock().await.state.clone()
    }

    pub async fn reservations(&self) -> Vec<Reservation> {
        self.ledger.lock().await.reservations.values().cloned().collect()
    }

    /// Record the latest market price for a symbol.
    pub fn observe_price(&self, symbol: &str, price: Decimal) {
        if price <= Decimal::ZERO {
            return;
        }
        self.prices.insert(
            symbol.to_string(),
            ObservedPrice {
                price,
                observed_at: Utc::now(),
            },
        );
    }

    pub fn latest_price(&self, symbol: &str) -> Option<Decimal> {
        self.prices.get(symbol).map(|p| p.price)
    }

    pub fn prices(&self) -> HashMap<String, ObservedPrice> {
        self.prices
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }

    /// Evaluate a signal and, for approved entries, reserve its exposure
    /// under `reservation_id` in the same critical section.
    pub async fn evaluate_and_reserve(
        &self,
        reservation_id: Uuid,
        signal: &Signal,
        mode: &ModeState,
        ctx: &TradeContext,
    ) -> EvaluationOutcome {
        if ctx.market_price.is_none() {
            warn!(symbol = %signal.symbol, "No observed market price, slippage guard skipped");
        }

        let mut ledger = self.ledger.lock().await;
        let evaluated = ledger.state.clone();
        let decision = evaluate(signal, &evaluated, mode, ctx, &self.limits);

        let reservation = match (&decision, signal.action.is_entry()) {
            (RiskDecision::Approve, true) => {
                // evaluate() denies when equity is non-positive, so this is defined.
                let exposure_pct = evaluated.exposure_pct_of(ctx.notional).unwrap_or_default();
                let tier = mode.effective_tier(Utc::now());
                let cash = required_cash(ctx.notional, &self.limits);
                let reservation = Reservation {
                    id: reservation_id,
                    symbol: signal.symbol.clone(),
                    exposure_pct,
                    cash,
                    tier,
                    created_at: Utc::now(),
                };

                ledger.state.open_exposure_pct += exposure_pct;
                ledger.state.reserved_cash += cash;
                if tier == ExecutionTier::Advanced {
                    ledger.state.advanced_exposure_pct += exposure_pct;
                }
                ledger.reservations.insert(reservation_id, reservation.clone());

                debug!(
                    reservation_id = %reservation_id,
                    exposure_pct = %exposure_pct,
                    cash = %cash,
                    open_exposure_pct = %ledger.state.open_exposure_pct,
                    reserved_cash = %ledger.state.reserved_cash,
                    "Exposure reserved"
                );
                self.persist(&ledger).await;
                Some(reservation)
            }
            _ => None,
        };

        if let RiskDecision::Deny(reason) = &decision {
            warn!(symbol = %signal.symbol, action = %signal.action, reason = %reason, "Risk guard denied signal");
        }

        EvaluationOutcome {
            decision,
            reservation,
            state: evaluated,
        }
    }

    /// Return a reservation's exposure to the pool (order failed, rejected,
    /// or cancelled). Idempotent.
    pub async fn release(&self, reservation_id: Uuid) -> bool {
        let mut ledger = self.ledger.lock().await;
        let Some(reservation) = ledger.reservations.remove(&reservation_id) else {
            return false;
        };

        let state = &mut ledger.state;
        state.open_exposure_pct = (state.open_exposure_pct - reservation.exposure_pct).max(Decimal::ZERO);
        state.reserved_cash = (state.reserved_cash - reservation.cash).max(Decimal::ZERO);
        if reservation.tier == ExecutionTier::Advanced {
            state.advanced_exposure_pct =
                (state.advanced_exposure_pct - reservation.exposure_pct).max(Decimal::ZERO);
        }

        info!(
            reservation_id = %reservation_id,
            exposure_pct = %reservation.exposure_pct,
            open_exposure_pct = %state.open_exposure_pct,
            "Reservation released"
        );
        self.persist(&ledger).await;
        true
    }

    /// Convert a reservation into held exposure after its entry filled.
    pub async fn confirm_entry(&self, reservation_id: Uuid) -> bool {
        let mut ledger = self.ledger.lock().await;
        let Some(reservation) = ledger.reservations.remove(&reservation_id) else {
            return false;
        };

        // The broker's cash figure now reflects the fill.
        ledger.state.reserved_cash = (ledger.state.reserved_cash - reservation.cash).max(Decimal::ZERO);

        let advanced = if reservation.tier == ExecutionTier::Advanced {
            reservation.exposure_pct
        } else {
            Decimal::ZERO
        };
        let holding = ledger
            .state
            .holdings
            .entry(reservation.symbol.clone())
            .or_insert(Holding {
                exposure_pct: Decimal::ZERO,
                advanced_exposure_pct: Decimal::ZERO,
            });
        holding.exposure_pct += reservation.exposure_pct;
        holding.advanced_exposure_pct += advanced;

        self.persist(&ledger).await;
        true
    }

    /// Account for a filled exit: release the position's held exposure and
    /// book the realized P&L.
    pub async fn record_exit(&self, symbol: &str, realized_pnl: Decimal) -> ExitRecord {
        let mut ledger = self.ledger.lock().await;
        let mut record = ExitRecord::default();
        if let Some(holding) = ledger.state.holdings.remove(symbol) {
            let state = &mut ledger.state;
            state.open_exposure_pct = (state.open_exposure_pct - holding.exposure_pct).max(Decimal::ZERO);
            state.advanced_exposure_pct =
                (state.advanced_exposure_pct - holding.advanced_exposure_pct).max(Decimal::ZERO);
            record.released_exposure_pct = holding.exposure_pct;
            record.advanced_exposure_pct = holding.advanced_exposure_pct;
        }
        record.breach = self.apply_trade(&mut ledger.state, realized_pnl);
        self.persist(&ledger).await;
        record
    }

    /// Record a realized trade result and check thresholds.
    pub async fn record_trade(&self, pnl: Decimal) -> Option<Breach> {
        let mut ledger = self.ledger.lock().await;
        let breach = self.apply_trade(&mut ledger.state, pnl);
        self.persist(&ledger).await;
        breach
    }

    /// Update equity from an authoritative source (broker account value).
    pub async fn update_equity(&self, equity: Decimal) -> Option<Breach> {
        let mut ledger = self.ledger.lock().await;
        ledger.state.apply_equity(equity);
        let breach = self.check_thresholds(&ledger.state);
        if breach == Some(Breach::MaxDrawdown) {
            error!(
                drawdown_pct = %ledger.state.rolling_drawdown_pct,
                "Drawdown limit breached, entries denied"
            );
        }
        self.persist(&ledger).await;
        breach
    }

    /// Reset daily counters if the broker-local trading day changed.
    pub async fn roll_day_if_due(&self, now: DateTime<Utc>) -> bool {
        let today = trading_day(now, self.config.trading_day_utc_offset_hours);
        let mut ledger = self.ledger.lock().await;
        if ledger.state.trading_day >= today {
            return false;
        }

        info!(
            previous_day = %ledger.state.trading_day,
            today = %today,
            daily_pnl = %ledger.state.daily_pnl,
            "New trading day, resetting daily risk counters"
        );
        Self::reset_daily_counters(&mut ledger.state, now, today);
        self.persist(&ledger).await;
        true
    }

    /// Reset daily counters unconditionally.
    pub async fn reset_daily(&self) {
        let now = Utc::now();
        let today = trading_day(now, self.config.trading_day_utc_offset_hours);
        let mut ledger = self.ledger.lock().await;
        Self::reset_daily_counters(&mut ledger.state, now, today);
        self.persist(&ledger).await;
        info!("Risk guard daily reset");
    }

    fn reset_daily_counters(state: &mut RiskState, now: DateTime<Utc>, today: NaiveDate) {
        state.daily_pnl = Decimal::ZERO;
        state.consecutive_losses = 0;
        state.last_reset_at = now;
        state.trading_day = today;
    }

    fn apply_trade(&self, state: &mut RiskState, pnl: Decimal) -> Option<Breach> {
        state.daily_pnl += pnl;
        if pnl > Decimal::ZERO {
            state.consecutive_losses = 0;
        } else if pnl < Decimal::ZERO {
            state.consecutive_losses += 1;
        }
        let equity = state.current_equity + pnl;
        state.apply_equity(equity);

        let breach = self.check_thresholds(state);
        if let Some(breach) = breach {
            error!(
                breach = ?breach,
                daily_pnl = %state.daily_pnl,
                consecutive_losses = state.consecutive_losses,
                drawdown_pct = %state.rolling_drawdown_pct,
                "Risk threshold breached, new entries denied"
            );
        }
        breach
    }

    fn check_thresholds(&self, state: &RiskState) -> Option<Breach> {
        if state.daily_pnl < Decimal::ZERO && state.daily_pnl.abs() >= self.limits.daily_loss_limit {
            return Some(Breach::DailyLossLimit);
        }
        if state.consecutive_losses >= self.limits.max_consecutive_losses {
            return Some(Breach::ConsecutiveLosses);
        }
        if state.rolling_drawdown_pct >= self.limits.max_drawdown_pct {
            return Some(Breach::MaxDrawdown);
        }
        None
    }

    async fn persist(&self, ledger: &Ledger) {
        if let Some(store) = &self.store {
            if let Err(e) = save_snapshot(store.as_ref(), keys::RISK_STATE, &ledger.snapshot()).await {
                error!(error = %e, "Failed to persist risk state");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use signal_core::db::MemoryStateStore;
    use signal_core::types::{SignalAction, SignalSource};

    fn config() -> RiskConfig {
        RiskConfig {
            starting_capital: Decimal::from(10_000),
            ..Default::default()
        }
    }

    fn signal(action: SignalAction) -> Signal {
        Signal::new(
            SignalSource::Webhook,
            "AAPL",
            action,
            Decimal::from(100),
            Decimal::ONE,
            "Test",
            Utc::now(),
            serde_json::Value::Null,
            60,
        )
    }

    fn ctx(notional: i64) -> TradeContext {
        TradeContext {
            quantity: Decimal::ONE,
            notional: Decimal::from(notional),
            available_capital: Decimal::from(1_000_000),
            market_price: None,
            position_quantity: Decimal::ZERO,
        }
    }

    #[tokio::test]
    async fn test_daily_loss_breach() {
        let guard = RiskGuard::new(RiskConfig {
            daily_loss_limit: Decimal::new(100, 0),
            max_consecutive_losses: 100,
            ..config()
        });

        for _ in 0..9 {
            assert!(guard.record_trade(Decimal::new(-10, 0)).await.is_none());
        }

        let breach = guard.record_trade(Decimal::new(-10, 0)).await;
        assert_eq!(breach, Some(Breach::DailyLossLimit));

        let outcome = guard
            .evaluate_and_reserve(Uuid::new_v4(), &signal(SignalAction::Buy), &ModeState::default(), &ctx(100))
            .await;
        assert!(!outcome.decision.is_approved());
        assert!(outcome.reservation.is_none());
    }

    #[tokio::test]
    async fn test_consecutive_losses_breach() {
        let guard = RiskGuard::new(RiskConfig {
            max_consecutive_losses: 3,
            ..config()
        });

        assert!(guard.record_trade(Decimal::from(-1)).await.is_none());
        assert!(guard.record_trade(Decimal::from(-1)).await.is_none());
        assert_eq!(
            guard.record_trade(Decimal::from(-1)).await,
            Some(Breach::ConsecutiveLosses)
        );
    }

    #[tokio::test]
    async fn test_win_resets_consecutive_losses() {
        let guard = RiskGuard::new(config());

        guard.record_trade(Decimal::from(-5)).await;
        guard.record_trade(Decimal::from(-5)).await;
        assert_eq!(guard.snapshot().await.consecutive_losses, 2);

        guard.record_trade(Decimal::from(20)).await;
        let state = guard.snapshot().await;
        assert_eq!(state.consecutive_losses, 0);
        assert_eq!(state.daily_pnl, Decimal::from(10));
        assert_eq!(state.current_equity, Decimal::from(10_010));
    }

    #[tokio::test]
    async fn test_drawdown_breach() {
        let guard = RiskGuard::new(config());

        assert!(guard.update_equity(Decimal::from(11_000)).await.is_none());
        assert_eq!(
            guard.update_equity(Decimal::from(9_350)).await,
            Some(Breach::MaxDrawdown)
        );
        assert_eq!(guard.snapshot().await.rolling_drawdown_pct, Decimal::from(15));
    }

    #[tokio::test]
    async fn test_concurrent_reservations_never_exceed_limit() {
        // 5% per trade against a 25% ceiling: exactly five fit.
        let guard = Arc::new(RiskGuard::new(config()));
        let mut handles = Vec::new();
        for _ in 0..12 {
            let guard = guard.clone();
            handles.push(tokio::spawn(async move {
                guard
                    .evaluate_and_reserve(
                        Uuid::new_v4(),
                        &signal(SignalAction::Buy),
                        &ModeState::default(),
                        &ctx(500),
                    )
                    .await
            }));
        }

        let mut approved = 0;
        for handle in handles {
            if handle.await.unwrap().decision.is_approved() {
                approved += 1;
            }
        }

        assert_eq!(approved, 5);
        let state = guard.snapshot().await;
        assert_eq!(state.open_exposure_pct, Decimal::from(25));
        assert_eq!(guard.reservations().await.len(), 5);
    }

    #[tokio::test]
    async fn test_concurrent_entries_never_overdraw_cash() {
        // 500 of broker cash, 200 per entry: two fit even though exposure allows more.
        let guard = Arc::new(RiskGuard::new(config()));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let guard = guard.clone();
            handles.push(tokio::spawn(async move {
                let mut cash_ctx = ctx(200);
                cash_ctx.available_capital = Decimal::from(500);
                guard
                    .evaluate_and_reserve(
                        Uuid::new_v4(),
                        &signal(SignalAction::Buy),
                        &ModeState::default(),
                        &cash_ctx,
                    )
                    .await
            }));
        }

        let mut approved = Vec::new();
        for handle in handles {
            let outcome = handle.await.unwrap();
            if let Some(reservation) = outcome.reservation {
                approved.push(reservation);
            }
        }

        assert_eq!(approved.len(), 2);
        assert_eq!(guard.snapshot().await.reserved_cash, Decimal::from(400));

        assert!(guard.confirm_entry(approved[0].id).await);
        assert_eq!(guard.snapshot().await.reserved_cash, Decimal::from(200));
        assert!(guard.release(approved[1].id).await);
        assert_eq!(guard.snapshot().await.reserved_cash, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let guard = RiskGuard::new(config());
        let id = Uuid::new_v4();
        let outcome = guard
            .evaluate_and_reserve(id, &signal(SignalAction::Buy), &ModeState::default(), &ctx(300))
            .await;
        assert!(outcome.reservation.is_some());
        assert_eq!(guard.snapshot().await.open_exposure_pct, Decimal::from(3));

        assert!(guard.release(id).await);
        assert!(!guard.release(id).await);
        assert_eq!(guard.snapshot().await.open_exposure_pct, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_entry_then_exit_releases_holding() {
        let guard = RiskGuard::new(config());
        let id = Uuid::new_v4();
        guard
            .evaluate_and_reserve(id, &signal(SignalAction::Buy), &ModeState::default(), &ctx(400))
            .await;
        assert!(guard.confirm_entry(id).await);

        let state = guard.snapshot().await;
        assert_eq!(state.open_exposure_pct, Decimal::from(4));
        assert_eq!(state.holdings["AAPL"].exposure_pct, Decimal::from(4));

        let record = guard.record_exit("AAPL", Decimal::from(-25)).await;
        assert_eq!(record.released_exposure_pct, Decimal::from(4));
        assert_eq!(record.advanced_share(), Decimal::ZERO);
        let state = guard.snapshot().await;
        assert_eq!(state.open_exposure_pct, Decimal::ZERO);
        assert!(state.holdings.is_empty());
        assert_eq!(state.daily_pnl, Decimal::from(-25));
        assert_eq!(state.consecutive_losses, 1);
    }

    #[tokio::test]
    async fn test_exit_signal_does_not_reserve() {
        let guard = RiskGuard::new(config());
        let mut exit_ctx = ctx(100);
        exit_ctx.position_quantity = Decimal::ONE;
        let outcome = guard
            .evaluate_and_reserve(Uuid::new_v4(), &signal(SignalAction::Close), &ModeState::default(), &exit_ctx)
            .await;
        assert!(outcome.decision.is_approved());
        assert!(outcome.reservation.is_none());
        assert_eq!(guard.snapshot().await.open_exposure_pct, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_day_roll_resets_counters() {
        let guard = RiskGuard::new(config());
        guard.record_trade(Decimal::from(-40)).await;

        assert!(!guard.roll_day_if_due(Utc::now()).await);
        assert!(guard.roll_day_if_due(Utc::now() + Duration::days(1)).await);

        let state = guard.snapshot().await;
        assert_eq!(state.daily_pnl, Decimal::ZERO);
        assert_eq!(state.consecutive_losses, 0);
        // Equity and drawdown carry over.
        assert_eq!(state.current_equity, Decimal::from(9_960));
    }

    #[tokio::test]
    async fn test_state_survives_restart() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let id = Uuid::new_v4();
        {
            let guard = RiskGuard::with_store(config(), store.clone());
            guard.record_trade(Decimal::from(-30)).await;
            guard
                .evaluate_and_reserve(id, &signal(SignalAction::Buy), &ModeState::default(), &ctx(200))
                .await;
        }

        let restarted = RiskGuard::with_store(config(), store);
        assert!(tokio_test::assert_ok!(restarted.load_state().await));
        let state = restarted.snapshot().await;
        assert_eq!(state.daily_pnl, Decimal::from(-30));
        assert_eq!(restarted.reservations().await.len(), 1);
        assert!(restarted.release(id).await);
    }

    #[test]
    fn test_trading_day_offset() {
        let late_utc = DateTime::parse_from_rfc3339("2026-03-03T03:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(
            trading_day(late_utc, -5),
            NaiveDate::from_ymd_opt(2026, 3, 2).unwrap()
        );
        assert_eq!(
            trading_day(late_utc, 0),
            NaiveDate::from_ymd_opt(2026, 3, 3).unwrap()
        );
    }

    #[test]
    fn test_price_book() {
        let guard = RiskGuard::new(config());
        assert!(guard.latest_price("AAPL").is_none());
        guard.observe_price("AAPL", Decimal::new(15050, 2));
        guard.observe_price("AAPL", Decimal::ZERO);
        assert_eq!(guard.latest_price("AAPL"), Some(Decimal::new(15050, 2)));
    }
}
