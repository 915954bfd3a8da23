//! Integration tests for component interactions.
//!
//! These tests drive signals through ingestion, the Risk Guard, the mode gate
//! and the broker registry together, with in-memory stores and scripted
//! brokers.

use async_trait::async_trait;
use auth::{
    hash_phrase, AuditAction, AuditFilter, AuditLogger, Decision, SecondFactor, UnlockCredential,
};
use chrono::Utc;
use risk_manager::{CapitalScaler, RiskGuard};
use rust_decimal::Decimal;
use serde_json::json;
use signal_core::config::Config;
use signal_core::db::MemoryOrderStore;
use signal_core::notify::{BroadcastSink, EventType, NotificationHub};
use signal_core::types::{
    BrokerOrderId, BrokerOrderState, BrokerVenue, CancelOutcome, ExecutionTier, Order,
    OrderStatus, Position, Signal, SignalAction, SignalSource, TradingMode,
};
use signal_core::{BrokerError, Error};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use trading_engine::{
    BrokerApi, BrokerRegistry, ExecutionCoordinator, ExecutionOutcome, ExecutionServices,
    ModeController, PaperBroker, Rejection, RetryPolicy, SignalIngestor,
    BROKER_TIMEOUT_EXHAUSTED,
};
use uuid::Uuid;

const PHRASE: &str = "open the advanced tier";

struct Gate {
    config: Config,
    coordinator: Arc<ExecutionCoordinator>,
    ingestor: SignalIngestor,
    audit: AuditLogger,
    risk: Arc<RiskGuard>,
    mode: Arc<ModeController>,
    events: Arc<BroadcastSink>,
    totp: SecondFactor,
}

impl Gate {
    fn new(brokers: BrokerRegistry) -> Self {
        let config = Config::test_config();
        let totp_secret = auth::totp::generate_secret();
        let audit = AuditLogger::in_memory();
        let events = Arc::new(BroadcastSink::new(256));
        let notifier = NotificationHub::spawn(256, vec![events.clone()]);
        let risk = Arc::new(RiskGuard::new(config.risk.clone()));
        let scaler = Arc::new(CapitalScaler::new(config.capital_schedule.clone()));
        let credential =
            UnlockCredential::new(&hash_phrase(PHRASE).unwrap(), &totp_secret).unwrap();
        let mode = Arc::new(ModeController::new(
            &config.mode,
            credential,
            scaler.clone(),
            audit.clone(),
            notifier.clone(),
        ));

        let coordinator = ExecutionCoordinator::new(
            &config,
            ExecutionServices {
                risk: risk.clone(),
                scaler,
                mode: mode.clone(),
                brokers: Arc::new(brokers),
                orders: Arc::new(MemoryOrderStore::new()),
                audit: audit.clone(),
                notifier: notifier.clone(),
            },
        )
        .with_retry_policy(RetryPolicy {
            max_attempts: 3,
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            broker_timeout: Duration::from_millis(500),
        });

        Self {
            ingestor: SignalIngestor::new(&config.webhook, audit.clone(), notifier),
            config,
            coordinator: Arc::new(coordinator),
            audit,
            risk,
            mode,
            events,
            totp: SecondFactor::new(&totp_secret).unwrap(),
        }
    }

    fn paper() -> Self {
        Self::new(BrokerRegistry::new(Arc::new(paper_broker())).unwrap())
    }

    fn totp_code(&self) -> String {
        self.totp
            .generate_at(Utc::now().timestamp() as u64)
            .unwrap()
    }

    async fn count(&self, filter: AuditFilter) -> u64 {
        self.audit.count(&filter).await.unwrap()
    }
}

fn paper_broker() -> PaperBroker {
    PaperBroker::new(Decimal::from(10_000), Decimal::ZERO)
}

fn buy(symbol: &str, strategy: &str) -> Signal {
    Signal::new(
        SignalSource::Webhook,
        symbol,
        SignalAction::Buy,
        Decimal::new(15050, 2),
        Decimal::ONE,
        strategy,
        Utc::now(),
        serde_json::Value::Null,
        60,
    )
}

/// Scripted adapter: counts submissions, optionally delays or times out.
/// Accepted orders are debited from its cash immediately.
struct ScriptedBroker {
    id: String,
    venue: BrokerVenue,
    delay: Duration,
    time_out: bool,
    placed: AtomicUsize,
    cash: Mutex<Decimal>,
}

impl ScriptedBroker {
    fn new(id: &str, venue: BrokerVenue) -> Self {
        Self {
            id: id.to_string(),
            venue,
            delay: Duration::ZERO,
            time_out: false,
            placed: AtomicUsize::new(0),
            cash: Mutex::new(Decimal::from(10_000)),
        }
    }

    fn with_cash(mut self, cash: Decimal) -> Self {
        self.cash = Mutex::new(cash);
        self
    }

    fn placed(&self) -> usize {
        self.placed.load(Ordering::SeqCst)
    }

    fn cash(&self) -> Decimal {
        *self.cash.lock().unwrap()
    }
}

#[async_trait]
impl BrokerApi for ScriptedBroker {
    fn id(&self) -> &str {
        &self.id
    }

    fn venue(&self) -> BrokerVenue {
        self.venue
    }

    async fn place_order(&self, order: &Order) -> Result<BrokerOrderId, BrokerError> {
        self.placed.fetch_add(1, Ordering::SeqCst);
        if self.time_out {
            return Err(BrokerError::timeout("simulated"));
        }
        tokio::time::sleep(self.delay).await;
        *self.cash.lock().unwrap() -= order.quantity * order.reference_price;
        Ok(BrokerOrderId(format!("{}-{}", self.id, order.id)))
    }

    async fn cancel_order(&self, _client_order_id: Uuid) -> Result<CancelOutcome, BrokerError> {
        Err(BrokerError::unavailable("scripted"))
    }

    async fn order_status(&self, _client_order_id: Uuid) -> Result<BrokerOrderState, BrokerError> {
        if self.time_out {
            return Err(BrokerError::timeout("simulated"));
        }
        Err(BrokerError::unavailable("status not scripted"))
    }

    async fn get_position(&self, symbol: &str) -> Result<Position, BrokerError> {
        Ok(Position {
            symbol: symbol.to_string(),
            quantity: Decimal::ZERO,
            average_price: Decimal::ZERO,
        })
    }

    async fn get_available_capital(&self) -> Result<Decimal, BrokerError> {
        Ok(self.cash())
    }
}

/// Identical signals delivered concurrently produce exactly one order.
#[tokio::test]
async fn test_concurrent_redelivery_is_idempotent() {
    let gate = Gate::paper();
    let signal = buy("AAPL", "Test");

    let runs = (0..16).map(|_| {
        let coordinator = gate.coordinator.clone();
        let signal = signal.clone();
        async move { coordinator.execute(signal).await }
    });
    let outcomes = futures_util::future::join_all(runs).await;

    let executed = outcomes
        .iter()
        .filter(|o| matches!(o, Ok(ExecutionOutcome::Executed { .. })))
        .count();
    let duplicates = outcomes
        .iter()
        .filter(|o| matches!(o, Ok(ExecutionOutcome::Duplicate { .. })))
        .count();

    assert_eq!(executed, 1);
    assert_eq!(duplicates, 15);
    assert_eq!(
        gate.coordinator.orders().list(None, 100).await.unwrap().len(),
        1
    );
}

/// Paper orders never reach a live adapter, even when one is registered.
#[tokio::test]
async fn test_paper_orders_never_reach_live_adapter() {
    let live = Arc::new(ScriptedBroker::new("live-broker", BrokerVenue::Live));
    let mut registry = BrokerRegistry::new(Arc::new(paper_broker())).unwrap();
    registry.register_live(live.clone()).unwrap();
    let gate = Gate::new(registry);

    for symbol in ["AAPL", "MSFT", "NVDA"] {
        let outcome = gate.coordinator.execute(buy(symbol, "Test")).await.unwrap();
        let order = outcome.order().unwrap();
        assert_eq!(order.trading_mode, TradingMode::Paper);
        assert_eq!(order.broker_id, PaperBroker::ID);
    }
    assert_eq!(live.placed(), 0);

    let token = gate.config.mode.live_confirmation_token.clone();
    gate.mode.switch_live("admin", &token).await.unwrap();
    let outcome = gate.coordinator.execute(buy("AMZN", "Test")).await.unwrap();
    assert_eq!(outcome.order().unwrap().trading_mode, TradingMode::Live);
    assert_eq!(live.placed(), 1);
}

/// Concurrent approvals never jointly exceed the open-exposure limit.
#[tokio::test]
async fn test_concurrent_entries_respect_open_exposure() {
    let gate = Gate::paper();
    let max_open = gate.risk.limits().max_open_exposure_pct;

    let runs = (0..30).map(|i| {
        let coordinator = gate.coordinator.clone();
        let signal = buy(&format!("SYM{}", i), "Spread");
        async move { coordinator.execute(signal).await }
    });
    let outcomes = futures_util::future::join_all(runs).await;

    let executed = outcomes
        .iter()
        .filter(|o| matches!(o, Ok(ExecutionOutcome::Executed { .. })))
        .count();
    let denied = outcomes
        .iter()
        .filter(|o| matches!(o, Ok(ExecutionOutcome::Denied { .. })))
        .count();

    assert!(executed > 0);
    assert!(denied > 0);
    assert_eq!(executed + denied, 30);

    let state = gate.risk.snapshot().await;
    assert!(state.open_exposure_pct <= max_open);
    let reserved: Decimal = gate
        .risk
        .reservations()
        .await
        .iter()
        .map(|r| r.exposure_pct)
        .sum();
    assert!(reserved <= max_open);
}

/// Concurrent entries never jointly commit more cash than the broker holds.
#[tokio::test]
async fn test_concurrent_entries_never_overdraw_broker_cash() {
    // About 200 per entry against 500 of cash: at most two fit.
    let broker = Arc::new(
        ScriptedBroker::new("cash-paper", BrokerVenue::Paper).with_cash(Decimal::from(500)),
    );
    let gate = Gate::new(BrokerRegistry::new(broker.clone()).unwrap());

    let runs = ["AAPL", "MSFT", "NVDA", "AMZN"].map(|symbol| {
        let coordinator = gate.coordinator.clone();
        let signal = buy(symbol, "Spread");
        async move { coordinator.execute(signal).await }
    });
    let outcomes = futures_util::future::join_all(runs).await;

    let executed = outcomes
        .iter()
        .filter(|o| matches!(o, Ok(ExecutionOutcome::Executed { .. })))
        .count();
    let short_of_cash = outcomes
        .iter()
        .filter(|o| {
            matches!(o, Ok(ExecutionOutcome::Denied { code, .. }) if code == "InsufficientCapital")
        })
        .count();

    assert!((1..=2).contains(&executed), "executed {}", executed);
    assert_eq!(executed + short_of_cash, 4);
    assert_eq!(broker.placed(), executed);
    assert!(broker.cash() >= Decimal::ZERO, "overdraft: cash {}", broker.cash());
}

/// Wrong phrases never change the tier and repeated failures lock out.
#[tokio::test]
async fn test_unlock_gating_and_lockout() {
    let gate = Gate::paper();
    let attempts = gate.config.mode.max_failed_unlocks;

    for attempt in 1..=attempts {
        let err = gate
            .mode
            .unlock_advanced("admin", "wrong phrase", &gate.totp_code(), Decimal::from(5))
            .await
            .unwrap_err();
        if attempt < attempts {
            assert!(matches!(err, Error::Auth { .. }), "attempt {}: {:?}", attempt, err);
        } else {
            assert!(matches!(err, Error::Conflict(_)), "attempt {}: {:?}", attempt, err);
        }
        assert_eq!(gate.mode.snapshot().tier, ExecutionTier::Conservative);
    }

    // Correct credentials are refused during the lockout.
    let err = gate
        .mode
        .unlock_advanced("admin", PHRASE, &gate.totp_code(), Decimal::from(5))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Conflict(_)));
    assert_eq!(gate.mode.snapshot().tier, ExecutionTier::Conservative);

    let denied = gate
        .count(
            AuditFilter::new()
                .action(AuditAction::UnlockAttempt)
                .decision(Decision::Denied),
        )
        .await;
    assert_eq!(denied, u64::from(attempts) + 1);
}

/// A valid webhook is accepted, approved and filled on the paper adapter.
#[tokio::test]
async fn test_webhook_signal_flows_to_paper_fill() {
    let gate = Gate::paper();
    let payload = json!({
        "token": "T1",
        "symbol": "AAPL",
        "action": "BUY",
        "price": 150.50,
        "strategy": "Test"
    });

    let signal = gate
        .ingestor
        .ingest(payload, SignalSource::Webhook)
        .await
        .unwrap()
        .unwrap();
    let key = signal.idempotency_key.to_string();

    let outcome = gate.coordinator.execute(signal).await.unwrap();
    let order = outcome.order().unwrap();
    assert!(matches!(order.status, OrderStatus::Submitted | OrderStatus::Filled));
    assert_eq!(order.broker_id, PaperBroker::ID);

    let approved = gate
        .count(
            AuditFilter::new()
                .action(AuditAction::RiskEvaluation)
                .decision(Decision::Approved)
                .key(key),
        )
        .await;
    assert_eq!(approved, 1);
}

/// A bad token is rejected before the Risk Guard runs.
#[tokio::test]
async fn test_invalid_token_rejected_before_risk() {
    let gate = Gate::paper();
    let payload = json!({
        "token": "not-the-secret",
        "symbol": "AAPL",
        "action": "BUY",
        "price": 150.50,
        "strategy": "Test"
    });

    let rejection = gate
        .ingestor
        .ingest(payload, SignalSource::Webhook)
        .await
        .unwrap()
        .unwrap_err();
    assert_eq!(rejection, Rejection::AuthFailure);

    let entries = gate
        .audit
        .query(
            &AuditFilter::new()
                .action(AuditAction::SignalIngest)
                .decision(Decision::Rejected),
        )
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].reason.as_deref(), Some("AuthFailure"));
    assert_eq!(
        gate.count(AuditFilter::new().action(AuditAction::RiskEvaluation)).await,
        0
    );
}

/// Forcing the conservative tier lets the in-flight broker call finish and
/// applies to the next signal.
#[tokio::test]
async fn test_force_conservative_during_inflight_advanced_order() {
    let mut slow = ScriptedBroker::new("slow-paper", BrokerVenue::Paper);
    slow.delay = Duration::from_millis(200);
    let slow = Arc::new(slow);
    let gate = Gate::new(BrokerRegistry::new(slow.clone()).unwrap());

    gate.mode
        .unlock_advanced("admin", PHRASE, &gate.totp_code(), Decimal::from(5))
        .await
        .unwrap();
    assert_eq!(gate.mode.snapshot().tier, ExecutionTier::Advanced);

    let coordinator = gate.coordinator.clone();
    let inflight = tokio::spawn(async move { coordinator.execute(buy("AAPL", "Momentum")).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    gate.mode.force_conservative("ops").await.unwrap();

    let outcome = inflight.await.unwrap().unwrap();
    let order = outcome.order().unwrap();
    assert_eq!(order.status, OrderStatus::Submitted);
    assert_eq!(order.tier, ExecutionTier::Advanced);

    let next = gate
        .coordinator
        .execute(buy("MSFT", "Momentum"))
        .await
        .unwrap();
    assert_eq!(next.order().unwrap().tier, ExecutionTier::Conservative);
    assert_eq!(slow.placed(), 2);
}

/// Three timeouts fail the order, release the reservation and notify.
#[tokio::test]
async fn test_broker_timeouts_fail_and_release() {
    let mut flaky = ScriptedBroker::new("flaky-paper", BrokerVenue::Paper);
    flaky.time_out = true;
    let flaky = Arc::new(flaky);
    let gate = Gate::new(BrokerRegistry::new(flaky.clone()).unwrap());
    let mut events = gate.events.subscribe();

    let outcome = gate.coordinator.execute(buy("AAPL", "Test")).await.unwrap();
    match outcome {
        ExecutionOutcome::Failed { order, reason } => {
            assert_eq!(reason, BROKER_TIMEOUT_EXHAUSTED);
            assert_eq!(order.status, OrderStatus::Failed);
        }
        other => panic!("expected failure, got {:?}", other),
    }
    assert_eq!(flaky.placed(), 3);
    assert!(gate.risk.reservations().await.is_empty());
    assert_eq!(gate.risk.snapshot().await.open_exposure_pct, Decimal::ZERO);

    let failed = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let event = events.recv().await.unwrap();
            if event.event_type == EventType::OrderFailed {
                return event;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(failed.payload["reason"], BROKER_TIMEOUT_EXHAUSTED);
}
