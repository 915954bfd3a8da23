//! Application state shared across handlers.

use anyhow::Context;
use sqlx::PgPool;
use std::sync::Arc;
use tracing::{info, warn};

use auth::{
    AuditLogger, AuditStorage, JwtAuth, JwtConfig, MemoryAuditStorage, PostgresAuditStorage,
    UnlockCredential,
};
use risk_manager::{CapitalScaler, RiskGuard};
use signal_core::config::Config;
use signal_core::db::{
    MemoryOrderStore, MemoryStateStore, OrderStore, PgOrderStore, PgStateStore, StateStore,
};
use signal_core::notify::{LogSink, NotificationHub, NotificationSink, RedisSink};
use trading_engine::{
    build_registry, BrokerRegistry, ExecutionCoordinator, ExecutionServices, ModeController,
    ReconciliationReport, SignalIngestor,
};

/// Persistence backends.
#[derive(Clone)]
pub struct Stores {
    pub audit: Arc<dyn AuditStorage>,
    pub state: Arc<dyn StateStore>,
    pub orders: Arc<dyn OrderStore>,
}

impl Stores {
    /// Process-local stores. Nothing survives a restart.
    pub fn memory() -> Self {
        Self {
            audit: Arc::new(MemoryAuditStorage::new()),
            state: Arc::new(MemoryStateStore::new()),
            orders: Arc::new(MemoryOrderStore::new()),
        }
    }

    pub fn postgres(pool: PgPool) -> Self {
        Self {
            audit: Arc::new(PostgresAuditStorage::new(pool.clone())),
            state: Arc::new(PgStateStore::new(pool.clone())),
            orders: Arc::new(PgOrderStore::new(pool)),
        }
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    /// Database connection pool, absent when running on memory stores.
    pub pool: Option<PgPool>,
    /// JWT authentication handler for operator commands.
    pub jwt_auth: Arc<JwtAuth>,
    pub audit: AuditLogger,
    pub notifier: NotificationHub,
    pub ingestor: Arc<SignalIngestor>,
    pub risk: Arc<RiskGuard>,
    pub scaler: Arc<CapitalScaler>,
    pub mode: Arc<ModeController>,
    pub coordinator: Arc<ExecutionCoordinator>,
}

impl AppState {
    /// Build the production state: brokers from configuration, Postgres
    /// stores when a pool is given, Redis notifications when configured.
    pub async fn new(config: Config, pool: Option<PgPool>) -> anyhow::Result<Self> {
        let stores = match &pool {
            Some(pool) => Stores::postgres(pool.clone()),
            None => {
                warn!("No database configured, state will not survive a restart");
                Stores::memory()
            }
        };

        let mut sinks: Vec<Arc<dyn NotificationSink>> = vec![Arc::new(LogSink)];
        if let Some(url) = &config.notifications.redis_url {
            match RedisSink::connect(url, config.notifications.channel.clone()).await {
                Ok(sink) => {
                    info!(channel = %config.notifications.channel, "Publishing notifications to Redis");
                    sinks.push(Arc::new(sink));
                }
                Err(e) => warn!(error = %e, "Redis unavailable, notifications stay local"),
            }
        }

        let brokers = build_registry(&config).context("Failed to build broker registry")?;
        let mut state = Self::assemble(config, stores, brokers, sinks)?;
        state.pool = pool;
        Ok(state)
    }

    /// Wire the components together from explicit parts.
    pub fn assemble(
        config: Config,
        stores: Stores,
        brokers: BrokerRegistry,
        sinks: Vec<Arc<dyn NotificationSink>>,
    ) -> anyhow::Result<Self> {
        let audit = AuditLogger::new(stores.audit);
        let notifier = NotificationHub::spawn(config.notifications.buffer, sinks);

        let credential =
            UnlockCredential::from_config(&config.mode).context("Invalid unlock credential")?;
        if !credential.is_configured() {
            warn!("Advanced unlock credential not configured, the advanced tier stays locked");
        }

        let risk = Arc::new(RiskGuard::with_store(config.risk.clone(), stores.state.clone()));
        let scaler = Arc::new(CapitalScaler::with_store(
            config.capital_schedule.clone(),
            stores.state.clone(),
        ));
        let mode = Arc::new(
            ModeController::new(
                &config.mode,
                credential,
                scaler.clone(),
                audit.clone(),
                notifier.clone(),
            )
            .with_store(stores.state),
        );
        let ingestor = Arc::new(SignalIngestor::new(
            &config.webhook,
            audit.clone(),
            notifier.clone(),
        ));
        let coordinator = Arc::new(ExecutionCoordinator::new(
            &config,
            ExecutionServices {
                risk: risk.clone(),
                scaler: scaler.clone(),
                mode: mode.clone(),
                brokers: Arc::new(brokers),
                orders: stores.orders,
                audit: audit.clone(),
                notifier: notifier.clone(),
            },
        ));

        Ok(Self {
            jwt_auth: Arc::new(JwtAuth::new(JwtConfig::from_admin(&config.admin))),
            config: Arc::new(config),
            pool: None,
            audit,
            notifier,
            ingestor,
            risk,
            scaler,
            mode,
            coordinator,
        })
    }

    /// Reload persisted state and reconcile open orders against the brokers.
    /// Must complete before the server accepts signals.
    pub async fn restore(&self) -> anyhow::Result<ReconciliationReport> {
        let risk_restored = self.risk.load_state().await.context("Failed to load risk state")?;
        let scaler_restored = self
            .scaler
            .load_state()
            .await
            .context("Failed to load capital schedule")?;
        let mode_restored = self.mode.load_state().await.context("Failed to load mode state")?;
        info!(
            risk = risk_restored,
            capital_schedule = scaler_restored,
            mode = mode_restored,
            "Persisted state restored"
        );

        let report = self
            .coordinator
            .reconcile()
            .await
            .context("Startup reconciliation failed")?;
        if report.safe_mode {
            warn!(
                mismatches = report.mismatches.len(),
                "Reconciliation found mismatches, safe mode engaged until acknowledged"
            );
        }
        Ok(report)
    }

    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }
}
