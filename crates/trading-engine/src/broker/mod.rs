//! Broker capability interface and the fixed adapter registry.

pub mod paper;
pub mod rest;

pub use paper::PaperBroker;
pub use rest::RestBroker;

use async_trait::async_trait;
use rust_decimal::Decimal;
use signal_core::config::{BrokerKind, Config};
use signal_core::types::{
    BrokerOrderId, BrokerOrderState, BrokerVenue, CancelOutcome, Order, Position, TradingMode,
};
use signal_core::{BrokerError, Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

/// Uniform order/position interface implemented once per broker integration.
///
/// `place_order` must be idempotent on `Order.id`, which adapters send as the
/// client order id: a retried submission returns the original acceptance
/// instead of creating a second order.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerApi: Send + Sync {
    fn id(&self) -> &str;

    fn venue(&self) -> BrokerVenue;

    async fn place_order(&self, order: &Order) -> std::result::Result<BrokerOrderId, BrokerError>;

    async fn cancel_order(
        &self,
        client_order_id: Uuid,
    ) -> std::result::Result<CancelOutcome, BrokerError>;

    async fn order_status(
        &self,
        client_order_id: Uuid,
    ) -> std::result::Result<BrokerOrderState, BrokerError>;

    async fn get_position(&self, symbol: &str) -> std::result::Result<Position, BrokerError>;

    async fn get_available_capital(&self) -> std::result::Result<Decimal, BrokerError>;
}

/// Closed set of adapters, fixed at startup.
///
/// Paper orders always resolve to the simulator; live orders resolve to a
/// registered live-venue adapter. There is no path from a paper order to a
/// live adapter.
pub struct BrokerRegistry {
    paper: Arc<dyn BrokerApi>,
    live: HashMap<String, Arc<dyn BrokerApi>>,
    default_live: Option<String>,
}

impl BrokerRegistry {
    pub fn new(paper: Arc<dyn BrokerApi>) -> Result<Self> {
        if paper.venue() != BrokerVenue::Paper {
            return Err(Error::config(format!(
                "broker '{}' is not a paper venue",
                paper.id()
            )));
        }
        Ok(Self {
            paper,
            live: HashMap::new(),
            default_live: None,
        })
    }

    /// Register a live adapter. The first one registered becomes the default.
    pub fn register_live(&mut self, broker: Arc<dyn BrokerApi>) -> Result<()> {
        if broker.venue() != BrokerVenue::Live {
            return Err(Error::config(format!(
                "broker '{}' is not a live venue",
                broker.id()
            )));
        }
        let id = broker.id().to_string();
        if self.live.contains_key(&id) || id == self.paper.id() {
            return Err(Error::config(format!("duplicate broker id '{}'", id)));
        }
        if self.default_live.is_none() {
            self.default_live = Some(id.clone());
        }
        self.live.insert(id, broker);
        Ok(())
    }

    pub fn set_default_live(&mut self, id: &str) -> Result<()> {
        if !self.live.contains_key(id) {
            return Err(Error::config(format!("unknown live broker '{}'", id)));
        }
        self.default_live = Some(id.to_string());
        Ok(())
    }

    pub fn paper(&self) -> Arc<dyn BrokerApi> {
        self.paper.clone()
    }

    pub fn has_live(&self) -> bool {
        self.default_live.is_some()
    }

    /// Adapter new orders under `mode` are sent to.
    pub fn route(&self, mode: TradingMode) -> Result<Arc<dyn BrokerApi>> {
        match mode {
            TradingMode::Paper => Ok(self.paper.clone()),
            TradingMode::Live => self
                .default_live
                .as_ref()
                .and_then(|id| self.live.get(id))
                .cloned()
                .ok_or_else(|| Error::denied("no live broker configured")),
        }
    }

    /// Adapter that owns an existing order. Verifies the adapter's venue
    /// matches the mode the order was declared under.
    pub fn for_order(&self, order: &Order) -> Result<Arc<dyn BrokerApi>> {
        let broker = match order.trading_mode {
            TradingMode::Paper => self.paper.clone(),
            TradingMode::Live => self
                .live
                .get(&order.broker_id)
                .cloned()
                .ok_or_else(|| Error::NotFound(format!("broker '{}'", order.broker_id)))?,
        };

        if broker.venue() != BrokerVenue::for_mode(order.trading_mode) {
            return Err(Error::StateCorruption {
                message: format!(
                    "order {} declared {} but broker '{}' is {}",
                    order.id,
                    order.trading_mode,
                    broker.id(),
                    broker.venue()
                ),
            });
        }
        Ok(broker)
    }

    pub fn brokers(&self) -> Vec<Arc<dyn BrokerApi>> {
        std::iter::once(self.paper.clone())
            .chain(self.live.values().cloned())
            .collect()
    }
}

/// Build the registry from configuration: the paper simulator plus one REST
/// adapter per configured broker.
pub fn build_registry(config: &Config) -> Result<BrokerRegistry> {
    let paper = Arc::new(PaperBroker::new(
        config.risk.starting_capital,
        config.risk.fee_rate,
    ));
    let mut registry = BrokerRegistry::new(paper)?;

    let timeout = Duration::from_secs(config.execution.broker_timeout_secs);
    for broker in &config.brokers {
        match broker.kind {
            BrokerKind::Rest => {
                let adapter = RestBroker::new(&broker.id, &broker.base_url, &broker.api_key, timeout)?;
                registry.register_live(Arc::new(adapter))?;
                info!(broker_id = %broker.id, base_url = %broker.base_url, "Registered REST broker");
            }
        }
    }

    if config.execution.default_broker != PaperBroker::ID {
        registry.set_default_live(&config.execution.default_broker)?;
    }

    Ok(registry)
}
