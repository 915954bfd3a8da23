//! Trading Engine
//!
//! Signal ingestion, the mode controller, broker adapters, and the execution
//! coordinator that drives a signal through risk, mode gate, and broker.

pub mod broker;
pub mod coordinator;
pub mod ingestion;
pub mod mode;
pub mod reconcile;
pub mod tasks;

pub use broker::{build_registry, BrokerApi, BrokerRegistry, PaperBroker, RestBroker};
pub use coordinator::{
    DenialStage, ExecutionCoordinator, ExecutionOutcome, ExecutionServices, MetricsSnapshot,
    RetryPolicy, BROKER_TIMEOUT_EXHAUSTED,
};
pub use ingestion::{parse_signal, ManualSignal, RecentSignalCache, Rejection, SignalIngestor};
pub use mode::{GateDecision, GateDenial, ModeController, ModePermit};
pub use reconcile::ReconciliationReport;
pub use tasks::{HousekeepingReport, Scheduler, SchedulerConfig};
