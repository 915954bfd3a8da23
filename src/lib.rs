//! Signal Gate: fail-safe signal-to-execution control plane.
//!
//! This is the root crate that provides benchmark and integration-test access
//! to the internal crates. For actual functionality, use the individual crates
//! directly:
//!
//! - `signal-core`: Domain types, errors, configuration, persistence contracts
//! - `auth`: Audit log, operator JWTs, shared secrets, unlock credentials
//! - `risk-manager`: Risk Guard, reservation ledger, capital scaling schedule
//! - `trading-engine`: Ingestion, mode controller, brokers, execution coordinator
//! - `api-server`: HTTP surface and the `signal-gate` binary

pub use auth;
pub use risk_manager as risk;
pub use signal_core as domain;
pub use trading_engine as trading;
