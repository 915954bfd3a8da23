//! Signal Gate Core Library
//!
//! Shared domain types, error taxonomy, configuration, notification fan-out,
//! and persistence contracts for the Signal Gate control plane.

pub mod config;
pub mod db;
pub mod error;
pub mod notify;
pub mod types;

pub use error::{BrokerError, Error, Result, TransientReason};
