//! Core domain types for the Signal Gate system.

pub mod broker;
pub mod mode;
pub mod order;
pub mod risk;
pub mod signal;

pub use broker::*;
pub use mode::*;
pub use order::*;
pub use risk::*;
pub use signal::*;
