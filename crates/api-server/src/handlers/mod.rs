//! Request handlers.

pub mod audit;
pub mod health;
pub mod market;
pub mod mode;
pub mod orders;
pub mod risk;
pub mod signals;
