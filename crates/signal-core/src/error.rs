//! Error types for the Signal Gate system.

use thiserror::Error;

/// Why a transient broker failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransientReason {
    Timeout,
    RateLimited,
    Unavailable,
}

/// Failure reported by a broker adapter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Retryable: timeout, rate-limit, broker unavailable.
    #[error("Transient broker error ({reason:?}): {message}")]
    Transient {
        reason: TransientReason,
        message: String,
    },

    /// Non-retryable: invalid symbol, insufficient funds.
    #[error("Broker rejected order: {message}")]
    Rejected { message: String },

    /// Unclassified. Retried like a transient error up to the cap, then escalated.
    #[error("Unknown broker error: {message}")]
    Unknown { message: String },
}

impl BrokerError {
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Transient {
            reason: TransientReason::Timeout,
            message: message.into(),
        }
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::Transient {
            reason: TransientReason::RateLimited,
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Transient {
            reason: TransientReason::Unavailable,
            message: message.into(),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected {
            message: message.into(),
        }
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::Unknown {
            message: message.into(),
        }
    }

    /// Whether the coordinator may retry the call.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, BrokerError::Rejected { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            BrokerError::Transient {
                reason: TransientReason::Timeout,
                ..
            }
        )
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Configuration file error: {0}")]
    ConfigFile(#[from] config::ConfigError),

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Validation error: {message}")]
    Validation { message: String },

    #[error("Authentication error: {message}")]
    Auth { message: String },

    #[error("Policy denied: {reason}")]
    PolicyDenied { reason: String },

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("State corruption: {message}")]
    StateCorruption { message: String },

    #[error("Invalid transition: from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),
}

impl Error {
    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
        }
    }

    pub fn denied(reason: impl Into<String>) -> Self {
        Error::PolicyDenied {
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
