//! Layered configuration for the Signal Gate system.
//!
//! Sources, lowest precedence first: built-in defaults, an optional TOML file,
//! then `GATE__SECTION__KEY` environment variables.

use crate::{Error, Result};
use config::{Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::path::Path;

/// Default location of the optional config file.
pub const DEFAULT_CONFIG_PATH: &str = "config/gate.toml";

/// Application configuration.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerSettings,
    pub webhook: WebhookConfig,
    pub admin: AdminConfig,
    pub risk: RiskConfig,
    pub mode: ModeConfig,
    pub capital_schedule: CapitalScheduleConfig,
    pub execution: ExecutionConfig,
    pub brokers: Vec<BrokerConfig>,
    pub notifications: NotificationConfig,
    pub database: DatabaseConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub body_limit_bytes: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            body_limit_bytes: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    /// Token expected in the body of `POST /webhook/signal`.
    pub shared_secret: String,
    /// Token expected from the bot channel. Empty disables bot ingestion.
    pub bot_shared_secret: String,
    pub dedup_window_secs: i64,
    pub time_bucket_secs: i64,
    pub cache_capacity: usize,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            shared_secret: String::new(),
            bot_shared_secret: String::new(),
            dedup_window_secs: 300,
            time_bucket_secs: 60,
            cache_capacity: 10_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    pub jwt_secret: String,
    pub jwt_issuer: String,
    pub token_expiry_hours: i64,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            jwt_issuer: "signal-gate".to_string(),
            token_expiry_hours: 12,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    pub starting_capital: Decimal,
    /// Entry size as % of equity before tier scaling.
    pub position_size_pct: Decimal,
    pub max_trade_exposure_pct: Decimal,
    pub max_open_exposure_pct: Decimal,
    /// Absolute loss (currency units) after which new entries are denied for the day.
    pub daily_loss_limit: Decimal,
    pub max_drawdown_pct: Decimal,
    pub max_consecutive_losses: u32,
    pub slippage_tolerance_pips: Decimal,
    pub pip_size: Decimal,
    pub fee_rate: Decimal,
    pub trading_day_utc_offset_hours: i32,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            starting_capital: Decimal::from(10_000),
            position_size_pct: Decimal::from(2),
            max_trade_exposure_pct: Decimal::from(5),
            max_open_exposure_pct: Decimal::from(25),
            daily_loss_limit: Decimal::from(500),
            max_drawdown_pct: Decimal::from(15),
            max_consecutive_losses: 5,
            slippage_tolerance_pips: Decimal::new(12, 1),
            pip_size: Decimal::new(1, 2),
            fee_rate: Decimal::ZERO,
            trading_day_utc_offset_hours: -5,
        }
    }
}

impl RiskConfig {
    /// Slippage tolerance in price units.
    pub fn slippage_tolerance(&self) -> Decimal {
        self.slippage_tolerance_pips * self.pip_size
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModeConfig {
    /// Argon2 PHC string of the unlock phrase.
    pub secret_phrase_hash: String,
    /// Base32 TOTP secret for the second factor.
    pub totp_secret: String,
    pub live_confirmation_token: String,
    pub unlock_ttl_minutes: i64,
    pub max_failed_unlocks: u32,
    pub failed_unlock_window_secs: i64,
    pub lockout_secs: i64,
}

impl Default for ModeConfig {
    fn default() -> Self {
        Self {
            secret_phrase_hash: String::new(),
            totp_secret: String::new(),
            live_confirmation_token: String::new(),
            unlock_ttl_minutes: 240,
            max_failed_unlocks: 3,
            failed_unlock_window_secs: 900,
            lockout_secs: 1800,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CapitalScheduleConfig {
    pub stages_pct: Vec<Decimal>,
    pub evaluation_interval_hours: i64,
    pub min_profit_factor: Decimal,
    pub max_drawdown_pct: Decimal,
    /// Closed advanced trades required before a stage can advance.
    pub min_trades: u32,
}

impl Default for CapitalScheduleConfig {
    fn default() -> Self {
        Self {
            stages_pct: [5, 10, 25, 50, 100].into_iter().map(Decimal::from).collect(),
            evaluation_interval_hours: 24,
            min_profit_factor: Decimal::new(15, 1),
            max_drawdown_pct: Decimal::from(10),
            min_trades: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub broker_timeout_secs: u64,
    pub poll_interval_secs: u64,
    /// Broker used for live orders. Paper orders always go to the simulator.
    pub default_broker: String,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff_ms: 200,
            max_backoff_ms: 5_000,
            broker_timeout_secs: 10,
            poll_interval_secs: 5,
            default_broker: "paper".to_string(),
        }
    }
}

/// Kinds of broker integrations that can be configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerKind {
    Rest,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    pub id: String,
    pub kind: BrokerKind,
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub redis_url: Option<String>,
    pub channel: String,
    pub buffer: usize,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            channel: "gate:events".to_string(),
            buffer: 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
        }
    }
}

impl Config {
    /// Load configuration from the default file location and environment.
    #[allow(clippy::result_large_err)]
    pub fn load() -> Result<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from `path` (optional) and environment.
    #[allow(clippy::result_large_err)]
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut config: Config = config::Config::builder()
            .add_source(File::from(path.as_ref()).required(false))
            .add_source(
                Environment::with_prefix("GATE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        // Conventional variable wins when the nested one is absent.
        if config.database.url.is_none() {
            config.database.url = std::env::var("DATABASE_URL").ok();
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject inconsistent settings.
    #[allow(clippy::result_large_err)]
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();
        let hundred = Decimal::ONE_HUNDRED;

        if self.webhook.shared_secret.is_empty() {
            errors.push("webhook.shared_secret must be set".to_string());
        }
        if self.webhook.dedup_window_secs <= 0 {
            errors.push("webhook.dedup_window_secs must be positive".to_string());
        }
        if self.webhook.time_bucket_secs <= 0 {
            errors.push("webhook.time_bucket_secs must be positive".to_string());
        }
        if self.webhook.cache_capacity == 0 {
            errors.push("webhook.cache_capacity must be positive".to_string());
        }
        if self.admin.jwt_secret.len() < 32 {
            errors.push("admin.jwt_secret must be at least 32 bytes".to_string());
        }

        let risk = &self.risk;
        if risk.starting_capital <= Decimal::ZERO {
            errors.push("risk.starting_capital must be positive".to_string());
        }
        for (name, value) in [
            ("risk.position_size_pct", risk.position_size_pct),
            ("risk.max_trade_exposure_pct", risk.max_trade_exposure_pct),
            ("risk.max_open_exposure_pct", risk.max_open_exposure_pct),
            ("risk.max_drawdown_pct", risk.max_drawdown_pct),
        ] {
            if value <= Decimal::ZERO || value > hundred {
                errors.push(format!("{} must be in (0, 100]", name));
            }
        }
        if risk.max_trade_exposure_pct > risk.max_open_exposure_pct {
            errors.push("risk.max_trade_exposure_pct exceeds risk.max_open_exposure_pct".to_string());
        }
        if risk.daily_loss_limit <= Decimal::ZERO {
            errors.push("risk.daily_loss_limit must be positive".to_string());
        }
        if risk.pip_size <= Decimal::ZERO || risk.slippage_tolerance_pips < Decimal::ZERO {
            errors.push("risk slippage settings must be positive".to_string());
        }

        if self.mode.max_failed_unlocks == 0 {
            errors.push("mode.max_failed_unlocks must be positive".to_string());
        }
        if self.mode.unlock_ttl_minutes <= 0 {
            errors.push("mode.unlock_ttl_minutes must be positive".to_string());
        }

        let stages = &self.capital_schedule.stages_pct;
        if stages.is_empty() {
            errors.push("capital_schedule.stages_pct must not be empty".to_string());
        }
        if stages.windows(2).any(|w| w[0] >= w[1])
            || stages.iter().any(|s| *s <= Decimal::ZERO || *s > hundred)
        {
            errors.push("capital_schedule.stages_pct must be ascending within (0, 100]".to_string());
        }

        if self.execution.max_attempts == 0 {
            errors.push("execution.max_attempts must be positive".to_string());
        }
        if self.execution.broker_timeout_secs == 0 {
            errors.push("execution.broker_timeout_secs must be positive".to_string());
        }
        let default_broker = &self.execution.default_broker;
        if default_broker != "paper" && !self.brokers.iter().any(|b| &b.id == default_broker) {
            errors.push(format!(
                "execution.default_broker '{}' is not a configured broker",
                default_broker
            ));
        }
        for broker in &self.brokers {
            if let Err(e) = url::Url::parse(&broker.base_url) {
                errors.push(format!("brokers.{}.base_url: {}", broker.id, e));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::config(errors.join("; ")))
        }
    }

    /// Configuration for tests: valid, in-memory, deterministic secrets.
    pub fn test_config() -> Self {
        Self {
            webhook: WebhookConfig {
                shared_secret: "T1".to_string(),
                bot_shared_secret: "B1".to_string(),
                ..Default::default()
            },
            admin: AdminConfig {
                jwt_secret: "test-secret-key-that-is-at-least-32-bytes".to_string(),
                ..Default::default()
            },
            mode: ModeConfig {
                live_confirmation_token: "CONFIRM-LIVE".to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.webhook.dedup_window_secs, 300);
        assert_eq!(config.execution.max_attempts, 3);
        assert_eq!(config.execution.broker_timeout_secs, 10);
        assert_eq!(config.risk.slippage_tolerance_pips, Decimal::new(12, 1));
        assert_eq!(config.capital_schedule.stages_pct.len(), 5);
        assert_eq!(config.notifications.channel, "gate:events");
    }

    #[test]
    fn test_test_config_validates() {
        assert!(Config::test_config().validate().is_ok());
    }

    #[test]
    fn test_validate_collects_errors() {
        let mut config = Config::test_config();
        config.webhook.shared_secret.clear();
        config.risk.max_trade_exposure_pct = Decimal::from(50);
        config.execution.default_broker = "alpaca".to_string();

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("webhook.shared_secret"));
        assert!(err.contains("max_trade_exposure_pct exceeds"));
        assert!(err.contains("alpaca"));
    }

    #[test]
    fn test_broker_base_url_must_parse() {
        let mut config = Config::test_config();
        config.brokers.push(BrokerConfig {
            id: "alpaca".to_string(),
            kind: BrokerKind::Rest,
            base_url: "not a url".to_string(),
            api_key: String::new(),
        });
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("brokers.alpaca.base_url"));
    }

    #[test]
    fn test_unsorted_stages_rejected() {
        let mut config = Config::test_config();
        config.capital_schedule.stages_pct = vec![Decimal::from(10), Decimal::from(5)];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_slippage_tolerance_in_price_units() {
        let risk = RiskConfig::default();
        assert_eq!(risk.slippage_tolerance(), Decimal::new(12, 3));
    }
}
