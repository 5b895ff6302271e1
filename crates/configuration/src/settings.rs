use crate::error::ConfigError;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// The root configuration structure for the entire application.
///
/// Every section has defaults, so an empty `config.toml` (or none at all)
/// yields a runnable paper-trading setup.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub scheduler: SchedulerConfig,
    pub retry: RetryConfig,
    pub trading: TradingConfig,
    pub exchange: ExchangeConfig,
    pub signals: SignalsConfig,
    pub telegram: TelegramConfig,
    pub logging: LoggingConfig,
}

/// Which persistence backend holds the lock and position records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Postgres,
    /// Process-local store. Only meaningful for a single instance.
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub backend: StoreBackend,
    /// Falls back to the `DATABASE_URL` environment variable when empty.
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Postgres,
            url: String::new(),
            max_connections: 10,
            acquire_timeout_secs: 5,
        }
    }
}

/// Timing of the trade-monitor tick and its lock lease.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub period_secs: u64,
    /// Must be strictly shorter than `period_secs`, so a crashed holder's lease
    /// runs out before the next tick is due.
    pub lease_secs: u64,
    pub lock_name: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            period_secs: 60,
            lease_secs: 55,
            lock_name: "trade-monitor".to_string(),
        }
    }
}

impl SchedulerConfig {
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs)
    }

    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            delay_ms: 1_000,
        }
    }
}

impl RetryConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TradingConfig {
    /// Exchange identifier written on every position.
    pub platform: String,
    /// Settlement currency.
    pub currency: String,
    /// New trades are only started while fewer positions than this are open.
    pub max_open_positions: usize,
    /// Used when a signal does not carry its own leverage.
    pub default_leverage: u32,
    /// Route orders to the paper exchange instead of the gateway.
    pub dry_run: bool,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            platform: "binance-futures".to_string(),
            currency: "USDT".to_string(),
            max_open_positions: 3,
            default_leverage: 5,
            dry_run: true,
        }
    }
}

/// Connection settings for the exchange gateway.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    pub base_url: String,
    pub api_key: String,
    pub timeout_secs: u64,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8088".to_string(),
            api_key: String::new(),
            timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SignalsConfig {
    /// Endpoint of the model service. No signals are produced when unset.
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
    pub token: String,
    pub chat_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default `EnvFilter` directive; `RUST_LOG` overrides it.
    pub level: String,
    /// When set, logs are also written to a daily rolling file in this directory.
    pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            directory: None,
        }
    }
}

impl Config {
    /// Rejects settings that would break the scheduler's guarantees.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.scheduler;
        if s.period_secs == 0 {
            return Err(ConfigError::ValidationError(
                "scheduler.period_secs must be greater than 0".to_string(),
            ));
        }
        if s.lease_secs == 0 || s.lease_secs >= s.period_secs {
            return Err(ConfigError::ValidationError(format!(
                "scheduler.lease_secs ({}) must be between 1 and period_secs ({}) exclusive",
                s.lease_secs, s.period_secs
            )));
        }
        if s.lock_name.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "scheduler.lock_name must not be empty".to_string(),
            ));
        }
        // The trade monitor stops retrying once a call and its retry delay no
        // longer fit in the lease, so at least one must fit.
        let step_ms = self
            .exchange
            .timeout_secs
            .saturating_mul(1000)
            .saturating_add(self.retry.delay_ms);
        if step_ms >= s.lease_secs.saturating_mul(1000) {
            return Err(ConfigError::ValidationError(format!(
                "scheduler.lease_secs ({}) must exceed exchange.timeout_secs plus retry.delay_ms ({step_ms} ms)",
                s.lease_secs
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.trading.default_leverage == 0 {
            return Err(ConfigError::ValidationError(
                "trading.default_leverage must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
