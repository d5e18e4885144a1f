//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs.
//! Secrets (the broker token) are referenced by env-var name in the config
//! and resolved at runtime via `std::env::var`.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::fs;

use crate::engine::retry::RetryPolicy;
use crate::engine::EngineSettings;
use crate::types::GroupId;

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub engine: EngineConfig,
    pub storage: StorageConfig,
    pub broker: BrokerConfig,
    #[serde(default)]
    pub outbox: OutboxConfig,
    pub dashboard: DashboardConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    /// Trading group this instance acts for.
    pub group_id: GroupId,
    /// Group whose approved positions are settled. Defaults to `group_id`.
    #[serde(default)]
    pub payout_group: Option<GroupId>,
    #[serde(default = "default_bet_limit")]
    pub bet_limit: u32,
    pub unit_price: Decimal,
    /// Fraction taken off reserved purchases while the discount is on.
    #[serde(default = "default_discount_rate")]
    pub discount_rate: Decimal,
}

fn default_bet_limit() -> u32 {
    40
}

fn default_discount_rate() -> Decimal {
    Decimal::new(10, 2)
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub state_file: String,
    pub snapshot_interval_secs: u64,
    /// JSON list of fixtures ingested at startup.
    #[serde(default)]
    pub fixtures_file: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BrokerConfig {
    pub enabled: bool,
    pub url: String,
    pub token_env: String,
    #[serde(default = "default_broker_timeout")]
    pub timeout_secs: u64,
}

fn default_broker_timeout() -> u64 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct OutboxConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            base_delay_ms: policy.base_delay_ms,
            max_delay_ms: policy.max_delay_ms,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DashboardConfig {
    pub enabled: bool,
    pub port: u16,
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        Self::parse(&contents).with_context(|| format!("Failed to parse config file: {path}"))
    }

    /// Parse configuration from TOML text.
    pub fn parse(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents)?;
        if config.engine.bet_limit == 0 {
            anyhow::bail!("engine.bet_limit must be positive");
        }
        if config.engine.unit_price <= Decimal::ZERO {
            anyhow::bail!("engine.unit_price must be positive");
        }
        let rate = config.engine.discount_rate;
        if rate < Decimal::ZERO || rate >= Decimal::ONE {
            anyhow::bail!("engine.discount_rate must be in [0, 1), got {rate}");
        }
        Ok(config)
    }

    /// Resolve an environment variable name to its value.
    /// Useful for loading secrets referenced in the config.
    pub fn resolve_env(env_name: &str) -> Result<String> {
        std::env::var(env_name)
            .with_context(|| format!("Environment variable not set: {env_name}"))
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            group_id: self.engine.group_id,
            payout_group: self.engine.payout_group.unwrap_or(self.engine.group_id),
            bet_limit: self.engine.bet_limit,
            unit_price: self.engine.unit_price,
            discount_rate: self.engine.discount_rate,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.outbox.max_attempts.max(1),
            base_delay_ms: self.outbox.base_delay_ms,
            max_delay_ms: self.outbox.max_delay_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const SAMPLE: &str = r#"
        [engine]
        group_id = 2
        unit_price = 1000

        [storage]
        state_file = "exchange_state.json"
        snapshot_interval_secs = 60

        [broker]
        enabled = false
        url = "http://localhost:9000/"
        token_env = "BROKER_TOKEN"

        [dashboard]
        enabled = true
        port = 8080
    "#;

    #[test]
    fn test_parse_defaults() {
        let cfg = AppConfig::parse(SAMPLE).unwrap();
        assert_eq!(cfg.engine.bet_limit, 40);
        assert_eq!(cfg.broker.timeout_secs, 5);

        let settings = cfg.engine_settings();
        assert_eq!(settings.group_id, 2);
        assert_eq!(settings.payout_group, 2);
        assert_eq!(settings.unit_price, dec!(1000));
        assert_eq!(settings.discount_rate, dec!(0.10));
        assert_eq!(cfg.retry_policy().max_attempts, RetryPolicy::default().max_attempts);
    }

    #[test]
    fn test_parse_rejects_zero_price() {
        let text = SAMPLE.replace("unit_price = 1000", "unit_price = 0");
        assert!(AppConfig::parse(&text).is_err());
    }

    #[test]
    fn test_parse_discount_rate() {
        let text = SAMPLE.replace("unit_price = 1000", "unit_price = 1000\ndiscount_rate = 0.25");
        let cfg = AppConfig::parse(&text).unwrap();
        assert_eq!(cfg.engine_settings().discount_rate, dec!(0.25));

        let text = SAMPLE.replace("unit_price = 1000", "unit_price = 1000\ndiscount_rate = 1.0");
        assert!(AppConfig::parse(&text).is_err());
        let text = SAMPLE.replace("unit_price = 1000", "unit_price = 1000\ndiscount_rate = -0.1");
        assert!(AppConfig::parse(&text).is_err());
    }

    #[test]
    fn test_load_config() {
        // Requires config.toml in the working directory; skipped otherwise.
        let result = AppConfig::load("config.toml");
        if let Ok(cfg) = result {
            assert!(cfg.engine.bet_limit > 0);
            assert!(cfg.engine.unit_price > Decimal::ZERO);
            assert!(cfg.storage.snapshot_interval_secs > 0);
        }
    }
}
