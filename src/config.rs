// 7.0 config.rs: all settings in one place. fees, margins, rollover, retries.
// 7.1 presets per network (regtest / mainnet), loaded from yaml when DLC_CORE_CONFIG is set.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::margin::{CoordinatorLeverage, MarginParams, ReferralTier};
use crate::types::{Leverage, Sats};

pub const CONFIG_ENV_VAR: &str = "DLC_CORE_CONFIG";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

/** 7.2: fee settings. matching fee is a rate on the btc notional */
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeeSettings {
    pub matching_fee_rate: Decimal,
    // rebate fraction of the matching fee by traded volume
    pub referral_tiers: Vec<ReferralTier>,
}

impl Default for FeeSettings {
    fn default() -> Self {
        Self {
            matching_fee_rate: dec!(0.003),
            referral_tiers: vec![
                ReferralTier { min_volume: dec!(100_000), fee_rebate: dec!(0.1) },
                ReferralTier { min_volume: dec!(1_000_000), fee_rebate: dec!(0.2) },
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelSettings {
    pub fee_rate_sats_vb: u64,
    // used when an order arrives for a trader without a channel
    pub default_trader_reserve: Sats,
    pub default_coordinator_reserve: Sats,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            fee_rate_sats_vb: 2,
            default_trader_reserve: Sats::new(250_000),
            default_coordinator_reserve: Sats::new(500_000),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RolloverSettings {
    pub enabled: bool,
    pub check_interval_secs: u64,
    // window before a daily expiry on test networks
    pub test_window_hours: i64,
}

impl Default for RolloverSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval_secs: 300,
            test_window_hours: 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NegotiationSettings {
    // per message deadline for the counterparty reply
    pub timeout_ms: u64,
}

impl Default for NegotiationSettings {
    fn default() -> Self {
        Self { timeout_ms: 30_000 }
    }
}

/** 7.3: background task retries. timeouts past `escalate_after_timeouts` go to collab revert */
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub escalate_to_collab_revert: bool,
    pub escalate_after_timeouts: u32,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff_ms: 500,
            max_backoff_ms: 30_000,
            escalate_to_collab_revert: false,
            escalate_after_timeouts: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollabRevertSettings {
    pub tx_weight: u64,
    pub fee_rate_sats_vb: u64,
}

impl Default for CollabRevertSettings {
    fn default() -> Self {
        Self {
            tx_weight: crate::collab_revert::COLLAB_REVERT_TX_WEIGHT,
            fee_rate_sats_vb: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventSettings {
    pub broadcast_capacity: usize,
    // lagged subscribers replay from here
    pub history_size: usize,
}

impl Default for EventSettings {
    fn default() -> Self {
        Self {
            broadcast_capacity: 256,
            history_size: 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PriceFeedSettings {
    pub max_staleness_secs: u64,
}

impl Default for PriceFeedSettings {
    fn default() -> Self {
        Self { max_staleness_secs: 60 }
    }
}

// The complete configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub network: Network,
    pub margin: MarginParams,
    pub coordinator_leverages: Vec<CoordinatorLeverage>,
    pub fees: FeeSettings,
    pub channel: ChannelSettings,
    pub rollover: RolloverSettings,
    pub negotiation: NegotiationSettings,
    pub retry: RetrySettings,
    pub collab_revert: CollabRevertSettings,
    pub events: EventSettings,
    pub price_feed: PriceFeedSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            network: Network::Regtest,
            margin: MarginParams::default(),
            coordinator_leverages: (1..=5)
                .map(|l| CoordinatorLeverage {
                    trader_leverage: l,
                    coordinator_leverage: Decimal::from(l.min(2)),
                })
                .collect(),
            fees: FeeSettings::default(),
            channel: ChannelSettings::default(),
            rollover: RolloverSettings::default(),
            negotiation: NegotiationSettings::default(),
            retry: RetrySettings::default(),
            collab_revert: CollabRevertSettings::default(),
            events: EventSettings::default(),
            price_feed: PriceFeedSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    NotFound(String),

    #[error("could not read {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("yaml parse error: {0}")]
    Parse(String),

    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl Settings {
    // local development: short timeouts, fast retries
    pub fn regtest() -> Self {
        let mut settings = Self::default();
        settings.negotiation.timeout_ms = 2_000;
        settings.retry.base_backoff_ms = 50;
        settings.retry.max_backoff_ms = 1_000;
        settings.rollover.check_interval_secs = 10;
        settings
    }

    pub fn mainnet() -> Self {
        let mut settings = Self::default();
        settings.network = Network::Mainnet;
        settings.margin.maintenance_margin_rate = dec!(0.1);
        settings.retry.escalate_to_collab_revert = true;
        settings.retry.escalate_after_timeouts = 5;
        settings.retry.max_attempts = 8;
        settings.collab_revert.fee_rate_sats_vb = 10;
        settings.channel.fee_rate_sats_vb = 10;
        settings
    }

    pub fn max_leverage(&self) -> Leverage {
        self.margin.max_leverage
    }

    // Validate the configuration for internal consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mmr = self.margin.maintenance_margin_rate;
        if mmr < Decimal::ZERO || mmr >= Decimal::ONE {
            return Err(ConfigError::Invalid {
                field: "margin.maintenance_margin_rate",
                reason: "must be in [0, 1)".to_string(),
            });
        }

        if self.fees.matching_fee_rate < Decimal::ZERO || self.fees.matching_fee_rate > dec!(0.1) {
            return Err(ConfigError::Invalid {
                field: "fees.matching_fee_rate",
                reason: "must be in [0, 0.1]".to_string(),
            });
        }

        if self
            .fees
            .referral_tiers
            .iter()
            .any(|tier| tier.fee_rebate < Decimal::ZERO || tier.fee_rebate > Decimal::ONE)
        {
            return Err(ConfigError::Invalid {
                field: "fees.referral_tiers",
                reason: "rebate must be in [0, 1]".to_string(),
            });
        }

        if self.coordinator_leverages.iter().any(|row| row.coordinator_leverage < Decimal::ONE) {
            return Err(ConfigError::Invalid {
                field: "coordinator_leverages",
                reason: "coordinator leverage must be >= 1".to_string(),
            });
        }

        if self.negotiation.timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "negotiation.timeout_ms",
                reason: "must be positive".to_string(),
            });
        }

        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "retry.max_attempts",
                reason: "need at least one attempt".to_string(),
            });
        }

        if self.retry.base_backoff_ms > self.retry.max_backoff_ms {
            return Err(ConfigError::Invalid {
                field: "retry.base_backoff_ms",
                reason: "base backoff above max backoff".to_string(),
            });
        }

        if self.retry.escalate_to_collab_revert && self.retry.escalate_after_timeouts == 0 {
            return Err(ConfigError::Invalid {
                field: "retry.escalate_after_timeouts",
                reason: "must be positive when escalation is enabled".to_string(),
            });
        }

        if self.events.broadcast_capacity == 0 || self.events.history_size == 0 {
            return Err(ConfigError::Invalid {
                field: "events",
                reason: "buffers must be non-empty".to_string(),
            });
        }

        if self.rollover.test_window_hours <= 0 || self.rollover.test_window_hours >= 24 {
            return Err(ConfigError::Invalid {
                field: "rollover.test_window_hours",
                reason: "must be between 1 and 23".to_string(),
            });
        }

        Ok(())
    }
}

/// Loads `.env`, then the yaml file named by `DLC_CORE_CONFIG`. Falls back to
/// the regtest preset when the variable is unset.
pub fn load_settings() -> Result<Settings, ConfigError> {
    let _ = dotenvy::dotenv();
    match std::env::var(CONFIG_ENV_VAR) {
        Ok(path) => load_settings_from_path(Path::new(&path)),
        Err(_) => {
            let settings = Settings::regtest();
            settings.validate()?;
            Ok(settings)
        }
    }
}

pub fn load_settings_from_path(path: &Path) -> Result<Settings, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.display().to_string()));
    }
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    load_settings_from_str(&content)
}

pub fn load_settings_from_str(yaml: &str) -> Result<Settings, ConfigError> {
    let settings: Settings = serde_yaml::from_str(yaml).map_err(|e| ConfigError::Parse(e.to_string()))?;
    settings.validate()?;
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn presets_are_valid() {
        assert!(Settings::default().validate().is_ok());
        assert!(Settings::regtest().validate().is_ok());
        let mainnet = Settings::mainnet();
        assert!(mainnet.validate().is_ok());
        assert_eq!(mainnet.network, Network::Mainnet);
        assert!(mainnet.retry.escalate_to_collab_revert);
    }

    #[test]
    fn partial_yaml_fills_defaults() {
        let yaml = r#"
network: mainnet
fees:
  matching_fee_rate: 0.002
retry:
  max_attempts: 2
"#;
        let settings = load_settings_from_str(yaml).unwrap();
        assert_eq!(settings.network, Network::Mainnet);
        assert_eq!(settings.fees.matching_fee_rate, dec!(0.002));
        assert_eq!(settings.retry.max_attempts, 2);
        assert_eq!(settings.negotiation.timeout_ms, 30_000);
    }

    #[test]
    fn invalid_margin_rate_rejected() {
        let yaml = "margin:\n  max_leverage: 5\n  maintenance_margin_rate: 1.5\n";
        let result = load_settings_from_str(yaml);
        assert!(matches!(result, Err(ConfigError::Invalid { field: "margin.maintenance_margin_rate", .. })));
    }

    #[test]
    fn backoff_order_checked() {
        let mut settings = Settings::default();
        settings.retry.base_backoff_ms = 10_000;
        settings.retry.max_backoff_ms = 10;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn garbage_yaml_is_parse_error() {
        assert!(matches!(load_settings_from_str("network: [nope"), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "negotiation:\n  timeout_ms: 1234").unwrap();
        let settings = load_settings_from_path(file.path()).unwrap();
        assert_eq!(settings.negotiation.timeout_ms, 1234);
    }

    #[test]
    fn missing_file_reported() {
        let result = load_settings_from_path(Path::new("/definitely/not/here.yaml"));
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }
}
