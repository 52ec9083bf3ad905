//! Application configuration.

use std::path::Path;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use lotbot_core::MAX_PRICE_SCALE;
use lotbot_executor::{GateConfig, OrderMode};
use lotbot_feed::ReportLayout;
use lotbot_persistence::PersistenceConfig;
use lotbot_position::{ReconcileConfig, RiskConfig};

use crate::error::{AppError, AppResult};

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "LOTBOT_CONFIG";

/// Config file used when neither the CLI nor the environment names one.
pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

fn default_mode() -> OrderMode {
    OrderMode::Virtual
}

fn default_max_slippage_points() -> Decimal {
    Decimal::from(5)
}

fn default_sweep_interval_ms() -> u64 {
    1_000
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Order mode requested at startup. Real mode still needs a ready broker.
    #[serde(default = "default_mode")]
    pub mode: OrderMode,
    /// Slippage allowance attached to entry orders (points).
    #[serde(default = "default_max_slippage_points")]
    pub max_slippage_points: Decimal,
    /// Interval of the unconfirmed-order and orphan-fill sweep (ms).
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    #[serde(default)]
    pub report_layout: ReportLayout,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub gate: GateConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            max_slippage_points: default_max_slippage_points(),
            sweep_interval_ms: default_sweep_interval_ms(),
            report_layout: ReportLayout::default(),
            reconcile: ReconcileConfig::default(),
            risk: RiskConfig::default(),
            gate: GateConfig::default(),
            persistence: PersistenceConfig::default(),
        }
    }
}

impl AppConfig {
    /// Resolve and load configuration.
    ///
    /// Path precedence: `cli_path` > `LOTBOT_CONFIG` > `config/default.toml`.
    /// A missing default file yields the built-in defaults; a missing
    /// explicitly named file is an error.
    pub fn load(cli_path: Option<&str>) -> AppResult<Self> {
        let explicit = cli_path
            .map(str::to_string)
            .or_else(|| std::env::var(CONFIG_ENV).ok());

        match explicit {
            Some(path) => Self::from_file(&path),
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => Self::from_file(DEFAULT_CONFIG_PATH),
            None => {
                tracing::warn!(path = DEFAULT_CONFIG_PATH, "Config file not found, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Load from a specific file.
    pub fn from_file(path: &str) -> AppResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AppError::Config(format!("Failed to read config {path}: {e}")))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> AppResult<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| AppError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the components cannot work with.
    pub fn validate(&self) -> AppResult<()> {
        if self.risk.initial_stop_points <= Decimal::ZERO {
            return Err(AppError::Config(
                "risk.initial_stop_points must be positive".to_string(),
            ));
        }
        if self.risk.lot_rules.is_empty() {
            return Err(AppError::Config("risk.lot_rules must not be empty".to_string()));
        }
        for (i, rule) in self.risk.lot_rules.iter().enumerate() {
            if rule.pullback_ratio <= Decimal::ZERO || rule.pullback_ratio >= Decimal::ONE {
                return Err(AppError::Config(format!(
                    "risk.lot_rules[{i}].pullback_ratio must be in (0, 1)"
                )));
            }
        }
        if self.max_slippage_points < Decimal::ZERO {
            return Err(AppError::Config(
                "max_slippage_points must not be negative".to_string(),
            ));
        }
        if self.report_layout.price_scale > MAX_PRICE_SCALE {
            return Err(AppError::Config(format!(
                "report_layout.price_scale must be at most {MAX_PRICE_SCALE}"
            )));
        }
        if self.persistence.capacity == 0 {
            return Err(AppError::Config(
                "persistence.capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lotbot_persistence::StopPolicy;
    use rust_decimal_macros::dec;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.mode, OrderMode::Virtual);
        assert_eq!(config.risk.initial_stop_points, dec!(30));
        assert_eq!(config.persistence.stop_policy, StopPolicy::Drain);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = AppConfig::from_toml(
            r#"
            mode = "real"
            max_slippage_points = "3"

            [risk]
            initial_stop_points = "25"

            [persistence]
            capacity = 500
            stop_policy = "discard"

            [persistence.log]
            log_completion = true
            "#,
        )
        .unwrap();

        assert_eq!(config.mode, OrderMode::Real);
        assert_eq!(config.max_slippage_points, dec!(3));
        assert_eq!(config.risk.initial_stop_points, dec!(25));
        assert_eq!(config.risk.lot_rules.len(), 3);
        assert_eq!(config.persistence.capacity, 500);
        assert_eq!(config.persistence.batch_size, 64);
        assert_eq!(config.persistence.stop_policy, StopPolicy::Discard);
        assert!(config.persistence.log.log_completion);
        assert!(!config.persistence.log.log_schedule);
        assert_eq!(config.gate.confirm_timeout_ms, 10_000);
        assert_eq!(config.report_layout, ReportLayout::default());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = AppConfig::from_toml(
            r#"
            [risk]
            initial_stop_points = "0"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, AppError::Config(_)));

        let err = AppConfig::from_toml("mode = \"paper\"").unwrap_err();
        assert!(matches!(err, AppError::Config(_)));

        let err = AppConfig::from_toml(
            r#"
            [report_layout]
            price_scale = 29
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, AppError::Config(m) if m.contains("price_scale")));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bot.toml");
        std::fs::write(&path, "sweep_interval_ms = 250\n").unwrap();

        let config = AppConfig::from_file(path.to_str().unwrap()).unwrap();
        assert_eq!(config.sweep_interval_ms, 250);

        let missing = dir.path().join("missing.toml");
        assert!(AppConfig::load(missing.to_str()).is_err());
    }

    #[test]
    fn test_shipped_default_file_matches_defaults() {
        let config = AppConfig::from_toml(include_str!("../../../config/default.toml")).unwrap();
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn test_config_serialization() {
        let toml_str = toml::to_string(&AppConfig::default()).unwrap();
        assert!(toml_str.contains("mode"));
        assert!(toml_str.contains("[persistence]"));
    }
}
