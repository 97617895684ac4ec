use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Full engine configuration. Every section has working defaults; a TOML
/// file overrides them and credentials come from the environment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub scanner: ScannerSettings,
    pub evaluator: EvaluatorSettings,
    pub executor: ExecutorSettings,
    pub exit: ExitSettings,
    pub store: StoreSettings,
    pub reconciler: ReconcilerSettings,
    pub pattern_config_path: Option<PathBuf>,
    pub database_url: Option<String>,
}

impl AppConfig {
    pub fn load(path: Option<&str>) -> anyhow::Result<Self> {
        let config = match path {
            Some(path) if std::path::Path::new(path).exists() => {
                let raw = std::fs::read_to_string(path)?;
                toml::from_str(&raw)?
            }
            _ => AppConfig::default(),
        };
        if let Err(errors) = config.validate() {
            anyhow::bail!("invalid configuration: {}", errors.join(", "));
        }
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.scanner.max_scan_stocks == 0 {
            errors.push("scanner.max_scan_stocks must be > 0".to_string());
        }
        if self.scanner.min_price >= self.scanner.max_price {
            errors.push("scanner.min_price must be < scanner.max_price".to_string());
        }
        if self.scanner.batch_size == 0 {
            errors.push("scanner.batch_size must be > 0".to_string());
        }

        if !(0.0..=100.0).contains(&self.evaluator.buy_threshold)
            || self.evaluator.buy_threshold > self.evaluator.strong_buy_threshold
        {
            errors.push("evaluator buy thresholds must satisfy 0 <= buy <= strong_buy <= 100".to_string());
        }
        if self.evaluator.sell_threshold > self.evaluator.strong_sell_threshold {
            errors.push("evaluator sell thresholds must satisfy sell <= strong_sell".to_string());
        }
        if !(0.0..=1.0).contains(&self.evaluator.min_pattern_confidence) {
            errors.push("evaluator.min_pattern_confidence must be within [0, 1]".to_string());
        }

        if self.executor.max_single_investment_ratio <= 0.0
            || self.executor.max_single_investment_ratio > 1.0
        {
            errors.push("executor.max_single_investment_ratio must be within (0, 1]".to_string());
        }
        if self.executor.available_amount_ratio <= 0.0 || self.executor.available_amount_ratio > 1.0 {
            errors.push("executor.available_amount_ratio must be within (0, 1]".to_string());
        }

        if crate::config::parse_hhmm(&self.exit.trading_start).is_none()
            || crate::config::parse_hhmm(&self.exit.trading_end).is_none()
        {
            errors.push("exit trading window times must be HH:MM".to_string());
        }

        if self.store.max_positions == 0 {
            errors.push("store.max_positions must be > 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerSettings {
    pub scan_interval_secs: u64,
    pub max_scan_stocks: usize,
    /// Minimum day gain (%) for the fluctuation ranking pull.
    pub min_fluctuation_rate: f64,
    pub min_price: i64,
    pub max_price: i64,
    pub min_volume: u64,
    pub batch_size: usize,
    pub batch_pause_ms: u64,
}

impl Default for ScannerSettings {
    fn default() -> Self {
        Self {
            scan_interval_secs: 60,
            max_scan_stocks: 50,
            min_fluctuation_rate: 1.0,
            min_price: 1_000,
            max_price: 500_000,
            min_volume: 10_000,
            batch_size: 5,
            batch_pause_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluatorSettings {
    pub strong_buy_threshold: f64,
    pub buy_threshold: f64,
    pub strong_sell_threshold: f64,
    pub sell_threshold: f64,
    pub min_pattern_confidence: f64,
    pub min_volume_ratio: f64,
    /// Minimum daily traded value in KRW for the entry gate.
    pub min_daily_volume_krw: i64,
    pub rsi_overbought: f64,
    pub batch_size: usize,
    pub batch_pause_ms: u64,
}

impl Default for EvaluatorSettings {
    fn default() -> Self {
        Self {
            strong_buy_threshold: 85.0,
            buy_threshold: 70.0,
            strong_sell_threshold: 80.0,
            sell_threshold: 60.0,
            min_pattern_confidence: 0.6,
            min_volume_ratio: 1.2,
            min_daily_volume_krw: 1_000_000_000,
            rsi_overbought: 65.0,
            batch_size: 5,
            batch_pause_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorSettings {
    pub min_order_interval_secs: i64,
    pub min_investment_krw: i64,
    pub max_single_investment_ratio: f64,
    /// Share of the reported buyable amount treated as investable.
    pub available_amount_ratio: f64,
    /// Fallback share of raw cash when the buyable amount is missing.
    pub cash_usage_ratio: f64,
    pub max_priority_multiplier: f64,
    pub base_priority_multiplier: f64,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            min_order_interval_secs: 300,
            min_investment_krw: 100_000,
            max_single_investment_ratio: 0.4,
            available_amount_ratio: 0.9,
            cash_usage_ratio: 0.8,
            max_priority_multiplier: 1.5,
            base_priority_multiplier: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExitSettings {
    pub trading_start: String,
    pub trading_end: String,
    pub min_profit_for_time_exit_pct: f64,
    pub subscription_release_grace_secs: u64,
}

impl Default for ExitSettings {
    fn default() -> Self {
        Self {
            trading_start: "09:00".to_string(),
            trading_end: "15:20".to_string(),
            min_profit_for_time_exit_pct: 1.0,
            subscription_release_grace_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    pub max_watched: usize,
    pub max_positions: usize,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            max_watched: 100,
            max_positions: 15,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerSettings {
    pub pending_order_timeout_secs: i64,
    pub balance_check_interval_secs: u64,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            pending_order_timeout_secs: 600,
            balance_check_interval_secs: 300,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(AppConfig::default().validate().is_ok());
    }

    #[test]
    fn inverted_thresholds_are_rejected() {
        let mut config = AppConfig::default();
        config.evaluator.buy_threshold = 90.0;
        config.evaluator.strong_buy_threshold = 80.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn bad_trading_window_is_rejected() {
        let mut config = AppConfig::default();
        config.exit.trading_start = "9am".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn toml_overrides_partial_sections() {
        let raw = r#"
            [scanner]
            max_scan_stocks = 25

            [store]
            max_positions = 7
        "#;
        let config: AppConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.scanner.max_scan_stocks, 25);
        assert_eq!(config.store.max_positions, 7);
        // Untouched sections keep defaults.
        assert_eq!(config.executor.min_order_interval_secs, 300);
    }
}
