use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::{env, fs, path::Path};

/// Where the loss stage takes each wallet's exposure from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceSource {
    /// Pre-run balance reconstructed from on-chain flows.
    #[default]
    Reconstructed,
    /// Balance reported by the data collaborator, supplied alongside the inputs.
    Reported,
}

/// Immutable pipeline configuration threaded through every stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PanelConfig {
    #[serde(default = "default_market_contract")]
    pub market_contract: String,
    #[serde(default = "default_aust_contract")]
    pub aust_contract: String,
    #[serde(default = "default_history_start")]
    pub history_start: DateTime<Utc>,
    #[serde(default = "default_window_start")]
    pub window_start: DateTime<Utc>,
    #[serde(default = "default_window_end")]
    pub window_end: DateTime<Utc>,
    #[serde(default = "default_run_start")]
    pub run_start: DateTime<Utc>,
    #[serde(default = "default_run_end")]
    pub run_end: DateTime<Utc>,
    #[serde(default = "default_exit_threshold")]
    pub exit_threshold: f64,
    #[serde(default = "default_whale_top_pct")]
    pub whale_top_pct: f64,
    #[serde(default = "default_size_quantiles")]
    pub size_quantiles: u32,
    #[serde(default = "default_lags")]
    pub lags: Vec<usize>,
    #[serde(default)]
    pub hac_max_lags: Option<usize>,
    #[serde(default = "default_event_window")]
    pub event_window: i64,
    #[serde(default = "default_whale_event_quantile")]
    pub whale_event_quantile: f64,
    #[serde(default = "default_hazard_penalizer")]
    pub hazard_penalizer: f64,
    #[serde(default = "default_hazard_max_iter")]
    pub hazard_max_iter: usize,
    #[serde(default = "default_hazard_tolerance")]
    pub hazard_tolerance: f64,
    #[serde(default = "default_min_hazard_wallets")]
    pub min_hazard_wallets: usize,
    #[serde(default = "default_max_skip_rate")]
    pub max_skip_rate: f64,
    #[serde(default = "default_min_records_for_skip_check")]
    pub min_records_for_skip_check: u64,
    #[serde(default = "default_ust_decimals")]
    pub ust_decimals: u32,
    #[serde(default)]
    pub balance_source: BalanceSource,
    #[serde(default = "default_early_quantile")]
    pub early_quantile: f64,
    #[serde(default = "default_late_quantile")]
    pub late_quantile: f64,
}

fn utc(y: i32, m: u32, d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, 0, 0, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

fn default_market_contract() -> String {
    "terra1sepfj7s0aeg5967uxnfk4thzlerrsktkpelm5s".to_string()
}

fn default_aust_contract() -> String {
    "terra1hzh9vpxhsk8253se0vv5jj6etdvxu3nv8z07zu".to_string()
}

fn default_history_start() -> DateTime<Utc> {
    utc(2022, 1, 1)
}

fn default_window_start() -> DateTime<Utc> {
    utc(2022, 4, 1)
}

fn default_window_end() -> DateTime<Utc> {
    utc(2022, 5, 31)
}

fn default_run_start() -> DateTime<Utc> {
    utc(2022, 5, 7)
}

fn default_run_end() -> DateTime<Utc> {
    utc(2022, 5, 16)
}

fn default_exit_threshold() -> f64 {
    0.5
}

fn default_whale_top_pct() -> f64 {
    0.01
}

fn default_size_quantiles() -> u32 {
    10
}

fn default_lags() -> Vec<usize> {
    (0..=6).collect()
}

fn default_event_window() -> i64 {
    12
}

fn default_whale_event_quantile() -> f64 {
    0.99
}

fn default_hazard_penalizer() -> f64 {
    0.1
}

fn default_hazard_max_iter() -> usize {
    50
}

fn default_hazard_tolerance() -> f64 {
    1e-9
}

fn default_min_hazard_wallets() -> usize {
    5
}

fn default_max_skip_rate() -> f64 {
    0.25
}

fn default_min_records_for_skip_check() -> u64 {
    50
}

fn default_ust_decimals() -> u32 {
    6
}

fn default_early_quantile() -> f64 {
    0.25
}

fn default_late_quantile() -> f64 {
    0.75
}

impl Default for PanelConfig {
    fn default() -> Self {
        Self {
            market_contract: default_market_contract(),
            aust_contract: default_aust_contract(),
            history_start: default_history_start(),
            window_start: default_window_start(),
            window_end: default_window_end(),
            run_start: default_run_start(),
            run_end: default_run_end(),
            exit_threshold: default_exit_threshold(),
            whale_top_pct: default_whale_top_pct(),
            size_quantiles: default_size_quantiles(),
            lags: default_lags(),
            hac_max_lags: None,
            event_window: default_event_window(),
            whale_event_quantile: default_whale_event_quantile(),
            hazard_penalizer: default_hazard_penalizer(),
            hazard_max_iter: default_hazard_max_iter(),
            hazard_tolerance: default_hazard_tolerance(),
            min_hazard_wallets: default_min_hazard_wallets(),
            max_skip_rate: default_max_skip_rate(),
            min_records_for_skip_check: default_min_records_for_skip_check(),
            ust_decimals: default_ust_decimals(),
            balance_source: BalanceSource::default(),
            early_quantile: default_early_quantile(),
            late_quantile: default_late_quantile(),
        }
    }
}

impl PanelConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let data = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read {}", path.as_ref().display()))?;
        Self::from_toml_str(&data)
    }

    pub fn from_toml_str(data: &str) -> Result<Self> {
        let mut raw: toml::Value =
            toml::from_str(data).with_context(|| "Failed to parse TOML config")?;
        // Support nested [panel] tables or top-level entries.
        let table = if let Some(table) = raw
            .get_mut("panel")
            .and_then(|v| v.as_table_mut())
            .cloned()
        {
            table
        } else {
            raw.try_into()
                .map_err(|_| anyhow::anyhow!("Invalid panel config structure"))?
        };
        let mut cfg: PanelConfig = toml::from_str(&toml::to_string(&table)?)?;
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) {
        // Robustness runs flip these without editing the file.
        override_f64("RUNPANEL_EXIT_THRESHOLD", &mut self.exit_threshold);
        override_f64("RUNPANEL_WHALE_TOP_PCT", &mut self.whale_top_pct);
        override_f64("RUNPANEL_HAZARD_PENALIZER", &mut self.hazard_penalizer);
        override_f64("RUNPANEL_MAX_SKIP_RATE", &mut self.max_skip_rate);
        override_f64(
            "RUNPANEL_WHALE_EVENT_QUANTILE",
            &mut self.whale_event_quantile,
        );
        if let Ok(value) = env::var("RUNPANEL_MAX_LAG") {
            if let Ok(parsed) = value.parse::<usize>() {
                self.lags = (0..=parsed).collect();
            }
        }
        if let Ok(value) = env::var("RUNPANEL_BALANCE_SOURCE") {
            match value.to_ascii_lowercase().as_str() {
                "reconstructed" => self.balance_source = BalanceSource::Reconstructed,
                "reported" => self.balance_source = BalanceSource::Reported,
                _ => {}
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.exit_threshold > 0.0 && self.exit_threshold <= 1.0,
            "exit_threshold must be within (0, 1]"
        );
        anyhow::ensure!(
            self.whale_top_pct > 0.0 && self.whale_top_pct <= 0.5,
            "whale_top_pct must be within (0, 0.5]"
        );
        anyhow::ensure!(
            self.history_start <= self.window_start
                && self.window_start <= self.run_start
                && self.run_start < self.run_end
                && self.run_end <= self.window_end,
            "windows must satisfy history_start <= window_start <= run_start < run_end <= window_end"
        );
        anyhow::ensure!(self.size_quantiles >= 2, "size_quantiles must be at least 2");
        anyhow::ensure!(!self.lags.is_empty(), "lags must not be empty");
        anyhow::ensure!(self.event_window >= 0, "event_window must be non-negative");
        anyhow::ensure!(
            (0.0..=1.0).contains(&self.whale_event_quantile),
            "whale_event_quantile must be within [0, 1]"
        );
        anyhow::ensure!(
            self.hazard_penalizer >= 0.0,
            "hazard_penalizer must be non-negative"
        );
        anyhow::ensure!(self.hazard_max_iter > 0, "hazard_max_iter must be positive");
        anyhow::ensure!(
            (0.0..=1.0).contains(&self.max_skip_rate),
            "max_skip_rate must be within [0, 1]"
        );
        anyhow::ensure!(self.ust_decimals <= 18, "ust_decimals must be at most 18");
        anyhow::ensure!(
            0.0 < self.early_quantile
                && self.early_quantile < self.late_quantile
                && self.late_quantile < 1.0,
            "exit bucket quantiles must satisfy 0 < early < late < 1"
        );
        Ok(())
    }

    pub fn max_lag(&self) -> usize {
        self.lags.iter().copied().max().unwrap_or(0)
    }

    pub fn hac_lags(&self) -> usize {
        self.hac_max_lags.unwrap_or_else(|| self.max_lag())
    }

    /// Number of hours in the run window, used as the censoring duration.
    pub fn run_hours(&self) -> f64 {
        (self.run_end - self.run_start).num_hours() as f64
    }

    pub fn micro_scale(&self) -> f64 {
        10f64.powi(self.ust_decimals as i32)
    }
}

fn override_f64(key: &str, field: &mut f64) {
    if let Ok(value) = env::var(key) {
        if let Ok(parsed) = value.parse::<f64>() {
            *field = parsed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let cfg = PanelConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.max_lag(), 6);
        assert_eq!(cfg.hac_lags(), 6);
        assert_eq!(cfg.run_hours(), 9.0 * 24.0);
    }

    #[test]
    fn test_nested_table_and_defaults() {
        let cfg = PanelConfig::from_toml_str(
            r#"
            [panel]
            exit_threshold = 0.3
            lags = [0, 1, 2]
            run_start = "2022-05-08T00:00:00Z"
            balance_source = "reported"
            "#,
        )
        .unwrap();
        assert!((cfg.exit_threshold - 0.3).abs() < 1e-12);
        assert_eq!(cfg.max_lag(), 2);
        assert_eq!(cfg.balance_source, BalanceSource::Reported);
        assert_eq!(cfg.whale_top_pct, 0.01);
    }

    #[test]
    fn test_rejects_inverted_windows() {
        let result = PanelConfig::from_toml_str(
            r#"
            run_start = "2022-05-20T00:00:00Z"
            run_end = "2022-05-10T00:00:00Z"
            "#,
        );
        assert!(result.is_err());
    }
}
