//! Engine configuration with profile support.
//!
//! Provides centralized configuration for all cascade parameters with
//! support for different profiles (testing, production, aggressive).

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;

/// Main configuration structure containing all engine parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Profile name (for logging/identification)
    #[serde(default = "default_profile_name")]
    pub profile: String,

    /// Cascade sizing and pacing
    #[serde(default)]
    pub cascade: CascadeConfig,

    /// LTV thresholds and staleness policy
    #[serde(default)]
    pub risk: RiskConfig,

    /// Monitor loop timing
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Liquidation execution parameters
    #[serde(default)]
    pub liquidation: LiquidationConfig,
}

fn default_profile_name() -> String {
    "default".to_string()
}

/// Cascade planning and build parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CascadeConfig {
    /// Maximum number of cascade levels
    #[serde(default = "default_max_levels")]
    pub max_cascade_levels: usize,

    /// Headroom multiplier applied to a tier's max LTV when sizing a loan
    #[serde(default = "default_safety_factor")]
    pub safety_factor: f64,

    /// Smallest borrow (base currency) worth opening a level for
    #[serde(default = "default_min_trade_size")]
    pub min_trade_size: f64,

    /// Upper bound on `start` capital
    #[serde(default = "default_max_initial_capital")]
    pub max_initial_capital: f64,

    /// Base (quote and loan) currency
    #[serde(default = "default_base_asset")]
    pub base_asset: String,

    /// Pause between levels to stay under exchange rate limits (milliseconds)
    #[serde(default = "default_level_delay")]
    pub level_delay_ms: u64,

    /// Park the last level's un-reinvested loan in flexible savings
    #[serde(default)]
    pub deposit_idle_to_savings: bool,
}

fn default_max_levels() -> usize {
    5
}
fn default_safety_factor() -> f64 {
    0.9
}
fn default_min_trade_size() -> f64 {
    10.0
}
fn default_max_initial_capital() -> f64 {
    10_000.0
}
fn default_base_asset() -> String {
    "USDT".to_string()
}
fn default_level_delay() -> u64 {
    1000
}

impl Default for CascadeConfig {
    fn default() -> Self {
        Self {
            max_cascade_levels: default_max_levels(),
            safety_factor: default_safety_factor(),
            min_trade_size: default_min_trade_size(),
            max_initial_capital: default_max_initial_capital(),
            base_asset: default_base_asset(),
            level_delay_ms: default_level_delay(),
            deposit_idle_to_savings: false,
        }
    }
}

impl CascadeConfig {
    pub fn level_delay(&self) -> Duration {
        Duration::from_millis(self.level_delay_ms)
    }
}

/// Risk thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskConfig {
    /// LTV at which a position is flagged (WARNING)
    #[serde(default = "default_warn_ltv")]
    pub warn_ltv: f64,

    /// LTV at which the deepest position is partially unwound (REDUCE)
    #[serde(default = "default_reduce_ltv")]
    pub reduce_ltv: f64,

    /// LTV at which everything is liquidated (EMERGENCY)
    #[serde(default = "default_emergency_ltv")]
    pub emergency_ltv: f64,

    /// Consecutive missed quotes before a position is forced to EMERGENCY
    #[serde(default = "default_staleness_limit")]
    pub staleness_limit: u32,

    /// Account margin level below which the portfolio is at least REDUCE
    #[serde(default = "default_margin_level_reduce")]
    pub margin_level_reduce: f64,

    /// Account margin level below which the portfolio is EMERGENCY
    #[serde(default = "default_margin_level_emergency")]
    pub margin_level_emergency: f64,
}

fn default_warn_ltv() -> f64 {
    0.75
}
fn default_reduce_ltv() -> f64 {
    0.80
}
fn default_emergency_ltv() -> f64 {
    0.85
}
fn default_staleness_limit() -> u32 {
    3
}
fn default_margin_level_reduce() -> f64 {
    1.5
}
fn default_margin_level_emergency() -> f64 {
    1.2
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            warn_ltv: default_warn_ltv(),
            reduce_ltv: default_reduce_ltv(),
            emergency_ltv: default_emergency_ltv(),
            staleness_limit: default_staleness_limit(),
            margin_level_reduce: default_margin_level_reduce(),
            margin_level_emergency: default_margin_level_emergency(),
        }
    }
}

/// Monitor loop timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Interval between risk ticks (seconds)
    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    /// Per-quote timeout inside a tick (milliseconds)
    #[serde(default = "default_quote_timeout")]
    pub quote_timeout_ms: u64,
}

fn default_interval() -> u64 {
    30
}
fn default_quote_timeout() -> u64 {
    5000
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval(),
            quote_timeout_ms: default_quote_timeout(),
        }
    }
}

impl MonitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
    pub fn quote_timeout(&self) -> Duration {
        Duration::from_millis(self.quote_timeout_ms)
    }
}

/// Liquidation execution parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiquidationConfig {
    /// Fraction of the deepest position unwound on REDUCE
    #[serde(default = "default_partial_fraction")]
    pub partial_fraction: f64,

    /// Sell released collateral on emergency liquidation
    #[serde(default = "default_emergency_cash_out")]
    pub emergency_cash_out: bool,

    /// Extra collateral sold when covering a repay shortfall (percentage)
    #[serde(default = "default_repay_buffer")]
    pub repay_buffer_pct: f64,
}

fn default_partial_fraction() -> f64 {
    0.3
}
fn default_emergency_cash_out() -> bool {
    true
}
fn default_repay_buffer() -> f64 {
    1.0
}

impl Default for LiquidationConfig {
    fn default() -> Self {
        Self {
            partial_fraction: default_partial_fraction(),
            emergency_cash_out: default_emergency_cash_out(),
            repay_buffer_pct: default_repay_buffer(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            profile: default_profile_name(),
            cascade: CascadeConfig::default(),
            risk: RiskConfig::default(),
            monitor: MonitorConfig::default(),
            liquidation: LiquidationConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Create a testing profile: fast ticks, no pacing, tiny trades allowed.
    pub fn testing() -> Self {
        Self {
            profile: "testing".to_string(),
            cascade: CascadeConfig {
                min_trade_size: 1.0,
                level_delay_ms: 0,
                ..Default::default()
            },
            risk: RiskConfig::default(),
            monitor: MonitorConfig {
                interval_secs: 1,
                quote_timeout_ms: 500,
            },
            liquidation: LiquidationConfig::default(),
        }
    }

    /// Create a production profile with conservative settings.
    pub fn production() -> Self {
        Self {
            profile: "production".to_string(),
            cascade: CascadeConfig {
                max_cascade_levels: 3,
                safety_factor: 0.8,
                min_trade_size: 100.0, // $100 minimum level
                ..Default::default()
            },
            risk: RiskConfig {
                warn_ltv: 0.65,
                reduce_ltv: 0.70,
                emergency_ltv: 0.75,
                staleness_limit: 2,
                ..Default::default()
            },
            monitor: MonitorConfig::default(),
            liquidation: LiquidationConfig {
                partial_fraction: 0.25,
                ..Default::default()
            },
        }
    }

    /// Create an aggressive profile: deeper cascade, thinner headroom.
    pub fn aggressive() -> Self {
        Self {
            profile: "aggressive".to_string(),
            cascade: CascadeConfig {
                safety_factor: 0.95,
                min_trade_size: 5.0,
                level_delay_ms: 250,
                ..Default::default()
            },
            risk: RiskConfig {
                staleness_limit: 5,
                ..Default::default()
            },
            monitor: MonitorConfig {
                interval_secs: 10,
                quote_timeout_ms: 2000,
            },
            liquidation: LiquidationConfig::default(),
        }
    }

    /// Get profile from environment variable CASCADE_PROFILE, or default.
    /// Supported values: testing, production, aggressive
    pub fn from_env() -> Self {
        let profile = std::env::var("CASCADE_PROFILE").unwrap_or_else(|_| "default".to_string());
        match profile.to_lowercase().as_str() {
            "testing" | "test" => Self::testing(),
            "production" | "prod" => Self::production(),
            "aggressive" | "aggro" => Self::aggressive(),
            _ => Self::default(),
        }
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let r = &self.risk;
        if !(0.0 < r.warn_ltv && r.warn_ltv < r.reduce_ltv && r.reduce_ltv < r.emergency_ltv) {
            return Err(ConfigError::Thresholds {
                warn: r.warn_ltv,
                reduce: r.reduce_ltv,
                emergency: r.emergency_ltv,
            });
        }
        if r.staleness_limit == 0 {
            return Err(ConfigError::invalid("risk.staleness_limit", "must be at least 1"));
        }
        if r.margin_level_emergency > r.margin_level_reduce {
            return Err(ConfigError::invalid(
                "risk.margin_level_emergency",
                "must not exceed risk.margin_level_reduce",
            ));
        }

        let c = &self.cascade;
        if c.max_cascade_levels == 0 {
            return Err(ConfigError::invalid("cascade.max_cascade_levels", "must be at least 1"));
        }
        if !(c.safety_factor > 0.0 && c.safety_factor <= 1.0) {
            return Err(ConfigError::invalid("cascade.safety_factor", "must be in (0, 1]"));
        }
        if c.min_trade_size <= 0.0 {
            return Err(ConfigError::invalid("cascade.min_trade_size", "must be positive"));
        }
        if c.max_initial_capital <= 0.0 {
            return Err(ConfigError::invalid("cascade.max_initial_capital", "must be positive"));
        }
        if c.base_asset.is_empty() {
            return Err(ConfigError::invalid("cascade.base_asset", "must not be empty"));
        }

        let l = &self.liquidation;
        if !(l.partial_fraction > 0.0 && l.partial_fraction <= 1.0) {
            return Err(ConfigError::invalid("liquidation.partial_fraction", "must be in (0, 1]"));
        }
        if l.repay_buffer_pct < 0.0 {
            return Err(ConfigError::invalid("liquidation.repay_buffer_pct", "must not be negative"));
        }

        if self.monitor.interval_secs == 0 {
            return Err(ConfigError::invalid("monitor.interval_secs", "must be at least 1"));
        }

        Ok(())
    }

    /// Log the current configuration.
    pub fn log_config(&self) {
        tracing::info!(profile = %self.profile, "Engine configuration loaded");
        tracing::info!(
            max_levels = self.cascade.max_cascade_levels,
            safety_factor = self.cascade.safety_factor,
            min_trade_size = self.cascade.min_trade_size,
            max_initial_capital = self.cascade.max_initial_capital,
            base_asset = %self.cascade.base_asset,
            level_delay_ms = self.cascade.level_delay_ms,
            "Cascade parameters"
        );
        tracing::info!(
            warn = self.risk.warn_ltv,
            reduce = self.risk.reduce_ltv,
            emergency = self.risk.emergency_ltv,
            staleness_limit = self.risk.staleness_limit,
            "Risk LTV thresholds"
        );
        tracing::info!(
            interval_secs = self.monitor.interval_secs,
            quote_timeout_ms = self.monitor.quote_timeout_ms,
            "Monitor timing"
        );
        tracing::info!(
            partial_fraction = self.liquidation.partial_fraction,
            emergency_cash_out = self.liquidation.emergency_cash_out,
            repay_buffer_pct = self.liquidation.repay_buffer_pct,
            "Liquidation parameters"
        );
    }
}
