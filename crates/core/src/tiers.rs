//! Tiered asset table for cascade collateral.
//!
//! Each asset belongs to a liquidity tier (1 = most liquid). Deeper cascade
//! levels move to higher tiers, which carry a lower maximum LTV.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::ConfigError;

/// Lowest (most liquid) tier number.
pub const MIN_TIER: u8 = 1;
/// Highest (least liquid) tier number.
pub const MAX_TIER: u8 = 4;

/// Static configuration of one collateral asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetConfig {
    /// Asset symbol (e.g., "BTC")
    pub symbol: String,
    /// Liquidity tier, 1..=4
    pub tier: u8,
    /// Maximum loan-to-value as a fraction (e.g., 0.70)
    pub max_ltv: f64,
    /// Annualized collateral yield
    pub yield_rate: f64,
    /// Annualized loan interest
    pub loan_rate: f64,
    /// Relative volatility, informational
    #[serde(default)]
    pub volatility_factor: f64,
    /// Whether the asset may be selected
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_true() -> bool {
    true
}

impl AssetConfig {
    pub fn new(symbol: &str, tier: u8, max_ltv: f64, yield_rate: f64, loan_rate: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            tier,
            max_ltv,
            yield_rate,
            loan_rate,
            volatility_factor: 0.0,
            active: true,
        }
    }

    pub fn with_volatility(mut self, volatility_factor: f64) -> Self {
        self.volatility_factor = volatility_factor;
        self
    }

    /// Annualized carry: collateral yield minus loan cost.
    pub fn net_yield(&self) -> f64 {
        self.yield_rate - self.loan_rate
    }
}

/// Ordered, read-only table of cascade assets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierTable {
    pub assets: Vec<AssetConfig>,
}

impl TierTable {
    pub fn new(assets: Vec<AssetConfig>) -> Self {
        Self { assets }
    }

    pub fn get(&self, symbol: &str) -> Option<&AssetConfig> {
        self.assets.iter().find(|a| a.symbol == symbol)
    }

    pub fn active_assets(&self) -> impl Iterator<Item = &AssetConfig> {
        self.assets.iter().filter(|a| a.active)
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }

    pub fn len(&self) -> usize {
        self.assets.len()
    }

    /// Check per-asset bounds and that max LTV strictly decreases with tier.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for asset in &self.assets {
            if !seen.insert(asset.symbol.as_str()) {
                return Err(ConfigError::invalid(
                    format!("assets.{}", asset.symbol),
                    "duplicate symbol",
                ));
            }
            if !(MIN_TIER..=MAX_TIER).contains(&asset.tier) {
                return Err(ConfigError::invalid(
                    format!("assets.{}.tier", asset.symbol),
                    format!("must be in {}..={}", MIN_TIER, MAX_TIER),
                ));
            }
            if !(asset.max_ltv > 0.0 && asset.max_ltv < 1.0) {
                return Err(ConfigError::invalid(
                    format!("assets.{}.max_ltv", asset.symbol),
                    "must be in (0, 1)",
                ));
            }
            if asset.yield_rate < 0.0 || asset.loan_rate < 0.0 {
                return Err(ConfigError::invalid(
                    format!("assets.{}", asset.symbol),
                    "rates must be non-negative",
                ));
            }
        }

        // Every asset of a tier must sit strictly below every asset of a lower tier
        for tier in MIN_TIER + 1..=MAX_TIER {
            let Some(current_max) = self.tier_ltv_bound(tier, f64::max) else {
                continue;
            };
            let Some((prev_tier, prev_min)) = (MIN_TIER..tier)
                .rev()
                .find_map(|t| self.tier_ltv_bound(t, f64::min).map(|ltv| (t, ltv)))
            else {
                continue;
            };
            if current_max >= prev_min {
                return Err(ConfigError::TierOrdering {
                    tier,
                    max_ltv: current_max,
                    prev_tier,
                    prev_max_ltv: prev_min,
                });
            }
        }
        Ok(())
    }

    fn tier_ltv_bound(&self, tier: u8, pick: fn(f64, f64) -> f64) -> Option<f64> {
        self.assets
            .iter()
            .filter(|a| a.tier == tier)
            .map(|a| a.max_ltv)
            .reduce(pick)
    }
}

impl Default for TierTable {
    /// Built-in table: one major per tier.
    fn default() -> Self {
        Self::new(vec![
            AssetConfig::new("BTC", 1, 0.70, 0.030, 0.020).with_volatility(0.25),
            AssetConfig::new("ETH", 2, 0.60, 0.035, 0.022).with_volatility(0.28),
            AssetConfig::new("BNB", 3, 0.50, 0.040, 0.025).with_volatility(0.30),
            AssetConfig::new("SOL", 4, 0.40, 0.050, 0.030).with_volatility(0.45),
        ])
    }
}

/// Pick the asset for the next level.
///
/// Lowest tier among active assets not in `used`, ties broken by highest
/// yield and then by symbol so the choice is deterministic.
pub fn select_asset<'a>(table: &'a TierTable, used: &HashSet<String>) -> Option<&'a AssetConfig> {
    table
        .active_assets()
        .filter(|a| !used.contains(&a.symbol))
        .min_by(|a, b| {
            a.tier
                .cmp(&b.tier)
                .then_with(|| b.yield_rate.total_cmp(&a.yield_rate))
                .then_with(|| a.symbol.cmp(&b.symbol))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn used(symbols: &[&str]) -> HashSet<String> {
        symbols.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_default_table_is_valid() {
        let table = TierTable::default();
        assert_eq!(table.len(), 4);
        assert!(table.validate().is_ok());
        assert_eq!(table.get("BTC").map(|a| a.tier), Some(1));
    }

    #[test]
    fn test_select_lowest_tier_first() {
        let table = TierTable::default();
        assert_eq!(select_asset(&table, &used(&[])).unwrap().symbol, "BTC");
        assert_eq!(select_asset(&table, &used(&["BTC"])).unwrap().symbol, "ETH");
        assert_eq!(
            select_asset(&table, &used(&["BTC", "ETH", "BNB"])).unwrap().symbol,
            "SOL"
        );
        assert!(select_asset(&table, &used(&["BTC", "ETH", "BNB", "SOL"])).is_none());
    }

    #[test]
    fn test_select_tie_broken_by_yield() {
        let table = TierTable::new(vec![
            AssetConfig::new("ETH", 1, 0.65, 0.035, 0.02),
            AssetConfig::new("BTC", 1, 0.70, 0.030, 0.02),
            AssetConfig::new("BNB", 2, 0.50, 0.090, 0.02),
        ]);
        assert_eq!(select_asset(&table, &used(&[])).unwrap().symbol, "ETH");
        assert_eq!(select_asset(&table, &used(&["ETH"])).unwrap().symbol, "BTC");
    }

    #[test]
    fn test_select_skips_inactive() {
        let mut table = TierTable::default();
        table.assets[0].active = false;
        assert_eq!(select_asset(&table, &used(&[])).unwrap().symbol, "ETH");
    }

    #[test]
    fn test_validate_rejects_non_decreasing_ltv() {
        let table = TierTable::new(vec![
            AssetConfig::new("BTC", 1, 0.50, 0.03, 0.02),
            AssetConfig::new("ETH", 2, 0.60, 0.03, 0.02),
        ]);
        assert!(matches!(
            table.validate(),
            Err(ConfigError::TierOrdering { tier: 2, prev_tier: 1, .. })
        ));
    }

    #[test]
    fn test_validate_rejects_bad_fields() {
        let bad_tier = TierTable::new(vec![AssetConfig::new("X", 5, 0.5, 0.0, 0.0)]);
        assert!(bad_tier.validate().is_err());

        let bad_ltv = TierTable::new(vec![AssetConfig::new("X", 1, 1.0, 0.0, 0.0)]);
        assert!(bad_ltv.validate().is_err());

        let bad_rate = TierTable::new(vec![AssetConfig::new("X", 1, 0.5, -0.01, 0.0)]);
        assert!(bad_rate.validate().is_err());

        let dup = TierTable::new(vec![
            AssetConfig::new("X", 1, 0.5, 0.0, 0.0),
            AssetConfig::new("X", 2, 0.4, 0.0, 0.0),
        ]);
        assert!(dup.validate().is_err());
    }

    #[test]
    fn test_validate_allows_tier_gaps() {
        let table = TierTable::new(vec![
            AssetConfig::new("BTC", 1, 0.70, 0.03, 0.02),
            AssetConfig::new("SOL", 4, 0.40, 0.05, 0.03),
        ]);
        assert!(table.validate().is_ok());
    }

    #[test]
    fn test_net_yield() {
        let asset = AssetConfig::new("BTC", 1, 0.7, 0.03, 0.02);
        assert!((asset.net_yield() - 0.01).abs() < 1e-12);
    }
}
