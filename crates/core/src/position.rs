//! Position data structures for cascade levels.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::RiskConfig;

/// Risk state of a position or of the whole portfolio.
///
/// Ordered by severity so the governing state is a plain `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RiskState {
    /// LTV below the warn threshold
    Healthy,
    /// warn <= LTV < reduce, flag only
    Warning,
    /// reduce <= LTV < emergency, partial unwind of the deepest level
    Reduce,
    /// LTV >= emergency or risk unknown, full liquidation
    Emergency,
}

impl RiskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "HEALTHY",
            Self::Warning => "WARNING",
            Self::Reduce => "REDUCE",
            Self::Emergency => "EMERGENCY",
        }
    }
}

impl std::fmt::Display for RiskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// LTV threshold table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RiskThresholds {
    pub warn: f64,
    pub reduce: f64,
    pub emergency: f64,
}

impl RiskThresholds {
    /// Classify an LTV. No hysteresis: the state depends only on this value.
    pub fn classify(&self, ltv: f64) -> RiskState {
        if ltv >= self.emergency {
            RiskState::Emergency
        } else if ltv >= self.reduce {
            RiskState::Reduce
        } else if ltv >= self.warn {
            RiskState::Warning
        } else {
            RiskState::Healthy
        }
    }
}

impl Default for RiskThresholds {
    fn default() -> Self {
        Self::from(&RiskConfig::default())
    }
}

impl From<&RiskConfig> for RiskThresholds {
    fn from(cfg: &RiskConfig) -> Self {
        Self {
            warn: cfg.warn_ltv,
            reduce: cfg.reduce_ltv,
            emergency: cfg.emergency_ltv,
        }
    }
}

/// One committed cascade level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Level index, 1-based
    pub level: usize,
    /// Collateral asset symbol
    pub asset: String,
    /// Trading pair used to quote and trade the collateral
    pub symbol: String,
    /// Tier of the collateral asset
    pub tier: u8,
    /// Collateral quantity held in the margin account
    pub collateral_qty: f64,
    /// Collateral moved back to spot during a liquidation and not yet sold
    #[serde(default)]
    pub released_qty: f64,
    /// Average fill price at acquisition
    pub entry_price: f64,
    /// Most recent price seen by the monitor
    pub last_price: f64,
    /// Loan asset (always the base currency)
    pub loan_asset: String,
    /// Outstanding loan amount
    pub loan_amount: f64,
    /// loan / collateral value at `last_price`
    pub ltv: f64,
    /// Last classified risk state
    pub risk_state: RiskState,
    /// Consecutive ticks without a usable quote
    pub missed_quotes: u32,
    /// Exchange order id of the acquisition buy
    pub order_id: Option<String>,
    /// Annualized collateral yield
    pub yield_rate: f64,
    /// Annualized loan interest
    pub loan_rate: f64,
    /// When the level was committed
    pub opened_at: DateTime<Utc>,
}

impl Position {
    /// Collateral value at a given price.
    pub fn collateral_value(&self, price: f64) -> f64 {
        self.collateral_qty * price
    }

    /// Collateral value at the last observed price.
    pub fn current_value(&self) -> f64 {
        self.collateral_value(self.last_price)
    }

    /// Update the last price and recompute LTV from it.
    pub fn reprice(&mut self, price: f64) {
        self.last_price = price;
        self.missed_quotes = 0;
        self.ltv = ltv(self.loan_amount, self.collateral_value(price));
    }

    /// Annualized carry: yield on collateral value minus interest on the loan.
    pub fn net_yield(&self) -> f64 {
        self.current_value() * self.yield_rate - self.loan_amount * self.loan_rate
    }

    /// Whether anything is left to unwind.
    pub fn is_closed(&self) -> bool {
        self.loan_amount <= DUST && self.collateral_qty <= DUST && self.released_qty <= DUST
    }
}

/// Amounts at or below this are treated as zero.
pub const DUST: f64 = 1e-9;

/// Loan-to-value with an empty-collateral guard.
///
/// Debt against no collateral is treated as infinitely levered.
pub fn ltv(loan: f64, collateral_value: f64) -> f64 {
    if collateral_value > 0.0 {
        loan / collateral_value
    } else if loan > 0.0 {
        f64::INFINITY
    } else {
        0.0
    }
}

#[cfg(test)]
pub(crate) fn test_position(level: usize, asset: &str, qty: f64, price: f64, loan: f64) -> Position {
    Position {
        level,
        asset: asset.to_string(),
        symbol: format!("{}USDT", asset),
        tier: level as u8,
        collateral_qty: qty,
        released_qty: 0.0,
        entry_price: price,
        last_price: price,
        loan_asset: "USDT".to_string(),
        loan_amount: loan,
        ltv: ltv(loan, qty * price),
        risk_state: RiskState::Healthy,
        missed_quotes: 0,
        order_id: None,
        yield_rate: 0.03,
        loan_rate: 0.02,
        opened_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_thresholds() {
        let t = RiskThresholds::default();
        assert_eq!(t.classify(0.70), RiskState::Healthy);
        assert_eq!(t.classify(0.75), RiskState::Warning);
        assert_eq!(t.classify(0.76), RiskState::Warning);
        assert_eq!(t.classify(0.82), RiskState::Reduce);
        assert_eq!(t.classify(0.85), RiskState::Emergency);
        assert_eq!(t.classify(0.90), RiskState::Emergency);
        assert_eq!(t.classify(f64::INFINITY), RiskState::Emergency);
    }

    #[test]
    fn test_no_hysteresis() {
        let t = RiskThresholds::default();
        // A single jump goes straight to EMERGENCY
        assert_eq!(t.classify(0.10), RiskState::Healthy);
        assert_eq!(t.classify(0.95), RiskState::Emergency);
        assert_eq!(t.classify(0.10), RiskState::Healthy);
    }

    #[test]
    fn test_state_ordering() {
        assert!(RiskState::Healthy < RiskState::Warning);
        assert!(RiskState::Warning < RiskState::Reduce);
        assert!(RiskState::Reduce < RiskState::Emergency);
        assert_eq!(
            [RiskState::Warning, RiskState::Emergency, RiskState::Healthy]
                .into_iter()
                .max(),
            Some(RiskState::Emergency)
        );
    }

    #[test]
    fn test_reprice_updates_ltv() {
        let mut pos = test_position(1, "BTC", 0.02, 50_000.0, 630.0);
        assert!((pos.ltv - 0.63).abs() < 1e-9);

        pos.missed_quotes = 2;
        pos.reprice(40_000.0);
        assert!((pos.ltv - 630.0 / 800.0).abs() < 1e-9);
        assert_eq!(pos.missed_quotes, 0);
        assert_eq!(pos.last_price, 40_000.0);
    }

    #[test]
    fn test_ltv_edge_cases() {
        assert_eq!(ltv(0.0, 0.0), 0.0);
        assert_eq!(ltv(10.0, 0.0), f64::INFINITY);
        assert_eq!(ltv(0.0, 100.0), 0.0);
    }
}
