//! Cascade planner.
//!
//! Pure function from capital, tier table and quotes to an ordered list of
//! level actions. Nothing here touches the exchange.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::config::CascadeConfig;
use crate::error::PlanningError;
use crate::tiers::{select_asset, TierTable};
use cascade_api::pair_symbol;

/// Sizing parameters for a plan.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlanParams {
    pub max_levels: usize,
    pub safety_factor: f64,
    pub min_trade_size: f64,
}

impl From<&CascadeConfig> for PlanParams {
    fn from(cfg: &CascadeConfig) -> Self {
        Self {
            max_levels: cfg.max_cascade_levels,
            safety_factor: cfg.safety_factor,
            min_trade_size: cfg.min_trade_size,
        }
    }
}

/// One planned level: buy -> transfer to margin -> borrow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelAction {
    pub level: usize,
    pub asset: String,
    pub symbol: String,
    pub tier: u8,
    pub max_ltv: f64,
    /// Quote used for sizing
    pub price: f64,
    /// Base currency spent on the buy
    pub spend: f64,
    /// Expected collateral quantity
    pub buy_qty: f64,
    /// Base currency to borrow once the collateral is in margin
    pub borrow: f64,
}

impl LevelAction {
    pub fn collateral_value(&self) -> f64 {
        self.buy_qty * self.price
    }
}

/// Why the planner stopped adding levels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StopReason {
    /// `max_levels` reached
    MaxLevels,
    /// The next level's borrow would fall below `min_trade_size`
    BelowMinTrade { level: usize, borrow: f64 },
    /// Every active asset is already used
    AssetsExhausted { level: usize },
    /// No usable quote for the next level's asset
    PriceUnavailable { level: usize, symbol: String },
}

/// Ordered cascade plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CascadePlan {
    pub initial_capital: f64,
    pub levels: Vec<LevelAction>,
    pub stop_reason: StopReason,
}

impl CascadePlan {
    pub fn total_borrowed(&self) -> f64 {
        self.levels.iter().map(|l| l.borrow).sum()
    }

    pub fn total_deployed(&self) -> f64 {
        self.levels.iter().map(|l| l.spend).sum()
    }
}

/// Largest loan allowed against a collateral value.
pub fn max_borrow(collateral_value: f64, max_ltv: f64, safety_factor: f64) -> f64 {
    collateral_value * max_ltv * safety_factor
}

/// Plan the cascade.
///
/// `quotes` maps asset symbol to price in `base`. A missing quote fails the
/// plan at level 1 and ends it at any deeper level.
pub fn plan(
    initial_capital: f64,
    table: &TierTable,
    params: &PlanParams,
    quotes: &HashMap<String, f64>,
    base: &str,
) -> Result<CascadePlan, PlanningError> {
    if !(initial_capital.is_finite() && initial_capital > 0.0) {
        return Err(PlanningError::InsufficientCapital {
            capital: initial_capital,
            min_trade_size: params.min_trade_size,
        });
    }

    let mut levels = Vec::with_capacity(params.max_levels);
    let mut used = HashSet::new();
    let mut available = initial_capital;
    let mut stop_reason = StopReason::MaxLevels;

    for level in 1..=params.max_levels {
        let Some(asset) = select_asset(table, &used) else {
            if level == 1 {
                return Err(PlanningError::NoEligibleAsset { level });
            }
            stop_reason = StopReason::AssetsExhausted { level };
            break;
        };
        let symbol = pair_symbol(&asset.symbol, base);

        let price = match quotes.get(&asset.symbol) {
            Some(&p) if p.is_finite() && p > 0.0 => p,
            _ => {
                if level == 1 {
                    return Err(PlanningError::PriceUnavailable { symbol });
                }
                stop_reason = StopReason::PriceUnavailable { level, symbol };
                break;
            }
        };

        let buy_qty = available / price;
        let borrow = max_borrow(buy_qty * price, asset.max_ltv, params.safety_factor);

        if borrow < params.min_trade_size {
            if level == 1 {
                return Err(PlanningError::InsufficientCapital {
                    capital: initial_capital,
                    min_trade_size: params.min_trade_size,
                });
            }
            stop_reason = StopReason::BelowMinTrade { level, borrow };
            break;
        }

        used.insert(asset.symbol.clone());
        levels.push(LevelAction {
            level,
            asset: asset.symbol.clone(),
            symbol,
            tier: asset.tier,
            max_ltv: asset.max_ltv,
            price,
            spend: available,
            buy_qty,
            borrow,
        });
        available = borrow;
    }

    Ok(CascadePlan {
        initial_capital,
        levels,
        stop_reason,
    })
}
