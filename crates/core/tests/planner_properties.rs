//! Property-based tests for cascade planning.
//!
//! These tests verify the sizing bounds hold under random inputs.

use std::collections::{HashMap, HashSet};

use cascade_core::*;
use proptest::prelude::*;

// Strategies for generating test data
fn capital_strategy() -> impl Strategy<Value = f64> {
    (1u64..5_000_000u64).prop_map(|x| x as f64 / 100.0) // $0.01 to $50,000
}

fn price_strategy() -> impl Strategy<Value = f64> {
    (1u64..10_000_000u64).prop_map(|x| x as f64 / 100.0)
}

fn safety_strategy() -> impl Strategy<Value = f64> {
    (10u32..=100u32).prop_map(|x| x as f64 / 100.0) // 0.10 to 1.00
}

/// Three assets in each of four tiers, max LTV falling by `step` per tier.
fn wide_table(top_ltv: f64, step: f64) -> TierTable {
    let assets = (1u8..=4)
        .flat_map(|tier| {
            let max_ltv = top_ltv - step * f64::from(tier - 1);
            (0..3).map(move |i| AssetConfig::new(&format!("T{}A{}", tier, i), tier, max_ltv, 0.03, 0.02))
        })
        .collect();
    TierTable::new(assets)
}

fn quotes(btc: f64, eth: f64, bnb: f64, sol: f64) -> HashMap<String, f64> {
    [("BTC", btc), ("ETH", eth), ("BNB", bnb), ("SOL", sol)]
        .into_iter()
        .map(|(a, p)| (a.to_string(), p))
        .collect()
}

proptest! {
    /// The plan never exceeds max_levels or the number of assets
    #[test]
    fn plan_terminates_within_bounds(
        capital in capital_strategy(),
        max_levels in 1usize..=8,
        safety in safety_strategy(),
        min_trade in 1u32..=500u32,
        prices in (price_strategy(), price_strategy(), price_strategy(), price_strategy()),
    ) {
        let table = TierTable::default();
        let params = PlanParams { max_levels, safety_factor: safety, min_trade_size: min_trade as f64 };
        let quotes = quotes(prices.0, prices.1, prices.2, prices.3);

        if let Ok(plan) = plan(capital, &table, &params, &quotes, "USDT") {
            prop_assert!(!plan.levels.is_empty());
            prop_assert!(plan.levels.len() <= max_levels);
            prop_assert!(plan.levels.len() <= table.len());

            let assets: HashSet<_> = plan.levels.iter().map(|l| l.asset.clone()).collect();
            prop_assert_eq!(assets.len(), plan.levels.len(), "an asset was reused");
        }
    }

    /// Each borrow stays within max_ltv * safety of its collateral and
    /// funds exactly the next level
    #[test]
    fn borrow_bounded_by_safe_ltv(
        capital in capital_strategy(),
        safety in safety_strategy(),
        prices in (price_strategy(), price_strategy(), price_strategy(), price_strategy()),
    ) {
        let table = TierTable::default();
        let params = PlanParams { max_levels: 5, safety_factor: safety, min_trade_size: 1.0 };
        let quotes = quotes(prices.0, prices.1, prices.2, prices.3);

        if let Ok(plan) = plan(capital, &table, &params, &quotes, "USDT") {
            for action in &plan.levels {
                let bound = action.collateral_value() * action.max_ltv * safety;
                prop_assert!(action.borrow <= bound * (1.0 + 1e-12));
                prop_assert!(action.borrow >= params.min_trade_size);
                prop_assert!(ltv(action.borrow, action.collateral_value()) <= action.max_ltv * (1.0 + 1e-12));
            }
            for pair in plan.levels.windows(2) {
                prop_assert_eq!(pair[1].spend, pair[0].borrow);
                prop_assert!(pair[1].tier >= pair[0].tier);
            }
            // Geometric bound: each level borrows at most 70% of the one before
            prop_assert!(plan.total_borrowed() < capital * 0.7 / 0.3);
        }
    }

    /// With more assets than levels, the plan stops early only because the
    /// next borrow would be too small, and otherwise runs to max_levels
    #[test]
    fn stop_reason_matches_plan_length(
        capital in capital_strategy(),
        max_levels in 1usize..=8,
        safety in safety_strategy(),
        min_trade in 1u32..=500u32,
        top_ltv in 50u32..=80u32,
        step in 2u32..=10u32,
        price in price_strategy(),
    ) {
        let table = wide_table(f64::from(top_ltv) / 100.0, f64::from(step) / 100.0);
        let params = PlanParams { max_levels, safety_factor: safety, min_trade_size: f64::from(min_trade) };
        let quotes: HashMap<String, f64> = table.active_assets().map(|a| (a.symbol.clone(), price)).collect();

        match plan(capital, &table, &params, &quotes, "USDT") {
            Ok(plan) => {
                match &plan.stop_reason {
                    StopReason::MaxLevels => prop_assert_eq!(plan.levels.len(), max_levels),
                    StopReason::BelowMinTrade { level, borrow } => {
                        prop_assert!(*borrow < params.min_trade_size);
                        prop_assert_eq!(*level, plan.levels.len() + 1);
                        prop_assert!(plan.levels.len() < max_levels);
                    }
                    other => prop_assert!(false, "unexpected stop reason {:?}", other),
                }
                if plan.levels.len() < max_levels {
                    let is_below_min = matches!(plan.stop_reason, StopReason::BelowMinTrade { .. });
                    prop_assert!(is_below_min);
                }
                let last = plan.levels.last().map(|l| l.borrow).unwrap_or(0.0);
                prop_assert!(last >= params.min_trade_size);
            }
            Err(e) => {
                let is_insufficient = matches!(e, PlanningError::InsufficientCapital { .. });
                prop_assert!(is_insufficient);
                prop_assert!(capital * f64::from(top_ltv) / 100.0 * safety < params.min_trade_size * (1.0 + 1e-9));
            }
        }
    }

    /// Below the minimum trade size the first level is refused
    #[test]
    fn tiny_capital_is_rejected(
        capital in 0.01f64..1.0,
        price in price_strategy(),
    ) {
        let table = TierTable::default();
        let params = PlanParams { max_levels: 5, safety_factor: 0.9, min_trade_size: 10.0 };
        let quotes = quotes(price, price, price, price);

        let result = plan(capital, &table, &params, &quotes, "USDT");
        let is_insufficient = matches!(result, Err(PlanningError::InsufficientCapital { .. }));
        prop_assert!(is_insufficient);
    }
}
