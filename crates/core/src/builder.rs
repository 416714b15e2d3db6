//! Cascade build execution.
//!
//! Executes a plan level by level against the exchange. A level is the
//! unit of commit and of cancellation: its buy, transfer and borrow either
//! all succeed and the position is appended, or the completed sub-actions
//! are unwound and the build stops.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::CascadeConfig;
use crate::error::{EngineError, ExecutionError, LevelStep};
use crate::ledger::PositionLedger;
use crate::planner::{max_borrow, CascadePlan, LevelAction, StopReason};
use crate::position::{ltv, Position, RiskState};
use crate::tiers::TierTable;
use cascade_api::{ExchangeGateway, TransferDirection};

/// How a build ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BuildOutcome {
    /// Every planned level that was still viable got committed
    Completed(StopReason),
    /// A stop request arrived before `next_level` started
    Cancelled { next_level: usize },
    /// A level failed and was unwound
    Failed { level: usize, error: String },
}

/// Summary returned by `start`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildReport {
    pub initial_capital: f64,
    pub planned_levels: usize,
    pub committed_levels: usize,
    pub total_deployed: f64,
    pub total_borrowed: f64,
    pub outcome: BuildOutcome,
    /// Idle proceeds parked in flexible savings, if any
    pub savings_deposit: Option<f64>,
}

/// Execute one level: buy, move collateral to margin, borrow.
///
/// The borrow is capped at the filled collateral's value times
/// `max_ltv * safety_factor`, so a worse fill never breaches the tier limit.
#[instrument(skip(gateway, action, cfg, tiers), fields(level = action.level, asset = %action.asset))]
pub async fn execute_level(
    gateway: &dyn ExchangeGateway,
    action: &LevelAction,
    spend: f64,
    cfg: &CascadeConfig,
    tiers: &TierTable,
) -> Result<Position, ExecutionError> {
    let level = action.level;
    let fail = |step, source| ExecutionError { level, step, source };

    let fill = gateway
        .market_buy(&action.symbol, spend)
        .await
        .map_err(|e| fail(LevelStep::Buy, e))?;
    debug!(qty = fill.quantity, spent = fill.quote_amount, "Collateral bought");

    if let Err(e) = gateway
        .margin_transfer(&action.asset, fill.quantity, TransferDirection::ToMargin)
        .await
    {
        unwind_buy(gateway, action, fill.quantity).await;
        return Err(fail(LevelStep::Transfer, e));
    }

    let entry_price = match fill.avg_price() {
        p if p > 0.0 => p,
        _ => action.price,
    };
    // Size the loan on the lower of fill and quote price
    let value_price = entry_price.min(action.price);
    let collateral_value = fill.quantity * value_price;
    let borrow = max_borrow(collateral_value, action.max_ltv, cfg.safety_factor).min(action.borrow);

    if let Err(e) = gateway.margin_borrow(&cfg.base_asset, borrow).await {
        unwind_transfer(gateway, action, fill.quantity).await;
        return Err(fail(LevelStep::Borrow, e));
    }

    let (yield_rate, loan_rate) = tiers
        .get(&action.asset)
        .map(|a| (a.yield_rate, a.loan_rate))
        .unwrap_or((0.0, 0.0));

    Ok(Position {
        level,
        asset: action.asset.clone(),
        symbol: action.symbol.clone(),
        tier: action.tier,
        collateral_qty: fill.quantity,
        released_qty: 0.0,
        entry_price,
        last_price: value_price,
        loan_asset: cfg.base_asset.clone(),
        loan_amount: borrow,
        ltv: ltv(borrow, collateral_value),
        risk_state: RiskState::Healthy,
        missed_quotes: 0,
        order_id: fill.order_id,
        yield_rate,
        loan_rate,
        opened_at: Utc::now(),
    })
}

/// Move collateral back to spot and sell it.
async fn unwind_transfer(gateway: &dyn ExchangeGateway, action: &LevelAction, qty: f64) {
    match gateway
        .margin_transfer(&action.asset, qty, TransferDirection::FromMargin)
        .await
    {
        Ok(()) => unwind_buy(gateway, action, qty).await,
        Err(e) => error!(
            level = action.level,
            asset = %action.asset,
            qty,
            error = %e,
            "Unwind failed: collateral stuck in margin account"
        ),
    }
}

/// Sell back a bought quantity.
async fn unwind_buy(gateway: &dyn ExchangeGateway, action: &LevelAction, qty: f64) {
    match gateway.market_sell(&action.symbol, qty).await {
        Ok(fill) => warn!(
            level = action.level,
            asset = %action.asset,
            qty,
            proceeds = fill.quote_amount,
            "Partial level unwound"
        ),
        Err(e) => error!(
            level = action.level,
            asset = %action.asset,
            qty,
            error = %e,
            "Unwind failed: collateral left in spot wallet"
        ),
    }
}

/// Execute a plan, appending each committed level to the ledger.
///
/// `cancel` is checked between levels and during the pacing delay, never
/// inside a level. `on_commit` runs after every append.
pub async fn run_build<F>(
    gateway: &dyn ExchangeGateway,
    ledger: &mut PositionLedger,
    plan: &CascadePlan,
    cfg: &CascadeConfig,
    tiers: &TierTable,
    cancel: &CancellationToken,
    mut on_commit: F,
) -> Result<BuildReport, EngineError>
where
    F: FnMut(&PositionLedger),
{
    ledger.begin_build()?;

    let mut available = plan.initial_capital;
    let mut deployed = 0.0;
    let mut borrowed = 0.0;
    let mut committed = 0;
    let mut outcome = BuildOutcome::Completed(plan.stop_reason.clone());

    for (idx, action) in plan.levels.iter().enumerate() {
        if cancel.is_cancelled() {
            outcome = BuildOutcome::Cancelled { next_level: action.level };
            break;
        }
        let delay = cfg.level_delay();
        if idx > 0 && !delay.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => {
                    outcome = BuildOutcome::Cancelled { next_level: action.level };
                    break;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }

        // Reinvest what was actually borrowed, never more than planned
        let spend = available.min(action.spend);
        let projected = max_borrow(spend, action.max_ltv, cfg.safety_factor);
        if idx > 0 && projected < cfg.min_trade_size {
            outcome = BuildOutcome::Completed(StopReason::BelowMinTrade {
                level: action.level,
                borrow: projected,
            });
            break;
        }

        match execute_level(gateway, action, spend, cfg, tiers).await {
            Ok(position) => {
                info!(
                    level = position.level,
                    asset = %position.asset,
                    qty = position.collateral_qty,
                    loan = position.loan_amount,
                    ltv = position.ltv,
                    "Level committed"
                );
                deployed += spend;
                borrowed += position.loan_amount;
                available = position.loan_amount;
                committed += 1;
                ledger.append(position)?;
                on_commit(ledger);
            }
            Err(e) => {
                error!(error = %e, "Level failed, stopping build");
                outcome = BuildOutcome::Failed {
                    level: e.level,
                    error: e.to_string(),
                };
                break;
            }
        }
    }

    ledger.finish_build()?;

    let savings_deposit = if cfg.deposit_idle_to_savings && committed > 0 && available > 0.0 {
        deposit_idle(gateway, &cfg.base_asset, available).await
    } else {
        None
    };

    Ok(BuildReport {
        initial_capital: plan.initial_capital,
        planned_levels: plan.levels.len(),
        committed_levels: committed,
        total_deployed: deployed,
        total_borrowed: borrowed,
        outcome,
        savings_deposit,
    })
}

/// Best-effort deposit of un-reinvested loan proceeds.
async fn deposit_idle(gateway: &dyn ExchangeGateway, base: &str, amount: f64) -> Option<f64> {
    match gateway.savings_deposit(base, amount).await {
        Ok(()) => {
            info!(asset = base, amount, "Idle proceeds deposited to flexible savings");
            Some(amount)
        }
        Err(e) => {
            warn!(asset = base, amount, error = %e, "Savings deposit failed, proceeds left in wallet");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::{plan, PlanParams};
    use crate::tiers::AssetConfig;
    use cascade_api::{CallKind, PaperExchange};
    use std::collections::HashMap;

    fn table() -> TierTable {
        TierTable::new(vec![
            AssetConfig::new("BTC", 1, 0.70, 0.03, 0.02),
            AssetConfig::new("ETH", 2, 0.50, 0.035, 0.022),
        ])
    }

    fn cfg() -> CascadeConfig {
        CascadeConfig {
            max_cascade_levels: 2,
            level_delay_ms: 0,
            ..Default::default()
        }
    }

    fn exchange() -> PaperExchange {
        PaperExchange::new("USDT", 1_000.0)
            .with_price("BTCUSDT", 50_000.0)
            .with_price("ETHUSDT", 2_000.0)
    }

    fn two_level_plan(cfg: &CascadeConfig) -> CascadePlan {
        let quotes: HashMap<String, f64> =
            [("BTC".to_string(), 50_000.0), ("ETH".to_string(), 2_000.0)].into();
        plan(1_000.0, &table(), &PlanParams::from(cfg), &quotes, "USDT").unwrap()
    }

    #[tokio::test]
    async fn test_full_build() {
        let ex = exchange();
        let cfg = cfg();
        let plan = two_level_plan(&cfg);
        let mut ledger = PositionLedger::new();
        let mut commits = 0;

        let report = run_build(&ex, &mut ledger, &plan, &cfg, &table(), &CancellationToken::new(), |_| {
            commits += 1
        })
        .await
        .unwrap();

        assert_eq!(report.committed_levels, 2);
        assert_eq!(commits, 2);
        assert!((report.total_borrowed - 913.5).abs() < 1e-6);
        assert!(matches!(report.outcome, BuildOutcome::Completed(StopReason::MaxLevels)));

        assert_eq!(ledger.len(), 2);
        assert!((ex.margin_balance("BTC") - 0.02).abs() < 1e-12);
        assert!((ex.margin_balance("ETH") - 0.315).abs() < 1e-12);
        assert!((ex.loan("USDT") - 913.5).abs() < 1e-6);
        // Level 2's loan is the idle remainder
        assert!((ex.spot_balance("USDT") - 283.5).abs() < 1e-6);

        let l1 = ledger.get(1).unwrap();
        assert!(l1.order_id.is_some());
        assert!(l1.loan_amount <= l1.collateral_value(l1.entry_price) * 0.70 * 0.9 + 1e-9);
    }

    #[tokio::test]
    async fn test_entry_price_is_fill_price() {
        let ex = exchange();
        let cfg = cfg();
        let plan = two_level_plan(&cfg);
        let mut ledger = PositionLedger::new();

        // Market moved up between planning and execution
        ex.set_price("BTCUSDT", 52_000.0);
        run_build(&ex, &mut ledger, &plan, &cfg, &table(), &CancellationToken::new(), |_| {})
            .await
            .unwrap();

        let l1 = ledger.get(1).unwrap();
        assert!((l1.entry_price - 52_000.0).abs() < 1e-6);
        assert!((l1.collateral_qty - 1_000.0 / 52_000.0).abs() < 1e-12);
        // The loan is still sized on the lower planning quote
        let conservative = l1.collateral_qty * 50_000.0 * 0.70 * cfg.safety_factor;
        assert!((l1.loan_amount - conservative).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_borrow_failure_unwinds_level() {
        let ex = exchange();
        let cfg = cfg();
        let plan = two_level_plan(&cfg);
        let mut ledger = PositionLedger::new();

        // First borrow succeeds, second is rejected
        let report = {
            let ex_ref = &ex;
            let mut fail_armed = false;
            run_build(ex_ref, &mut ledger, &plan, &cfg, &table(), &CancellationToken::new(), |_| {
                if !fail_armed {
                    ex_ref.fail_next(CallKind::MarginBorrow, 1);
                    fail_armed = true;
                }
            })
            .await
            .unwrap()
        };

        assert_eq!(report.committed_levels, 1);
        assert!(matches!(report.outcome, BuildOutcome::Failed { level: 2, .. }));
        assert_eq!(ledger.len(), 1);

        // ETH went to margin, came back and was sold
        assert!(ex.margin_balance("ETH").abs() < 1e-12);
        assert!(ex.spot_balance("ETH").abs() < 1e-12);
        let transfers = ex.calls_of(CallKind::MarginTransfer);
        assert_eq!(transfers.len(), 3);
        assert_eq!(ex.calls_of(CallKind::MarketSell).len(), 1);
        assert!((ex.loan("USDT") - 630.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_transfer_failure_sells_back() {
        let ex = exchange();
        let cfg = cfg();
        let plan = two_level_plan(&cfg);
        let mut ledger = PositionLedger::new();
        ex.fail_next(CallKind::MarginTransfer, 1);

        let report = run_build(&ex, &mut ledger, &plan, &cfg, &table(), &CancellationToken::new(), |_| {})
            .await
            .unwrap();

        assert_eq!(report.committed_levels, 0);
        assert!(matches!(report.outcome, BuildOutcome::Failed { level: 1, .. }));
        assert!(ledger.is_empty());
        assert!(ex.spot_balance("BTC").abs() < 1e-12);
        assert!((ex.spot_balance("USDT") - 1_000.0).abs() < 1e-6);
        assert!(ex.calls_of(CallKind::MarginBorrow).is_empty());
    }

    #[tokio::test]
    async fn test_buy_failure_leaves_nothing() {
        let ex = exchange();
        let cfg = cfg();
        let plan = two_level_plan(&cfg);
        let mut ledger = PositionLedger::new();
        ex.fail_next(CallKind::MarketBuy, 1);

        let report = run_build(&ex, &mut ledger, &plan, &cfg, &table(), &CancellationToken::new(), |_| {})
            .await
            .unwrap();

        assert_eq!(report.committed_levels, 0);
        assert!(ex.calls_of(CallKind::MarketSell).is_empty());
        assert!(ex.calls_of(CallKind::MarginTransfer).is_empty());
    }

    #[tokio::test]
    async fn test_cancel_between_levels() {
        let ex = exchange();
        let cfg = cfg();
        let plan = two_level_plan(&cfg);
        let mut ledger = PositionLedger::new();
        let cancel = CancellationToken::new();

        let report = run_build(&ex, &mut ledger, &plan, &cfg, &table(), &cancel, |_| cancel.cancel())
            .await
            .unwrap();

        assert_eq!(report.committed_levels, 1);
        assert_eq!(report.outcome, BuildOutcome::Cancelled { next_level: 2 });
        assert_eq!(ledger.len(), 1);
        assert!(ex.calls_of(CallKind::MarketBuy).len() == 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_pacing_delay() {
        let ex = exchange();
        let cfg = CascadeConfig {
            level_delay_ms: 60_000,
            ..cfg()
        };
        let plan = two_level_plan(&cfg);
        let mut ledger = PositionLedger::new();
        let cancel = CancellationToken::new();

        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                cancel.cancel();
            })
        };

        let report = run_build(&ex, &mut ledger, &plan, &cfg, &table(), &cancel, |_| {})
            .await
            .unwrap();
        canceller.await.unwrap();

        assert_eq!(report.outcome, BuildOutcome::Cancelled { next_level: 2 });
        assert_eq!(ledger.len(), 1);
    }

    #[tokio::test]
    async fn test_idle_proceeds_to_savings() {
        let ex = exchange();
        let cfg = CascadeConfig {
            deposit_idle_to_savings: true,
            ..cfg()
        };
        let plan = two_level_plan(&cfg);
        let mut ledger = PositionLedger::new();

        let report = run_build(&ex, &mut ledger, &plan, &cfg, &table(), &CancellationToken::new(), |_| {})
            .await
            .unwrap();

        let deposited = report.savings_deposit.unwrap();
        assert!((deposited - 283.5).abs() < 1e-6);
        assert!((ex.savings_balance("USDT") - 283.5).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_savings_failure_is_not_fatal() {
        let ex = exchange();
        let cfg = CascadeConfig {
            deposit_idle_to_savings: true,
            ..cfg()
        };
        let plan = two_level_plan(&cfg);
        let mut ledger = PositionLedger::new();
        ex.fail_next(CallKind::SavingsDeposit, 1);

        let report = run_build(&ex, &mut ledger, &plan, &cfg, &table(), &CancellationToken::new(), |_| {})
            .await
            .unwrap();

        assert_eq!(report.committed_levels, 2);
        assert_eq!(report.savings_deposit, None);
    }

    #[tokio::test]
    async fn test_build_rejected_while_liquidating() {
        let ex = exchange();
        let cfg = cfg();
        let plan = two_level_plan(&cfg);
        let mut ledger = PositionLedger::new();
        ledger.begin_liquidation().unwrap();

        let err = run_build(&ex, &mut ledger, &plan, &cfg, &table(), &CancellationToken::new(), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Ledger(_)));
        assert!(ex.calls().is_empty());
    }
}
