//! Risk monitor computations.
//!
//! Quote collection is the only async part. Assessment is a pure pass over
//! the ledger: reprice, count missed quotes, classify, and pick the
//! governing state.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::RiskConfig;
use crate::error::RiskDataError;
use crate::ledger::PositionLedger;
use crate::position::{RiskState, RiskThresholds, DUST};
use cascade_api::ExchangeGateway;

/// Per-symbol quote result for one tick.
pub type QuoteMap = HashMap<String, Result<f64, RiskDataError>>;

/// Fetch quotes for all symbols concurrently, each bounded by `timeout`.
pub async fn fetch_quotes(gateway: &dyn ExchangeGateway, symbols: &[String], timeout: Duration) -> QuoteMap {
    let timeout_ms = timeout.as_millis() as u64;
    let fetches = symbols.iter().map(|symbol| async move {
        let result = match tokio::time::timeout(timeout, gateway.price(symbol)).await {
            Ok(Ok(price)) if price.is_finite() && price > 0.0 => Ok(price),
            Ok(Ok(price)) => Err(RiskDataError::MissingQuote {
                symbol: symbol.clone(),
                reason: format!("unusable price {}", price),
            }),
            Ok(Err(e)) => Err(RiskDataError::MissingQuote {
                symbol: symbol.clone(),
                reason: e.to_string(),
            }),
            Err(_) => Err(RiskDataError::QuoteTimeout {
                symbol: symbol.clone(),
                timeout_ms,
            }),
        };
        (symbol.clone(), result)
    });
    join_all(fetches).await.into_iter().collect()
}

/// Annualized carry across open positions. Informational only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct YieldReport {
    /// Collateral yield at current value
    pub projected_yield: f64,
    /// Loan interest on outstanding debt
    pub loan_cost: f64,
    /// projected_yield - loan_cost
    pub net_yield: f64,
    /// Sum of per-position (yield_rate - loan_rate)
    pub net_rate_sum: f64,
}

/// Result of one assessment pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub global_ltv: f64,
    pub global_state: RiskState,
    /// Worst state across positions, global LTV and margin level
    pub governing: RiskState,
    /// (level, state) for every position
    pub position_states: Vec<(usize, RiskState)>,
    /// Levels forced to EMERGENCY by missed quotes
    pub stale_levels: Vec<usize>,
    pub data_errors: Vec<String>,
    pub margin_level: Option<f64>,
    pub yield_report: YieldReport,
}

/// State implied by the account margin level.
pub fn margin_state(margin_level: f64, cfg: &RiskConfig) -> RiskState {
    if margin_level < cfg.margin_level_emergency {
        RiskState::Emergency
    } else if margin_level < cfg.margin_level_reduce {
        RiskState::Reduce
    } else {
        RiskState::Healthy
    }
}

/// Reprice the ledger from `quotes` and classify every position.
///
/// A missing quote keeps the last known LTV for this tick and bumps the
/// position's miss counter. At `staleness_limit` consecutive misses the
/// position is EMERGENCY regardless of its last LTV.
pub fn assess(
    ledger: &mut PositionLedger,
    quotes: &QuoteMap,
    margin_level: Option<f64>,
    cfg: &RiskConfig,
) -> RiskAssessment {
    let thresholds = RiskThresholds::from(cfg);
    let mut position_states = Vec::with_capacity(ledger.len());
    let mut stale_levels = Vec::new();
    let mut data_errors = Vec::new();

    for position in ledger.positions_mut() {
        match quotes.get(&position.symbol) {
            Some(Ok(price)) => position.reprice(*price),
            Some(Err(e)) => {
                position.missed_quotes += 1;
                data_errors.push(e.to_string());
            }
            None => {
                position.missed_quotes += 1;
                data_errors.push(
                    RiskDataError::MissingQuote {
                        symbol: position.symbol.clone(),
                        reason: "not requested".to_string(),
                    }
                    .to_string(),
                );
            }
        }

        let state = if position.missed_quotes >= cfg.staleness_limit {
            stale_levels.push(position.level);
            RiskState::Emergency
        } else if position.released_qty > DUST {
            // Partially unwound by a liquidation that has not finished
            RiskState::Emergency
        } else {
            thresholds.classify(position.ltv)
        };

        if state != position.risk_state {
            debug!(
                level = position.level,
                asset = %position.asset,
                from = %position.risk_state,
                to = %state,
                ltv = position.ltv,
                "Position risk state changed"
            );
        }
        position.risk_state = state;
        position_states.push((position.level, state));
    }

    if !stale_levels.is_empty() {
        warn!(levels = ?stale_levels, limit = cfg.staleness_limit, "Stale quotes forced EMERGENCY");
    }

    let global_ltv = ledger.global_ltv();
    let global_state = if ledger.is_empty() {
        RiskState::Healthy
    } else {
        thresholds.classify(global_ltv)
    };

    let margin = margin_level
        .filter(|_| !ledger.is_empty())
        .map(|ml| margin_state(ml, cfg))
        .unwrap_or(RiskState::Healthy);

    let governing = position_states
        .iter()
        .map(|(_, s)| *s)
        .chain([global_state, margin])
        .max()
        .unwrap_or(RiskState::Healthy);

    RiskAssessment {
        global_ltv,
        global_state,
        governing,
        position_states,
        stale_levels,
        data_errors,
        margin_level,
        yield_report: yield_report(ledger),
    }
}

/// Projected annual carry of the open positions.
pub fn yield_report(ledger: &PositionLedger) -> YieldReport {
    let mut report = YieldReport::default();
    for p in ledger.positions() {
        report.projected_yield += p.current_value() * p.yield_rate;
        report.loan_cost += p.loan_amount * p.loan_rate;
        report.net_rate_sum += p.yield_rate - p.loan_rate;
    }
    report.net_yield = report.projected_yield - report.loan_cost;
    report
}
