//! Liquidation executor for cascade positions.
//!
//! Reverses ledger entries deepest level first. Per position: repay the loan
//! (selling some of the position's own collateral if base currency is
//! short), transfer the collateral out of margin, then sell it when the mode
//! cashes out. Each position is attempted independently; a failure is
//! reported and leaves the position in the ledger for the next retry.
//! Every exchange call is bounded by the call timeout.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{LiquidationError, ReversalStep};
use crate::ledger::PositionLedger;
use crate::position::{RiskState, DUST};
use cascade_api::{ExchangeGateway, GatewayError, TransferDirection};

/// What to unwind.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum LiquidationMode {
    /// Unwind `fraction` of the deepest position and sell the released collateral
    Partial { fraction: f64 },
    /// Unwind every position; sell released collateral if `cash_out`
    Full { cash_out: bool },
}

impl LiquidationMode {
    fn cash_out(&self) -> bool {
        match self {
            Self::Partial { .. } => true,
            Self::Full { cash_out } => *cash_out,
        }
    }
}

/// Completed reversal of one position (or a fraction of it).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reversal {
    pub level: usize,
    pub asset: String,
    /// Loan repaid in base currency
    pub repaid: f64,
    /// Collateral moved out of margin
    pub released_qty: f64,
    /// Collateral sold (shortfall cover plus cash-out)
    pub sold_qty: f64,
    /// Base currency received from sales
    pub proceeds: f64,
    /// Whether the position was removed from the ledger
    pub closed: bool,
}

/// Outcome of a liquidation pass.
#[derive(Debug, Clone, PartialEq)]
pub struct LiquidationReport {
    pub mode: LiquidationMode,
    pub reversals: Vec<Reversal>,
    pub failures: Vec<LiquidationError>,
    /// Positions left in the ledger afterwards
    pub remaining_positions: usize,
    /// Global LTV recomputed after the pass
    pub global_ltv_after: f64,
}

impl LiquidationReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Liquidation executor.
pub struct Liquidator {
    gateway: Arc<dyn ExchangeGateway>,
    /// Base (loan) currency
    base: String,
    /// Extra collateral sold when covering a repay shortfall (percentage)
    repay_buffer_pct: f64,
    call_timeout: Duration,
}

const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

impl Liquidator {
    pub fn new(gateway: Arc<dyn ExchangeGateway>, base: impl Into<String>) -> Self {
        Self {
            gateway,
            base: base.into(),
            repay_buffer_pct: 1.0,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    /// Bound each exchange call; a call that overruns fails its step.
    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    async fn timed<T>(
        &self,
        call: impl Future<Output = Result<T, GatewayError>>,
        on_timeout: impl FnOnce(String) -> GatewayError,
    ) -> Result<T, GatewayError> {
        match tokio::time::timeout(self.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(on_timeout(format!(
                "timed out after {}ms",
                self.call_timeout.as_millis()
            ))),
        }
    }

    /// Set the shortfall sale buffer.
    pub fn with_repay_buffer(mut self, repay_buffer_pct: f64) -> Self {
        self.repay_buffer_pct = repay_buffer_pct.max(0.0);
        self
    }

    /// Run a liquidation pass over the ledger.
    ///
    /// Fails only if the ledger is not idle; per-position failures are
    /// collected in the report.
    #[instrument(skip(self, ledger), fields(positions = ledger.len()))]
    pub async fn liquidate(
        &self,
        ledger: &mut PositionLedger,
        mode: LiquidationMode,
    ) -> Result<LiquidationReport, crate::error::LedgerError> {
        ledger.begin_liquidation()?;

        let (targets, fraction) = match mode {
            LiquidationMode::Partial { fraction } => (
                ledger.deepest().map(|p| vec![p.level]).unwrap_or_default(),
                fraction.clamp(0.0, 1.0),
            ),
            LiquidationMode::Full { .. } => (ledger.levels_deepest_first(), 1.0),
        };

        let mut reversals = Vec::new();
        let mut failures = Vec::new();

        for level in targets {
            match self.unwind(ledger, level, fraction, mode.cash_out()).await {
                Ok(reversal) => {
                    info!(
                        level,
                        asset = %reversal.asset,
                        repaid = reversal.repaid,
                        sold = reversal.sold_qty,
                        proceeds = reversal.proceeds,
                        closed = reversal.closed,
                        "Position unwound"
                    );
                    reversals.push(reversal);
                }
                Err(e) => {
                    error!(error = %e, "Position unwind failed, will retry");
                    if let Ok(p) = ledger.position_mut(level) {
                        p.risk_state = RiskState::Emergency;
                    }
                    failures.push(e);
                }
            }
        }

        ledger.finish_liquidation()?;

        Ok(LiquidationReport {
            mode,
            reversals,
            failures,
            remaining_positions: ledger.len(),
            global_ltv_after: ledger.global_ltv(),
        })
    }

    /// Unwind `fraction` of one position.
    async fn unwind(
        &self,
        ledger: &mut PositionLedger,
        level: usize,
        fraction: f64,
        cash_out: bool,
    ) -> Result<Reversal, LiquidationError> {
        let snapshot = ledger
            .get(level)
            .cloned()
            .ok_or_else(|| LiquidationError {
                level,
                asset: String::new(),
                step: ReversalStep::Repay,
                source: GatewayError::repay(&self.base, format!("no position at level {}", level)),
            })?;
        let asset = snapshot.asset.clone();
        let symbol = snapshot.symbol.clone();
        let fail = |step, source| LiquidationError {
            level,
            asset: asset.clone(),
            step,
            source,
        };

        let mut release_target = snapshot.collateral_qty * fraction;
        let debt_target = snapshot.loan_amount * fraction;
        let mut reversal = Reversal {
            level,
            asset: asset.clone(),
            repaid: 0.0,
            released_qty: 0.0,
            sold_qty: 0.0,
            proceeds: 0.0,
            closed: false,
        };

        // 1. Repay, covering any shortfall from this position's collateral
        if debt_target > DUST {
            let free = match self
                .timed(self.gateway.free_balance(&self.base), |reason| {
                    GatewayError::BalanceUnavailable {
                        asset: self.base.clone(),
                        reason,
                    }
                })
                .await
            {
                Ok(free) => free,
                Err(e) => {
                    warn!(level, error = %e, "Free balance unavailable, assuming none");
                    0.0
                }
            };

            let mut available = free;
            let shortfall = debt_target - free;
            if shortfall > DUST {
                let price = match self
                    .timed(self.gateway.price(&symbol), |r| GatewayError::price(&symbol, r))
                    .await
                {
                    Ok(price) if price > 0.0 => price,
                    _ => snapshot.last_price,
                };
                let need_qty = shortfall * (1.0 + self.repay_buffer_pct / 100.0) / price;
                let released = ledger_released(ledger, level);
                let from_spot = released.min(need_qty);
                let from_margin = release_target.min(need_qty - from_spot);
                debug!(level, shortfall, need_qty, from_spot, from_margin, "Covering repay shortfall");

                if from_margin > DUST {
                    self.timed(
                        self.gateway
                            .margin_transfer(&asset, from_margin, TransferDirection::FromMargin),
                        |r| GatewayError::transfer(&asset, r),
                    )
                    .await
                        .map_err(|e| fail(ReversalStep::CoverShortfall, e))?;
                    if let Ok(p) = ledger.position_mut(level) {
                        p.collateral_qty = (p.collateral_qty - from_margin).max(0.0);
                        p.released_qty += from_margin;
                    }
                    release_target -= from_margin;
                    reversal.released_qty += from_margin;
                }

                let sell_qty = from_spot + from_margin;
                if sell_qty > DUST {
                    let fill = self
                        .timed(self.gateway.market_sell(&symbol, sell_qty), |r| {
                            GatewayError::order(&symbol, r)
                        })
                        .await
                        .map_err(|e| fail(ReversalStep::CoverShortfall, e))?;
                    if let Ok(p) = ledger.position_mut(level) {
                        p.released_qty = (p.released_qty - sell_qty).max(0.0);
                    }
                    reversal.sold_qty += sell_qty;
                    reversal.proceeds += fill.quote_amount;
                    available += fill.quote_amount;
                }
            }

            let repay = debt_target.min(available);
            if repay <= DUST {
                return Err(fail(
                    ReversalStep::Repay,
                    GatewayError::repay(&self.base, "no base currency available"),
                ));
            }
            self.timed(self.gateway.margin_repay(&self.base, repay), |r| {
                GatewayError::repay(&self.base, r)
            })
            .await
                .map_err(|e| fail(ReversalStep::Repay, e))?;
            if let Ok(p) = ledger.position_mut(level) {
                p.loan_amount = (p.loan_amount - repay).max(0.0);
            }
            reversal.repaid = repay;

            if repay + DUST < debt_target {
                return Err(fail(
                    ReversalStep::Repay,
                    GatewayError::repay(
                        &self.base,
                        format!("repaid {:.8} of {:.8}, collateral exhausted", repay, debt_target),
                    ),
                ));
            }
        }

        // 2. Transfer the (remaining) collateral out of margin
        if release_target > DUST {
            self.timed(
                self.gateway
                    .margin_transfer(&asset, release_target, TransferDirection::FromMargin),
                |r| GatewayError::transfer(&asset, r),
            )
            .await
                .map_err(|e| fail(ReversalStep::TransferOut, e))?;
            if let Ok(p) = ledger.position_mut(level) {
                p.collateral_qty = (p.collateral_qty - release_target).max(0.0);
                p.released_qty += release_target;
            }
            reversal.released_qty += release_target;
        }

        // 3. Cash out everything released, or hand it back to the wallet
        let released = ledger_released(ledger, level);
        if released > DUST {
            if cash_out {
                let fill = self
                    .timed(self.gateway.market_sell(&symbol, released), |r| {
                        GatewayError::order(&symbol, r)
                    })
                    .await
                    .map_err(|e| fail(ReversalStep::CashOut, e))?;
                reversal.sold_qty += released;
                reversal.proceeds += fill.quote_amount;
            }
            if let Ok(p) = ledger.position_mut(level) {
                p.released_qty = 0.0;
            }
        }

        if let Ok(p) = ledger.position_mut(level) {
            if p.last_price > 0.0 {
                let price = p.last_price;
                p.ltv = crate::position::ltv(p.loan_amount, p.collateral_value(price));
            }
        }

        if ledger.get(level).map(|p| p.is_closed()).unwrap_or(false) {
            ledger.remove(level).map_err(|e| {
                fail(
                    ReversalStep::TransferOut,
                    GatewayError::transfer(&asset, e.to_string()),
                )
            })?;
            reversal.closed = true;
        }

        Ok(reversal)
    }
}

fn ledger_released(ledger: &PositionLedger, level: usize) -> f64 {
    ledger.get(level).map(|p| p.released_qty).unwrap_or(0.0)
}
