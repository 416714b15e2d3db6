//! Portfolio status snapshots published by the engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ledger::PositionLedger;
use crate::position::{Position, RiskState};
use crate::risk::{yield_report, YieldReport};

/// Engine run state as shown to operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Stopped,
    Building,
    Running,
    /// Monitoring, but the last tick had data or liquidation failures
    Degraded,
    Liquidating,
    /// Emergency liquidation triggered; cleared by the next start
    Emergency,
    Error,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Building => "building",
            Self::Running => "running",
            Self::Degraded => "degraded",
            Self::Liquidating => "liquidating",
            Self::Emergency => "emergency",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only view of one position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionView {
    pub level: usize,
    pub asset: String,
    pub tier: u8,
    pub collateral_qty: f64,
    pub entry_price: f64,
    pub last_price: f64,
    pub collateral_value: f64,
    pub loan_amount: f64,
    pub ltv: f64,
    pub risk_state: RiskState,
    pub missed_quotes: u32,
    pub order_id: Option<String>,
}

impl From<&Position> for PositionView {
    fn from(p: &Position) -> Self {
        Self {
            level: p.level,
            asset: p.asset.clone(),
            tier: p.tier,
            collateral_qty: p.collateral_qty,
            entry_price: p.entry_price,
            last_price: p.last_price,
            collateral_value: p.current_value(),
            loan_amount: p.loan_amount,
            ltv: p.ltv,
            risk_state: p.risk_state,
            missed_quotes: p.missed_quotes,
            order_id: p.order_id.clone(),
        }
    }
}

/// Point-in-time portfolio status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioSnapshot {
    pub run_state: RunState,
    /// Last error or notable event
    pub message: Option<String>,
    pub total_positions: usize,
    pub initial_capital: f64,
    pub total_deployed: f64,
    pub total_borrowed: f64,
    pub total_collateral_value: f64,
    pub global_ltv: f64,
    /// total_borrowed / initial_capital
    pub leverage_ratio: f64,
    pub risk_state: RiskState,
    pub margin_level: Option<f64>,
    pub yield_report: YieldReport,
    pub circuit_breaker: bool,
    pub updated_at: DateTime<Utc>,
    pub positions: Vec<PositionView>,
}

impl PortfolioSnapshot {
    /// Empty snapshot for an engine that has never started.
    pub fn idle() -> Self {
        Self {
            run_state: RunState::Stopped,
            message: None,
            total_positions: 0,
            initial_capital: 0.0,
            total_deployed: 0.0,
            total_borrowed: 0.0,
            total_collateral_value: 0.0,
            global_ltv: 0.0,
            leverage_ratio: 0.0,
            risk_state: RiskState::Healthy,
            margin_level: None,
            yield_report: YieldReport::default(),
            circuit_breaker: false,
            updated_at: Utc::now(),
            positions: Vec::new(),
        }
    }

    /// Refresh every ledger-derived field.
    pub fn refresh_positions(&mut self, ledger: &PositionLedger) {
        self.positions = ledger.positions().iter().map(PositionView::from).collect();
        self.total_positions = ledger.len();
        self.total_borrowed = ledger.total_borrowed();
        self.total_collateral_value = ledger.total_collateral_value();
        self.global_ltv = ledger.global_ltv();
        self.leverage_ratio = if self.initial_capital > 0.0 {
            self.total_borrowed / self.initial_capital
        } else {
            0.0
        };
        self.yield_report = yield_report(ledger);
        self.updated_at = Utc::now();
    }
}

impl Default for PortfolioSnapshot {
    fn default() -> Self {
        Self::idle()
    }
}
