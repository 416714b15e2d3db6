//! Error taxonomy for the cascade engine.
//!
//! Planning and execution errors abort a build; risk-data and liquidation
//! errors are recovered inside the monitor loop and surface through status.

use cascade_api::GatewayError;
use thiserror::Error;

use crate::ledger::Phase;

/// Why a cascade could not be planned.
///
/// Reaching `min_trade_size` is normal termination and never an error.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PlanningError {
    #[error("insufficient capital: {capital} cannot open a level (min trade size {min_trade_size})")]
    InsufficientCapital { capital: f64, min_trade_size: f64 },

    #[error("no eligible asset for level {level}")]
    NoEligibleAsset { level: usize },

    #[error("no price quote for {symbol}")]
    PriceUnavailable { symbol: String },
}

/// One of the three sub-actions that make up a cascade level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LevelStep {
    Buy,
    Transfer,
    Borrow,
}

impl std::fmt::Display for LevelStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Buy => "buy",
            Self::Transfer => "transfer",
            Self::Borrow => "borrow",
        })
    }
}

/// An exchange call failed while executing a level.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("level {level} failed at {step}: {source}")]
pub struct ExecutionError {
    pub level: usize,
    pub step: LevelStep,
    #[source]
    pub source: GatewayError,
}

/// Price data problem for one position in a monitor tick.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RiskDataError {
    #[error("no quote for {symbol}: {reason}")]
    MissingQuote { symbol: String, reason: String },

    #[error("quote for {symbol} timed out after {timeout_ms}ms")]
    QuoteTimeout { symbol: String, timeout_ms: u64 },
}

/// One reversal step of a liquidation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReversalStep {
    /// Selling collateral to cover a repay shortfall
    CoverShortfall,
    Repay,
    TransferOut,
    CashOut,
}

impl std::fmt::Display for ReversalStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::CoverShortfall => "cover_shortfall",
            Self::Repay => "repay",
            Self::TransferOut => "transfer_out",
            Self::CashOut => "cash_out",
        })
    }
}

/// A reversal step failed for one position.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("liquidation of level {level} ({asset}) failed at {step}: {source}")]
pub struct LiquidationError {
    pub level: usize,
    pub asset: String,
    pub step: ReversalStep,
    #[source]
    pub source: GatewayError,
}

/// Ledger mutation attempted in the wrong phase.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("cannot {operation} while ledger is {phase}")]
    WrongPhase { operation: &'static str, phase: Phase },

    #[error("no position at level {0}")]
    UnknownLevel(usize),
}

/// Invalid configuration or tier table.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("risk thresholds must satisfy 0 < warn < reduce < emergency (got {warn}/{reduce}/{emergency})")]
    Thresholds { warn: f64, reduce: f64, emergency: f64 },

    #[error("{field}: {reason}")]
    Invalid { field: String, reason: String },

    #[error("tier {tier} max LTV {max_ltv} must be below tier {prev_tier} max LTV {prev_max_ltv}")]
    TierOrdering {
        tier: u8,
        max_ltv: f64,
        prev_tier: u8,
        prev_max_ltv: f64,
    },
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Errors surfaced by the engine control surface.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    #[error("engine is already running")]
    AlreadyRunning,

    #[error("capital {requested} exceeds configured limit {limit}")]
    CapitalLimit { requested: f64, limit: f64 },

    #[error("insufficient {asset} balance: {available} available, {required} required")]
    InsufficientBalance {
        asset: String,
        available: f64,
        required: f64,
    },

    #[error("invalid capital {0}")]
    InvalidCapital(f64),

    #[error(transparent)]
    Planning(#[from] PlanningError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_error_display() {
        let err = ExecutionError {
            level: 2,
            step: LevelStep::Borrow,
            source: GatewayError::BorrowFailed {
                asset: "USDT".to_string(),
                reason: cascade_api::BorrowFailure::Limit("max borrowable exceeded".to_string()),
            },
        };
        let msg = err.to_string();
        assert!(msg.starts_with("level 2 failed at borrow"));
        assert!(msg.contains("limit"));
    }

    #[test]
    fn test_engine_error_from_planning() {
        let err: EngineError = PlanningError::NoEligibleAsset { level: 1 }.into();
        assert!(matches!(err, EngineError::Planning(_)));
        assert_eq!(err.to_string(), "no eligible asset for level 1");
    }
}
