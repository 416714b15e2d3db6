//! Cascade leverage engine core.
//!
//! This crate provides the leveraged-yield cascade:
//! - Asset tier table and tier-ordered collateral selection
//! - Cascade planning (pure, no exchange calls)
//! - Level-by-level build against an exchange gateway
//! - Position ledger with build/liquidation phases
//! - Risk monitoring with per-position and global LTV states
//! - Partial and full liquidation, deepest level first
//! - Engine orchestration and status snapshots

mod builder;
pub mod config;
mod engine;
mod error;
mod ledger;
mod liquidator;
mod planner;
mod position;
mod risk;
mod status;
mod tiers;

pub use builder::{execute_level, run_build, BuildOutcome, BuildReport};
pub use config::{
    load_config_from_env, CascadeConfig, EngineConfig, LiquidationConfig, MonitorConfig, RiskConfig,
};
pub use engine::{Engine, MonitorAction, TickReport};
pub use error::{
    ConfigError, EngineError, ExecutionError, LedgerError, LevelStep, LiquidationError, PlanningError,
    ReversalStep, RiskDataError,
};
pub use ledger::{Phase, PositionLedger};
pub use liquidator::{LiquidationMode, LiquidationReport, Liquidator, Reversal};
pub use planner::{max_borrow, plan, CascadePlan, LevelAction, PlanParams, StopReason};
pub use position::{ltv, Position, RiskState, RiskThresholds, DUST};
pub use risk::{assess, fetch_quotes, margin_state, yield_report, QuoteMap, RiskAssessment, YieldReport};
pub use status::{PortfolioSnapshot, PositionView, RunState};
pub use tiers::{select_asset, AssetConfig, TierTable, MAX_TIER, MIN_TIER};
