//! Position ledger for the cascade.
//!
//! Append-only while a build is in progress, drain-only while a
//! liquidation is in progress. The two phases never overlap.

use serde::{Deserialize, Serialize};

use crate::error::LedgerError;
use crate::position::{ltv, Position};

/// Mutation phase of the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Idle,
    Building,
    Liquidating,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Building => "building",
            Self::Liquidating => "liquidating",
        })
    }
}

/// Ordered record of committed cascade levels (level 1 first).
#[derive(Debug, Clone)]
pub struct PositionLedger {
    positions: Vec<Position>,
    phase: Phase,
}

impl PositionLedger {
    pub fn new() -> Self {
        Self {
            positions: Vec::new(),
            phase: Phase::Idle,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn positions(&self) -> &[Position] {
        &self.positions
    }

    /// Mutable access for repricing. Does not change the set of levels.
    pub(crate) fn positions_mut(&mut self) -> &mut [Position] {
        &mut self.positions
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn get(&self, level: usize) -> Option<&Position> {
        self.positions.iter().find(|p| p.level == level)
    }

    /// Highest level currently open.
    pub fn deepest(&self) -> Option<&Position> {
        self.positions.iter().max_by_key(|p| p.level)
    }

    /// Next level index to open.
    pub fn next_level(&self) -> usize {
        self.positions.iter().map(|p| p.level).max().unwrap_or(0) + 1
    }

    pub fn begin_build(&mut self) -> Result<(), LedgerError> {
        self.transition(Phase::Idle, Phase::Building, "begin build")
    }

    pub fn finish_build(&mut self) -> Result<(), LedgerError> {
        self.transition(Phase::Building, Phase::Idle, "finish build")
    }

    pub fn begin_liquidation(&mut self) -> Result<(), LedgerError> {
        self.transition(Phase::Idle, Phase::Liquidating, "begin liquidation")
    }

    pub fn finish_liquidation(&mut self) -> Result<(), LedgerError> {
        self.transition(Phase::Liquidating, Phase::Idle, "finish liquidation")
    }

    fn transition(&mut self, from: Phase, to: Phase, operation: &'static str) -> Result<(), LedgerError> {
        if self.phase != from {
            return Err(LedgerError::WrongPhase {
                operation,
                phase: self.phase,
            });
        }
        self.phase = to;
        Ok(())
    }

    /// Commit a fully executed level.
    pub fn append(&mut self, position: Position) -> Result<(), LedgerError> {
        self.require(Phase::Building, "append")?;
        self.positions.push(position);
        Ok(())
    }

    /// Mutable access to one position during liquidation.
    pub fn position_mut(&mut self, level: usize) -> Result<&mut Position, LedgerError> {
        self.require(Phase::Liquidating, "modify position")?;
        self.positions
            .iter_mut()
            .find(|p| p.level == level)
            .ok_or(LedgerError::UnknownLevel(level))
    }

    /// Remove a fully unwound position.
    pub fn remove(&mut self, level: usize) -> Result<Position, LedgerError> {
        self.require(Phase::Liquidating, "remove")?;
        let idx = self
            .positions
            .iter()
            .position(|p| p.level == level)
            .ok_or(LedgerError::UnknownLevel(level))?;
        Ok(self.positions.remove(idx))
    }

    fn require(&self, phase: Phase, operation: &'static str) -> Result<(), LedgerError> {
        if self.phase == phase {
            Ok(())
        } else {
            Err(LedgerError::WrongPhase {
                operation,
                phase: self.phase,
            })
        }
    }

    /// Levels ordered deepest first.
    pub fn levels_deepest_first(&self) -> Vec<usize> {
        let mut levels: Vec<usize> = self.positions.iter().map(|p| p.level).collect();
        levels.sort_unstable_by(|a, b| b.cmp(a));
        levels
    }

    pub fn total_borrowed(&self) -> f64 {
        self.positions.iter().map(|p| p.loan_amount).sum()
    }

    /// Collateral value at each position's last price.
    pub fn total_collateral_value(&self) -> f64 {
        self.positions.iter().map(|p| p.current_value()).sum()
    }

    /// Aggregate LTV: total borrowed / total collateral value.
    pub fn global_ltv(&self) -> f64 {
        ltv(self.total_borrowed(), self.total_collateral_value())
    }
}

impl Default for PositionLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::test_position;

    fn built_ledger() -> PositionLedger {
        let mut ledger = PositionLedger::new();
        ledger.begin_build().unwrap();
        ledger.append(test_position(1, "BTC", 0.02, 50_000.0, 630.0)).unwrap();
        ledger.append(test_position(2, "ETH", 0.315, 2_000.0, 283.5)).unwrap();
        ledger.finish_build().unwrap();
        ledger
    }

    #[test]
    fn test_append_only_while_building() {
        let mut ledger = PositionLedger::new();
        let err = ledger.append(test_position(1, "BTC", 1.0, 1.0, 0.5)).unwrap_err();
        assert_eq!(
            err,
            LedgerError::WrongPhase {
                operation: "append",
                phase: Phase::Idle
            }
        );

        ledger.begin_build().unwrap();
        assert!(ledger.append(test_position(1, "BTC", 1.0, 1.0, 0.5)).is_ok());
        assert_eq!(ledger.next_level(), 2);
    }

    #[test]
    fn test_build_and_liquidate_exclusive() {
        let mut ledger = PositionLedger::new();
        ledger.begin_build().unwrap();
        assert!(ledger.begin_liquidation().is_err());
        assert!(ledger.begin_build().is_err());
        ledger.finish_build().unwrap();

        ledger.begin_liquidation().unwrap();
        assert!(ledger.begin_build().is_err());
        assert!(ledger.append(test_position(1, "BTC", 1.0, 1.0, 0.5)).is_err());
        ledger.finish_liquidation().unwrap();
        assert_eq!(ledger.phase(), Phase::Idle);
    }

    #[test]
    fn test_drain_only_while_liquidating() {
        let mut ledger = built_ledger();
        assert!(ledger.remove(2).is_err());
        assert!(ledger.position_mut(1).is_err());

        ledger.begin_liquidation().unwrap();
        assert_eq!(ledger.levels_deepest_first(), vec![2, 1]);
        let removed = ledger.remove(2).unwrap();
        assert_eq!(removed.asset, "ETH");
        assert_eq!(ledger.remove(7).unwrap_err(), LedgerError::UnknownLevel(7));
        ledger.position_mut(1).unwrap().loan_amount = 0.0;
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_totals() {
        let ledger = built_ledger();
        assert!((ledger.total_borrowed() - 913.5).abs() < 1e-9);
        assert!((ledger.total_collateral_value() - 1_630.0).abs() < 1e-9);
        assert!((ledger.global_ltv() - 913.5 / 1_630.0).abs() < 1e-9);
        assert_eq!(ledger.deepest().map(|p| p.level), Some(2));
    }

    #[test]
    fn test_empty_ledger_ltv_is_zero() {
        let ledger = PositionLedger::new();
        assert_eq!(ledger.global_ltv(), 0.0);
        assert_eq!(ledger.next_level(), 1);
        assert!(ledger.deepest().is_none());
    }
}
