//! Cascade engine orchestration.
//!
//! The engine exclusively owns the portfolio. Builds, liquidations and
//! monitor ticks all run under one async mutex, so they never overlap.
//! Status reads go to a separately published snapshot and never wait on it.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::builder::{run_build, BuildOutcome, BuildReport};
use crate::config::EngineConfig;
use crate::error::{EngineError, LedgerError};
use crate::ledger::PositionLedger;
use crate::liquidator::{LiquidationMode, LiquidationReport, Liquidator};
use crate::planner::{plan, PlanParams};
use crate::position::RiskState;
use crate::risk::{assess, fetch_quotes, RiskAssessment};
use crate::status::{PortfolioSnapshot, RunState};
use crate::tiers::TierTable;
use cascade_api::{pair_symbol, ExchangeGateway};

/// How often `wait_monitor` checks on the monitor task.
const MONITOR_POLL: Duration = Duration::from_millis(100);

/// What the monitor did in a tick.
#[derive(Debug, Clone, PartialEq)]
pub enum MonitorAction {
    None,
    /// WARNING: logged only
    Flagged,
    /// REDUCE entered: deepest position partially unwound
    Reduced(LiquidationReport),
    /// EMERGENCY or a pending stop: full liquidation attempted
    Liquidated(LiquidationReport),
    /// The liquidation could not run at all
    Failed(String),
}

/// Result of one monitor tick.
#[derive(Debug, Clone, PartialEq)]
pub struct TickReport {
    pub assessment: RiskAssessment,
    pub action: MonitorAction,
    /// No positions left; the background monitor exits on this
    pub ledger_empty: bool,
}

/// Mutable portfolio state, only touched under the portfolio lock.
struct Portfolio {
    ledger: PositionLedger,
    initial_capital: f64,
    total_deployed: f64,
    run_state: RunState,
    message: Option<String>,
    circuit_breaker: bool,
    /// Liquidation still owed after a stop or an emergency
    pending: Option<LiquidationMode>,
    /// Governing state at the previous tick
    last_governing: RiskState,
    /// A REDUCE unwind failed and is retried while REDUCE persists
    reduce_owed: bool,
    margin_level: Option<f64>,
}

impl Portfolio {
    fn new() -> Self {
        Self {
            ledger: PositionLedger::new(),
            initial_capital: 0.0,
            total_deployed: 0.0,
            run_state: RunState::Stopped,
            message: None,
            circuit_breaker: false,
            pending: None,
            last_governing: RiskState::Healthy,
            reduce_owed: false,
            margin_level: None,
        }
    }
}

struct Control {
    running: bool,
    build_cancel: CancellationToken,
    monitor_cancel: CancellationToken,
    monitor: Option<JoinHandle<()>>,
}

impl Control {
    fn monitor_alive(&self) -> bool {
        self.monitor.as_ref().map(|h| !h.is_finished()).unwrap_or(false)
    }
}

/// Cascade leverage engine.
pub struct Engine {
    gateway: Arc<dyn ExchangeGateway>,
    config: Arc<EngineConfig>,
    tiers: Arc<TierTable>,
    liquidator: Arc<Liquidator>,
    portfolio: Arc<AsyncMutex<Portfolio>>,
    snapshot: Arc<RwLock<PortfolioSnapshot>>,
    control: Arc<Mutex<Control>>,
}

impl Engine {
    /// Create an engine after validating the configuration and tier table.
    pub fn new(
        gateway: Arc<dyn ExchangeGateway>,
        config: EngineConfig,
        tiers: TierTable,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        tiers.validate()?;

        let liquidator = Liquidator::new(gateway.clone(), config.cascade.base_asset.clone())
            .with_repay_buffer(config.liquidation.repay_buffer_pct)
            .with_call_timeout(config.monitor.quote_timeout());

        Ok(Self {
            gateway,
            config: Arc::new(config),
            tiers: Arc::new(tiers),
            liquidator: Arc::new(liquidator),
            portfolio: Arc::new(AsyncMutex::new(Portfolio::new())),
            snapshot: Arc::new(RwLock::new(PortfolioSnapshot::idle())),
            control: Arc::new(Mutex::new(Control {
                running: false,
                build_cancel: CancellationToken::new(),
                monitor_cancel: CancellationToken::new(),
                monitor: None,
            })),
        })
    }

    /// Clone Arc references for the spawned monitor.
    fn clone_refs(&self) -> Self {
        Self {
            gateway: self.gateway.clone(),
            config: self.config.clone(),
            tiers: self.tiers.clone(),
            liquidator: self.liquidator.clone(),
            portfolio: self.portfolio.clone(),
            snapshot: self.snapshot.clone(),
            control: self.control.clone(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The tier table in use.
    pub fn asset_config(&self) -> TierTable {
        self.tiers.as_ref().clone()
    }

    /// Last published snapshot.
    pub fn status(&self) -> PortfolioSnapshot {
        self.snapshot.read().clone()
    }

    pub fn is_running(&self) -> bool {
        self.control.lock().running
    }

    fn publish(&self, portfolio: &Portfolio) {
        let mut snap = self.snapshot.write();
        snap.run_state = portfolio.run_state;
        snap.message = portfolio.message.clone();
        snap.initial_capital = portfolio.initial_capital;
        snap.total_deployed = portfolio.total_deployed;
        snap.circuit_breaker = portfolio.circuit_breaker;
        snap.margin_level = portfolio.margin_level;
        snap.risk_state = portfolio.last_governing;
        snap.refresh_positions(&portfolio.ledger);
    }

    fn spawn_monitor(&self, control: &mut Control) {
        let engine = self.clone_refs();
        let cancel = control.monitor_cancel.clone();
        control.monitor = Some(tokio::spawn(async move {
            engine.monitor_loop(cancel).await;
        }));
    }

    /// Plan and build the cascade, then start the risk monitor.
    ///
    /// Rejects a second start while running, capital above the configured
    /// limit, and capital the exchange wallet cannot cover.
    #[instrument(skip(self))]
    pub async fn start(&self, initial_capital: f64) -> Result<BuildReport, EngineError> {
        let build_cancel = {
            let mut control = self.control.lock();
            if control.running {
                return Err(EngineError::AlreadyRunning);
            }
            control.running = true;
            control.build_cancel = CancellationToken::new();
            control.monitor_cancel = CancellationToken::new();
            control.build_cancel.clone()
        };

        let result = self.build_portfolio(initial_capital, &build_cancel).await;

        let mut control = self.control.lock();
        match &result {
            Ok(report) if report.committed_levels > 0 => {
                if !build_cancel.is_cancelled() {
                    self.spawn_monitor(&mut control);
                }
            }
            // A cancelled start is finished by `stop`
            _ if build_cancel.is_cancelled() => {}
            _ => control.running = false,
        }
        result
    }

    async fn build_portfolio(
        &self,
        capital: f64,
        cancel: &CancellationToken,
    ) -> Result<BuildReport, EngineError> {
        let cfg = &self.config.cascade;

        if !(capital.is_finite() && capital > 0.0) {
            return Err(EngineError::InvalidCapital(capital));
        }
        if capital > cfg.max_initial_capital {
            return Err(EngineError::CapitalLimit {
                requested: capital,
                limit: cfg.max_initial_capital,
            });
        }
        let available = self.gateway.free_balance(&cfg.base_asset).await?;
        if available < capital {
            return Err(EngineError::InsufficientBalance {
                asset: cfg.base_asset.clone(),
                available,
                required: capital,
            });
        }

        let mut portfolio = self.portfolio.lock().await;
        if !portfolio.ledger.is_empty() {
            return Err(EngineError::AlreadyRunning);
        }
        portfolio.initial_capital = capital;
        portfolio.total_deployed = 0.0;
        portfolio.run_state = RunState::Building;
        portfolio.message = None;
        portfolio.circuit_breaker = false;
        portfolio.pending = None;
        portfolio.last_governing = RiskState::Healthy;
        portfolio.reduce_owed = false;
        portfolio.margin_level = None;
        self.publish(&portfolio);

        info!(capital, venue = self.gateway.venue(), "Starting cascade build");

        let symbols: Vec<String> = self
            .tiers
            .active_assets()
            .map(|a| pair_symbol(&a.symbol, &cfg.base_asset))
            .collect();
        let quotes = fetch_quotes(self.gateway.as_ref(), &symbols, self.config.monitor.quote_timeout()).await;
        let prices: HashMap<String, f64> = self
            .tiers
            .active_assets()
            .filter_map(|a| {
                let symbol = pair_symbol(&a.symbol, &cfg.base_asset);
                match quotes.get(&symbol) {
                    Some(Ok(price)) => Some((a.symbol.clone(), *price)),
                    Some(Err(e)) => {
                        warn!(error = %e, "No quote for tier asset");
                        None
                    }
                    None => None,
                }
            })
            .collect();

        let plan = match plan(capital, &self.tiers, &PlanParams::from(cfg), &prices, &cfg.base_asset) {
            Ok(plan) => plan,
            Err(e) => {
                error!(error = %e, "Cascade planning failed");
                portfolio.run_state = RunState::Error;
                portfolio.message = Some(e.to_string());
                self.publish(&portfolio);
                return Err(e.into());
            }
        };
        info!(
            levels = plan.levels.len(),
            planned_borrow = plan.total_borrowed(),
            stop = ?plan.stop_reason,
            "Cascade planned"
        );

        let snapshot = &self.snapshot;
        let built = run_build(
            self.gateway.as_ref(),
            &mut portfolio.ledger,
            &plan,
            cfg,
            &self.tiers,
            cancel,
            |ledger| snapshot.write().refresh_positions(ledger),
        )
        .await;

        let report = match built {
            Ok(report) => report,
            Err(e) => {
                portfolio.run_state = RunState::Error;
                portfolio.message = Some(e.to_string());
                self.publish(&portfolio);
                return Err(e);
            }
        };

        portfolio.total_deployed = report.total_deployed;
        portfolio.message = match &report.outcome {
            BuildOutcome::Completed(_) => None,
            BuildOutcome::Cancelled { next_level } => {
                Some(format!("build cancelled before level {}", next_level))
            }
            BuildOutcome::Failed { error, .. } => Some(error.clone()),
        };
        portfolio.run_state = match (&report.outcome, portfolio.ledger.is_empty()) {
            (_, false) => RunState::Running,
            (BuildOutcome::Failed { .. }, true) => RunState::Error,
            (_, true) => RunState::Stopped,
        };
        self.publish(&portfolio);

        info!(
            committed = report.committed_levels,
            deployed = report.total_deployed,
            borrowed = report.total_borrowed,
            outcome = ?report.outcome,
            "Cascade build finished"
        );
        Ok(report)
    }

    /// Cancel any in-flight build and liquidate everything with cash-out.
    ///
    /// Waits for a level that is mid-commit. Positions that cannot be
    /// closed stay with the monitor, which retries every tick until the
    /// ledger is empty.
    #[instrument(skip(self))]
    pub async fn stop(&self) -> Result<LiquidationReport, EngineError> {
        self.control.lock().build_cancel.cancel();
        info!("Stop requested");

        let mut portfolio = self.portfolio.lock().await;
        let mode = LiquidationMode::Full { cash_out: true };
        portfolio.pending = Some(mode);
        portfolio.reduce_owed = false;
        portfolio.run_state = RunState::Liquidating;
        self.publish(&portfolio);

        let report = match self.liquidator.liquidate(&mut portfolio.ledger, mode).await {
            Ok(report) => report,
            Err(e) => {
                portfolio.message = Some(e.to_string());
                self.publish(&portfolio);
                return Err(e.into());
            }
        };

        if portfolio.ledger.is_empty() {
            portfolio.pending = None;
            portfolio.last_governing = RiskState::Healthy;
            if !portfolio.circuit_breaker {
                portfolio.run_state = RunState::Stopped;
            }
            portfolio.message = Some("stopped, all positions closed".to_string());
            self.publish(&portfolio);

            let mut control = self.control.lock();
            control.monitor_cancel.cancel();
            control.running = false;
            info!("Engine stopped");
        } else {
            portfolio.message = Some(format!(
                "{} position(s) could not be closed, retrying every tick",
                portfolio.ledger.len()
            ));
            self.publish(&portfolio);

            let mut control = self.control.lock();
            if !control.monitor_alive() {
                control.monitor_cancel = CancellationToken::new();
                self.spawn_monitor(&mut control);
            }
            warn!(remaining = report.remaining_positions, "Stop left positions open");
        }

        Ok(report)
    }

    /// One risk-monitor pass.
    ///
    /// Never fails: data and liquidation errors are logged and surface
    /// through the status snapshot.
    #[instrument(skip(self))]
    pub async fn tick(&self) -> TickReport {
        let mut guard = self.portfolio.lock().await;
        let portfolio = &mut *guard;
        let timeout = self.config.monitor.quote_timeout();

        let mut symbols: Vec<String> = portfolio.ledger.positions().iter().map(|p| p.symbol.clone()).collect();
        symbols.sort();
        symbols.dedup();

        let has_positions = !portfolio.ledger.is_empty();
        let (quotes, margin_level) = tokio::join!(
            fetch_quotes(self.gateway.as_ref(), &symbols, timeout),
            async {
                if !has_positions {
                    return None;
                }
                match tokio::time::timeout(timeout, self.gateway.margin_level()).await {
                    Ok(Ok(level)) => Some(level),
                    Ok(Err(e)) => {
                        warn!(error = %e, "Margin level unavailable");
                        None
                    }
                    Err(_) => {
                        warn!(timeout_ms = timeout.as_millis() as u64, "Margin level query timed out");
                        None
                    }
                }
            }
        );

        let assessment = assess(&mut portfolio.ledger, &quotes, margin_level, &self.config.risk);
        let previous = portfolio.last_governing;
        portfolio.last_governing = assessment.governing;
        portfolio.margin_level = margin_level;
        if assessment.governing != RiskState::Reduce {
            portfolio.reduce_owed = false;
        }

        debug!(
            global_ltv = assessment.global_ltv,
            governing = %assessment.governing,
            margin_level = ?margin_level,
            positions = portfolio.ledger.len(),
            "Risk tick"
        );

        let action = if let Some(mode) = portfolio.pending {
            info!(remaining = portfolio.ledger.len(), "Retrying pending liquidation");
            self.liquidate(portfolio, mode).await
        } else {
            match assessment.governing {
                RiskState::Emergency => {
                    error!(
                        global_ltv = assessment.global_ltv,
                        stale = ?assessment.stale_levels,
                        "EMERGENCY: liquidating all positions"
                    );
                    let mode = LiquidationMode::Full {
                        cash_out: self.config.liquidation.emergency_cash_out,
                    };
                    portfolio.circuit_breaker = true;
                    portfolio.run_state = RunState::Emergency;
                    portfolio.pending = Some(mode);
                    self.liquidate(portfolio, mode).await
                }
                RiskState::Reduce if previous < RiskState::Reduce || portfolio.reduce_owed => {
                    warn!(
                        global_ltv = assessment.global_ltv,
                        fraction = self.config.liquidation.partial_fraction,
                        "REDUCE: partially unwinding deepest position"
                    );
                    let mode = LiquidationMode::Partial {
                        fraction: self.config.liquidation.partial_fraction,
                    };
                    let action = match self.liquidate(portfolio, mode).await {
                        MonitorAction::Liquidated(report) => MonitorAction::Reduced(report),
                        other => other,
                    };
                    portfolio.reduce_owed = !matches!(&action, MonitorAction::Reduced(r) if r.is_complete());
                    action
                }
                RiskState::Warning => {
                    if previous < RiskState::Warning {
                        warn!(global_ltv = assessment.global_ltv, "WARNING: LTV above warn threshold");
                    }
                    MonitorAction::Flagged
                }
                _ => MonitorAction::None,
            }
        };

        let ledger_empty = portfolio.ledger.is_empty();
        if ledger_empty {
            portfolio.pending = None;
            portfolio.last_governing = RiskState::Healthy;
            portfolio.reduce_owed = false;
            if portfolio.run_state != RunState::Emergency {
                portfolio.run_state = RunState::Stopped;
            }
        } else if matches!(portfolio.run_state, RunState::Running | RunState::Degraded) {
            let failed = match &action {
                MonitorAction::Reduced(report) | MonitorAction::Liquidated(report) => !report.is_complete(),
                MonitorAction::Failed(_) => true,
                _ => false,
            };
            if failed || !assessment.data_errors.is_empty() {
                portfolio.run_state = RunState::Degraded;
                portfolio.message = assessment.data_errors.first().cloned().or_else(|| match &action {
                    MonitorAction::Reduced(r) | MonitorAction::Liquidated(r) => {
                        r.failures.first().map(|f| f.to_string())
                    }
                    MonitorAction::Failed(msg) => Some(msg.clone()),
                    _ => None,
                });
            } else {
                portfolio.run_state = RunState::Running;
            }
        }
        self.publish(portfolio);

        TickReport {
            assessment,
            action,
            ledger_empty,
        }
    }

    async fn liquidate(&self, portfolio: &mut Portfolio, mode: LiquidationMode) -> MonitorAction {
        match self.liquidator.liquidate(&mut portfolio.ledger, mode).await {
            Ok(report) => {
                if !report.is_complete() {
                    portfolio.message = report.failures.first().map(|f| f.to_string());
                } else if portfolio.ledger.is_empty() && portfolio.pending.is_some() {
                    portfolio.message = Some("liquidation complete".to_string());
                }
                MonitorAction::Liquidated(report)
            }
            Err(e) => {
                let msg = liquidation_blocked(&e);
                error!(error = %e, "Liquidation could not run");
                portfolio.message = Some(msg.clone());
                MonitorAction::Failed(msg)
            }
        }
    }

    /// Background loop: tick every interval until cancelled or the ledger
    /// is empty.
    async fn monitor_loop(self, cancel: CancellationToken) {
        let mut ticker = interval(self.config.monitor.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        info!(interval_secs = self.config.monitor.interval_secs, "Risk monitor started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Risk monitor cancelled");
                    return;
                }
                _ = ticker.tick() => {}
            }
            if cancel.is_cancelled() {
                return;
            }

            let report = self.tick().await;
            if report.ledger_empty {
                info!("No open positions, risk monitor exiting");
                break;
            }
        }

        if !cancel.is_cancelled() {
            self.control.lock().running = false;
        }
    }

    /// Wait for the background monitor to exit.
    ///
    /// Cancel-safe: the task handle stays with the engine until the monitor
    /// has finished, so dropping this future never detaches it.
    pub async fn wait_monitor(&self) {
        loop {
            let finished = {
                let mut control = self.control.lock();
                if control.monitor_alive() {
                    None
                } else {
                    Some(control.monitor.take())
                }
            };
            match finished {
                None => tokio::time::sleep(MONITOR_POLL).await,
                Some(Some(handle)) => {
                    if let Err(e) = handle.await {
                        error!(error = %e, "Risk monitor task failed");
                    }
                    return;
                }
                Some(None) => return,
            }
        }
    }
}

fn liquidation_blocked(e: &LedgerError) -> String {
    format!("liquidation blocked: {}", e)
}
