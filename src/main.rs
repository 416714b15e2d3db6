//! Cascade Leverage Engine
//!
//! Deploys capital into a leveraged-yield cascade on a margin exchange:
//! buy collateral, pledge it, borrow against it, reinvest the loan one tier
//! down. A background risk monitor reduces or liquidates the cascade when
//! LTV crosses the configured thresholds.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cascade_api::{BinanceCredentials, BinanceMarginClient, ExchangeGateway, PaperExchange, RetryPolicy};
use cascade_core::{load_config_from_env, Engine, TierTable};

/// Environment variable names.
mod env {
    pub const INITIAL_CAPITAL: &str = "CASCADE_INITIAL_CAPITAL";
    pub const DRY_RUN: &str = "CASCADE_DRY_RUN";
    pub const PAPER_BALANCE: &str = "CASCADE_PAPER_BALANCE";
    pub const BINANCE_BASE_URL: &str = "BINANCE_BASE_URL";
    pub const BINANCE_MAX_RETRIES: &str = "BINANCE_MAX_RETRIES";
}

const DEFAULT_PAPER_BALANCE: f64 = 10_000.0;

#[tokio::main]
async fn main() -> Result<()> {
    print_banner();

    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,cascade_core=debug,cascade_api=debug")),
        )
        .init();

    // CASCADE_CONFIG (TOML path) wins over the CASCADE_PROFILE preset
    let config = load_config_from_env()?;
    config.log_config();

    let tiers = TierTable::from_env()?;
    info!(assets = tiers.len(), "Tier table loaded");

    let capital = initial_capital(config.cascade.max_initial_capital)?;
    let gateway = build_gateway(&config.cascade.base_asset);
    info!(venue = gateway.venue(), capital, "Starting Cascade Leverage Engine");

    let engine = Engine::new(gateway, config, tiers)?;

    let report = engine.start(capital).await?;
    info!(
        committed = report.committed_levels,
        planned = report.planned_levels,
        deployed = report.total_deployed,
        borrowed = report.total_borrowed,
        "Cascade built"
    );

    if report.committed_levels == 0 {
        warn!(outcome = ?report.outcome, "No levels committed, nothing to monitor");
        log_status(&engine);
        return Ok(());
    }

    // Run until the monitor exits with the ledger flat. An incomplete stop
    // leaves the monitor retrying; another signal retries the stop directly.
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received, unwinding cascade");
                match engine.stop().await {
                    Ok(liquidation) if liquidation.is_complete() => {
                        info!(reversals = liquidation.reversals.len(), "All positions closed");
                        break;
                    }
                    Ok(liquidation) => {
                        error!(
                            remaining = liquidation.remaining_positions,
                            failures = liquidation.failures.len(),
                            "Positions left open, monitor keeps retrying"
                        );
                    }
                    Err(e) => error!(error = %e, "Stop failed"),
                }
            }
            _ = engine.wait_monitor() => {
                info!("Risk monitor finished");
                break;
            }
        }
    }

    let remaining = engine.status().total_positions;
    if remaining > 0 {
        error!(remaining, "Exiting with open positions, manual action required");
    }
    log_status(&engine);
    Ok(())
}

/// Capital to deploy, from CASCADE_INITIAL_CAPITAL or the configured maximum.
fn initial_capital(max: f64) -> Result<f64> {
    match std::env::var(env::INITIAL_CAPITAL) {
        Ok(value) => value
            .parse::<f64>()
            .with_context(|| format!("Invalid {}: {}", env::INITIAL_CAPITAL, value)),
        Err(_) => Ok(max),
    }
}

/// Live Binance gateway when credentials are present, paper otherwise.
fn build_gateway(base: &str) -> Arc<dyn ExchangeGateway> {
    let dry_run = std::env::var(env::DRY_RUN)
        .map(|v| !v.is_empty() && v != "0" && v.to_lowercase() != "false")
        .unwrap_or(false);

    let mut client = BinanceMarginClient::new(BinanceCredentials::from_env());
    if let Ok(url) = std::env::var(env::BINANCE_BASE_URL) {
        client = client.with_base_url(url);
    }
    if let Some(max_retries) = std::env::var(env::BINANCE_MAX_RETRIES)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
    {
        client = client.with_retry(RetryPolicy {
            max_retries,
            ..RetryPolicy::default()
        });
    }

    if !dry_run && client.has_credentials() {
        info!("Binance credentials found, trading live");
        return Arc::new(client);
    }

    if !dry_run {
        warn!("No Binance credentials, falling back to paper trading");
    }
    let balance = std::env::var(env::PAPER_BALANCE)
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .unwrap_or(DEFAULT_PAPER_BALANCE);
    info!(balance, "Paper exchange with live public quotes");

    Arc::new(PaperExchange::new(base, balance).with_quote_source(Arc::new(client)))
}

fn log_status(engine: &Engine) {
    let status = engine.status();
    info!(
        state = %status.run_state,
        positions = status.total_positions,
        global_ltv = status.global_ltv,
        circuit_breaker = status.circuit_breaker,
        message = ?status.message,
        "Final status"
    );
    match serde_json::to_string_pretty(&status) {
        Ok(json) => println!("{}", json),
        Err(e) => warn!(error = %e, "Could not render status"),
    }
}

/// Print startup banner.
fn print_banner() {
    println!(
        r#"
    ╔═╗┌─┐┌─┐┌─┐┌─┐┌┬┐┌─┐
    ║  ├─┤└─┐│  ├─┤ ││├┤
    ╚═╝┴ ┴└─┘└─┘┴ ┴─┴┘└─┘
    Cascade Leverage Engine v0.1.0
    "#
    );
}
