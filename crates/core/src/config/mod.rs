//! Configuration for the cascade engine.
//!
//! This module provides:
//! - Engine runtime configuration (profiles, thresholds, timing)
//! - Tier table loading from TOML

mod asset_config;
mod engine;

pub use engine::{CascadeConfig, EngineConfig, LiquidationConfig, MonitorConfig, RiskConfig};

use anyhow::Context;

/// Resolve the engine configuration from the environment.
///
/// A TOML path in CASCADE_CONFIG wins over the CASCADE_PROFILE preset.
pub fn load_config_from_env() -> anyhow::Result<EngineConfig> {
    match std::env::var("CASCADE_CONFIG") {
        Ok(path) if !path.is_empty() => EngineConfig::from_file(&path)
            .with_context(|| format!("loading engine config from {}", path)),
        _ => {
            let config = EngineConfig::from_env();
            config.validate()?;
            Ok(config)
        }
    }
}
