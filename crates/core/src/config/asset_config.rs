//! Tier table loading from TOML files.

use anyhow::Context;
use std::path::Path;

use crate::tiers::TierTable;

impl TierTable {
    /// Load a tier table from a TOML file of `[[assets]]` entries.
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading tier table {}", path.display()))?;
        let table = Self::from_toml(&content)
            .with_context(|| format!("parsing tier table {}", path.display()))?;
        Ok(table)
    }

    /// Parse and validate a tier table from TOML text.
    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let table: TierTable = toml::from_str(content)?;
        table.validate()?;
        Ok(table)
    }

    /// Load from the path in CASCADE_ASSETS, or fall back to the built-in table.
    pub fn from_env() -> anyhow::Result<Self> {
        match std::env::var("CASCADE_ASSETS") {
            Ok(path) if !path.is_empty() => Self::from_file(path),
            _ => Ok(Self::default()),
        }
    }
}
