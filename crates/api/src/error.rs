//! Gateway error types.

use std::fmt;
use thiserror::Error;

/// Why the exchange refused a margin borrow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BorrowFailure {
    /// Borrow would exceed the account or pool borrow limit
    Limit(String),
    /// Not enough collateral / balance backing the loan
    Balance(String),
    /// Anything else (transport, unknown exchange code)
    Other(String),
}

impl fmt::Display for BorrowFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Limit(msg) => write!(f, "limit: {}", msg),
            Self::Balance(msg) => write!(f, "balance: {}", msg),
            Self::Other(msg) => write!(f, "other: {}", msg),
        }
    }
}

/// Failure of a single exchange call.
///
/// Every variant names the operation that failed so callers can decide how
/// to recover without inspecting messages.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GatewayError {
    #[error("price unavailable for {symbol}: {reason}")]
    PriceUnavailable { symbol: String, reason: String },

    #[error("order failed for {symbol}: {reason}")]
    OrderFailed { symbol: String, reason: String },

    #[error("margin transfer of {asset} failed: {reason}")]
    TransferFailed { asset: String, reason: String },

    #[error("borrow of {asset} failed ({reason})")]
    BorrowFailed { asset: String, reason: BorrowFailure },

    #[error("repay of {asset} failed: {reason}")]
    RepayFailed { asset: String, reason: String },

    #[error("flexible savings deposit of {asset} failed: {reason}")]
    SavingsFailed { asset: String, reason: String },

    #[error("balance unavailable for {asset}: {reason}")]
    BalanceUnavailable { asset: String, reason: String },

    #[error("account query failed: {0}")]
    AccountUnavailable(String),

    #[error("API credentials are required for signed endpoints")]
    MissingCredentials,

    #[error("request signing failed: {0}")]
    Signing(String),
}

impl GatewayError {
    /// Build a `PriceUnavailable` error.
    pub fn price(symbol: &str, reason: impl Into<String>) -> Self {
        Self::PriceUnavailable {
            symbol: symbol.to_string(),
            reason: reason.into(),
        }
    }

    /// Build an `OrderFailed` error.
    pub fn order(symbol: &str, reason: impl Into<String>) -> Self {
        Self::OrderFailed {
            symbol: symbol.to_string(),
            reason: reason.into(),
        }
    }

    /// Build a `TransferFailed` error.
    pub fn transfer(asset: &str, reason: impl Into<String>) -> Self {
        Self::TransferFailed {
            asset: asset.to_string(),
            reason: reason.into(),
        }
    }

    /// Build a `RepayFailed` error.
    pub fn repay(asset: &str, reason: impl Into<String>) -> Self {
        Self::RepayFailed {
            asset: asset.to_string(),
            reason: reason.into(),
        }
    }

    /// Check if this error is a missing or failed price quote.
    pub fn is_price_unavailable(&self) -> bool {
        matches!(self, Self::PriceUnavailable { .. })
    }
}
