//! Exchange capability abstraction.
//!
//! The engine only ever talks to the exchange through `ExchangeGateway`.
//! Implementations are pure request/response and hold no portfolio state.
//!
//! # Example
//!
//! ```rust,ignore
//! use cascade_api::{ExchangeGateway, PaperExchange, TransferDirection};
//!
//! let exchange = PaperExchange::new("USDT", 1_000.0).with_price("BTCUSDT", 50_000.0);
//! let fill = exchange.market_buy("BTCUSDT", 500.0).await?;
//! exchange.margin_transfer("BTC", fill.quantity, TransferDirection::ToMargin).await?;
//! exchange.margin_borrow("USDT", 300.0).await?;
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug};

use crate::error::GatewayError;

/// Direction of a spot <-> margin transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferDirection {
    /// Spot wallet into the margin account
    ToMargin,
    /// Margin account back to the spot wallet
    FromMargin,
}

/// Exchange call kinds, classified by whether a retry is safe.
///
/// Trade-affecting calls are at-most-once: a timeout gives no information
/// about whether the exchange executed the request, so resubmitting could
/// double a market order or a loan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallKind {
    Price,
    FreeBalance,
    MarginLevel,
    MarketBuy,
    MarketSell,
    MarginTransfer,
    MarginBorrow,
    MarginRepay,
    SavingsDeposit,
}

impl CallKind {
    /// Read-only calls may be retried; everything else is submitted once.
    pub fn is_retry_safe(self) -> bool {
        matches!(self, Self::Price | Self::FreeBalance | Self::MarginLevel)
    }

    /// Short name for logging.
    pub fn name(self) -> &'static str {
        match self {
            Self::Price => "price",
            Self::FreeBalance => "free_balance",
            Self::MarginLevel => "margin_level",
            Self::MarketBuy => "market_buy",
            Self::MarketSell => "market_sell",
            Self::MarginTransfer => "margin_transfer",
            Self::MarginBorrow => "margin_borrow",
            Self::MarginRepay => "margin_repay",
            Self::SavingsDeposit => "savings_deposit",
        }
    }
}

impl fmt::Display for CallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Result of an executed market order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    /// Trading pair (e.g., "BTCUSDT")
    pub symbol: String,
    /// Exchange order id, if the venue reports one
    pub order_id: Option<String>,
    /// Executed quantity of the traded asset
    pub quantity: f64,
    /// Quote currency spent (buy) or received (sell)
    pub quote_amount: f64,
}

impl Fill {
    /// Average execution price.
    pub fn avg_price(&self) -> f64 {
        if self.quantity > 0.0 {
            self.quote_amount / self.quantity
        } else {
            0.0
        }
    }
}

/// Build the trading pair symbol for an asset quoted in the base currency.
pub fn pair_symbol(asset: &str, base: &str) -> String {
    format!("{}{}", asset, base)
}

/// Capability set of a margin-trading exchange.
///
/// Implement this trait to support a new venue. Amounts are plain `f64`
/// in the units of the named asset.
///
/// Wallet contract: trades settle in the spot wallet and collateral sits in
/// the margin account. Borrowed funds must arrive spendable in the spot
/// wallet, and a repay draws on the spot wallet. Venues that book loans in
/// the margin account move the funds across inside `margin_borrow` and
/// `margin_repay`.
#[async_trait]
pub trait ExchangeGateway: Send + Sync + Debug {
    /// Venue identifier (e.g., "binance", "paper").
    fn venue(&self) -> &str;

    /// Current price of a trading pair in quote currency.
    async fn price(&self, symbol: &str) -> Result<f64, GatewayError>;

    /// Market buy spending `quote_amount` of the quote currency.
    async fn market_buy(&self, symbol: &str, quote_amount: f64) -> Result<Fill, GatewayError>;

    /// Market sell of `quantity` units of the traded asset.
    async fn market_sell(&self, symbol: &str, quantity: f64) -> Result<Fill, GatewayError>;

    /// Move an asset between the spot wallet and the margin account.
    async fn margin_transfer(
        &self,
        asset: &str,
        amount: f64,
        direction: TransferDirection,
    ) -> Result<(), GatewayError>;

    /// Borrow against the margin account's collateral; the proceeds land
    /// in the spot wallet.
    async fn margin_borrow(&self, asset: &str, amount: f64) -> Result<(), GatewayError>;

    /// Repay an outstanding margin loan from the spot wallet.
    async fn margin_repay(&self, asset: &str, amount: f64) -> Result<(), GatewayError>;

    /// Deposit into flexible savings. Best-effort from the engine's view.
    async fn savings_deposit(&self, asset: &str, amount: f64) -> Result<(), GatewayError>;

    /// Free (unlocked) spot balance of an asset.
    async fn free_balance(&self, asset: &str) -> Result<f64, GatewayError>;

    /// Account-wide margin level (collateral value / debt value).
    async fn margin_level(&self) -> Result<f64, GatewayError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(CallKind::Price.is_retry_safe());
        assert!(CallKind::FreeBalance.is_retry_safe());
        assert!(CallKind::MarginLevel.is_retry_safe());

        for kind in [
            CallKind::MarketBuy,
            CallKind::MarketSell,
            CallKind::MarginTransfer,
            CallKind::MarginBorrow,
            CallKind::MarginRepay,
            CallKind::SavingsDeposit,
        ] {
            assert!(!kind.is_retry_safe(), "{} must be at-most-once", kind);
        }
    }

    #[test]
    fn test_fill_avg_price() {
        let fill = Fill {
            symbol: "ETHUSDT".to_string(),
            order_id: None,
            quantity: 0.5,
            quote_amount: 1_000.0,
        };
        assert!((fill.avg_price() - 2_000.0).abs() < 1e-9);
        assert_eq!(pair_symbol("ETH", "USDT"), "ETHUSDT");
    }
}
