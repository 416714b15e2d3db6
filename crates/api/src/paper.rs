//! In-memory paper exchange.
//!
//! Keeps spot, margin, loan and savings books per asset and fills market
//! orders at the current quote with no fees or slippage. Used for dry runs
//! (optionally quoting live prices from a real venue) and as the gateway in
//! engine tests, where individual calls can be made to fail or hang.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::error::{BorrowFailure, GatewayError};
use crate::gateway::{CallKind, ExchangeGateway, Fill, TransferDirection};

/// Relative tolerance when comparing requested amounts to balances.
const AMOUNT_TOLERANCE: f64 = 1e-9;

/// Margin level reported when there is no outstanding debt.
const NO_DEBT_MARGIN_LEVEL: f64 = 999.0;

/// One call observed by the paper exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRecord {
    pub kind: CallKind,
    /// Symbol or asset the call targeted
    pub target: String,
    pub amount: f64,
    pub ok: bool,
}

#[derive(Debug, Default)]
struct Books {
    spot: HashMap<String, f64>,
    margin: HashMap<String, f64>,
    loans: HashMap<String, f64>,
    savings: HashMap<String, f64>,
}

fn balance(book: &HashMap<String, f64>, asset: &str) -> f64 {
    book.get(asset).copied().unwrap_or(0.0)
}

fn covers(have: f64, want: f64) -> bool {
    want <= have + AMOUNT_TOLERANCE * have.abs().max(1.0)
}

fn credit(book: &mut HashMap<String, f64>, asset: &str, amount: f64) {
    *book.entry(asset.to_string()).or_insert(0.0) += amount;
}

fn debit(book: &mut HashMap<String, f64>, asset: &str, amount: f64) {
    let entry = book.entry(asset.to_string()).or_insert(0.0);
    *entry = (*entry - amount).max(0.0);
}

/// Paper exchange implementing the full gateway capability set.
pub struct PaperExchange {
    base: String,
    prices: DashMap<String, f64>,
    delays: DashMap<String, Duration>,
    books: Mutex<Books>,
    failures: Mutex<HashMap<CallKind, u32>>,
    stalls: Mutex<HashMap<CallKind, Duration>>,
    calls: Mutex<Vec<CallRecord>>,
    quote_source: Option<Arc<dyn ExchangeGateway>>,
    next_order_id: AtomicU64,
}

impl fmt::Debug for PaperExchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PaperExchange")
            .field("base", &self.base)
            .field("prices", &self.prices.len())
            .field("live_quotes", &self.quote_source.is_some())
            .finish()
    }
}

impl PaperExchange {
    /// Create a paper account holding `starting_balance` of the base currency.
    pub fn new(base: impl Into<String>, starting_balance: f64) -> Self {
        let base = base.into();
        let mut books = Books::default();
        books.spot.insert(base.clone(), starting_balance);

        Self {
            base,
            prices: DashMap::new(),
            delays: DashMap::new(),
            books: Mutex::new(books),
            failures: Mutex::new(HashMap::new()),
            stalls: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            quote_source: None,
            next_order_id: AtomicU64::new(1),
        }
    }

    /// Seed a static price.
    pub fn with_price(self, symbol: &str, price: f64) -> Self {
        self.prices.insert(symbol.to_string(), price);
        self
    }

    /// Quote prices from another venue (e.g., public tickers of a live exchange).
    pub fn with_quote_source(mut self, source: Arc<dyn ExchangeGateway>) -> Self {
        self.quote_source = Some(source);
        self
    }

    /// Set or move a price.
    pub fn set_price(&self, symbol: &str, price: f64) {
        self.prices.insert(symbol.to_string(), price);
    }

    /// Drop a price so quotes for it fail.
    pub fn remove_price(&self, symbol: &str) {
        self.prices.remove(symbol);
    }

    /// Make price queries for a symbol hang for `delay` before answering.
    pub fn set_price_delay(&self, symbol: &str, delay: Duration) {
        self.delays.insert(symbol.to_string(), delay);
    }

    /// Fail the next `times` calls of a kind.
    pub fn fail_next(&self, kind: CallKind, times: u32) {
        self.failures.lock().insert(kind, times);
    }

    /// Make the next call of a kind hang for `delay` before it runs.
    pub fn stall_next(&self, kind: CallKind, delay: Duration) {
        self.stalls.lock().insert(kind, delay);
    }

    /// Overwrite a spot balance.
    pub fn set_spot_balance(&self, asset: &str, amount: f64) {
        self.books.lock().spot.insert(asset.to_string(), amount);
    }

    pub fn spot_balance(&self, asset: &str) -> f64 {
        balance(&self.books.lock().spot, asset)
    }

    pub fn margin_balance(&self, asset: &str) -> f64 {
        balance(&self.books.lock().margin, asset)
    }

    pub fn loan(&self, asset: &str) -> f64 {
        balance(&self.books.lock().loans, asset)
    }

    pub fn savings_balance(&self, asset: &str) -> f64 {
        balance(&self.books.lock().savings, asset)
    }

    /// All calls observed so far, in order.
    pub fn calls(&self) -> Vec<CallRecord> {
        self.calls.lock().clone()
    }

    /// Calls of one kind, in order.
    pub fn calls_of(&self, kind: CallKind) -> Vec<CallRecord> {
        self.calls.lock().iter().filter(|c| c.kind == kind).cloned().collect()
    }

    fn record(&self, kind: CallKind, target: &str, amount: f64, ok: bool) {
        self.calls.lock().push(CallRecord {
            kind,
            target: target.to_string(),
            amount,
            ok,
        });
    }

    fn asset_of<'a>(&self, symbol: &'a str) -> Option<&'a str> {
        symbol.strip_suffix(self.base.as_str()).filter(|a| !a.is_empty())
    }

    fn injected_error(kind: CallKind, target: &str) -> GatewayError {
        let reason = "injected failure".to_string();
        match kind {
            CallKind::Price => GatewayError::price(target, reason),
            CallKind::MarketBuy | CallKind::MarketSell => GatewayError::order(target, reason),
            CallKind::MarginTransfer => GatewayError::transfer(target, reason),
            CallKind::MarginBorrow => GatewayError::BorrowFailed {
                asset: target.to_string(),
                reason: BorrowFailure::Other(reason),
            },
            CallKind::MarginRepay => GatewayError::repay(target, reason),
            CallKind::SavingsDeposit => GatewayError::SavingsFailed {
                asset: target.to_string(),
                reason,
            },
            CallKind::FreeBalance => GatewayError::BalanceUnavailable {
                asset: target.to_string(),
                reason,
            },
            CallKind::MarginLevel => GatewayError::AccountUnavailable(reason),
        }
    }

    async fn stall(&self, kind: CallKind) {
        let delay = self.stalls.lock().remove(&kind);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    /// Consume one injected failure for `kind`, if any is pending.
    fn check_injected(&self, kind: CallKind, target: &str, amount: f64) -> Result<(), GatewayError> {
        let mut failures = self.failures.lock();
        if let Some(remaining) = failures.get_mut(&kind) {
            if *remaining > 0 {
                *remaining -= 1;
                drop(failures);
                self.record(kind, target, amount, false);
                debug!(call = %kind, target, "Injected paper exchange failure");
                return Err(Self::injected_error(kind, target));
            }
        }
        Ok(())
    }

    /// Finish a call: record it and pass the outcome through.
    fn finish<T>(
        &self,
        kind: CallKind,
        target: &str,
        amount: f64,
        result: Result<T, GatewayError>,
    ) -> Result<T, GatewayError> {
        self.record(kind, target, amount, result.is_ok());
        result
    }

    async fn quote(&self, symbol: &str) -> Result<f64, GatewayError> {
        let delay = self.delays.get(symbol).map(|d| *d);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(source) = &self.quote_source {
            let price = source.price(symbol).await?;
            self.prices.insert(symbol.to_string(), price);
            return Ok(price);
        }

        self.prices
            .get(symbol)
            .map(|p| *p)
            .filter(|p| p.is_finite() && *p > 0.0)
            .ok_or_else(|| GatewayError::price(symbol, "no quote"))
    }

    fn price_of_asset(&self, asset: &str) -> Option<f64> {
        if asset == self.base {
            return Some(1.0);
        }
        self.prices.get(&format!("{}{}", asset, self.base)).map(|p| *p)
    }

    fn order_id(&self) -> String {
        format!("paper-{}", self.next_order_id.fetch_add(1, Ordering::Relaxed))
    }
}

#[async_trait]
impl ExchangeGateway for PaperExchange {
    fn venue(&self) -> &str {
        "paper"
    }

    async fn price(&self, symbol: &str) -> Result<f64, GatewayError> {
        self.check_injected(CallKind::Price, symbol, 0.0)?;
        let result = self.quote(symbol).await;
        self.finish(CallKind::Price, symbol, 0.0, result)
    }

    async fn market_buy(&self, symbol: &str, quote_amount: f64) -> Result<Fill, GatewayError> {
        self.stall(CallKind::MarketBuy).await;
        self.check_injected(CallKind::MarketBuy, symbol, quote_amount)?;

        let result: Result<Fill, GatewayError> = async {
            let asset = self
                .asset_of(symbol)
                .ok_or_else(|| GatewayError::order(symbol, "unknown symbol"))?;
            if quote_amount <= 0.0 {
                return Err(GatewayError::order(symbol, "non-positive quote amount"));
            }
            let price = self
                .quote(symbol)
                .await
                .map_err(|e| GatewayError::order(symbol, e.to_string()))?;

            let mut books = self.books.lock();
            if !covers(balance(&books.spot, &self.base), quote_amount) {
                return Err(GatewayError::order(symbol, "insufficient quote balance"));
            }
            let quantity = quote_amount / price;
            debit(&mut books.spot, &self.base, quote_amount);
            credit(&mut books.spot, asset, quantity);

            Ok(Fill {
                symbol: symbol.to_string(),
                order_id: Some(self.order_id()),
                quantity,
                quote_amount,
            })
        }
        .await;

        self.finish(CallKind::MarketBuy, symbol, quote_amount, result)
    }

    async fn market_sell(&self, symbol: &str, quantity: f64) -> Result<Fill, GatewayError> {
        self.stall(CallKind::MarketSell).await;
        self.check_injected(CallKind::MarketSell, symbol, quantity)?;

        let result: Result<Fill, GatewayError> = async {
            let asset = self
                .asset_of(symbol)
                .ok_or_else(|| GatewayError::order(symbol, "unknown symbol"))?;
            if quantity <= 0.0 {
                return Err(GatewayError::order(symbol, "non-positive quantity"));
            }
            let price = self
                .quote(symbol)
                .await
                .map_err(|e| GatewayError::order(symbol, e.to_string()))?;

            let mut books = self.books.lock();
            if !covers(balance(&books.spot, asset), quantity) {
                return Err(GatewayError::order(symbol, "insufficient asset balance"));
            }
            let proceeds = quantity * price;
            debit(&mut books.spot, asset, quantity);
            credit(&mut books.spot, &self.base, proceeds);

            Ok(Fill {
                symbol: symbol.to_string(),
                order_id: Some(self.order_id()),
                quantity,
                quote_amount: proceeds,
            })
        }
        .await;

        self.finish(CallKind::MarketSell, symbol, quantity, result)
    }

    async fn margin_transfer(
        &self,
        asset: &str,
        amount: f64,
        direction: TransferDirection,
    ) -> Result<(), GatewayError> {
        self.stall(CallKind::MarginTransfer).await;
        self.check_injected(CallKind::MarginTransfer, asset, amount)?;

        let result = {
            let mut books = self.books.lock();
            let books = &mut *books;
            let (from, to) = match direction {
                TransferDirection::ToMargin => (&mut books.spot, &mut books.margin),
                TransferDirection::FromMargin => (&mut books.margin, &mut books.spot),
            };
            if amount <= 0.0 {
                Err(GatewayError::transfer(asset, "non-positive amount"))
            } else if !covers(balance(from, asset), amount) {
                Err(GatewayError::transfer(asset, "insufficient balance"))
            } else {
                debit(from, asset, amount);
                credit(to, asset, amount);
                Ok(())
            }
        };

        self.finish(CallKind::MarginTransfer, asset, amount, result)
    }

    async fn margin_borrow(&self, asset: &str, amount: f64) -> Result<(), GatewayError> {
        self.stall(CallKind::MarginBorrow).await;
        self.check_injected(CallKind::MarginBorrow, asset, amount)?;

        let result = if amount <= 0.0 {
            Err(GatewayError::BorrowFailed {
                asset: asset.to_string(),
                reason: BorrowFailure::Other("non-positive amount".to_string()),
            })
        } else {
            let mut books = self.books.lock();
            credit(&mut books.loans, asset, amount);
            credit(&mut books.spot, asset, amount);
            Ok(())
        };

        self.finish(CallKind::MarginBorrow, asset, amount, result)
    }

    async fn margin_repay(&self, asset: &str, amount: f64) -> Result<(), GatewayError> {
        self.stall(CallKind::MarginRepay).await;
        self.check_injected(CallKind::MarginRepay, asset, amount)?;

        let result = {
            let mut books = self.books.lock();
            let owed = balance(&books.loans, asset);
            if amount <= 0.0 {
                Err(GatewayError::repay(asset, "non-positive amount"))
            } else if !covers(balance(&books.spot, asset), amount) {
                Err(GatewayError::repay(asset, "insufficient balance"))
            } else {
                let applied = amount.min(owed);
                debit(&mut books.spot, asset, applied);
                debit(&mut books.loans, asset, applied);
                Ok(())
            }
        };

        self.finish(CallKind::MarginRepay, asset, amount, result)
    }

    async fn savings_deposit(&self, asset: &str, amount: f64) -> Result<(), GatewayError> {
        self.stall(CallKind::SavingsDeposit).await;
        self.check_injected(CallKind::SavingsDeposit, asset, amount)?;

        let result = {
            let mut books = self.books.lock();
            if amount <= 0.0 || !covers(balance(&books.spot, asset), amount) {
                Err(GatewayError::SavingsFailed {
                    asset: asset.to_string(),
                    reason: "insufficient balance".to_string(),
                })
            } else {
                debit(&mut books.spot, asset, amount);
                credit(&mut books.savings, asset, amount);
                Ok(())
            }
        };

        self.finish(CallKind::SavingsDeposit, asset, amount, result)
    }

    async fn free_balance(&self, asset: &str) -> Result<f64, GatewayError> {
        self.stall(CallKind::FreeBalance).await;
        self.check_injected(CallKind::FreeBalance, asset, 0.0)?;
        let amount = self.spot_balance(asset);
        self.finish(CallKind::FreeBalance, asset, 0.0, Ok(amount))
    }

    async fn margin_level(&self) -> Result<f64, GatewayError> {
        self.stall(CallKind::MarginLevel).await;
        self.check_injected(CallKind::MarginLevel, "account", 0.0)?;

        let result = {
            let books = self.books.lock();
            let value_of = |book: &HashMap<String, f64>| -> Result<f64, GatewayError> {
                book.iter()
                    .filter(|(_, amount)| **amount > 0.0)
                    .map(|(asset, amount)| {
                        self.price_of_asset(asset).map(|p| p * amount).ok_or_else(|| {
                            GatewayError::AccountUnavailable(format!("no price for {}", asset))
                        })
                    })
                    .sum()
            };

            value_of(&books.loans).and_then(|debt| {
                if debt <= AMOUNT_TOLERANCE {
                    Ok(NO_DEBT_MARGIN_LEVEL)
                } else {
                    value_of(&books.margin).map(|collateral| collateral / debt)
                }
            })
        };

        self.finish(CallKind::MarginLevel, "account", 0.0, result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exchange() -> PaperExchange {
        PaperExchange::new("USDT", 1_000.0)
            .with_price("BTCUSDT", 50_000.0)
            .with_price("ETHUSDT", 2_000.0)
    }

    #[tokio::test]
    async fn test_buy_transfer_borrow_cycle() {
        let ex = exchange();

        let fill = ex.market_buy("BTCUSDT", 1_000.0).await.unwrap();
        assert!((fill.quantity - 0.02).abs() < 1e-12);
        assert!(fill.order_id.is_some());
        assert!(ex.spot_balance("USDT").abs() < 1e-9);

        ex.margin_transfer("BTC", fill.quantity, TransferDirection::ToMargin)
            .await
            .unwrap();
        assert!((ex.margin_balance("BTC") - 0.02).abs() < 1e-12);

        ex.margin_borrow("USDT", 630.0).await.unwrap();
        assert!((ex.loan("USDT") - 630.0).abs() < 1e-9);
        assert!((ex.spot_balance("USDT") - 630.0).abs() < 1e-9);

        // 1000 collateral / 630 debt
        let level = ex.margin_level().await.unwrap();
        assert!((level - 1_000.0 / 630.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_repay_and_sell() {
        let ex = exchange();
        ex.margin_borrow("USDT", 100.0).await.unwrap();
        ex.margin_repay("USDT", 100.0).await.unwrap();
        assert!(ex.loan("USDT").abs() < 1e-9);
        assert_eq!(ex.margin_level().await.unwrap(), NO_DEBT_MARGIN_LEVEL);

        let fill = ex.market_buy("ETHUSDT", 500.0).await.unwrap();
        let sold = ex.market_sell("ETHUSDT", fill.quantity).await.unwrap();
        assert!((sold.quote_amount - 500.0).abs() < 1e-9);
        assert!((ex.spot_balance("USDT") - 1_000.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_insufficient_balances_rejected() {
        let ex = exchange();
        let err = ex.market_buy("BTCUSDT", 5_000.0).await.unwrap_err();
        assert!(matches!(err, GatewayError::OrderFailed { .. }));

        let err = ex
            .margin_transfer("BTC", 1.0, TransferDirection::ToMargin)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::TransferFailed { .. }));

        ex.set_spot_balance("USDT", 0.0);
        ex.margin_borrow("USDT", 50.0).await.unwrap();
        ex.set_spot_balance("USDT", 10.0);
        let err = ex.margin_repay("USDT", 50.0).await.unwrap_err();
        assert!(matches!(err, GatewayError::RepayFailed { .. }));
    }

    #[tokio::test]
    async fn test_injected_failures_and_call_log() {
        let ex = exchange();
        ex.fail_next(CallKind::MarginBorrow, 1);

        let err = ex.margin_borrow("USDT", 10.0).await.unwrap_err();
        assert!(matches!(
            err,
            GatewayError::BorrowFailed {
                reason: BorrowFailure::Other(_),
                ..
            }
        ));
        // Only the first call fails
        ex.margin_borrow("USDT", 10.0).await.unwrap();

        let borrows = ex.calls_of(CallKind::MarginBorrow);
        assert_eq!(borrows.len(), 2);
        assert!(!borrows[0].ok);
        assert!(borrows[1].ok);
    }

    #[tokio::test]
    async fn test_missing_price() {
        let ex = exchange();
        ex.remove_price("ETHUSDT");
        let err = ex.price("ETHUSDT").await.unwrap_err();
        assert!(err.is_price_unavailable());

        let err = ex.market_buy("ETHUSDT", 10.0).await.unwrap_err();
        assert!(matches!(err, GatewayError::OrderFailed { .. }));
    }

    #[tokio::test]
    async fn test_savings_deposit() {
        let ex = exchange();
        ex.savings_deposit("USDT", 250.0).await.unwrap();
        assert!((ex.savings_balance("USDT") - 250.0).abs() < 1e-9);
        assert!((ex.free_balance("USDT").await.unwrap() - 750.0).abs() < 1e-9);
    }
}
