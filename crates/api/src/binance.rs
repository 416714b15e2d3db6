//! Signed REST client for a Binance-style margin exchange.
//!
//! Signed endpoints carry a millisecond `timestamp` and `recvWindow`, and an
//! HMAC-SHA256 `signature` over the url-encoded query string. Only calls
//! classified retry-safe by `CallKind` are retried.
//!
//! Market orders settle in the spot wallet while loans are booked in the
//! cross-margin account, so a borrow sweeps the proceeds to spot and a repay
//! moves the funds back to margin first.

use async_trait::async_trait;
use rand::Rng;
use reqwest::{Client, Method, Url};
use serde::Deserialize;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::error::{BorrowFailure, GatewayError};
use crate::gateway::{CallKind, ExchangeGateway, Fill, TransferDirection};
use crate::signing::{sign_query, timestamp_ms};

const DEFAULT_BASE_URL: &str = "https://api.binance.com";

/// Receive window for signed requests (milliseconds).
const RECV_WINDOW_MS: u64 = 5000;

/// Per-request HTTP timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// API key pair for signed endpoints.
#[derive(Clone)]
pub struct BinanceCredentials {
    pub api_key: String,
    pub api_secret: String,
}

impl BinanceCredentials {
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
        }
    }

    /// Read `BINANCE_API_KEY` / `BINANCE_API_SECRET`, if both are set and non-empty.
    pub fn from_env() -> Option<Self> {
        let key = std::env::var("BINANCE_API_KEY").ok()?;
        let secret = std::env::var("BINANCE_API_SECRET").ok()?;
        if key.is_empty() || secret.is_empty() || key == "demo" {
            return None;
        }
        Some(Self::new(key, secret))
    }
}

impl fmt::Debug for BinanceCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BinanceCredentials")
            .field("api_key", &"<redacted>")
            .field("api_secret", &"<redacted>")
            .finish()
    }
}

/// Backoff policy for retry-safe calls.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 100,
            max_delay_ms: 5000,
            jitter_factor: 0.3,
        }
    }
}

impl RetryPolicy {
    /// No retries at all.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Exponential backoff with +/- jitter.
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay_ms as f64 * 2.0_f64.powi(attempt as i32);
        let clamped = base.min(self.max_delay_ms as f64);

        let jitter_range = clamped * self.jitter_factor;
        let jitter = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };

        Duration::from_millis((clamped + jitter).max(0.0) as u64)
    }
}

/// Failure of one HTTP round trip, before it is mapped to an operation error.
#[derive(Debug)]
struct RequestFailure {
    status: Option<u16>,
    code: Option<i64>,
    message: String,
}

impl RequestFailure {
    fn transport(message: impl Into<String>) -> Self {
        Self {
            status: None,
            code: None,
            message: message.into(),
        }
    }

    /// Network errors, timeouts, throttling and server errors.
    fn is_transient(&self) -> bool {
        match self.status {
            None => true,
            Some(status) => matches!(status, 408 | 418 | 429 | 500..=599),
        }
    }
}

impl fmt::Display for RequestFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.status, self.code) {
            (Some(status), Some(code)) => write!(f, "HTTP {} code {}: {}", status, code, self.message),
            (Some(status), None) => write!(f, "HTTP {}: {}", status, self.message),
            _ => write!(f, "{}", self.message),
        }
    }
}

/// Map an exchange rejection of a borrow to its cause.
fn classify_borrow(failure: &RequestFailure) -> BorrowFailure {
    let msg = failure.to_string();
    match failure.code {
        Some(-3006) | Some(-3045) => BorrowFailure::Limit(msg),
        Some(-3041) | Some(-2010) => BorrowFailure::Balance(msg),
        _ => {
            let lower = failure.message.to_lowercase();
            if lower.contains("exceed") || lower.contains("limit") {
                BorrowFailure::Limit(msg)
            } else if lower.contains("balance") || lower.contains("not enough") {
                BorrowFailure::Balance(msg)
            } else {
                BorrowFailure::Other(msg)
            }
        }
    }
}

/// Render an amount the way the exchange accepts it (no exponent, no trailing zeros).
fn format_amount(value: f64) -> String {
    let s = format!("{:.8}", value);
    let trimmed = s.trim_end_matches('0').trim_end_matches('.');
    if trimmed.is_empty() || trimmed == "-" {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}

fn parse_number(raw: &str, what: &str) -> Result<f64, String> {
    raw.parse::<f64>()
        .map_err(|e| format!("invalid {} '{}': {}", what, raw, e))
}

/// Signed REST client for spot orders, margin transfers, loans and savings.
#[derive(Clone)]
pub struct BinanceMarginClient {
    client: Client,
    base_url: String,
    credentials: Option<BinanceCredentials>,
    retry: RetryPolicy,
}

impl fmt::Debug for BinanceMarginClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BinanceMarginClient")
            .field("base_url", &self.base_url)
            .field("authenticated", &self.credentials.is_some())
            .field("retry", &self.retry)
            .finish()
    }
}

impl BinanceMarginClient {
    /// Create a client against the production endpoint.
    ///
    /// Without credentials only public endpoints (prices) work.
    pub fn new(credentials: Option<BinanceCredentials>) -> Self {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            base_url: DEFAULT_BASE_URL.to_string(),
            credentials,
            retry: RetryPolicy::default(),
        }
    }

    /// Use a custom base URL (testnet, proxy).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Override the retry policy for retry-safe calls.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Check whether signed endpoints are usable.
    pub fn has_credentials(&self) -> bool {
        self.credentials.is_some()
    }

    fn credentials(&self) -> Result<&BinanceCredentials, GatewayError> {
        self.credentials.as_ref().ok_or(GatewayError::MissingCredentials)
    }

    /// Send a request, retrying only when the call kind allows it.
    async fn request(
        &self,
        kind: CallKind,
        method: Method,
        path: &str,
        params: &[(&str, String)],
        credentials: Option<&BinanceCredentials>,
    ) -> Result<serde_json::Value, RequestFailure> {
        let attempts = if kind.is_retry_safe() {
            self.retry.max_retries + 1
        } else {
            1
        };

        let mut attempt = 0;
        loop {
            match self.send_once(method.clone(), path, params, credentials).await {
                Ok(value) => return Ok(value),
                Err(failure) if attempt + 1 < attempts && failure.is_transient() => {
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(
                        call = %kind,
                        attempt = attempt + 1,
                        max_attempts = attempts,
                        error = %failure,
                        delay_ms = delay.as_millis() as u64,
                        "Retry-safe call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(failure) => return Err(failure),
            }
        }
    }

    async fn send_once(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
        credentials: Option<&BinanceCredentials>,
    ) -> Result<serde_json::Value, RequestFailure> {
        let mut url = Url::parse(&format!("{}{}", self.base_url, path))
            .map_err(|e| RequestFailure::transport(format!("invalid url: {}", e)))?;

        {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in params {
                pairs.append_pair(key, value);
            }
            if credentials.is_some() {
                pairs.append_pair("recvWindow", &RECV_WINDOW_MS.to_string());
                pairs.append_pair("timestamp", &timestamp_ms().to_string());
            }
        }

        let request = match credentials {
            Some(creds) => {
                let query = url.query().unwrap_or_default().to_string();
                let signature = sign_query(&query, &creds.api_secret)
                    .map_err(|e| RequestFailure::transport(e.to_string()))?;
                url.query_pairs_mut().append_pair("signature", &signature);
                self.client
                    .request(method, url)
                    .header("X-MBX-APIKEY", &creds.api_key)
            }
            None => self.client.request(method, url),
        };

        let response = request
            .send()
            .await
            .map_err(|e| RequestFailure::transport(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| RequestFailure::transport(e.to_string()))?;

        if !status.is_success() {
            let api_error: Option<ApiError> = serde_json::from_str(&body).ok();
            return Err(RequestFailure {
                status: Some(status.as_u16()),
                code: api_error.as_ref().map(|e| e.code),
                message: api_error.map(|e| e.msg).unwrap_or(body),
            });
        }

        serde_json::from_str(&body)
            .map_err(|e| RequestFailure::transport(format!("invalid response body: {}", e)))
    }

    /// Move funds between the spot wallet and the cross-margin account.
    async fn transfer(
        &self,
        creds: &BinanceCredentials,
        asset: &str,
        amount: f64,
        direction: TransferDirection,
    ) -> Result<(), RequestFailure> {
        let transfer_type = match direction {
            TransferDirection::ToMargin => "1",
            TransferDirection::FromMargin => "2",
        };
        let params = [
            ("asset", asset.to_string()),
            ("amount", format_amount(amount)),
            ("type", transfer_type.to_string()),
        ];

        self.request(
            CallKind::MarginTransfer,
            Method::POST,
            "/sapi/v1/margin/transfer",
            &params,
            Some(creds),
        )
        .await
        .map(|_| ())
    }

    /// Repay from funds already in the margin account.
    async fn repay_loan(
        &self,
        creds: &BinanceCredentials,
        asset: &str,
        amount: f64,
    ) -> Result<(), RequestFailure> {
        let params = [("asset", asset.to_string()), ("amount", format_amount(amount))];
        self.request(
            CallKind::MarginRepay,
            Method::POST,
            "/sapi/v1/margin/repay",
            &params,
            Some(creds),
        )
        .await
        .map(|_| ())
    }

    async fn place_market_order(
        &self,
        kind: CallKind,
        symbol: &str,
        side: &str,
        amount_param: (&str, String),
    ) -> Result<Fill, GatewayError> {
        let creds = self.credentials()?;
        let params = [
            ("symbol", symbol.to_string()),
            ("side", side.to_string()),
            ("type", "MARKET".to_string()),
            amount_param,
            ("newOrderRespType", "FULL".to_string()),
        ];

        let value = self
            .request(kind, Method::POST, "/api/v3/order", &params, Some(creds))
            .await
            .map_err(|e| GatewayError::order(symbol, e.to_string()))?;

        let order: OrderResponse = serde_json::from_value(value)
            .map_err(|e| GatewayError::order(symbol, format!("invalid order response: {}", e)))?;

        let quantity = parse_number(&order.executed_qty, "executedQty")
            .map_err(|e| GatewayError::order(symbol, e))?;
        let quote_amount = parse_number(&order.cummulative_quote_qty, "cummulativeQuoteQty")
            .map_err(|e| GatewayError::order(symbol, e))?;

        if quantity <= 0.0 {
            return Err(GatewayError::order(
                symbol,
                format!("order {} not filled (status {})", order.order_id, order.status),
            ));
        }

        info!(
            symbol,
            side,
            order_id = order.order_id,
            quantity,
            quote_amount,
            "Market order filled"
        );

        Ok(Fill {
            symbol: symbol.to_string(),
            order_id: Some(order.order_id.to_string()),
            quantity,
            quote_amount,
        })
    }
}

#[async_trait]
impl ExchangeGateway for BinanceMarginClient {
    fn venue(&self) -> &str {
        "binance"
    }

    #[instrument(skip(self))]
    async fn price(&self, symbol: &str) -> Result<f64, GatewayError> {
        let params = [("symbol", symbol.to_string())];
        let value = self
            .request(CallKind::Price, Method::GET, "/api/v3/ticker/price", &params, None)
            .await
            .map_err(|e| GatewayError::price(symbol, e.to_string()))?;

        let ticker: TickerPrice = serde_json::from_value(value)
            .map_err(|e| GatewayError::price(symbol, format!("invalid ticker: {}", e)))?;
        let price = parse_number(&ticker.price, "price").map_err(|e| GatewayError::price(symbol, e))?;

        if !price.is_finite() || price <= 0.0 {
            return Err(GatewayError::price(symbol, format!("non-positive price {}", price)));
        }

        debug!(symbol, price, "Fetched price");
        Ok(price)
    }

    #[instrument(skip(self))]
    async fn market_buy(&self, symbol: &str, quote_amount: f64) -> Result<Fill, GatewayError> {
        self.place_market_order(
            CallKind::MarketBuy,
            symbol,
            "BUY",
            ("quoteOrderQty", format_amount(quote_amount)),
        )
        .await
    }

    #[instrument(skip(self))]
    async fn market_sell(&self, symbol: &str, quantity: f64) -> Result<Fill, GatewayError> {
        self.place_market_order(
            CallKind::MarketSell,
            symbol,
            "SELL",
            ("quantity", format_amount(quantity)),
        )
        .await
    }

    #[instrument(skip(self))]
    async fn margin_transfer(
        &self,
        asset: &str,
        amount: f64,
        direction: TransferDirection,
    ) -> Result<(), GatewayError> {
        let creds = self.credentials()?;
        self.transfer(creds, asset, amount, direction)
            .await
            .map_err(|e| GatewayError::transfer(asset, e.to_string()))?;

        info!(asset, amount, ?direction, "Margin transfer completed");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn margin_borrow(&self, asset: &str, amount: f64) -> Result<(), GatewayError> {
        let creds = self.credentials()?;
        let params = [("asset", asset.to_string()), ("amount", format_amount(amount))];

        self.request(
            CallKind::MarginBorrow,
            Method::POST,
            "/sapi/v1/margin/loan",
            &params,
            Some(creds),
        )
        .await
        .map_err(|e| GatewayError::BorrowFailed {
            asset: asset.to_string(),
            reason: classify_borrow(&e),
        })?;

        // Loan proceeds are booked in the margin account; orders trade spot
        if let Err(sweep) = self
            .transfer(creds, asset, amount, TransferDirection::FromMargin)
            .await
        {
            warn!(asset, amount, error = %sweep, "Borrowed funds stuck in margin, returning loan");
            let undo = self.repay_loan(creds, asset, amount).await;
            let reason = match undo {
                Ok(()) => format!("could not move loan to spot ({}), loan returned", sweep),
                Err(e) => format!(
                    "could not move loan to spot ({}), loan still open ({})",
                    sweep, e
                ),
            };
            return Err(GatewayError::BorrowFailed {
                asset: asset.to_string(),
                reason: BorrowFailure::Other(reason),
            });
        }

        info!(asset, amount, "Margin loan taken and moved to spot");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn margin_repay(&self, asset: &str, amount: f64) -> Result<(), GatewayError> {
        let creds = self.credentials()?;

        self.transfer(creds, asset, amount, TransferDirection::ToMargin)
            .await
            .map_err(|e| GatewayError::repay(asset, format!("could not move funds to margin: {}", e)))?;

        if let Err(e) = self.repay_loan(creds, asset, amount).await {
            if let Err(back) = self
                .transfer(creds, asset, amount, TransferDirection::FromMargin)
                .await
            {
                warn!(asset, amount, error = %back, "Repay funds left in margin account");
            }
            return Err(GatewayError::repay(asset, e.to_string()));
        }

        info!(asset, amount, "Margin loan repaid");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn savings_deposit(&self, asset: &str, amount: f64) -> Result<(), GatewayError> {
        let creds = self.credentials()?;
        let savings_err = |reason: String| GatewayError::SavingsFailed {
            asset: asset.to_string(),
            reason,
        };

        let list_params = [("asset", asset.to_string())];
        let value = self
            .request(
                CallKind::SavingsDeposit,
                Method::GET,
                "/sapi/v1/simple-earn/flexible/list",
                &list_params,
                Some(creds),
            )
            .await
            .map_err(|e| savings_err(e.to_string()))?;

        let products: FlexibleProductList = serde_json::from_value(value)
            .map_err(|e| savings_err(format!("invalid product list: {}", e)))?;
        let product = products
            .rows
            .into_iter()
            .find(|p| p.asset == asset)
            .ok_or_else(|| savings_err("no flexible product for asset".to_string()))?;

        let params = [
            ("productId", product.product_id.clone()),
            ("amount", format_amount(amount)),
        ];
        self.request(
            CallKind::SavingsDeposit,
            Method::POST,
            "/sapi/v1/simple-earn/flexible/subscribe",
            &params,
            Some(creds),
        )
        .await
        .map_err(|e| savings_err(e.to_string()))?;

        info!(asset, amount, product = %product.product_id, "Deposited into flexible savings");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn free_balance(&self, asset: &str) -> Result<f64, GatewayError> {
        let creds = self.credentials()?;
        let balance_err = |reason: String| GatewayError::BalanceUnavailable {
            asset: asset.to_string(),
            reason,
        };

        let value = self
            .request(CallKind::FreeBalance, Method::GET, "/api/v3/account", &[], Some(creds))
            .await
            .map_err(|e| balance_err(e.to_string()))?;

        let account: SpotAccount = serde_json::from_value(value)
            .map_err(|e| balance_err(format!("invalid account response: {}", e)))?;

        match account.balances.iter().find(|b| b.asset == asset) {
            Some(balance) => parse_number(&balance.free, "free").map_err(balance_err),
            None => Ok(0.0),
        }
    }

    #[instrument(skip(self))]
    async fn margin_level(&self) -> Result<f64, GatewayError> {
        let creds = self.credentials()?;
        let value = self
            .request(
                CallKind::MarginLevel,
                Method::GET,
                "/sapi/v1/margin/account",
                &[],
                Some(creds),
            )
            .await
            .map_err(|e| GatewayError::AccountUnavailable(e.to_string()))?;

        let account: MarginAccount = serde_json::from_value(value)
            .map_err(|e| GatewayError::AccountUnavailable(format!("invalid margin account: {}", e)))?;

        parse_number(&account.margin_level, "marginLevel").map_err(GatewayError::AccountUnavailable)
    }
}

// API response types

#[derive(Debug, Deserialize)]
struct ApiError {
    code: i64,
    msg: String,
}

#[derive(Debug, Deserialize)]
struct TickerPrice {
    price: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderResponse {
    order_id: u64,
    status: String,
    executed_qty: String,
    cummulative_quote_qty: String,
}

#[derive(Debug, Deserialize)]
struct SpotAccount {
    balances: Vec<SpotBalance>,
}

#[derive(Debug, Deserialize)]
struct SpotBalance {
    asset: String,
    free: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MarginAccount {
    margin_level: String,
}

#[derive(Debug, Deserialize)]
struct FlexibleProductList {
    #[serde(default)]
    rows: Vec<FlexibleProduct>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FlexibleProduct {
    asset: String,
    product_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Local HTTP venue that answers by path and records (path, query) of
    /// every request. Unrouted paths answer `200 {}`.
    struct StubVenue {
        base_url: String,
        requests: Arc<Mutex<Vec<(String, String)>>>,
    }

    impl StubVenue {
        async fn start(routes: Vec<(&'static str, u16, &'static str)>) -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let requests = Arc::new(Mutex::new(Vec::new()));
            let log = requests.clone();

            tokio::spawn(async move {
                while let Ok((mut socket, _)) = listener.accept().await {
                    let mut head = Vec::new();
                    let mut chunk = [0u8; 4096];
                    loop {
                        match socket.read(&mut chunk).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => head.extend_from_slice(&chunk[..n]),
                        }
                        if head.windows(4).any(|w| w == b"\r\n\r\n") {
                            break;
                        }
                    }

                    let text = String::from_utf8_lossy(&head).to_string();
                    let target = text
                        .lines()
                        .next()
                        .and_then(|line| line.split_whitespace().nth(1))
                        .unwrap_or_default()
                        .to_string();
                    let (path, query) = match target.split_once('?') {
                        Some((path, query)) => (path.to_string(), query.to_string()),
                        None => (target.clone(), String::new()),
                    };

                    let (status, body) = routes
                        .iter()
                        .find(|(route, _, _)| *route == path)
                        .map(|(_, status, body)| (*status, *body))
                        .unwrap_or((200, "{}"));
                    log.lock().push((path, query));

                    let response = format!(
                        "HTTP/1.1 {} Stub\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        status,
                        body.len(),
                        body
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                }
            });

            Self {
                base_url: format!("http://{}", addr),
                requests,
            }
        }

        fn client(&self) -> BinanceMarginClient {
            BinanceMarginClient::new(Some(BinanceCredentials::new("key", "secret")))
                .with_base_url(&self.base_url)
                .with_retry(RetryPolicy::none())
        }

        /// Request paths in arrival order, transfers tagged with their type.
        fn calls(&self) -> Vec<String> {
            self.requests
                .lock()
                .iter()
                .map(|(path, query)| {
                    let transfer_type = query
                        .split('&')
                        .find_map(|pair| pair.strip_prefix("type="));
                    match transfer_type {
                        Some(t) if path.ends_with("/margin/transfer") => format!("{} type={}", path, t),
                        _ => path.clone(),
                    }
                })
                .collect()
        }
    }

    const TO_MARGIN: &str = "/sapi/v1/margin/transfer type=1";
    const TO_SPOT: &str = "/sapi/v1/margin/transfer type=2";

    #[test]
    fn test_format_amount() {
        assert_eq!(format_amount(630.0), "630");
        assert_eq!(format_amount(283.5), "283.5");
        assert_eq!(format_amount(0.00012345), "0.00012345");
        assert_eq!(format_amount(0.0), "0");
        assert_eq!(format_amount(1e-12), "0");
    }

    #[test]
    fn test_classify_borrow() {
        let limit = RequestFailure {
            status: Some(400),
            code: Some(-3006),
            message: "Your borrow amount has exceed maximum borrow amount.".to_string(),
        };
        assert!(matches!(classify_borrow(&limit), BorrowFailure::Limit(_)));

        let balance = RequestFailure {
            status: Some(400),
            code: Some(-3041),
            message: "Balance is not enough".to_string(),
        };
        assert!(matches!(classify_borrow(&balance), BorrowFailure::Balance(_)));

        let other = RequestFailure::transport("connection reset");
        assert!(matches!(classify_borrow(&other), BorrowFailure::Other(_)));
    }

    #[test]
    fn test_transient_failures() {
        assert!(RequestFailure::transport("timeout").is_transient());
        let throttled = RequestFailure {
            status: Some(429),
            code: None,
            message: "too many requests".to_string(),
        };
        assert!(throttled.is_transient());
        let rejected = RequestFailure {
            status: Some(400),
            code: Some(-1013),
            message: "Filter failure".to_string(),
        };
        assert!(!rejected.is_transient());
    }

    #[test]
    fn test_retry_delay_bounded() {
        let policy = RetryPolicy::default();
        for attempt in 0..10 {
            let delay = policy.delay_for_attempt(attempt);
            let max = policy.max_delay_ms as f64 * (1.0 + policy.jitter_factor);
            assert!(delay.as_millis() as f64 <= max);
        }
        assert_eq!(RetryPolicy::none().max_retries, 0);
    }

    #[test]
    fn test_credentials_debug_redacted() {
        let creds = BinanceCredentials::new("key-123", "secret-456");
        let debug = format!("{:?}", creds);
        assert!(!debug.contains("key-123"));
        assert!(!debug.contains("secret-456"));
    }

    #[test]
    fn test_deserialize_order_response() {
        let json = r#"{
            "symbol": "BTCUSDT",
            "orderId": 28,
            "clientOrderId": "6gCrw2kRUAF9CvJDGP16IP",
            "transactTime": 1507725176595,
            "price": "0.00000000",
            "origQty": "0.01000000",
            "executedQty": "0.01000000",
            "cummulativeQuoteQty": "500.00000000",
            "status": "FILLED",
            "fills": []
        }"#;
        let order: OrderResponse = serde_json::from_str(json).unwrap();
        assert_eq!(order.order_id, 28);
        assert_eq!(order.executed_qty, "0.01000000");
        assert_eq!(order.cummulative_quote_qty, "500.00000000");
    }

    #[tokio::test]
    async fn test_signed_call_without_credentials() {
        let client = BinanceMarginClient::new(None);
        assert!(!client.has_credentials());

        let err = client.margin_borrow("USDT", 100.0).await.unwrap_err();
        assert_eq!(err, GatewayError::MissingCredentials);
    }

    #[tokio::test]
    async fn test_borrow_moves_loan_to_spot() {
        let venue = StubVenue::start(vec![]).await;
        venue.client().margin_borrow("USDT", 283.5).await.unwrap();

        assert_eq!(venue.calls(), vec!["/sapi/v1/margin/loan".to_string(), TO_SPOT.to_string()]);
        let requests = venue.requests.lock();
        assert!(requests[0].1.contains("amount=283.5"));
        assert!(requests[0].1.contains("signature="));
    }

    #[tokio::test]
    async fn test_borrow_returns_loan_when_sweep_fails() {
        let venue = StubVenue::start(vec![(
            "/sapi/v1/margin/transfer",
            400,
            r#"{"code":-3020,"msg":"Transfer out amount exceeds max amount."}"#,
        )])
        .await;

        let err = venue.client().margin_borrow("USDT", 100.0).await.unwrap_err();
        assert!(matches!(
            err,
            GatewayError::BorrowFailed { reason: BorrowFailure::Other(_), .. }
        ));
        assert_eq!(
            venue.calls(),
            vec![
                "/sapi/v1/margin/loan".to_string(),
                TO_SPOT.to_string(),
                "/sapi/v1/margin/repay".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_repay_moves_funds_to_margin_first() {
        let venue = StubVenue::start(vec![]).await;
        venue.client().margin_repay("USDT", 198.45).await.unwrap();

        assert_eq!(venue.calls(), vec![TO_MARGIN.to_string(), "/sapi/v1/margin/repay".to_string()]);
    }

    #[tokio::test]
    async fn test_rejected_repay_returns_funds_to_spot() {
        let venue = StubVenue::start(vec![(
            "/sapi/v1/margin/repay",
            400,
            r#"{"code":-3015,"msg":"Repay amount exceeds borrow amount."}"#,
        )])
        .await;

        let err = venue.client().margin_repay("USDT", 50.0).await.unwrap_err();
        assert!(matches!(err, GatewayError::RepayFailed { .. }));
        assert_eq!(
            venue.calls(),
            vec![
                TO_MARGIN.to_string(),
                "/sapi/v1/margin/repay".to_string(),
                TO_SPOT.to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_free_balance_reads_spot_wallet() {
        let venue = StubVenue::start(vec![(
            "/api/v3/account",
            200,
            r#"{"balances":[{"asset":"USDT","free":"283.50000000","locked":"0"}]}"#,
        )])
        .await;

        let client = venue.client();
        assert_eq!(client.free_balance("USDT").await.unwrap(), 283.5);
        assert_eq!(client.free_balance("ETH").await.unwrap(), 0.0);
    }

    #[tokio::test]
    #[ignore] // Requires network
    async fn test_public_price() {
        let client = BinanceMarginClient::new(None);
        let price = client.price("BTCUSDT").await.unwrap();
        assert!(price > 0.0);
    }
}
