//! Exchange gateway for the cascade leverage engine.
//!
//! This crate provides:
//! - The `ExchangeGateway` capability trait consumed by the engine
//! - Typed gateway errors and per-call idempotency classification
//! - HMAC-SHA256 request signing for timestamped query strings
//! - A signed REST client for a Binance-style margin exchange
//! - An in-memory paper exchange for dry runs and tests

mod binance;
mod error;
mod gateway;
mod paper;
pub mod signing;

pub use binance::{BinanceCredentials, BinanceMarginClient, RetryPolicy};
pub use error::{BorrowFailure, GatewayError};
pub use gateway::{pair_symbol, CallKind, ExchangeGateway, Fill, TransferDirection};
pub use paper::{CallRecord, PaperExchange};
