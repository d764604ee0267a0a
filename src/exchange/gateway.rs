//! Venue-agnostic gateway trait over a derivatives exchange.
//!
//! The strategy core talks only to this trait; behind it live the real
//! Bybit adapter and the deterministic simulator used by tests and
//! dry-run accounts.

use async_trait::async_trait;
use rust_decimal::Decimal;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::exchange::types::{
    HistoricOrder, InstrumentInfo, OpenOrder, OrderRequest, OrderSnapshot, PositionPair,
    StreamEvent, WalletSnapshot,
};

/// Bybit retCode for cancelling an order that no longer exists.
pub const CODE_ORDER_NOT_FOUND: i64 = 110001;
/// Bybit retCode for a position mode that is already set.
pub const CODE_POSITION_MODE_NOT_MODIFIED: i64 = 110025;
/// Bybit retCode for leverage that is already at the requested value.
pub const CODE_LEVERAGE_NOT_MODIFIED: i64 = 110043;

/// Error taxonomy at the adapter boundary.
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// Network-level failure (connect, timeout, TLS, ...).
    #[error("transport error: {0}")]
    Transport(String),
    /// The exchange understood the request and refused it.
    #[error("exchange rejected request (code {code}): {message}")]
    Rejected { code: i64, message: String },
    /// A response we could not decode into the typed model.
    #[error("invalid exchange response: {0}")]
    Invalid(String),
}

impl ExchangeError {
    pub fn rejected(code: i64, message: impl Into<String>) -> Self {
        Self::Rejected {
            code,
            message: message.into(),
        }
    }

    /// Cancelling a nonexistent order is a warning, not a failure.
    pub fn is_order_not_found(&self) -> bool {
        matches!(self, Self::Rejected { code, .. } if *code == CODE_ORDER_NOT_FOUND)
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

/// Typed facade over the exchange's REST and WebSocket APIs.
///
/// `set_position_mode_hedge` and `set_leverage` are idempotent: "already
/// set" rejections are normalized to success inside the adapter. Stream
/// guarantee: on (re)connect the position and wallet streams deliver a
/// snapshot of current state; execution and order streams deliver only
/// incremental events.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    async fn instrument_info(&self, symbol: &str) -> Result<InstrumentInfo, ExchangeError>;

    async fn set_position_mode_hedge(&self, symbol: &str) -> Result<(), ExchangeError>;

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), ExchangeError>;

    async fn wallet_snapshot(&self) -> Result<WalletSnapshot, ExchangeError>;

    async fn active_positions(&self, symbol: &str) -> Result<PositionPair, ExchangeError>;

    async fn last_price(&self, symbol: &str) -> Result<Decimal, ExchangeError>;

    /// Filled orders, oldest data reachable within the adapter's
    /// pagination cap, newest page first as the exchange returns them.
    async fn order_history(
        &self,
        symbol: &str,
        limit: u32,
    ) -> Result<Vec<HistoricOrder>, ExchangeError>;

    async fn open_orders(&self, symbol: &str) -> Result<Vec<OpenOrder>, ExchangeError>;

    /// Returns the exchange order id.
    async fn place_order(&self, request: &OrderRequest) -> Result<String, ExchangeError>;

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), ExchangeError>;

    /// Realtime order lookup; `None` when the order is no longer queryable.
    async fn order_status(
        &self,
        symbol: &str,
        order_id: &str,
    ) -> Result<Option<OrderSnapshot>, ExchangeError>;

    /// Spawn the public ticker stream for `symbols` plus the private
    /// execution/position/order/wallet streams, delivering typed events
    /// into `tx` until the gateway is dropped.
    async fn start_streams(
        &self,
        symbols: Vec<String>,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ExchangeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_not_found_detection() {
        let err = ExchangeError::rejected(CODE_ORDER_NOT_FOUND, "order not exists");
        assert!(err.is_order_not_found());
        let err = ExchangeError::rejected(10001, "params error");
        assert!(!err.is_order_not_found());
        assert!(!ExchangeError::Transport("timeout".into()).is_order_not_found());
    }
}
