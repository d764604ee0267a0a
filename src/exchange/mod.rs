//! Exchange integration.
//!
//! Provides both REST API and WebSocket connectivity for:
//! - Market data (instrument rules, tickers)
//! - Account operations (orders, positions, wallet)
//! - Private streams (executions, positions, orders, wallet)

pub mod bybit;
pub mod gateway;
pub mod sim;
pub(crate) mod types;

pub use bybit::BybitGateway;
pub use gateway::{ExchangeError, ExchangeGateway};
pub use sim::SimExchange;
pub use types::*;
