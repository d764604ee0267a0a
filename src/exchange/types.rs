//! Typed domain model at the adapter boundary.
//!
//! Exchange payloads are decoded into these closed variants once, inside
//! the adapter; the strategy core never sees raw wire JSON.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A hedge-mode position side. Bybit addresses the two sides of one symbol
/// with `positionIdx` 1 (Long) and 2 (Short); one-way mode (0) is not used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    pub const BOTH: [PositionSide; 2] = [PositionSide::Long, PositionSide::Short];

    pub fn position_idx(self) -> u8 {
        match self {
            PositionSide::Long => 1,
            PositionSide::Short => 2,
        }
    }

    pub fn from_position_idx(idx: u8) -> Option<Self> {
        match idx {
            1 => Some(PositionSide::Long),
            2 => Some(PositionSide::Short),
            _ => None,
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            PositionSide::Long => PositionSide::Short,
            PositionSide::Short => PositionSide::Long,
        }
    }

    /// Order side that grows this position.
    pub fn open_order_side(self) -> OrderSide {
        match self {
            PositionSide::Long => OrderSide::Buy,
            PositionSide::Short => OrderSide::Sell,
        }
    }

    /// Order side that reduces this position (reduce-only orders).
    pub fn close_order_side(self) -> OrderSide {
        match self {
            PositionSide::Long => OrderSide::Sell,
            PositionSide::Short => OrderSide::Buy,
        }
    }
}

impl fmt::Display for PositionSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionSide::Long => write!(f, "LONG"),
            PositionSide::Short => write!(f, "SHORT"),
        }
    }
}

/// Order side (buy or sell).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "Buy"),
            OrderSide::Sell => write!(f, "Sell"),
        }
    }
}

/// Order type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
}

/// Time in force for limit orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeInForce {
    Gtc,
    Ioc,
    PostOnly,
}

/// Order status as reported by the order stream and order queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
    Deactivated,
}

/// Execution type on the private execution stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecType {
    Trade,
    Funding,
    BustTrade,
    AdlTrade,
    Settle,
}

/// Conditional-order class attached to an execution, when any.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopOrderType {
    TakeProfit,
    StopLoss,
    TrailingStop,
}

/// Instrument trading rules, loaded once per symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentInfo {
    pub symbol: String,
    pub min_qty: Decimal,
    pub qty_step: Decimal,
    pub max_qty: Decimal,
    pub tick_size: Decimal,
}

/// Wallet totals for the unified account.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct WalletSnapshot {
    pub available_balance: Decimal,
    pub initial_margin: Decimal,
    pub maintenance_margin: Decimal,
    /// Account maintenance-margin rate in percent (wire decimal * 100).
    pub mm_rate_pct: Decimal,
}

/// One side of an exchange-reported position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExchangePosition {
    pub side: PositionSide,
    pub size: Decimal,
    pub avg_price: Decimal,
}

/// Both sides of a hedge-mode position as the exchange reports them.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PositionPair {
    pub long: Option<ExchangePosition>,
    pub short: Option<ExchangePosition>,
}

impl PositionPair {
    pub fn side(&self, side: PositionSide) -> Option<&ExchangePosition> {
        match side {
            PositionSide::Long => self.long.as_ref(),
            PositionSide::Short => self.short.as_ref(),
        }
    }

    pub fn size(&self, side: PositionSide) -> Decimal {
        self.side(side).map(|p| p.size).unwrap_or(Decimal::ZERO)
    }
}

/// A filled order from the order-history endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoricOrder {
    pub order_id: String,
    pub side: OrderSide,
    pub position_idx: u8,
    pub qty: Decimal,
    pub avg_price: Decimal,
    pub reduce_only: bool,
    pub status: OrderStatus,
    pub created_time: DateTime<Utc>,
    pub updated_time: DateTime<Utc>,
}

/// An order currently live on the exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct OpenOrder {
    pub order_id: String,
    pub side: OrderSide,
    pub position_idx: u8,
    pub qty: Decimal,
    pub price: Decimal,
    pub reduce_only: bool,
}

/// Outgoing order request.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub qty: Decimal,
    /// Required for limit orders.
    pub price: Option<Decimal>,
    pub reduce_only: bool,
    pub position_idx: u8,
    pub time_in_force: Option<TimeInForce>,
}

impl OrderRequest {
    pub fn market(symbol: &str, side: PositionSide, qty: Decimal) -> Self {
        Self {
            symbol: symbol.to_string(),
            side: side.open_order_side(),
            order_type: OrderType::Market,
            qty,
            price: None,
            reduce_only: false,
            position_idx: side.position_idx(),
            time_in_force: None,
        }
    }

    pub fn limit(symbol: &str, side: PositionSide, qty: Decimal, price: Decimal) -> Self {
        Self {
            symbol: symbol.to_string(),
            side: side.open_order_side(),
            order_type: OrderType::Limit,
            qty,
            price: Some(price),
            reduce_only: false,
            position_idx: side.position_idx(),
            time_in_force: Some(TimeInForce::Gtc),
        }
    }

    /// Reduce-only limit that closes `side` at `price` (the TP shape).
    pub fn take_profit(symbol: &str, side: PositionSide, qty: Decimal, price: Decimal) -> Self {
        Self {
            symbol: symbol.to_string(),
            side: side.close_order_side(),
            order_type: OrderType::Limit,
            qty,
            price: Some(price),
            reduce_only: true,
            position_idx: side.position_idx(),
            time_in_force: Some(TimeInForce::Gtc),
        }
    }

    /// Reduce-only market that flattens `side` entirely.
    pub fn close_market(symbol: &str, side: PositionSide, qty: Decimal) -> Self {
        Self {
            symbol: symbol.to_string(),
            side: side.close_order_side(),
            order_type: OrderType::Market,
            qty,
            price: None,
            reduce_only: true,
            position_idx: side.position_idx(),
            time_in_force: None,
        }
    }
}

/// Live order state returned by a realtime order query.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderSnapshot {
    pub order_id: String,
    pub status: OrderStatus,
    pub qty: Decimal,
    pub cum_exec_qty: Decimal,
    pub avg_price: Decimal,
}

// ==================== Push stream events ====================

/// Public ticker update.
#[derive(Debug, Clone, PartialEq)]
pub struct TickerEvent {
    pub symbol: String,
    pub last_price: Decimal,
}

/// Private execution event; authoritative for fills, closes and PnL.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionEvent {
    pub symbol: String,
    pub exec_id: String,
    pub order_id: String,
    pub side: OrderSide,
    pub position_idx: u8,
    pub exec_type: ExecType,
    pub order_type: OrderType,
    pub stop_order_type: Option<StopOrderType>,
    pub exec_qty: Decimal,
    pub exec_price: Decimal,
    pub closed_size: Decimal,
    pub exec_pnl: Decimal,
    pub exec_fee: Decimal,
    pub exec_time: DateTime<Utc>,
}

impl ExecutionEvent {
    /// An execution closes position quantity iff it reports closed size or
    /// realized PnL; everything else is an open/add.
    pub fn is_close(&self) -> bool {
        self.closed_size > Decimal::ZERO || self.exec_pnl != Decimal::ZERO
    }

    pub fn position_side(&self) -> Option<PositionSide> {
        PositionSide::from_position_idx(self.position_idx)
    }
}

/// Private position update (exchange-reported size per side).
#[derive(Debug, Clone, PartialEq)]
pub struct PositionEvent {
    pub symbol: String,
    pub position_idx: u8,
    pub size: Decimal,
    pub avg_price: Decimal,
}

/// Private order lifecycle update.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderEvent {
    pub symbol: String,
    pub order_id: String,
    pub status: OrderStatus,
    pub side: OrderSide,
    pub position_idx: u8,
    pub qty: Decimal,
    pub cum_exec_qty: Decimal,
    pub avg_price: Decimal,
    pub reduce_only: bool,
}

/// Private wallet update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WalletEvent {
    pub snapshot: WalletSnapshot,
}

/// Which connection an event or disconnect belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    PublicTicker,
    Private,
}

/// Everything the gateway pushes into an account's inbox.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Ticker(TickerEvent),
    Execution(ExecutionEvent),
    Position(PositionEvent),
    Order(OrderEvent),
    Wallet(WalletEvent),
    Connected(StreamKind),
    Disconnected(StreamKind),
}
