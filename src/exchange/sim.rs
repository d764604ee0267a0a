//! Deterministic in-process exchange.
//!
//! Implements the full gateway contract against an in-memory ledger:
//! crossing limit orders fill, reduce-only orders only shrink positions,
//! hedge-mode sides are tracked separately and every fill emits the same
//! stream events the live venue would. Backs unit tests and `dry_run`
//! accounts.

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

use crate::exchange::gateway::{ExchangeError, ExchangeGateway, CODE_ORDER_NOT_FOUND};
use crate::exchange::types::{
    ExchangePosition, ExecType, ExecutionEvent, HistoricOrder, InstrumentInfo, OpenOrder,
    OrderEvent, OrderRequest, OrderSide, OrderSnapshot, OrderStatus, OrderType, PositionEvent,
    PositionPair, PositionSide, StreamEvent, StreamKind, TickerEvent, WalletEvent, WalletSnapshot,
};

#[derive(Debug, Clone, Default)]
struct SimPosition {
    size: Decimal,
    avg_price: Decimal,
}

#[derive(Debug, Clone)]
struct SimOrder {
    request: OrderRequest,
    order_id: String,
}

#[derive(Debug, Clone)]
struct FilledOrder {
    symbol: String,
    historic: HistoricOrder,
}

struct SimState {
    prices: HashMap<String, Decimal>,
    instruments: HashMap<String, InstrumentInfo>,
    leverage: HashMap<String, u32>,
    wallet: WalletSnapshot,
    positions: HashMap<(String, u8), SimPosition>,
    open_orders: Vec<SimOrder>,
    filled: Vec<FilledOrder>,
    next_order_id: u64,
    events_tx: Option<mpsc::Sender<StreamEvent>>,
}

/// Deterministic exchange simulator behind the gateway trait.
#[derive(Clone)]
pub struct SimExchange {
    state: Arc<RwLock<SimState>>,
}

impl SimExchange {
    pub fn new(starting_balance: Decimal) -> Self {
        Self {
            state: Arc::new(RwLock::new(SimState {
                prices: HashMap::new(),
                instruments: HashMap::new(),
                leverage: HashMap::new(),
                wallet: WalletSnapshot {
                    available_balance: starting_balance,
                    initial_margin: Decimal::ZERO,
                    maintenance_margin: Decimal::ZERO,
                    mm_rate_pct: Decimal::ZERO,
                },
                positions: HashMap::new(),
                open_orders: Vec::new(),
                filled: Vec::new(),
                next_order_id: 1,
                events_tx: None,
            })),
        }
    }

    /// Register an instrument and its starting price.
    pub async fn add_instrument(&self, info: InstrumentInfo, price: Decimal) {
        let mut state = self.state.write().await;
        state.prices.insert(info.symbol.clone(), price);
        state.instruments.insert(info.symbol.clone(), info);
    }

    /// Move the market: fills crossed resting limits and emits a tick.
    pub async fn set_price(&self, symbol: &str, price: Decimal) {
        let mut state = self.state.write().await;
        state.prices.insert(symbol.to_string(), price);

        let crossed: Vec<SimOrder> = state
            .open_orders
            .iter()
            .filter(|o| {
                o.request.symbol == symbol
                    && match (o.request.side, o.request.price) {
                        (OrderSide::Buy, Some(limit)) => price <= limit,
                        (OrderSide::Sell, Some(limit)) => price >= limit,
                        _ => false,
                    }
            })
            .cloned()
            .collect();
        for order in &crossed {
            state.open_orders.retain(|o| o.order_id != order.order_id);
            let fill_price = order.request.price.unwrap_or(price);
            Self::fill(&mut state, &order.request, &order.order_id, fill_price);
        }

        let event = StreamEvent::Ticker(TickerEvent {
            symbol: symbol.to_string(),
            last_price: price,
        });
        Self::emit(&state, event);
    }

    /// Force the wallet snapshot (for mm-rate scenarios) and emit it.
    pub async fn set_wallet(&self, wallet: WalletSnapshot) {
        let mut state = self.state.write().await;
        state.wallet = wallet;
        Self::emit(&state, StreamEvent::Wallet(WalletEvent { snapshot: wallet }));
    }

    /// Inject a raw stream event (liquidations, disconnects, ...).
    pub async fn inject_event(&self, event: StreamEvent) {
        let state = self.state.read().await;
        Self::emit(&state, event);
    }

    /// Seed an exchange-side position without history (restoration tests).
    pub async fn seed_position(&self, symbol: &str, side: PositionSide, size: Decimal, avg: Decimal) {
        let mut state = self.state.write().await;
        state.positions.insert(
            (symbol.to_string(), side.position_idx()),
            SimPosition {
                size,
                avg_price: avg,
            },
        );
    }

    /// Seed order history directly (restoration tests).
    pub async fn seed_history(&self, symbol: &str, orders: Vec<HistoricOrder>) {
        let mut state = self.state.write().await;
        state.filled.extend(orders.into_iter().map(|historic| FilledOrder {
            symbol: symbol.to_string(),
            historic,
        }));
    }

    pub async fn open_order_count(&self) -> usize {
        self.state.read().await.open_orders.len()
    }

    fn emit(state: &SimState, event: StreamEvent) {
        if let Some(tx) = &state.events_tx {
            // Dropped receivers are a test teardown artifact, not an error.
            let _ = tx.try_send(event);
        }
    }

    fn fill(state: &mut SimState, request: &OrderRequest, order_id: &str, price: Decimal) {
        let key = (request.symbol.clone(), request.position_idx);
        let position = state.positions.entry(key.clone()).or_default();
        let side = PositionSide::from_position_idx(request.position_idx)
            .unwrap_or(PositionSide::Long);

        let mut closed_size = Decimal::ZERO;
        let mut exec_pnl = Decimal::ZERO;
        let leverage = Decimal::from(*state.leverage.get(&request.symbol).unwrap_or(&1));

        if request.reduce_only {
            let qty = request.qty.min(position.size);
            closed_size = qty;
            exec_pnl = match side {
                PositionSide::Long => (price - position.avg_price) * qty,
                PositionSide::Short => (position.avg_price - price) * qty,
            };
            let released_margin = position.avg_price * qty / leverage;
            position.size -= qty;
            if position.size == Decimal::ZERO {
                position.avg_price = Decimal::ZERO;
            }
            state.wallet.available_balance += released_margin + exec_pnl;
        } else {
            let notional = position.avg_price * position.size + price * request.qty;
            position.size += request.qty;
            position.avg_price = notional / position.size;
            state.wallet.available_balance -= price * request.qty / leverage;
        }

        let now = Utc::now();
        let fee_rate = match request.order_type {
            OrderType::Market => dec!(0.00055),
            OrderType::Limit => dec!(0.0002),
        };
        let exec_fee = price * request.qty * fee_rate;
        let new_size = position.size;

        state.filled.push(FilledOrder {
            symbol: request.symbol.clone(),
            historic: HistoricOrder {
                order_id: order_id.to_string(),
                side: request.side,
                position_idx: request.position_idx,
                qty: request.qty,
                avg_price: price,
                reduce_only: request.reduce_only,
                status: OrderStatus::Filled,
                created_time: now,
                updated_time: now,
            },
        });

        debug!(
            "[sim] filled {} {:?} {} @ {} (reduce_only={}, pnl={})",
            request.symbol, request.side, request.qty, price, request.reduce_only, exec_pnl
        );

        Self::emit(
            state,
            StreamEvent::Execution(ExecutionEvent {
                symbol: request.symbol.clone(),
                exec_id: format!("exec-{order_id}"),
                order_id: order_id.to_string(),
                side: request.side,
                position_idx: request.position_idx,
                exec_type: ExecType::Trade,
                order_type: request.order_type,
                stop_order_type: None,
                exec_qty: request.qty,
                exec_price: price,
                closed_size,
                exec_pnl,
                exec_fee,
                exec_time: now,
            }),
        );
        Self::emit(
            state,
            StreamEvent::Order(OrderEvent {
                symbol: request.symbol.clone(),
                order_id: order_id.to_string(),
                status: OrderStatus::Filled,
                side: request.side,
                position_idx: request.position_idx,
                qty: request.qty,
                cum_exec_qty: request.qty,
                avg_price: price,
                reduce_only: request.reduce_only,
            }),
        );
        Self::emit(
            state,
            StreamEvent::Position(PositionEvent {
                symbol: request.symbol.clone(),
                position_idx: request.position_idx,
                size: new_size,
                avg_price: state
                    .positions
                    .get(&key)
                    .map(|p| p.avg_price)
                    .unwrap_or(Decimal::ZERO),
            }),
        );
        let wallet = state.wallet;
        Self::emit(state, StreamEvent::Wallet(WalletEvent { snapshot: wallet }));
    }
}

#[async_trait]
impl ExchangeGateway for SimExchange {
    async fn instrument_info(&self, symbol: &str) -> Result<InstrumentInfo, ExchangeError> {
        self.state
            .read()
            .await
            .instruments
            .get(symbol)
            .cloned()
            .ok_or_else(|| ExchangeError::Invalid(format!("unknown instrument {symbol}")))
    }

    async fn set_position_mode_hedge(&self, _symbol: &str) -> Result<(), ExchangeError> {
        Ok(())
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), ExchangeError> {
        self.state
            .write()
            .await
            .leverage
            .insert(symbol.to_string(), leverage);
        Ok(())
    }

    async fn wallet_snapshot(&self) -> Result<WalletSnapshot, ExchangeError> {
        Ok(self.state.read().await.wallet)
    }

    async fn active_positions(&self, symbol: &str) -> Result<PositionPair, ExchangeError> {
        let state = self.state.read().await;
        let mut pair = PositionPair::default();
        for side in PositionSide::BOTH {
            if let Some(p) = state.positions.get(&(symbol.to_string(), side.position_idx())) {
                if p.size > Decimal::ZERO {
                    let slot = match side {
                        PositionSide::Long => &mut pair.long,
                        PositionSide::Short => &mut pair.short,
                    };
                    *slot = Some(ExchangePosition {
                        side,
                        size: p.size,
                        avg_price: p.avg_price,
                    });
                }
            }
        }
        Ok(pair)
    }

    async fn last_price(&self, symbol: &str) -> Result<Decimal, ExchangeError> {
        self.state
            .read()
            .await
            .prices
            .get(symbol)
            .copied()
            .ok_or_else(|| ExchangeError::Invalid(format!("no price for {symbol}")))
    }

    async fn order_history(
        &self,
        symbol: &str,
        limit: u32,
    ) -> Result<Vec<HistoricOrder>, ExchangeError> {
        let state = self.state.read().await;
        let mut orders: Vec<HistoricOrder> = state
            .filled
            .iter()
            .filter(|f| f.symbol == symbol)
            .map(|f| f.historic.clone())
            .collect();
        let keep = orders.len().saturating_sub(limit as usize);
        orders.drain(..keep);
        Ok(orders)
    }

    async fn open_orders(&self, symbol: &str) -> Result<Vec<OpenOrder>, ExchangeError> {
        Ok(self
            .state
            .read()
            .await
            .open_orders
            .iter()
            .filter(|o| o.request.symbol == symbol)
            .map(|o| OpenOrder {
                order_id: o.order_id.clone(),
                side: o.request.side,
                position_idx: o.request.position_idx,
                qty: o.request.qty,
                price: o.request.price.unwrap_or(Decimal::ZERO),
                reduce_only: o.request.reduce_only,
            })
            .collect())
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<String, ExchangeError> {
        let mut state = self.state.write().await;
        let order_id = format!("sim-{}", state.next_order_id);
        state.next_order_id += 1;

        let market_price = state
            .prices
            .get(&request.symbol)
            .copied()
            .ok_or_else(|| ExchangeError::Invalid(format!("no price for {}", request.symbol)))?;

        match request.order_type {
            OrderType::Market => {
                Self::fill(&mut state, request, &order_id, market_price);
            }
            OrderType::Limit => {
                let limit = request
                    .price
                    .ok_or_else(|| ExchangeError::rejected(10001, "limit order without price"))?;
                let crosses = match request.side {
                    OrderSide::Buy => market_price <= limit,
                    OrderSide::Sell => market_price >= limit,
                };
                if crosses {
                    Self::fill(&mut state, request, &order_id, limit);
                } else {
                    state.open_orders.push(SimOrder {
                        request: request.clone(),
                        order_id: order_id.clone(),
                    });
                    Self::emit(
                        &state,
                        StreamEvent::Order(OrderEvent {
                            symbol: request.symbol.clone(),
                            order_id: order_id.clone(),
                            status: OrderStatus::New,
                            side: request.side,
                            position_idx: request.position_idx,
                            qty: request.qty,
                            cum_exec_qty: Decimal::ZERO,
                            avg_price: Decimal::ZERO,
                            reduce_only: request.reduce_only,
                        }),
                    );
                }
            }
        }
        Ok(order_id)
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), ExchangeError> {
        let mut state = self.state.write().await;
        let Some(index) = state.open_orders.iter().position(|o| o.order_id == order_id) else {
            return Err(ExchangeError::rejected(
                CODE_ORDER_NOT_FOUND,
                "order not exists or too late to cancel",
            ));
        };
        let order = state.open_orders.remove(index);
        Self::emit(
            &state,
            StreamEvent::Order(OrderEvent {
                symbol: symbol.to_string(),
                order_id: order_id.to_string(),
                status: OrderStatus::Cancelled,
                side: order.request.side,
                position_idx: order.request.position_idx,
                qty: order.request.qty,
                cum_exec_qty: Decimal::ZERO,
                avg_price: Decimal::ZERO,
                reduce_only: order.request.reduce_only,
            }),
        );
        Ok(())
    }

    async fn order_status(
        &self,
        _symbol: &str,
        order_id: &str,
    ) -> Result<Option<OrderSnapshot>, ExchangeError> {
        let state = self.state.read().await;
        if let Some(order) = state.open_orders.iter().find(|o| o.order_id == order_id) {
            return Ok(Some(OrderSnapshot {
                order_id: order_id.to_string(),
                status: OrderStatus::New,
                qty: order.request.qty,
                cum_exec_qty: Decimal::ZERO,
                avg_price: Decimal::ZERO,
            }));
        }
        if let Some(filled) = state
            .filled
            .iter()
            .rev()
            .find(|f| f.historic.order_id == order_id)
        {
            return Ok(Some(OrderSnapshot {
                order_id: order_id.to_string(),
                status: OrderStatus::Filled,
                qty: filled.historic.qty,
                cum_exec_qty: filled.historic.qty,
                avg_price: filled.historic.avg_price,
            }));
        }
        Ok(None)
    }

    async fn start_streams(
        &self,
        symbols: Vec<String>,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ExchangeError> {
        let mut state = self.state.write().await;
        state.events_tx = Some(tx.clone());
        let _ = tx.try_send(StreamEvent::Connected(StreamKind::Private));
        let _ = tx.try_send(StreamEvent::Connected(StreamKind::PublicTicker));
        // Position and wallet streams deliver a snapshot on connect.
        for symbol in &symbols {
            for side in PositionSide::BOTH {
                if let Some(p) = state.positions.get(&(symbol.clone(), side.position_idx())) {
                    let _ = tx.try_send(StreamEvent::Position(PositionEvent {
                        symbol: symbol.clone(),
                        position_idx: side.position_idx(),
                        size: p.size,
                        avg_price: p.avg_price,
                    }));
                }
            }
        }
        let wallet = state.wallet;
        let _ = tx.try_send(StreamEvent::Wallet(WalletEvent { snapshot: wallet }));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instrument(symbol: &str) -> InstrumentInfo {
        InstrumentInfo {
            symbol: symbol.to_string(),
            min_qty: dec!(0.1),
            qty_step: dec!(0.1),
            max_qty: dec!(10000),
            tick_size: dec!(0.01),
        }
    }

    async fn sim() -> SimExchange {
        let sim = SimExchange::new(dec!(1000));
        sim.add_instrument(instrument("SOLUSDT"), dec!(100)).await;
        sim.set_leverage("SOLUSDT", 100).await.unwrap();
        sim
    }

    #[tokio::test]
    async fn test_market_order_fills_and_updates_position() {
        let sim = sim().await;
        let request = OrderRequest::market("SOLUSDT", PositionSide::Long, dec!(2));
        sim.place_order(&request).await.unwrap();

        let pair = sim.active_positions("SOLUSDT").await.unwrap();
        let long = pair.long.unwrap();
        assert_eq!(long.size, dec!(2));
        assert_eq!(long.avg_price, dec!(100));
        assert!(pair.short.is_none());
    }

    #[tokio::test]
    async fn test_hedge_sides_are_independent() {
        let sim = sim().await;
        sim.place_order(&OrderRequest::market("SOLUSDT", PositionSide::Long, dec!(1)))
            .await
            .unwrap();
        sim.place_order(&OrderRequest::market("SOLUSDT", PositionSide::Short, dec!(3)))
            .await
            .unwrap();
        let pair = sim.active_positions("SOLUSDT").await.unwrap();
        assert_eq!(pair.size(PositionSide::Long), dec!(1));
        assert_eq!(pair.size(PositionSide::Short), dec!(3));
    }

    #[tokio::test]
    async fn test_reduce_only_never_grows_position() {
        let sim = sim().await;
        sim.place_order(&OrderRequest::market("SOLUSDT", PositionSide::Long, dec!(1)))
            .await
            .unwrap();
        sim.place_order(&OrderRequest::close_market("SOLUSDT", PositionSide::Long, dec!(5)))
            .await
            .unwrap();
        let pair = sim.active_positions("SOLUSDT").await.unwrap();
        assert!(pair.long.is_none());
    }

    #[tokio::test]
    async fn test_resting_limit_fills_on_cross() {
        let sim = sim().await;
        let tp = OrderRequest::take_profit("SOLUSDT", PositionSide::Long, dec!(1), dec!(101.075));
        sim.place_order(&OrderRequest::market("SOLUSDT", PositionSide::Long, dec!(1)))
            .await
            .unwrap();
        let tp_id = sim.place_order(&tp).await.unwrap();
        assert_eq!(sim.open_order_count().await, 1);

        sim.set_price("SOLUSDT", dec!(101.5)).await;
        assert_eq!(sim.open_order_count().await, 0);
        let snapshot = sim.order_status("SOLUSDT", &tp_id).await.unwrap().unwrap();
        assert_eq!(snapshot.status, OrderStatus::Filled);
        assert_eq!(snapshot.avg_price, dec!(101.075));
    }

    #[tokio::test]
    async fn test_cancel_missing_order_is_not_found() {
        let sim = sim().await;
        let err = sim.cancel_order("SOLUSDT", "sim-999").await.unwrap_err();
        assert!(err.is_order_not_found());
    }

    #[tokio::test]
    async fn test_close_emits_pnl_execution() {
        let sim = sim().await;
        let (tx, mut rx) = mpsc::channel(64);
        sim.start_streams(vec!["SOLUSDT".to_string()], tx).await.unwrap();

        sim.place_order(&OrderRequest::market("SOLUSDT", PositionSide::Long, dec!(1)))
            .await
            .unwrap();
        sim.set_price("SOLUSDT", dec!(102)).await;
        sim.place_order(&OrderRequest::close_market("SOLUSDT", PositionSide::Long, dec!(1)))
            .await
            .unwrap();

        let mut close_seen = false;
        while let Ok(event) = rx.try_recv() {
            if let StreamEvent::Execution(exec) = event {
                if exec.is_close() {
                    assert_eq!(exec.closed_size, dec!(1));
                    assert_eq!(exec.exec_pnl, dec!(2));
                    close_seen = true;
                }
            }
        }
        assert!(close_seen);
    }

    #[tokio::test]
    async fn test_history_window_limit() {
        let sim = sim().await;
        for _ in 0..5 {
            sim.place_order(&OrderRequest::market("SOLUSDT", PositionSide::Long, dec!(0.1)))
                .await
                .unwrap();
        }
        let history = sim.order_history("SOLUSDT", 3).await.unwrap();
        assert_eq!(history.len(), 3);
    }
}
