//! Limit-first order execution with market fallback.
//!
//! Every entry and averaging order goes out as a maker-offset limit first:
//! Buy slightly above market, Sell slightly below, so it fills quickly but
//! usually as maker. Unfilled orders are cancelled and retried at the
//! fresh price; after the retry budget the order goes out as a market.
//! Take-profit orders never pass through here.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::{LIMIT_ORDER_MAX_RETRIES, LIMIT_ORDER_OFFSET_PCT, LIMIT_ORDER_TIMEOUT};
use crate::exchange::gateway::{ExchangeError, ExchangeGateway};
use crate::exchange::types::{OrderRequest, OrderSide, OrderStatus, PositionSide};
use crate::utils::decimal::round_to_step;

/// Result of a completed entry.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryFill {
    pub order_id: String,
    pub price: Decimal,
    pub used_market: bool,
}

/// Limit price with the maker-friendly offset applied.
pub fn offset_limit_price(side: OrderSide, market_price: Decimal, tick_size: Decimal) -> Decimal {
    let factor = match side {
        OrderSide::Buy => Decimal::ONE + LIMIT_ORDER_OFFSET_PCT / dec!(100),
        OrderSide::Sell => Decimal::ONE - LIMIT_ORDER_OFFSET_PCT / dec!(100),
    };
    round_to_step(market_price * factor, tick_size)
}

/// Places entries through the limit-with-retry protocol.
#[derive(Debug, Clone)]
pub struct LimitEntryExecutor {
    timeout: Duration,
    max_retries: u32,
    poll_interval: Duration,
}

impl Default for LimitEntryExecutor {
    fn default() -> Self {
        Self {
            timeout: LIMIT_ORDER_TIMEOUT,
            max_retries: LIMIT_ORDER_MAX_RETRIES,
            poll_interval: Duration::from_millis(500),
        }
    }
}

impl LimitEntryExecutor {
    #[cfg(test)]
    pub fn with_timings(timeout: Duration, max_retries: u32, poll_interval: Duration) -> Self {
        Self {
            timeout,
            max_retries,
            poll_interval,
        }
    }

    /// Open `qty` on `side` of `symbol`, limit-first.
    pub async fn execute(
        &self,
        gateway: &dyn ExchangeGateway,
        symbol: &str,
        side: PositionSide,
        qty: Decimal,
        market_price: Decimal,
        tick_size: Decimal,
    ) -> Result<EntryFill, ExchangeError> {
        let order_side = side.open_order_side();
        let mut price = market_price;

        for attempt in 0..=self.max_retries {
            let limit_price = offset_limit_price(order_side, price, tick_size);
            let request = OrderRequest::limit(symbol, side, qty, limit_price);
            let order_id = gateway.place_order(&request).await?;
            info!(
                "✅ [{symbol}] limit {order_side} {qty} @ ${limit_price} (market ${price}, retry {attempt}/{}, id {order_id})",
                self.max_retries
            );

            if let Some(fill_price) = self.await_fill(gateway, symbol, &order_id).await? {
                let price = if fill_price > Decimal::ZERO {
                    fill_price
                } else {
                    limit_price
                };
                return Ok(EntryFill {
                    order_id,
                    price,
                    used_market: false,
                });
            }

            warn!(
                "⏱️  [{symbol}] limit order {order_id} unfilled after {:?}; cancelling",
                self.timeout
            );
            match gateway.cancel_order(symbol, &order_id).await {
                Ok(()) => {}
                Err(e) if e.is_order_not_found() => {
                    // Filled in the cancel race; treat as done.
                    if let Some(snapshot) = gateway.order_status(symbol, &order_id).await? {
                        if snapshot.status == OrderStatus::Filled {
                            return Ok(EntryFill {
                                order_id,
                                price: snapshot.avg_price,
                                used_market: false,
                            });
                        }
                    }
                }
                Err(e) => return Err(e),
            }

            price = gateway.last_price(symbol).await.unwrap_or(price);
        }

        warn!("📉 [{symbol}] limit retries exhausted; falling back to market {order_side} {qty}");
        let request = OrderRequest::market(symbol, side, qty);
        let order_id = gateway.place_order(&request).await?;
        let fill_price = match gateway.order_status(symbol, &order_id).await? {
            Some(snapshot) if snapshot.avg_price > Decimal::ZERO => snapshot.avg_price,
            _ => price,
        };
        Ok(EntryFill {
            order_id,
            price: fill_price,
            used_market: true,
        })
    }

    /// Poll order state until filled or the timeout lapses.
    async fn await_fill(
        &self,
        gateway: &dyn ExchangeGateway,
        symbol: &str,
        order_id: &str,
    ) -> Result<Option<Decimal>, ExchangeError> {
        let deadline = tokio::time::Instant::now() + self.timeout;
        loop {
            if let Some(snapshot) = gateway.order_status(symbol, order_id).await? {
                match snapshot.status {
                    OrderStatus::Filled => return Ok(Some(snapshot.avg_price)),
                    OrderStatus::Cancelled | OrderStatus::Rejected | OrderStatus::Deactivated => {
                        return Ok(None);
                    }
                    OrderStatus::New | OrderStatus::PartiallyFilled => {}
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
