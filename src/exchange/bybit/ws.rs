//! Bybit v5 WebSocket streams.
//!
//! One public connection for tickers, one authenticated private
//! connection for execution/position/order/wallet. Payloads are decoded
//! into the typed event model right here; the rest of the system never
//! sees wire JSON. Both connections ping every 20 s and reconnect with
//! exponential backoff, emitting `Disconnected` events the supervisor
//! counts toward its escalation threshold.

use futures_util::{SinkExt, StreamExt};
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use sha2::Sha256;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::exchange::bybit::client::{dec_or_zero, parse_order_side, parse_order_status};
use crate::exchange::types::{
    ExecType, ExecutionEvent, OrderEvent, OrderSide, OrderType, PositionEvent, PositionSide,
    StopOrderType, StreamEvent, StreamKind, TickerEvent, WalletEvent, WalletSnapshot,
};
use crate::utils::time::from_exchange_ms;

const PUBLIC_URL: &str = "wss://stream.bybit.com/v5/public/linear";
const PRIVATE_URL: &str = "wss://stream.bybit.com/v5/private";
const PRIVATE_DEMO_URL: &str = "wss://stream-demo.bybit.com/v5/private";
const PING_INTERVAL: Duration = Duration::from_secs(20);
const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(5);
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(60);

type HmacSha256 = Hmac<Sha256>;

/// Connection parameters for both Bybit sockets.
#[derive(Clone)]
pub struct BybitWs {
    api_key: String,
    api_secret: String,
    private_url: String,
}

impl BybitWs {
    pub fn new(api_key: String, api_secret: String, demo: bool) -> Self {
        Self {
            api_key,
            api_secret,
            private_url: if demo { PRIVATE_DEMO_URL } else { PRIVATE_URL }.to_string(),
        }
    }

    /// Spawn the public ticker loop for `symbols`.
    pub fn spawn_public(&self, symbols: Vec<String>, tx: mpsc::Sender<StreamEvent>) {
        tokio::spawn(async move {
            let mut backoff = RECONNECT_BASE_DELAY;
            loop {
                match run_connection(
                    PUBLIC_URL.to_string(),
                    public_subscribe_frames(&symbols),
                    tx.clone(),
                    StreamKind::PublicTicker,
                    parse_public_message,
                )
                .await
                {
                    Ok(()) => backoff = RECONNECT_BASE_DELAY,
                    Err(e) => warn!("public WS error: {e}"),
                }
                let _ = tx.send(StreamEvent::Disconnected(StreamKind::PublicTicker)).await;
                if tx.is_closed() {
                    return;
                }
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(RECONNECT_MAX_DELAY);
            }
        });
    }

    /// Spawn the authenticated private loop.
    pub fn spawn_private(&self, tx: mpsc::Sender<StreamEvent>) {
        let this = self.clone();
        tokio::spawn(async move {
            let mut backoff = RECONNECT_BASE_DELAY;
            loop {
                let mut frames = vec![this.auth_frame()];
                frames.push(
                    json!({
                        "op": "subscribe",
                        "args": ["execution", "position", "order", "wallet"],
                    })
                    .to_string(),
                );
                match run_connection(
                    this.private_url.clone(),
                    frames,
                    tx.clone(),
                    StreamKind::Private,
                    parse_private_message,
                )
                .await
                {
                    Ok(()) => backoff = RECONNECT_BASE_DELAY,
                    Err(e) => warn!("private WS error: {e}"),
                }
                let _ = tx.send(StreamEvent::Disconnected(StreamKind::Private)).await;
                if tx.is_closed() {
                    return;
                }
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(RECONNECT_MAX_DELAY);
            }
        });
    }

    /// `HMAC_SHA256(secret, "GET/realtime" + expires)` per the v5 docs.
    fn auth_frame(&self) -> String {
        let expires = chrono::Utc::now().timestamp_millis() + 10_000;
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(format!("GET/realtime{expires}").as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());
        json!({
            "op": "auth",
            "args": [self.api_key, expires, signature],
        })
        .to_string()
    }
}

fn public_subscribe_frames(symbols: &[String]) -> Vec<String> {
    let args: Vec<String> = symbols.iter().map(|s| format!("tickers.{s}")).collect();
    vec![json!({ "op": "subscribe", "args": args }).to_string()]
}

/// One connection lifetime: connect, send the setup frames, pump messages
/// until the socket drops.
async fn run_connection(
    url: String,
    setup_frames: Vec<String>,
    tx: mpsc::Sender<StreamEvent>,
    kind: StreamKind,
    parser: fn(&str) -> Vec<StreamEvent>,
) -> anyhow::Result<()> {
    info!("connecting {kind:?} WebSocket: {url}");
    let (ws, _) = connect_async(url.as_str()).await?;
    let (mut write, mut read) = ws.split();

    for frame in setup_frames {
        write.send(Message::text(frame)).await?;
    }
    let _ = tx.send(StreamEvent::Connected(kind)).await;

    let mut ping_timer = tokio::time::interval(PING_INTERVAL);
    ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ping_timer.tick() => {
                write
                    .send(Message::text(json!({ "op": "ping" }).to_string()))
                    .await?;
            }
            message = read.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        for event in parser(&text) {
                            if tx.send(event).await.is_err() {
                                return Ok(());
                            }
                        }
                    }
                    Some(Ok(Message::Ping(_))) => {
                        debug!("{kind:?} ping; pong handled by tungstenite");
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("{kind:?} WebSocket closed by server");
                        return Ok(());
                    }
                    Some(Err(e)) => anyhow::bail!("{kind:?} read error: {e}"),
                    _ => {}
                }
            }
        }
    }
}

/// Public stream: `tickers.{symbol}` snapshots and deltas.
pub fn parse_public_message(raw: &str) -> Vec<StreamEvent> {
    let Ok(value) = serde_json::from_str::<Value>(raw) else {
        return Vec::new();
    };
    let Some(topic) = value["topic"].as_str() else {
        return Vec::new(); // op acknowledgements, pongs
    };
    if !topic.starts_with("tickers.") {
        return Vec::new();
    }
    let data = &value["data"];
    let Some(symbol) = data["symbol"].as_str() else {
        return Vec::new();
    };
    // Deltas may omit lastPrice; skip those rather than emit zero.
    let last_price = dec_or_zero(data["lastPrice"].as_str().unwrap_or(""));
    if last_price == Decimal::ZERO {
        return Vec::new();
    }
    vec![StreamEvent::Ticker(TickerEvent {
        symbol: symbol.to_string(),
        last_price,
    })]
}

/// Private stream: execution / position / order / wallet topics.
pub fn parse_private_message(raw: &str) -> Vec<StreamEvent> {
    let Ok(value) = serde_json::from_str::<Value>(raw) else {
        return Vec::new();
    };
    if let Some(op) = value["op"].as_str() {
        if op == "auth" && value["success"].as_bool() == Some(false) {
            warn!("private WS auth failed: {raw}");
        }
        return Vec::new();
    }
    let Some(topic) = value["topic"].as_str() else {
        return Vec::new();
    };
    let Some(items) = value["data"].as_array() else {
        return Vec::new();
    };

    match topic {
        "execution" => items.iter().filter_map(parse_execution).collect(),
        "position" => items.iter().filter_map(parse_position).collect(),
        "order" => items.iter().filter_map(parse_order).collect(),
        "wallet" => items.iter().filter_map(parse_wallet).collect(),
        _ => Vec::new(),
    }
}

fn parse_exec_type(raw: &str) -> ExecType {
    match raw {
        "Funding" => ExecType::Funding,
        "BustTrade" => ExecType::BustTrade,
        "AdlTrade" => ExecType::AdlTrade,
        "Settle" => ExecType::Settle,
        _ => ExecType::Trade,
    }
}

fn parse_stop_order_type(raw: &str) -> Option<StopOrderType> {
    match raw {
        "TakeProfit" | "PartialTakeProfit" => Some(StopOrderType::TakeProfit),
        "StopLoss" | "PartialStopLoss" => Some(StopOrderType::StopLoss),
        "TrailingStop" => Some(StopOrderType::TrailingStop),
        _ => None,
    }
}

fn parse_execution(item: &Value) -> Option<StreamEvent> {
    let symbol = item["symbol"].as_str()?.to_string();
    let side = parse_order_side(item["side"].as_str().unwrap_or("Buy"));
    let closed_size = dec_or_zero(item["closedSize"].as_str().unwrap_or(""));
    let exec_pnl = dec_or_zero(item["execPnl"].as_str().unwrap_or(""));

    // The execution payload has no positionIdx: in hedge mode a closing
    // Buy reduces the Short, an opening Buy grows the Long.
    let is_close = closed_size > Decimal::ZERO || exec_pnl != Decimal::ZERO;
    let position_side = match (side, is_close) {
        (OrderSide::Buy, false) | (OrderSide::Sell, true) => PositionSide::Long,
        (OrderSide::Sell, false) | (OrderSide::Buy, true) => PositionSide::Short,
    };

    Some(StreamEvent::Execution(ExecutionEvent {
        symbol,
        exec_id: item["execId"].as_str().unwrap_or("").to_string(),
        order_id: item["orderId"].as_str().unwrap_or("").to_string(),
        side,
        position_idx: position_side.position_idx(),
        exec_type: parse_exec_type(item["execType"].as_str().unwrap_or("Trade")),
        order_type: if item["orderType"].as_str() == Some("Limit") {
            OrderType::Limit
        } else {
            OrderType::Market
        },
        stop_order_type: parse_stop_order_type(item["stopOrderType"].as_str().unwrap_or("")),
        exec_qty: dec_or_zero(item["execQty"].as_str().unwrap_or("")),
        exec_price: dec_or_zero(item["execPrice"].as_str().unwrap_or("")),
        closed_size,
        exec_pnl,
        exec_fee: dec_or_zero(item["execFee"].as_str().unwrap_or("")),
        exec_time: from_exchange_ms(
            item["execTime"]
                .as_str()
                .and_then(|t| t.parse::<i64>().ok())
                .unwrap_or(0),
        ),
    }))
}

fn parse_position(item: &Value) -> Option<StreamEvent> {
    let symbol = item["symbol"].as_str()?.to_string();
    let position_idx = item["positionIdx"].as_u64().unwrap_or(0) as u8;
    let avg = item["entryPrice"]
        .as_str()
        .or_else(|| item["avgPrice"].as_str())
        .unwrap_or("");
    Some(StreamEvent::Position(PositionEvent {
        symbol,
        position_idx,
        size: dec_or_zero(item["size"].as_str().unwrap_or("")),
        avg_price: dec_or_zero(avg),
    }))
}

fn parse_order(item: &Value) -> Option<StreamEvent> {
    let symbol = item["symbol"].as_str()?.to_string();
    Some(StreamEvent::Order(OrderEvent {
        symbol,
        order_id: item["orderId"].as_str().unwrap_or("").to_string(),
        status: parse_order_status(item["orderStatus"].as_str().unwrap_or("")),
        side: parse_order_side(item["side"].as_str().unwrap_or("Buy")),
        position_idx: item["positionIdx"].as_u64().unwrap_or(0) as u8,
        qty: dec_or_zero(item["qty"].as_str().unwrap_or("")),
        cum_exec_qty: dec_or_zero(item["cumExecQty"].as_str().unwrap_or("")),
        avg_price: dec_or_zero(item["avgPrice"].as_str().unwrap_or("")),
        reduce_only: item["reduceOnly"].as_bool().unwrap_or(false),
    }))
}

fn parse_wallet(item: &Value) -> Option<StreamEvent> {
    Some(StreamEvent::Wallet(WalletEvent {
        snapshot: WalletSnapshot {
            available_balance: dec_or_zero(
                item["totalAvailableBalance"].as_str().unwrap_or(""),
            ),
            initial_margin: dec_or_zero(item["totalInitialMargin"].as_str().unwrap_or("")),
            maintenance_margin: dec_or_zero(
                item["totalMaintenanceMargin"].as_str().unwrap_or(""),
            ),
            // Wire decimal, percent internally.
            mm_rate_pct: dec_or_zero(item["accountMMRate"].as_str().unwrap_or(""))
                * Decimal::from(100),
        },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::types::OrderStatus;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_ticker_snapshot() {
        let raw = r#"{"topic":"tickers.SOLUSDT","type":"snapshot","data":{"symbol":"SOLUSDT","lastPrice":"101.25"}}"#;
        let events = parse_public_message(raw);
        assert_eq!(
            events,
            vec![StreamEvent::Ticker(TickerEvent {
                symbol: "SOLUSDT".to_string(),
                last_price: dec!(101.25),
            })]
        );
    }

    #[test]
    fn test_parse_ticker_delta_without_price_is_skipped() {
        let raw = r#"{"topic":"tickers.SOLUSDT","type":"delta","data":{"symbol":"SOLUSDT","openInterest":"123"}}"#;
        assert!(parse_public_message(raw).is_empty());
    }

    #[test]
    fn test_op_acknowledgements_are_ignored() {
        assert!(parse_public_message(r#"{"op":"pong"}"#).is_empty());
        assert!(parse_private_message(r#"{"op":"auth","success":true}"#).is_empty());
        assert!(parse_private_message(r#"{"op":"subscribe","success":true}"#).is_empty());
    }

    #[test]
    fn test_parse_execution_derives_position_side() {
        // Opening Buy grows the Long.
        let open = r#"{"topic":"execution","data":[{"symbol":"SOLUSDT","side":"Buy","orderId":"o1","execId":"e1","execType":"Trade","orderType":"Market","execQty":"1","execPrice":"100","closedSize":"0","execPnl":"0","execFee":"0.055","execTime":"1700000000000","stopOrderType":""}]}"#;
        let events = parse_private_message(open);
        let StreamEvent::Execution(exec) = &events[0] else {
            panic!("expected execution");
        };
        assert_eq!(exec.position_idx, 1);
        assert!(!exec.is_close());

        // Closing Buy reduces the Short.
        let close = r#"{"topic":"execution","data":[{"symbol":"SOLUSDT","side":"Buy","orderId":"o2","execId":"e2","execType":"Trade","orderType":"Limit","execQty":"1","execPrice":"98.9","closedSize":"1","execPnl":"1.1","execFee":"0.02","execTime":"1700000000001","stopOrderType":""}]}"#;
        let events = parse_private_message(close);
        let StreamEvent::Execution(exec) = &events[0] else {
            panic!("expected execution");
        };
        assert_eq!(exec.position_idx, 2);
        assert!(exec.is_close());
        assert_eq!(exec.exec_pnl, dec!(1.1));
    }

    #[test]
    fn test_parse_liquidation_execution() {
        let raw = r#"{"topic":"execution","data":[{"symbol":"SOLUSDT","side":"Sell","orderId":"o3","execId":"e3","execType":"BustTrade","orderType":"Market","execQty":"3","execPrice":"90","closedSize":"3","execPnl":"-5.0","execFee":"0","execTime":"1700000000002","stopOrderType":""}]}"#;
        let events = parse_private_message(raw);
        let StreamEvent::Execution(exec) = &events[0] else {
            panic!("expected execution");
        };
        assert_eq!(exec.exec_type, ExecType::BustTrade);
        // Closing Sell reduces the Long.
        assert_eq!(exec.position_idx, 1);
    }

    #[test]
    fn test_parse_order_event() {
        let raw = r#"{"topic":"order","data":[{"symbol":"SOLUSDT","orderId":"tp1","orderStatus":"Cancelled","side":"Sell","positionIdx":1,"qty":"3","cumExecQty":"0","avgPrice":"","reduceOnly":true}]}"#;
        let events = parse_private_message(raw);
        let StreamEvent::Order(order) = &events[0] else {
            panic!("expected order");
        };
        assert_eq!(order.status, OrderStatus::Cancelled);
        assert!(order.reduce_only);
        assert_eq!(order.position_idx, 1);
    }

    #[test]
    fn test_parse_wallet_converts_mm_rate() {
        let raw = r#"{"topic":"wallet","data":[{"accountType":"UNIFIED","totalAvailableBalance":"950.5","totalInitialMargin":"40","totalMaintenanceMargin":"8","accountMMRate":"0.005"}]}"#;
        let events = parse_private_message(raw);
        let StreamEvent::Wallet(wallet) = &events[0] else {
            panic!("expected wallet");
        };
        assert_eq!(wallet.snapshot.available_balance, dec!(950.5));
        assert_eq!(wallet.snapshot.mm_rate_pct, dec!(0.5));
    }

    #[test]
    fn test_parse_position_event() {
        let raw = r#"{"topic":"position","data":[{"symbol":"SOLUSDT","positionIdx":2,"size":"2.5","entryPrice":"101.4"}]}"#;
        let events = parse_private_message(raw);
        let StreamEvent::Position(position) = &events[0] else {
            panic!("expected position");
        };
        assert_eq!(position.position_idx, 2);
        assert_eq!(position.size, dec!(2.5));
        assert_eq!(position.avg_price, dec!(101.4));
    }
}
