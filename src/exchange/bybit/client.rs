//! Bybit v5 REST client.
//!
//! Authenticated requests carry the v5 header signature:
//! `HMAC_SHA256(secret, timestamp + api_key + recv_window + payload)` where
//! payload is the raw query string for GETs and the raw JSON body for
//! POSTs. "Already set" rejections on position mode and leverage are
//! normalized to success here so callers stay idempotent.

use hmac::{Hmac, Mac};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;
use std::str::FromStr;
use tracing::{debug, warn};

use crate::exchange::gateway::{
    ExchangeError, CODE_LEVERAGE_NOT_MODIFIED, CODE_POSITION_MODE_NOT_MODIFIED,
};
use crate::exchange::types::{
    ExchangePosition, HistoricOrder, InstrumentInfo, OpenOrder, OrderRequest, OrderSide,
    OrderSnapshot, OrderStatus, OrderType, PositionPair, PositionSide, TimeInForce, WalletSnapshot,
};
use crate::utils::time::from_exchange_ms;

const MAINNET_URL: &str = "https://api.bybit.com";
const DEMO_URL: &str = "https://api-demo.bybit.com";
const RECV_WINDOW: &str = "5000";
const CATEGORY: &str = "linear";
/// Hedge mode for both sides (Bybit position mode 3).
const POSITION_MODE_HEDGE: u8 = 3;

type HmacSha256 = Hmac<Sha256>;

/// REST half of the Bybit adapter.
pub struct BybitClient {
    http: Client,
    base_url: String,
    api_key: String,
    api_secret: String,
}

#[derive(Debug, Deserialize)]
struct ApiEnvelope<T> {
    #[serde(rename = "retCode")]
    ret_code: i64,
    #[serde(rename = "retMsg")]
    ret_msg: String,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct ListResult<T> {
    list: Vec<T>,
    #[serde(rename = "nextPageCursor", default)]
    next_page_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireInstrument {
    symbol: String,
    #[serde(rename = "lotSizeFilter")]
    lot_size_filter: WireLotSize,
    #[serde(rename = "priceFilter")]
    price_filter: WirePriceFilter,
}

#[derive(Debug, Deserialize)]
struct WireLotSize {
    #[serde(rename = "minOrderQty")]
    min_order_qty: String,
    #[serde(rename = "qtyStep")]
    qty_step: String,
    #[serde(rename = "maxOrderQty")]
    max_order_qty: String,
}

#[derive(Debug, Deserialize)]
struct WirePriceFilter {
    #[serde(rename = "tickSize")]
    tick_size: String,
}

#[derive(Debug, Deserialize)]
struct WireTicker {
    #[serde(rename = "lastPrice")]
    last_price: String,
}

#[derive(Debug, Deserialize)]
struct WirePosition {
    #[serde(rename = "positionIdx")]
    position_idx: u8,
    size: String,
    #[serde(rename = "avgPrice", default)]
    avg_price: String,
}

#[derive(Debug, Deserialize)]
struct WireWallet {
    #[serde(rename = "totalAvailableBalance")]
    total_available_balance: String,
    #[serde(rename = "totalInitialMargin", default)]
    total_initial_margin: String,
    #[serde(rename = "totalMaintenanceMargin", default)]
    total_maintenance_margin: String,
    #[serde(rename = "accountMMRate", default)]
    account_mm_rate: String,
}

#[derive(Debug, Deserialize)]
struct WireOrderId {
    #[serde(rename = "orderId")]
    order_id: String,
}

#[derive(Debug, Deserialize)]
struct WireOrder {
    #[serde(rename = "orderId")]
    order_id: String,
    side: String,
    #[serde(rename = "positionIdx", default)]
    position_idx: u8,
    qty: String,
    #[serde(rename = "price", default)]
    price: String,
    #[serde(rename = "avgPrice", default)]
    avg_price: String,
    #[serde(rename = "cumExecQty", default)]
    cum_exec_qty: String,
    #[serde(rename = "reduceOnly", default)]
    reduce_only: bool,
    #[serde(rename = "orderStatus")]
    order_status: String,
    #[serde(rename = "createdTime", default)]
    created_time: String,
    #[serde(rename = "updatedTime", default)]
    updated_time: String,
}

/// Lenient decimal parse; Bybit sends `""` for unset numeric fields.
pub(crate) fn dec_or_zero(raw: &str) -> Decimal {
    Decimal::from_str(raw).unwrap_or(Decimal::ZERO)
}

pub(crate) fn parse_order_status(raw: &str) -> OrderStatus {
    match raw {
        "New" | "Untriggered" | "Triggered" => OrderStatus::New,
        "PartiallyFilled" => OrderStatus::PartiallyFilled,
        "Filled" => OrderStatus::Filled,
        "Cancelled" | "PartiallyFilledCanceled" => OrderStatus::Cancelled,
        "Rejected" => OrderStatus::Rejected,
        _ => OrderStatus::Deactivated,
    }
}

pub(crate) fn parse_order_side(raw: &str) -> OrderSide {
    if raw == "Sell" {
        OrderSide::Sell
    } else {
        OrderSide::Buy
    }
}

impl BybitClient {
    pub fn new(api_key: String, api_secret: String, demo: bool) -> Self {
        let base_url = if demo { DEMO_URL } else { MAINNET_URL };
        Self {
            http: Client::new(),
            base_url: base_url.to_string(),
            api_key,
            api_secret,
        }
    }

    #[cfg(test)]
    pub fn with_base_url(api_key: String, api_secret: String, base_url: String) -> Self {
        Self {
            http: Client::new(),
            base_url,
            api_key,
            api_secret,
        }
    }

    fn sign(&self, timestamp: &str, payload: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(timestamp.as_bytes());
        mac.update(self.api_key.as_bytes());
        mac.update(RECV_WINDOW.as_bytes());
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &str,
        auth: bool,
    ) -> Result<T, ExchangeError> {
        let url = if query.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, query)
        };
        let mut request = self.http.get(&url);
        if auth {
            let timestamp = chrono::Utc::now().timestamp_millis().to_string();
            let signature = self.sign(&timestamp, query);
            request = request
                .header("X-BAPI-API-KEY", &self.api_key)
                .header("X-BAPI-TIMESTAMP", &timestamp)
                .header("X-BAPI-RECV-WINDOW", RECV_WINDOW)
                .header("X-BAPI-SIGN", signature);
        }
        let response = request.send().await?;
        self.unwrap_envelope(response).await
    }

    async fn post<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<T, ExchangeError> {
        let payload = body.to_string();
        let timestamp = chrono::Utc::now().timestamp_millis().to_string();
        let signature = self.sign(&timestamp, &payload);
        let response = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .header("X-BAPI-API-KEY", &self.api_key)
            .header("X-BAPI-TIMESTAMP", &timestamp)
            .header("X-BAPI-RECV-WINDOW", RECV_WINDOW)
            .header("X-BAPI-SIGN", signature)
            .header("Content-Type", "application/json")
            .body(payload)
            .send()
            .await?;
        self.unwrap_envelope(response).await
    }

    async fn unwrap_envelope<T: DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, ExchangeError> {
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(ExchangeError::Transport(format!(
                "HTTP {status}: {body}"
            )));
        }
        let envelope: ApiEnvelope<T> = serde_json::from_str(&body)
            .map_err(|e| ExchangeError::Invalid(format!("{e}: {body}")))?;
        if envelope.ret_code != 0 {
            return Err(ExchangeError::rejected(envelope.ret_code, envelope.ret_msg));
        }
        envelope
            .result
            .ok_or_else(|| ExchangeError::Invalid("missing result".to_string()))
    }

    pub async fn instrument_info(&self, symbol: &str) -> Result<InstrumentInfo, ExchangeError> {
        let query = format!("category={CATEGORY}&symbol={symbol}");
        let result: ListResult<WireInstrument> = self
            .get("/v5/market/instruments-info", &query, false)
            .await?;
        let wire = result
            .list
            .into_iter()
            .next()
            .ok_or_else(|| ExchangeError::Invalid(format!("unknown instrument {symbol}")))?;
        Ok(InstrumentInfo {
            symbol: wire.symbol,
            min_qty: dec_or_zero(&wire.lot_size_filter.min_order_qty),
            qty_step: dec_or_zero(&wire.lot_size_filter.qty_step),
            max_qty: dec_or_zero(&wire.lot_size_filter.max_order_qty),
            tick_size: dec_or_zero(&wire.price_filter.tick_size),
        })
    }

    pub async fn last_price(&self, symbol: &str) -> Result<Decimal, ExchangeError> {
        let query = format!("category={CATEGORY}&symbol={symbol}");
        let result: ListResult<WireTicker> = self.get("/v5/market/tickers", &query, false).await?;
        result
            .list
            .first()
            .map(|t| dec_or_zero(&t.last_price))
            .filter(|p| *p > Decimal::ZERO)
            .ok_or_else(|| ExchangeError::Invalid(format!("no ticker for {symbol}")))
    }

    pub async fn set_position_mode_hedge(&self, symbol: &str) -> Result<(), ExchangeError> {
        let body = json!({
            "category": CATEGORY,
            "symbol": symbol,
            "mode": POSITION_MODE_HEDGE,
        });
        match self.post::<serde_json::Value>("/v5/position/switch-mode", &body).await {
            Ok(_) => Ok(()),
            Err(ExchangeError::Rejected { code, .. })
                if code == CODE_POSITION_MODE_NOT_MODIFIED =>
            {
                debug!("[{symbol}] position mode already hedge");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), ExchangeError> {
        let body = json!({
            "category": CATEGORY,
            "symbol": symbol,
            "buyLeverage": leverage.to_string(),
            "sellLeverage": leverage.to_string(),
        });
        match self.post::<serde_json::Value>("/v5/position/set-leverage", &body).await {
            Ok(_) => Ok(()),
            Err(ExchangeError::Rejected { code, .. }) if code == CODE_LEVERAGE_NOT_MODIFIED => {
                debug!("[{symbol}] leverage already {leverage}x");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn wallet_snapshot(&self) -> Result<WalletSnapshot, ExchangeError> {
        let result: ListResult<WireWallet> = self
            .get("/v5/account/wallet-balance", "accountType=UNIFIED", true)
            .await?;
        let wallet = result
            .list
            .into_iter()
            .next()
            .ok_or_else(|| ExchangeError::Invalid("empty wallet response".to_string()))?;
        Ok(WalletSnapshot {
            available_balance: dec_or_zero(&wallet.total_available_balance),
            initial_margin: dec_or_zero(&wallet.total_initial_margin),
            maintenance_margin: dec_or_zero(&wallet.total_maintenance_margin),
            // Wire sends a plain decimal; percent everywhere internally.
            mm_rate_pct: dec_or_zero(&wallet.account_mm_rate) * Decimal::from(100),
        })
    }

    pub async fn active_positions(&self, symbol: &str) -> Result<PositionPair, ExchangeError> {
        let query = format!("category={CATEGORY}&symbol={symbol}");
        let result: ListResult<WirePosition> = self.get("/v5/position/list", &query, true).await?;
        let mut pair = PositionPair::default();
        for wire in result.list {
            let size = dec_or_zero(&wire.size);
            if size == Decimal::ZERO {
                continue;
            }
            let Some(side) = PositionSide::from_position_idx(wire.position_idx) else {
                continue;
            };
            let position = ExchangePosition {
                side,
                size,
                avg_price: dec_or_zero(&wire.avg_price),
            };
            match side {
                PositionSide::Long => pair.long = Some(position),
                PositionSide::Short => pair.short = Some(position),
            }
        }
        Ok(pair)
    }

    pub async fn place_order(&self, request: &OrderRequest) -> Result<String, ExchangeError> {
        let mut body = json!({
            "category": CATEGORY,
            "symbol": request.symbol,
            "side": request.side.to_string(),
            "orderType": match request.order_type {
                OrderType::Market => "Market",
                OrderType::Limit => "Limit",
            },
            "qty": request.qty.to_string(),
            "positionIdx": request.position_idx,
            "reduceOnly": request.reduce_only,
        });
        if let Some(price) = request.price {
            body["price"] = json!(price.to_string());
        }
        if let Some(tif) = request.time_in_force {
            body["timeInForce"] = json!(match tif {
                TimeInForce::Gtc => "GTC",
                TimeInForce::Ioc => "IOC",
                TimeInForce::PostOnly => "PostOnly",
            });
        }
        let result: WireOrderId = self.post("/v5/order/create", &body).await?;
        Ok(result.order_id)
    }

    pub async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), ExchangeError> {
        let body = json!({
            "category": CATEGORY,
            "symbol": symbol,
            "orderId": order_id,
        });
        self.post::<serde_json::Value>("/v5/order/cancel", &body)
            .await
            .map(|_| ())
    }

    pub async fn order_status(
        &self,
        symbol: &str,
        order_id: &str,
    ) -> Result<Option<OrderSnapshot>, ExchangeError> {
        let query = format!("category={CATEGORY}&symbol={symbol}&orderId={order_id}");
        let result: ListResult<WireOrder> = match self.get("/v5/order/realtime", &query, true).await
        {
            Ok(result) => result,
            Err(ExchangeError::Rejected { code, message }) => {
                warn!("order_status {order_id} rejected ({code}): {message}");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        Ok(result.list.into_iter().next().map(|wire| OrderSnapshot {
            order_id: wire.order_id,
            status: parse_order_status(&wire.order_status),
            qty: dec_or_zero(&wire.qty),
            cum_exec_qty: dec_or_zero(&wire.cum_exec_qty),
            avg_price: dec_or_zero(&wire.avg_price),
        }))
    }

    pub async fn open_orders(&self, symbol: &str) -> Result<Vec<OpenOrder>, ExchangeError> {
        let query = format!("category={CATEGORY}&symbol={symbol}&openOnly=0&limit=50");
        let result: ListResult<WireOrder> = self.get("/v5/order/realtime", &query, true).await?;
        Ok(result
            .list
            .into_iter()
            .map(|wire| OpenOrder {
                order_id: wire.order_id,
                side: parse_order_side(&wire.side),
                position_idx: wire.position_idx,
                qty: dec_or_zero(&wire.qty),
                price: dec_or_zero(&wire.price),
                reduce_only: wire.reduce_only,
            })
            .collect())
    }

    /// Filled order history, following `nextPageCursor` up to the page cap.
    pub async fn order_history(
        &self,
        symbol: &str,
        limit: u32,
    ) -> Result<Vec<HistoricOrder>, ExchangeError> {
        let mut orders = Vec::new();
        let mut cursor: Option<String> = None;

        for _page in 0..crate::config::ORDER_HISTORY_MAX_PAGES {
            let mut query = format!(
                "category={CATEGORY}&symbol={symbol}&orderStatus=Filled&limit={limit}"
            );
            if let Some(c) = &cursor {
                query.push_str(&format!("&cursor={c}"));
            }
            let result: ListResult<WireOrder> =
                self.get("/v5/order/history", &query, true).await?;
            for wire in result.list {
                orders.push(HistoricOrder {
                    order_id: wire.order_id,
                    side: parse_order_side(&wire.side),
                    position_idx: wire.position_idx,
                    qty: dec_or_zero(&wire.qty),
                    avg_price: dec_or_zero(&wire.avg_price),
                    reduce_only: wire.reduce_only,
                    status: parse_order_status(&wire.order_status),
                    created_time: from_exchange_ms(
                        wire.created_time.parse::<i64>().unwrap_or(0),
                    ),
                    updated_time: from_exchange_ms(
                        wire.updated_time.parse::<i64>().unwrap_or(0),
                    ),
                });
            }
            if orders.len() >= limit as usize {
                break;
            }
            cursor = result.next_page_cursor.filter(|c| !c.is_empty());
            if cursor.is_none() {
                break;
            }
        }
        Ok(orders)
    }
}
