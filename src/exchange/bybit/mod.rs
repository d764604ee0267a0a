//! Bybit v5 adapter: REST client + WebSocket streams behind the gateway
//! trait.

pub mod client;
pub mod ws;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::mpsc;

use crate::exchange::gateway::{ExchangeError, ExchangeGateway};
use crate::exchange::types::{
    HistoricOrder, InstrumentInfo, OpenOrder, OrderRequest, OrderSnapshot, PositionPair,
    StreamEvent, WalletSnapshot,
};
use client::BybitClient;
use ws::BybitWs;

/// The live Bybit venue.
pub struct BybitGateway {
    rest: BybitClient,
    streams: BybitWs,
}

impl BybitGateway {
    pub fn new(api_key: String, api_secret: String, demo: bool) -> Self {
        Self {
            rest: BybitClient::new(api_key.clone(), api_secret.clone(), demo),
            streams: BybitWs::new(api_key, api_secret, demo),
        }
    }
}

#[async_trait]
impl ExchangeGateway for BybitGateway {
    async fn instrument_info(&self, symbol: &str) -> Result<InstrumentInfo, ExchangeError> {
        self.rest.instrument_info(symbol).await
    }

    async fn set_position_mode_hedge(&self, symbol: &str) -> Result<(), ExchangeError> {
        self.rest.set_position_mode_hedge(symbol).await
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), ExchangeError> {
        self.rest.set_leverage(symbol, leverage).await
    }

    async fn wallet_snapshot(&self) -> Result<WalletSnapshot, ExchangeError> {
        self.rest.wallet_snapshot().await
    }

    async fn active_positions(&self, symbol: &str) -> Result<PositionPair, ExchangeError> {
        self.rest.active_positions(symbol).await
    }

    async fn last_price(&self, symbol: &str) -> Result<Decimal, ExchangeError> {
        self.rest.last_price(symbol).await
    }

    async fn order_history(
        &self,
        symbol: &str,
        limit: u32,
    ) -> Result<Vec<HistoricOrder>, ExchangeError> {
        self.rest.order_history(symbol, limit).await
    }

    async fn open_orders(&self, symbol: &str) -> Result<Vec<OpenOrder>, ExchangeError> {
        self.rest.open_orders(symbol).await
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<String, ExchangeError> {
        self.rest.place_order(request).await
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), ExchangeError> {
        self.rest.cancel_order(symbol, order_id).await
    }

    async fn order_status(
        &self,
        symbol: &str,
        order_id: &str,
    ) -> Result<Option<OrderSnapshot>, ExchangeError> {
        self.rest.order_status(symbol, order_id).await
    }

    async fn start_streams(
        &self,
        symbols: Vec<String>,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ExchangeError> {
        self.streams.spawn_public(symbols, tx.clone());
        self.streams.spawn_private(tx);
        Ok(())
    }
}
