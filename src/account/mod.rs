//! Account supervision: one supervisor per exchange account.
//!
//! The supervisor owns the gateway, the balance cache, the risk
//! controller and one engine per symbol. All stream events for the
//! account funnel through a single inbox and are processed strictly in
//! arrival order; across accounts, supervisors run in parallel and share
//! nothing mutable.

pub mod balance;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::account::balance::BalanceCache;
use crate::config::{
    AccountConfig, MM_RATE_WARNING_PCT, RESTORATION_TIMEOUT, SYNC_INTERVAL, WARN_THROTTLE,
};
use crate::exchange::gateway::ExchangeGateway;
use crate::exchange::types::{
    PositionEvent, PositionSide, StreamEvent, StreamKind, TickerEvent,
};
use crate::persistence::analytics::{AnalyticsWriter, PerformanceRecord, TradeAction};
use crate::persistence::StateStore;
use crate::risk::controller::{ImBand, RiskController, RiskDirective};
use crate::risk::emergency::EmergencyFlagStore;
use crate::strategy::book::PositionBook;
use crate::strategy::engine::{EngineContext, EngineSignal, ReconcileOutcome, SymbolEngine};
use crate::utils::time::now_helsinki_iso;

const EVENT_QUEUE_DEPTH: usize = 1024;
const MAX_RESTORATION_ATTEMPTS: u32 = 3;
const MAX_PRIVATE_DISCONNECTS: u32 = 3;

/// Per-account supervisor: routes events, reconciles state, enforces the
/// account-wide risk posture.
pub struct AccountSupervisor {
    cfg: AccountConfig,
    gateway: Arc<dyn ExchangeGateway>,
    engines: BTreeMap<String, SymbolEngine>,
    risk: RiskController,
    balances: BalanceCache,
    store: StateStore,
    analytics: AnalyticsWriter,
    flags: EmergencyFlagStore,
    emergency_stopped: bool,
    first_sync_done: bool,
    private_disconnects: u32,
    last_ws_update: Option<Instant>,
    last_mm_warn: Option<Instant>,
}

impl AccountSupervisor {
    /// Build the supervisor: check the emergency flag, seed the balance,
    /// load persisted books and prepare every symbol on the exchange
    /// (hedge mode + leverage, both idempotent).
    pub async fn init(
        cfg: AccountConfig,
        gateway: Arc<dyn ExchangeGateway>,
        data_dir: &str,
    ) -> Result<Self> {
        let flags = EmergencyFlagStore::new(data_dir);
        flags.ensure_clear(cfg.id, &cfg.name)?;

        let store = StateStore::open(data_dir, cfg.id)
            .with_context(|| format!("opening state store for account {}", cfg.id))?;
        let analytics = AnalyticsWriter::open(data_dir, cfg.id)?;

        let mut balances = BalanceCache::new();
        let wallet = gateway
            .wallet_snapshot()
            .await
            .context("seeding balance cache")?;
        balances.seed(wallet);
        info!(
            "💎 [{}] account {} seeded: balance ${:.2}, MM rate {:.4}%",
            cfg.name, cfg.padded_id(), wallet.available_balance, wallet.mm_rate_pct
        );

        let mut engines = BTreeMap::new();
        for strategy in &cfg.strategies {
            let symbol = strategy.symbol.clone();
            gateway.set_position_mode_hedge(&symbol).await?;
            gateway.set_leverage(&symbol, strategy.leverage).await?;
            let instrument = gateway.instrument_info(&symbol).await?;
            let book = store
                .load_book(&symbol)
                .unwrap_or_else(|| PositionBook::new(&symbol));
            engines.insert(
                symbol,
                SymbolEngine::new(strategy.clone(), instrument, book),
            );
        }

        Ok(Self {
            risk: RiskController::new(cfg.risk_management.balance_buffer_percent),
            cfg,
            gateway,
            engines,
            balances,
            store,
            analytics,
            flags,
            emergency_stopped: false,
            first_sync_done: false,
            private_disconnects: 0,
            last_ws_update: None,
            last_mm_warn: None,
        })
    }

    pub fn emergency_stopped(&self) -> bool {
        self.emergency_stopped
    }

    /// Run the account until shutdown or emergency stop.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<bool> {
        let (tx, mut rx) = mpsc::channel::<StreamEvent>(EVENT_QUEUE_DEPTH);
        let symbols: Vec<String> = self.engines.keys().cloned().collect();
        self.gateway
            .start_streams(symbols, tx)
            .await
            .context("starting exchange streams")?;

        // No trading until local state matches exchange truth.
        let buffered = match self.restore_with_retries(&mut rx).await? {
            Some(events) => events,
            None => return Ok(self.emergency_stopped),
        };
        for event in buffered {
            self.dispatch(event).await?;
            if self.emergency_stopped {
                return Ok(true);
            }
        }

        info!("🚀 [{}] entering main event loop", self.cfg.name);
        let mut sync_timer = tokio::time::interval(SYNC_INTERVAL);
        sync_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        sync_timer.reset();

        loop {
            tokio::select! {
                event = rx.recv() => {
                    match event {
                        Some(event) => {
                            self.dispatch(event).await?;
                            if self.emergency_stopped {
                                return Ok(true);
                            }
                        }
                        None => {
                            warn!("[{}] event channel closed; shutting down", self.cfg.name);
                            break;
                        }
                    }
                }
                _ = sync_timer.tick() => {
                    self.periodic_sync().await?;
                    if self.emergency_stopped {
                        return Ok(true);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("🛑 [{}] shutdown signal received", self.cfg.name);
                        break;
                    }
                }
            }
        }

        // Grace pass: apply whatever already reached the inbox before
        // persisting, so the saved image reflects every confirmed fill.
        while let Ok(event) = rx.try_recv() {
            self.dispatch(event).await?;
            if self.emergency_stopped {
                return Ok(true);
            }
        }

        self.shutdown().await?;
        Ok(self.emergency_stopped)
    }

    /// Startup restoration with the needs-resync retry loop. Returns the
    /// buffered events to replay, or `None` when the account halted.
    async fn restore_with_retries(
        &mut self,
        rx: &mut mpsc::Receiver<StreamEvent>,
    ) -> Result<Option<Vec<StreamEvent>>> {
        let mut buffered: Vec<StreamEvent> = Vec::new();
        let mut resync_log: Vec<String> = Vec::new();

        for attempt in 1..=MAX_RESTORATION_ATTEMPTS {
            info!(
                "🔄 [{}] restoration attempt {attempt}/{MAX_RESTORATION_ATTEMPTS}",
                self.cfg.name
            );
            let mut needs_resync = false;

            let symbols: Vec<String> = self.engines.keys().cloned().collect();
            for symbol in symbols {
                let outcome = tokio::time::timeout(
                    RESTORATION_TIMEOUT,
                    Self::reconcile_symbol(
                        &mut self.engines,
                        &symbol,
                        self.gateway.as_ref(),
                        &mut self.risk,
                        &self.balances,
                        &mut self.store,
                        &mut self.analytics,
                    ),
                )
                .await
                .map_err(|_| anyhow::anyhow!("restoration timed out for {symbol}"))??;

                match outcome {
                    ReconcileOutcome::Synced => {}
                    ReconcileOutcome::NeedsResync { detail } => {
                        needs_resync = true;
                        resync_log.push(format!("attempt {attempt} {symbol}: {detail}"));
                    }
                    ReconcileOutcome::EmergencyStop { reason } => {
                        self.emergency_stop(Some(&symbol), &reason, None).await;
                        return Ok(None);
                    }
                }
            }

            // Concurrent stream traffic may have invalidated the snapshot:
            // buffered position deltas force another pass.
            while let Ok(event) = rx.try_recv() {
                if let StreamEvent::Position(position) = &event {
                    if self.position_delta_unexplained(position) {
                        needs_resync = true;
                        resync_log.push(format!(
                            "attempt {attempt} {}: position stream moved to {} mid-restore",
                            position.symbol, position.size
                        ));
                    }
                }
                buffered.push(event);
            }

            if !needs_resync {
                info!("✅ [{}] restoration complete", self.cfg.name);
                return Ok(Some(buffered));
            }
        }

        let reason = format!(
            "restoration failed after {MAX_RESTORATION_ATTEMPTS} attempts; triggers: [{}]",
            resync_log.join("; ")
        );
        let detail = self.state_diagnostic().await;
        self.emergency_stop(None, &reason, Some(detail)).await;
        Ok(None)
    }

    #[allow(clippy::too_many_arguments)]
    async fn reconcile_symbol(
        engines: &mut BTreeMap<String, SymbolEngine>,
        symbol: &str,
        gateway: &dyn ExchangeGateway,
        risk: &mut RiskController,
        balances: &BalanceCache,
        store: &mut StateStore,
        analytics: &mut AnalyticsWriter,
    ) -> Result<ReconcileOutcome> {
        let engine = engines
            .get_mut(symbol)
            .ok_or_else(|| anyhow::anyhow!("no engine for {symbol}"))?;
        let mut ctx = EngineContext {
            gateway,
            risk,
            balances,
            store,
            analytics,
        };
        engine.reconcile(&mut ctx).await
    }

    fn position_delta_unexplained(&self, event: &PositionEvent) -> bool {
        let Some(engine) = self.engines.get(&event.symbol) else {
            return false;
        };
        let Some(side) = PositionSide::from_position_idx(event.position_idx) else {
            return false;
        };
        (event.size - engine.book().total_qty(side)).abs() > crate::config::QTY_MATCH_TOLERANCE
    }

    /// Diagnostic snapshot attached to the restoration-failure flag.
    async fn state_diagnostic(&self) -> serde_json::Value {
        let mut per_symbol = serde_json::Map::new();
        for (symbol, engine) in &self.engines {
            let exchange = self
                .gateway
                .active_positions(symbol)
                .await
                .map(|p| {
                    json!({
                        "long": p.size(PositionSide::Long).to_string(),
                        "short": p.size(PositionSide::Short).to_string(),
                    })
                })
                .unwrap_or_else(|e| json!({ "error": e.to_string() }));
            per_symbol.insert(
                symbol.clone(),
                json!({
                    "exchange": exchange,
                    "local_long": engine.book().total_qty(PositionSide::Long).to_string(),
                    "local_short": engine.book().total_qty(PositionSide::Short).to_string(),
                }),
            );
        }
        serde_json::Value::Object(per_symbol)
    }

    /// Stream-event routing. Within the account everything is serialized here.
    async fn dispatch(&mut self, event: StreamEvent) -> Result<()> {
        if self.emergency_stopped {
            return Ok(());
        }
        self.last_ws_update = Some(Instant::now());

        match event {
            StreamEvent::Execution(exec) => {
                let symbol = exec.symbol.clone();
                let Some(engine) = self.engines.get_mut(&symbol) else {
                    return Ok(());
                };
                let mut ctx = EngineContext {
                    gateway: self.gateway.as_ref(),
                    risk: &mut self.risk,
                    balances: &self.balances,
                    store: &mut self.store,
                    analytics: &mut self.analytics,
                };
                match engine.on_execution(&mut ctx, &exec).await? {
                    EngineSignal::EmergencyStop { reason } => {
                        let data = json!({
                            "exec_id": exec.exec_id,
                            "exec_pnl": exec.exec_pnl.to_string(),
                        });
                        self.emergency_stop(Some(&symbol), &reason, Some(data)).await;
                    }
                    EngineSignal::None => {}
                }
            }
            StreamEvent::Position(position) => {
                self.on_position_event(&position).await;
            }
            StreamEvent::Order(order) => {
                let symbol = order.symbol.clone();
                let Some(engine) = self.engines.get_mut(&symbol) else {
                    return Ok(());
                };
                let mut ctx = EngineContext {
                    gateway: self.gateway.as_ref(),
                    risk: &mut self.risk,
                    balances: &self.balances,
                    store: &mut self.store,
                    analytics: &mut self.analytics,
                };
                engine.on_order_event(&mut ctx, &order).await?;
            }
            StreamEvent::Wallet(wallet) => {
                self.balances.apply(wallet.snapshot);
                self.check_mm_rate().await?;
            }
            StreamEvent::Ticker(ticker) => {
                self.on_ticker(ticker).await?;
            }
            StreamEvent::Connected(kind) => {
                debug!("[{}] {kind:?} stream connected", self.cfg.name);
                if kind == StreamKind::Private {
                    self.private_disconnects = 0;
                }
            }
            StreamEvent::Disconnected(kind) => {
                warn!("[{}] {kind:?} stream disconnected", self.cfg.name);
                if kind == StreamKind::Private {
                    self.private_disconnects += 1;
                    if self.private_disconnects >= MAX_PRIVATE_DISCONNECTS {
                        self.emergency_stop(
                            None,
                            "private WebSocket lost repeatedly; cannot trade safely without the execution stream",
                            None,
                        )
                        .await;
                    }
                }
            }
        }
        Ok(())
    }

    async fn on_ticker(&mut self, ticker: TickerEvent) -> Result<()> {
        self.risk.record_price(&ticker.symbol, ticker.last_price);

        let directives = self.risk.evaluate(self.balances.available_balance());
        self.execute_directives(directives).await?;

        let Some(engine) = self.engines.get_mut(&ticker.symbol) else {
            return Ok(());
        };
        let mut ctx = EngineContext {
            gateway: self.gateway.as_ref(),
            risk: &mut self.risk,
            balances: &self.balances,
            store: &mut self.store,
            analytics: &mut self.analytics,
        };
        engine.on_price_tick(&mut ctx, ticker.last_price).await?;
        Ok(())
    }

    /// Position events mirror exchange truth. A position appearing where
    /// the local book is empty and no pending entry explains it means
    /// someone else traded this account.
    async fn on_position_event(&mut self, event: &PositionEvent) {
        let Some(engine) = self.engines.get(&event.symbol) else {
            return;
        };
        let Some(side) = PositionSide::from_position_idx(event.position_idx) else {
            return;
        };
        let local = engine.book().total_qty(side);
        if event.size > Decimal::ZERO
            && local == Decimal::ZERO
            && engine.book().pending_orders(side).is_empty()
        {
            let reason = format!(
                "{side} position of {} appeared on {} without a local origin",
                event.size, event.symbol
            );
            self.emergency_stop(Some(&event.symbol.clone()), &reason, None).await;
        } else if event.size == Decimal::ZERO && local > Decimal::ZERO {
            // Close confirmation; the execution handler or the sync pass
            // owns the actual clear.
            debug!(
                "[{}] {side} position reported flat (local {local}); awaiting execution/sync",
                event.symbol
            );
        }
    }

    async fn execute_directives(&mut self, directives: Vec<RiskDirective>) -> Result<()> {
        for directive in directives {
            match directive {
                RiskDirective::EnterPanic {
                    reason,
                    rebalance,
                    cancel_tp,
                } => {
                    warn!("🚨 [{}] panic: {reason}", self.cfg.name);
                    if rebalance.critical {
                        error!(
                            "💥 [{}] rebalance impossible: balance below $1",
                            self.cfg.name
                        );
                    } else {
                        for leg in rebalance.legs {
                            let Some(engine) = self.engines.get_mut(&leg.symbol) else {
                                continue;
                            };
                            let mut ctx = EngineContext {
                                gateway: self.gateway.as_ref(),
                                risk: &mut self.risk,
                                balances: &self.balances,
                                store: &mut self.store,
                                analytics: &mut self.analytics,
                            };
                            if let Err(e) =
                                engine.apply_rebalance_leg(&mut ctx, leg.side, leg.qty).await
                            {
                                // Continue on per-symbol errors; never raise.
                                warn!(
                                    "⚠️  [{}] rebalance leg failed for {}: {e}",
                                    self.cfg.name, leg.symbol
                                );
                            }
                        }
                    }
                    for (symbol, side) in cancel_tp {
                        let Some(engine) = self.engines.get_mut(&symbol) else {
                            continue;
                        };
                        let mut ctx = EngineContext {
                            gateway: self.gateway.as_ref(),
                            risk: &mut self.risk,
                            balances: &self.balances,
                            store: &mut self.store,
                            analytics: &mut self.analytics,
                        };
                        if let Err(e) = engine.cancel_side_tp(&mut ctx, side).await {
                            warn!("⚠️  [{}] trend TP cancel failed: {e}", self.cfg.name);
                        }
                    }
                }
                RiskDirective::ExitPanic => {
                    let symbols: Vec<String> = self.engines.keys().cloned().collect();
                    for symbol in symbols {
                        let Some(engine) = self.engines.get_mut(&symbol) else {
                            continue;
                        };
                        let mut ctx = EngineContext {
                            gateway: self.gateway.as_ref(),
                            risk: &mut self.risk,
                            balances: &self.balances,
                            store: &mut self.store,
                            analytics: &mut self.analytics,
                        };
                        if let Err(e) = engine.ensure_tp(&mut ctx).await {
                            warn!("⚠️  [{}] TP restore failed for {symbol}: {e}", self.cfg.name);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// MM-rate supervision on every wallet update: warn at the caution
    /// band, close everything at the configured threshold.
    async fn check_mm_rate(&mut self) -> Result<()> {
        let mm_rate = self.balances.mm_rate_pct();
        let threshold = self.cfg.risk_management.mm_rate_threshold;

        if mm_rate >= threshold && threshold > Decimal::ZERO {
            error!(
                "💥 [{}] CRITICAL: account MM rate {mm_rate:.2}% >= {threshold:.2}%! EMERGENCY CLOSE ALL POSITIONS!",
                self.cfg.name
            );
            let symbols: Vec<String> = self.engines.keys().cloned().collect();
            for symbol in symbols {
                let Some(engine) = self.engines.get_mut(&symbol) else {
                    continue;
                };
                let mut ctx = EngineContext {
                    gateway: self.gateway.as_ref(),
                    risk: &mut self.risk,
                    balances: &self.balances,
                    store: &mut self.store,
                    analytics: &mut self.analytics,
                };
                if let Err(e) = engine.close_all_positions(&mut ctx).await {
                    error!("💥 [{}] emergency close failed for {symbol}: {e}", self.cfg.name);
                }
            }
            let data = json!({ "mm_rate": mm_rate.to_string() });
            self.emergency_stop(
                None,
                "Account MM Rate reached critical level",
                Some(data),
            )
            .await;
        } else if mm_rate >= MM_RATE_WARNING_PCT {
            let due = match self.last_mm_warn {
                Some(t) => t.elapsed() >= WARN_THROTTLE,
                None => true,
            };
            if due {
                warn!(
                    "⚠️  [{}] account maintenance margin rate {mm_rate:.2}% (caution!)",
                    self.cfg.name
                );
                self.last_mm_warn = Some(Instant::now());
            }
        }
        Ok(())
    }

    /// Drift-repair cycle across every symbol plus the per-cycle balance log
    /// and performance snapshots.
    async fn periodic_sync(&mut self) -> Result<()> {
        if self.emergency_stopped {
            return Ok(());
        }
        let first_run = !self.first_sync_done;
        self.first_sync_done = true;

        if let Some(last) = self.last_ws_update {
            if last.elapsed() > SYNC_INTERVAL {
                warn!(
                    "⚠️  [{}] no stream events for {:?}; connection may be stale",
                    self.cfg.name,
                    last.elapsed()
                );
            }
        }

        let symbols: Vec<String> = self.engines.keys().cloned().collect();
        for symbol in &symbols {
            let Some(engine) = self.engines.get_mut(symbol) else {
                continue;
            };
            let mut ctx = EngineContext {
                gateway: self.gateway.as_ref(),
                risk: &mut self.risk,
                balances: &self.balances,
                store: &mut self.store,
                analytics: &mut self.analytics,
            };
            match engine.periodic_sync(&mut ctx, first_run).await {
                Ok(EngineSignal::EmergencyStop { reason }) => {
                    let symbol = symbol.clone();
                    self.emergency_stop(Some(&symbol), &reason, None).await;
                    return Ok(());
                }
                Ok(EngineSignal::None) => {}
                Err(e) => warn!("⚠️  [{}] sync failed for {symbol}: {e}", self.cfg.name),
            }
        }

        let wallet = self.balances.snapshot();
        self.log_im_status();
        let balance_row = AnalyticsWriter::trade_row(
            "",
            "",
            TradeAction::Balance,
            Decimal::ZERO,
            wallet.available_balance,
            "sync cycle",
        );
        if let Err(e) = self.analytics.record_trade(&balance_row) {
            warn!("[{}] balance row failed: {e}", self.cfg.name);
        }

        for symbol in &symbols {
            let Some(engine) = self.engines.get(symbol) else {
                continue;
            };
            let book = engine.book();
            let price = engine.last_price().unwrap_or(Decimal::ZERO);
            let long_pnl = book.unrealized_pnl(PositionSide::Long, price);
            let short_pnl = book.unrealized_pnl(PositionSide::Short, price);
            let record = PerformanceRecord {
                timestamp: now_helsinki_iso(),
                symbol: symbol.clone(),
                price,
                long_positions: book.count(PositionSide::Long),
                short_positions: book.count(PositionSide::Short),
                long_qty: book.total_qty(PositionSide::Long),
                short_qty: book.total_qty(PositionSide::Short),
                long_pnl,
                short_pnl,
                total_pnl: long_pnl + short_pnl + book.total_realized_pnl(),
                total_trades: 0,
                balance: wallet.available_balance,
            };
            if let Err(e) = self.analytics.record_performance(record) {
                warn!("[{}] performance row failed: {e}", self.cfg.name);
            }
        }
        Ok(())
    }

    /// Per-cycle initial-margin status: tradable headroom is the free
    /// balance minus the safety reserve, and the log level escalates as
    /// the headroom shrinks. A breached reserve screams.
    fn log_im_status(&self) {
        let status = self.risk.im_status(self.balances.snapshot());
        let msg = format!(
            "IM status: balance=${:.2}, used_IM=${:.2}, reserve=${:.2}, available=${:.2} ({:.1}%), MM_Rate={:.2}%",
            status.total_balance,
            status.total_initial_margin,
            status.safety_reserve,
            status.available_for_trading,
            status.available_percent,
            status.account_mm_rate_pct
        );
        match status.band() {
            ImBand::ReserveBreached => {
                error!("🚨 [{}] {msg} - SAFETY RESERVE BREACHED!", self.cfg.name);
            }
            ImBand::CriticallyLow => {
                error!("❌ [{}] {msg} - CRITICALLY LOW AVAILABLE MARGIN", self.cfg.name);
            }
            ImBand::LowMargin => {
                warn!("⚠️  [{}] {msg} - LOW AVAILABLE MARGIN", self.cfg.name);
            }
            ImBand::Normal => {
                info!("💎 [{}] {msg}", self.cfg.name);
            }
        }
    }

    /// Terminal within the process: write the flag, refuse all further
    /// order operations.
    async fn emergency_stop(
        &mut self,
        symbol: Option<&str>,
        reason: &str,
        additional_data: Option<serde_json::Value>,
    ) {
        if self.emergency_stopped {
            return;
        }
        self.emergency_stopped = true;
        error!("🚨 [{}] EMERGENCY STOP: {reason}", self.cfg.name);
        if let Err(e) = self
            .flags
            .create(self.cfg.id, symbol, reason, additional_data)
        {
            error!("[{}] failed to write emergency flag: {e}", self.cfg.name);
        }
    }

    /// Graceful shutdown: persist every book, leave exchange orders alone
    /// (positions persist and are reconciled on the next start).
    async fn shutdown(&mut self) -> Result<()> {
        for engine in self.engines.values() {
            if let Err(e) = self.store.persist_book(engine.book()) {
                warn!("[{}] persist on shutdown failed: {e}", self.cfg.name);
            }
        }
        info!("👋 [{}] account stopped; state persisted", self.cfg.name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RiskConfig, StrategyConfig};
    use crate::exchange::sim::SimExchange;
    use crate::exchange::types::{InstrumentInfo, WalletSnapshot};
    use crate::risk::controller::SymbolExposure;
    use rust_decimal_macros::dec;

    fn account_cfg(dry_run: bool) -> AccountConfig {
        AccountConfig {
            id: 9,
            name: "test".to_string(),
            api_key_env: "K".to_string(),
            api_secret_env: "S".to_string(),
            demo_trading: true,
            dry_run,
            strategies: vec![StrategyConfig {
                symbol: "SOLUSDT".to_string(),
                leverage: 100,
                initial_position_size_usd: dec!(1),
                grid_step_percent: dec!(1),
                averaging_multiplier: dec!(2),
                take_profit_percent: dec!(1),
                max_grid_levels_per_side: 10,
            }],
            risk_management: RiskConfig {
                mm_rate_threshold: dec!(80),
                balance_buffer_percent: dec!(15),
            },
        }
    }

    async fn sim_with_market() -> SimExchange {
        let sim = SimExchange::new(dec!(1000));
        sim.add_instrument(
            InstrumentInfo {
                symbol: "SOLUSDT".to_string(),
                min_qty: dec!(0.1),
                qty_step: dec!(0.1),
                max_qty: dec!(100000),
                tick_size: dec!(0.01),
            },
            dec!(100),
        )
        .await;
        sim
    }

    #[tokio::test]
    async fn test_init_loads_and_prepares_symbols() {
        let dir = tempfile::tempdir().unwrap();
        let sim = sim_with_market().await;
        let supervisor = AccountSupervisor::init(
            account_cfg(true),
            Arc::new(sim),
            dir.path().to_str().unwrap(),
        )
        .await
        .unwrap();
        assert_eq!(supervisor.engines.len(), 1);
        assert!(!supervisor.emergency_stopped());
        assert_eq!(supervisor.balances.available_balance(), dec!(1000));
    }

    #[tokio::test]
    async fn test_init_refuses_flagged_account() {
        let dir = tempfile::tempdir().unwrap();
        let flags = EmergencyFlagStore::new(dir.path());
        flags.create(9, None, "previous crash", None).unwrap();

        let sim = sim_with_market().await;
        let result = AccountSupervisor::init(
            account_cfg(true),
            Arc::new(sim),
            dir.path().to_str().unwrap(),
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_mm_rate_threshold_closes_and_stops() {
        let dir = tempfile::tempdir().unwrap();
        let sim = sim_with_market().await;
        let mut supervisor = AccountSupervisor::init(
            account_cfg(true),
            Arc::new(sim),
            dir.path().to_str().unwrap(),
        )
        .await
        .unwrap();

        // Exactly at threshold triggers; one tick below does not.
        supervisor.balances.apply(WalletSnapshot {
            available_balance: dec!(100),
            initial_margin: dec!(50),
            maintenance_margin: dec!(40),
            mm_rate_pct: dec!(79.99),
        });
        supervisor.check_mm_rate().await.unwrap();
        assert!(!supervisor.emergency_stopped());

        supervisor.balances.apply(WalletSnapshot {
            available_balance: dec!(100),
            initial_margin: dec!(50),
            maintenance_margin: dec!(40),
            mm_rate_pct: dec!(80),
        });
        supervisor.check_mm_rate().await.unwrap();
        assert!(supervisor.emergency_stopped());
        assert!(supervisor.flags.exists(9));
    }

    #[tokio::test]
    async fn test_unexplained_position_triggers_emergency() {
        let dir = tempfile::tempdir().unwrap();
        let sim = sim_with_market().await;
        let mut supervisor = AccountSupervisor::init(
            account_cfg(true),
            Arc::new(sim),
            dir.path().to_str().unwrap(),
        )
        .await
        .unwrap();

        supervisor
            .dispatch(StreamEvent::Position(PositionEvent {
                symbol: "SOLUSDT".to_string(),
                position_idx: 1,
                size: dec!(5),
                avg_price: dec!(100),
            }))
            .await
            .unwrap();
        assert!(supervisor.emergency_stopped());
    }

    #[tokio::test]
    async fn test_emergency_stop_blocks_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let sim = sim_with_market().await;
        let mut supervisor = AccountSupervisor::init(
            account_cfg(true),
            Arc::new(sim.clone()),
            dir.path().to_str().unwrap(),
        )
        .await
        .unwrap();
        supervisor.emergency_stop(None, "test stop", None).await;

        // Ticks must no longer reach the engines: no new orders of any kind.
        supervisor
            .dispatch(StreamEvent::Ticker(TickerEvent {
                symbol: "SOLUSDT".to_string(),
                last_price: dec!(99),
            }))
            .await
            .unwrap();
        assert_eq!(sim.open_order_count().await, 0);
    }

    #[tokio::test]
    async fn test_im_monitoring_flags_reserve_breach() {
        let dir = tempfile::tempdir().unwrap();
        let sim = sim_with_market().await;
        let mut supervisor = AccountSupervisor::init(
            account_cfg(true),
            Arc::new(sim),
            dir.path().to_str().unwrap(),
        )
        .await
        .unwrap();

        // Lopsided exposure (imbalance 4 @ 100 / 100x -> reserve 4.8 with
        // the default ATR factor) against a starved wallet.
        supervisor.risk.update_exposure(SymbolExposure {
            symbol: "SOLUSDT".to_string(),
            long_qty: dec!(5),
            short_qty: dec!(1),
            long_count: 2,
            short_count: 1,
            price: dec!(100),
            leverage: 100,
        });
        supervisor.balances.apply(WalletSnapshot {
            available_balance: dec!(3),
            initial_margin: dec!(50),
            maintenance_margin: dec!(5),
            mm_rate_pct: dec!(2),
        });

        let status = supervisor.risk.im_status(supervisor.balances.snapshot());
        assert_eq!(status.safety_reserve, dec!(4.8));
        assert_eq!(status.band(), ImBand::ReserveBreached);
        // The banded sync-cycle log consumes the same snapshot.
        supervisor.log_im_status();

        // A funded wallet drops back to the normal band.
        supervisor.balances.apply(WalletSnapshot {
            available_balance: dec!(100),
            initial_margin: dec!(20),
            maintenance_margin: dec!(5),
            mm_rate_pct: dec!(2),
        });
        let status = supervisor.risk.im_status(supervisor.balances.snapshot());
        assert_eq!(status.band(), ImBand::Normal);
    }

    #[tokio::test]
    async fn test_private_disconnects_escalate() {
        let dir = tempfile::tempdir().unwrap();
        let sim = sim_with_market().await;
        let mut supervisor = AccountSupervisor::init(
            account_cfg(true),
            Arc::new(sim),
            dir.path().to_str().unwrap(),
        )
        .await
        .unwrap();

        for _ in 0..2 {
            supervisor
                .dispatch(StreamEvent::Disconnected(StreamKind::Private))
                .await
                .unwrap();
            assert!(!supervisor.emergency_stopped());
        }
        supervisor
            .dispatch(StreamEvent::Disconnected(StreamKind::Private))
            .await
            .unwrap();
        assert!(supervisor.emergency_stopped());
    }
}
