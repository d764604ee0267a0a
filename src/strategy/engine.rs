//! Per-symbol strategy state machine.
//!
//! One engine owns one symbol's grid: the initial ladder, tick-driven
//! averaging, take-profit maintenance, close handling with adaptive
//! reopen, and the pending symmetry orders that keep the opposite side's
//! margin reserved level-for-level.
//!
//! The engine never talks to the exchange behind the account's back;
//! every external effect flows through the context handed in by the
//! account supervisor, and the book is persisted before each one.

use anyhow::{Context as _, Result};
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::account::balance::BalanceCache;
use crate::config::{
    StrategyConfig, LADDER_BUDGET_TOLERANCE, LADDER_ORDER_DELAY, MAKER_FEE_PCT,
    MISSED_CLOSE_DEBOUNCE, PENDING_ORDER_ID, PENDING_RECALC_THRESHOLD_PCT, QTY_MATCH_TOLERANCE,
    REOPEN_LEVEL_STEP_BACK, TAKER_FEE_PCT,
};
use crate::exchange::gateway::ExchangeGateway;
use crate::exchange::types::{
    ExecType, ExecutionEvent, InstrumentInfo, OrderEvent, OrderRequest, OrderStatus, OrderType,
    PositionSide, StopOrderType,
};
use crate::persistence::analytics::{AnalyticsWriter, TradeAction};
use crate::persistence::StateStore;
use crate::risk::controller::{ReserveProbe, RiskController, SymbolExposure};
use crate::strategy::book::PositionBook;
use crate::strategy::entry::LimitEntryExecutor;
use crate::strategy::restoration::{reconstruct_side, RestorePlan};
use crate::utils::decimal::{ladder_margin, ladder_margin_sum, percent_drop, percent_rise, round_and_clamp};

/// Everything an engine needs from its account for one handler call.
pub struct EngineContext<'a> {
    pub gateway: &'a dyn ExchangeGateway,
    pub risk: &'a mut RiskController,
    pub balances: &'a BalanceCache,
    pub store: &'a mut StateStore,
    pub analytics: &'a mut AnalyticsWriter,
}

/// Why a side closed, per the execution classification table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    TakeProfit,
    StopLoss,
    Manual,
    Liquidation,
    Adl,
}

impl CloseReason {
    pub fn label(self) -> &'static str {
        match self {
            CloseReason::TakeProfit => "Take Profit",
            CloseReason::StopLoss => "Stop-Loss",
            CloseReason::Manual => "Manual",
            CloseReason::Liquidation => "Liquidation",
            CloseReason::Adl => "ADL",
        }
    }
}

/// Signals the supervisor must act on after a handler.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineSignal {
    None,
    /// Liquidation/ADL or an unexplainable state: write the flag and halt
    /// the account.
    EmergencyStop { reason: String },
}

/// Outcome of one reconciliation pass over this symbol.
#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    Synced,
    NeedsResync { detail: String },
    EmergencyStop { reason: String },
}

/// Classify a close execution into its reason.
pub fn classify_close(event: &ExecutionEvent) -> CloseReason {
    match event.exec_type {
        ExecType::BustTrade => CloseReason::Liquidation,
        ExecType::AdlTrade => CloseReason::Adl,
        _ => match event.stop_order_type {
            Some(StopOrderType::StopLoss) | Some(StopOrderType::TrailingStop) => {
                CloseReason::StopLoss
            }
            Some(StopOrderType::TakeProfit) => CloseReason::TakeProfit,
            None => {
                if event.order_type == OrderType::Limit && event.exec_pnl > Decimal::ZERO {
                    CloseReason::TakeProfit
                } else if event.exec_pnl < Decimal::ZERO {
                    CloseReason::StopLoss
                } else {
                    CloseReason::Manual
                }
            }
        },
    }
}

/// Honest TP price: the configured target plus the fees accumulated by
/// `entry_count` taker entries and the maker close.
pub fn honest_tp_price(
    side: PositionSide,
    avg_entry: Decimal,
    entry_count: u32,
    take_profit_percent: Decimal,
) -> Decimal {
    let total_fees_pct = Decimal::from(entry_count) * TAKER_FEE_PCT + MAKER_FEE_PCT;
    let honest_pct = take_profit_percent + total_fees_pct;
    match side {
        PositionSide::Long => avg_entry * (Decimal::ONE + honest_pct / dec!(100)),
        PositionSide::Short => avg_entry * (Decimal::ONE - honest_pct / dec!(100)),
    }
}

/// Price of the symmetry order for level `level` of `side`, anchored at
/// the price of the fill that spawned it: below for Buy, above for Sell.
pub fn pending_entry_price(
    side: PositionSide,
    base_price: Decimal,
    level: u32,
    grid_step_percent: Decimal,
) -> Decimal {
    let offset = grid_step_percent * Decimal::from(level) / dec!(100);
    match side.open_order_side() {
        crate::exchange::types::OrderSide::Buy => base_price * (Decimal::ONE - offset),
        crate::exchange::types::OrderSide::Sell => base_price * (Decimal::ONE + offset),
    }
}

/// Per-symbol strategy engine.
pub struct SymbolEngine {
    cfg: StrategyConfig,
    instrument: InstrumentInfo,
    book: PositionBook,
    executor: LimitEntryExecutor,
    last_price: Option<Decimal>,
    /// Anchor price for the large-move pending recalculation, per side.
    pending_anchor: HashMap<PositionSide, Decimal>,
    /// One retry budget per pending level after an exchange cancel.
    pending_retry_done: HashMap<(PositionSide, u32), bool>,
    /// Sides whose reopen failed the reserve check; retried by sync.
    failed_reopen_sides: Vec<PositionSide>,
    /// Debounce marker for sync-detected missed closes.
    missed_close_since: HashMap<PositionSide, Instant>,
    /// Execution ids already applied; duplicates are no-ops.
    seen_exec_ids: std::collections::HashSet<String>,
}

impl SymbolEngine {
    pub fn new(cfg: StrategyConfig, instrument: InstrumentInfo, book: PositionBook) -> Self {
        Self {
            cfg,
            instrument,
            book,
            executor: LimitEntryExecutor::default(),
            last_price: None,
            pending_anchor: HashMap::new(),
            pending_retry_done: HashMap::new(),
            failed_reopen_sides: Vec::new(),
            missed_close_since: HashMap::new(),
            seen_exec_ids: std::collections::HashSet::new(),
        }
    }

    #[cfg(test)]
    pub fn with_executor(mut self, executor: LimitEntryExecutor) -> Self {
        self.executor = executor;
        self
    }

    pub fn symbol(&self) -> &str {
        &self.cfg.symbol
    }

    pub fn book(&self) -> &PositionBook {
        &self.book
    }

    pub fn config(&self) -> &StrategyConfig {
        &self.cfg
    }

    pub fn last_price(&self) -> Option<Decimal> {
        self.last_price
    }

    pub fn has_failed_reopens(&self) -> bool {
        !self.failed_reopen_sides.is_empty()
    }

    /// Current exposure snapshot for the risk controller.
    pub fn exposure(&self) -> SymbolExposure {
        SymbolExposure {
            symbol: self.cfg.symbol.clone(),
            long_qty: self.book.total_qty(PositionSide::Long),
            short_qty: self.book.total_qty(PositionSide::Short),
            long_count: self.book.count(PositionSide::Long),
            short_count: self.book.count(PositionSide::Short),
            price: self.last_price.unwrap_or(Decimal::ZERO),
            leverage: self.cfg.leverage,
        }
    }

    fn sync_exposure(&self, ctx: &mut EngineContext<'_>) {
        ctx.risk.update_exposure(self.exposure());
    }

    fn persist(&self, ctx: &mut EngineContext<'_>) -> Result<()> {
        ctx.store
            .persist_book(&self.book)
            .with_context(|| format!("persisting book for {}", self.cfg.symbol))
    }

    /// Reference-quantity rule: a recorded level wins; otherwise compute
    /// from the geometric ladder at the current price.
    fn computed_level_qty(&self, level: u32, price: Decimal) -> Decimal {
        let margin = ladder_margin(
            self.cfg.initial_position_size_usd,
            self.cfg.averaging_multiplier,
            level,
        );
        let raw = margin * Decimal::from(self.cfg.leverage) / price;
        round_and_clamp(
            raw,
            self.instrument.qty_step,
            self.instrument.min_qty,
            self.instrument.max_qty,
        )
    }

    fn level_qty(&mut self, level: u32, price: Decimal) -> Decimal {
        match self.book.reference_qty(level) {
            Some(qty) => qty,
            None => {
                let qty = self.computed_level_qty(level, price);
                self.book.record_reference_qty(level, qty);
                qty
            }
        }
    }

    fn level_margin(&self, level: u32) -> Decimal {
        ladder_margin(
            self.cfg.initial_position_size_usd,
            self.cfg.averaging_multiplier,
            level,
        )
    }

    // ==================== take-profit ====================

    /// Cancel and re-place the side's reduce-only TP from the current
    /// book. Called whenever the side's book changes.
    pub async fn refresh_tp(&mut self, ctx: &mut EngineContext<'_>, side: PositionSide) -> Result<()> {
        if let Some(existing) = self.book.tp_id(side).map(str::to_string) {
            if existing != PENDING_ORDER_ID {
                match ctx.gateway.cancel_order(&self.cfg.symbol, &existing).await {
                    Ok(()) => {}
                    Err(e) if e.is_order_not_found() => {
                        debug!("[{}] stale TP {existing} already gone", self.cfg.symbol);
                    }
                    Err(e) => {
                        warn!("[{}] failed to cancel TP {existing}: {e}", self.cfg.symbol);
                    }
                }
            }
            self.book.set_tp_id(side, None);
        }

        if self.book.is_empty(side) {
            self.persist(ctx)?;
            return Ok(());
        }

        let qty = self.book.total_qty(side);
        let avg = self.book.average_entry(side);
        let price = honest_tp_price(side, avg, self.book.count(side), self.cfg.take_profit_percent);

        // Pre-fill with the sentinel so a racing order-stream `New` never
        // observes an empty slot.
        self.book.set_tp_id(side, Some(PENDING_ORDER_ID.to_string()));
        self.persist(ctx)?;

        let request = OrderRequest::take_profit(&self.cfg.symbol, side, qty, price);
        match ctx.gateway.place_order(&request).await {
            Ok(order_id) => {
                info!(
                    "🎯 [{}] {side} TP placed: {qty} @ ${price} (avg ${avg}, id {order_id})",
                    self.cfg.symbol
                );
                self.book.set_tp_id(side, Some(order_id));
            }
            Err(e) => {
                warn!("❌ [{}] {side} TP placement failed: {e}", self.cfg.symbol);
                self.book.set_tp_id(side, None);
            }
        }
        self.persist(ctx)?;
        Ok(())
    }

    // ==================== opening ====================

    /// Open a side as the deepest geometric ladder that fits the margin
    /// budget, one exchange order per level so history keeps the order.
    pub async fn open_ladder(
        &mut self,
        ctx: &mut EngineContext<'_>,
        side: PositionSide,
        margin_budget: Decimal,
    ) -> Result<()> {
        let mut top_level = 0u32;
        while top_level + 1 < self.cfg.max_grid_levels_per_side {
            let sum = ladder_margin_sum(
                self.cfg.initial_position_size_usd,
                self.cfg.averaging_multiplier,
                top_level + 1,
            );
            if sum <= margin_budget * LADDER_BUDGET_TOLERANCE {
                top_level += 1;
            } else {
                break;
            }
        }

        info!(
            "📈 [{}] opening {side} ladder levels 0..={top_level} (budget ${margin_budget})",
            self.cfg.symbol
        );

        for level in 0..=top_level {
            let price = ctx.gateway.last_price(&self.cfg.symbol).await?;
            let qty = self.level_qty(level, price);
            let fill = self
                .executor
                .execute(
                    ctx.gateway,
                    &self.cfg.symbol,
                    side,
                    qty,
                    price,
                    self.instrument.tick_size,
                )
                .await?;
            self.book.append_entry(
                side,
                fill.price,
                qty,
                level,
                Some(fill.order_id.clone()),
                Utc::now(),
            );
            self.persist(ctx)?;
            self.record_open_row(ctx, side, fill.price, qty, fill.used_market, "ladder open");
            self.last_price = Some(fill.price);
            if level < top_level {
                tokio::time::sleep(LADDER_ORDER_DELAY).await;
            }
        }

        self.sync_exposure(ctx);
        self.refresh_tp(ctx, side).await?;
        Ok(())
    }

    fn record_open_row(
        &self,
        ctx: &mut EngineContext<'_>,
        side: PositionSide,
        price: Decimal,
        qty: Decimal,
        used_market: bool,
        reason: &str,
    ) {
        let fee_pct = if used_market { TAKER_FEE_PCT } else { MAKER_FEE_PCT };
        let mut row = AnalyticsWriter::trade_row(
            &self.cfg.symbol,
            &side.to_string(),
            TradeAction::Open,
            price,
            qty,
            reason,
        );
        row.open_fee = price * qty * fee_pct / dec!(100);
        if let Err(e) = ctx.analytics.record_trade(&row) {
            warn!("[{}] trade row failed: {e}", self.cfg.symbol);
        }
    }

    // ==================== averaging ====================

    /// Tick entry point: averaging on both sides plus the large-move
    /// pending recalculation.
    pub async fn on_price_tick(&mut self, ctx: &mut EngineContext<'_>, price: Decimal) -> Result<()> {
        self.last_price = Some(price);
        for side in PositionSide::BOTH {
            self.maybe_average(ctx, side, price).await?;
        }
        self.maybe_recalc_pendings(ctx, price).await?;
        Ok(())
    }

    async fn maybe_average(
        &mut self,
        ctx: &mut EngineContext<'_>,
        side: PositionSide,
        price: Decimal,
    ) -> Result<()> {
        if self.book.is_empty(side) {
            return Ok(());
        }
        let Some(last_entry) = self.book.last_entry_price(side) else {
            return Ok(());
        };
        let move_pct = match side {
            PositionSide::Long => percent_drop(last_entry, price),
            PositionSide::Short => percent_rise(last_entry, price),
        };
        if move_pct < self.cfg.grid_step_percent {
            return Ok(());
        }
        let count = self.book.count(side);
        if count >= self.cfg.max_grid_levels_per_side {
            debug!(
                "[{}] {side} at max grid levels ({count}); averaging rejected",
                self.cfg.symbol
            );
            return Ok(());
        }

        let level = count;
        self.sync_exposure(ctx);
        let candidate_qty = self
            .book
            .reference_qty(level)
            .unwrap_or_else(|| self.computed_level_qty(level, price));
        let probe = ReserveProbe {
            symbol: self.cfg.symbol.clone(),
            side,
            candidate_qty,
            candidate_margin: self.level_margin(level),
        };
        let decision = ctx.risk.check_reserve(&probe, ctx.balances.available_balance());
        if !decision.approved {
            return Ok(());
        }

        let qty = self.level_qty(level, price);
        let fill = self
            .executor
            .execute(
                ctx.gateway,
                &self.cfg.symbol,
                side,
                qty,
                price,
                self.instrument.tick_size,
            )
            .await?;
        self.book
            .append_entry(side, fill.price, qty, level, Some(fill.order_id.clone()), Utc::now());
        self.persist(ctx)?;
        info!(
            "🔄 [{}] {side} averaged: level {level}, qty {qty} @ ${}",
            self.cfg.symbol, fill.price
        );
        self.record_open_row(ctx, side, fill.price, qty, fill.used_market, "grid averaging");
        self.sync_exposure(ctx);

        self.place_symmetric_pending(ctx, side, level, fill.price).await?;
        self.refresh_tp(ctx, side).await?;
        Ok(())
    }

    // ==================== pending symmetry ====================

    /// Reserve the opposite side's money for the level that just filled:
    /// a plain limit at the mirrored grid offset.
    async fn place_symmetric_pending(
        &mut self,
        ctx: &mut EngineContext<'_>,
        filled_side: PositionSide,
        level: u32,
        base_price: Decimal,
    ) -> Result<()> {
        let opposite = filled_side.opposite();
        if self.book.count(opposite) >= level + 1 {
            return Ok(());
        }
        if self.book.pending_orders(opposite).contains_key(&level) {
            return Ok(());
        }
        let qty = self.level_qty(level, base_price);
        let price = pending_entry_price(opposite, base_price, level, self.cfg.grid_step_percent);
        let request = OrderRequest::limit(&self.cfg.symbol, opposite, qty, price);
        match ctx.gateway.place_order(&request).await {
            Ok(order_id) => {
                info!(
                    "🪞 [{}] {opposite} pending entry level {level}: {qty} @ ${price} (id {order_id})",
                    self.cfg.symbol
                );
                self.book.set_pending(opposite, level, order_id);
                self.pending_anchor.entry(opposite).or_insert(base_price);
                self.persist(ctx)?;
            }
            Err(e) => {
                warn!(
                    "⚠️  [{}] {opposite} pending entry level {level} failed: {e}",
                    self.cfg.symbol
                );
            }
        }
        Ok(())
    }

    /// Re-place all pendings of a side when price drifted >5% from where
    /// they were anchored, keeping them close to market.
    async fn maybe_recalc_pendings(
        &mut self,
        ctx: &mut EngineContext<'_>,
        price: Decimal,
    ) -> Result<()> {
        for side in PositionSide::BOTH {
            let Some(anchor) = self.pending_anchor.get(&side).copied() else {
                continue;
            };
            if self.book.pending_orders(side).is_empty() {
                self.pending_anchor.remove(&side);
                continue;
            }
            let drift = percent_drop(anchor, price).abs().max(percent_rise(anchor, price).abs());
            if drift <= PENDING_RECALC_THRESHOLD_PCT {
                continue;
            }
            info!(
                "🔁 [{}] {side} pendings drifted {drift:.2}% from anchor ${anchor}; re-placing at market",
                self.cfg.symbol
            );
            let levels: Vec<u32> = self.book.pending_orders(side).keys().copied().collect();
            for level in &levels {
                if let Some(order_id) = self.book.remove_pending(side, *level) {
                    match ctx.gateway.cancel_order(&self.cfg.symbol, &order_id).await {
                        Ok(()) => {}
                        Err(e) if e.is_order_not_found() => {}
                        Err(e) => warn!("[{}] pending cancel failed: {e}", self.cfg.symbol),
                    }
                }
            }
            self.persist(ctx)?;
            for level in levels {
                let qty = self.level_qty(level, price);
                let new_price = pending_entry_price(side, price, level, self.cfg.grid_step_percent);
                let request = OrderRequest::limit(&self.cfg.symbol, side, qty, new_price);
                if let Ok(order_id) = ctx.gateway.place_order(&request).await {
                    self.book.set_pending(side, level, order_id);
                }
            }
            self.pending_anchor.insert(side, price);
            self.persist(ctx)?;
        }
        Ok(())
    }

    /// Cancel every tracked pending entry on both sides (stale after any
    /// close).
    async fn cancel_all_pendings(&mut self, ctx: &mut EngineContext<'_>) -> Result<()> {
        for side in PositionSide::BOTH {
            for order_id in self.book.clear_pending(side) {
                match ctx.gateway.cancel_order(&self.cfg.symbol, &order_id).await {
                    Ok(()) => {}
                    Err(e) if e.is_order_not_found() => {}
                    Err(e) => warn!("[{}] pending cancel failed: {e}", self.cfg.symbol),
                }
            }
            self.pending_anchor.remove(&side);
        }
        self.pending_retry_done.clear();
        self.persist(ctx)?;
        Ok(())
    }

    /// Restore missing symmetry orders (sync-cycle repair path). Level 0
    /// is opened by ladders, never by symmetry orders.
    pub async fn ensure_pendings(&mut self, ctx: &mut EngineContext<'_>) -> Result<()> {
        for side in PositionSide::BOTH {
            let levels: Vec<(u32, Decimal)> = self
                .book
                .entries(side)
                .iter()
                .filter(|e| e.grid_level > 0)
                .map(|e| (e.grid_level, e.entry_price))
                .collect();
            for (level, entry_price) in levels {
                self.place_symmetric_pending(ctx, side, level, entry_price).await?;
            }
        }
        Ok(())
    }

    // ==================== event handlers ====================

    /// Execution events are authoritative for open/close outcomes.
    pub async fn on_execution(
        &mut self,
        ctx: &mut EngineContext<'_>,
        event: &ExecutionEvent,
    ) -> Result<EngineSignal> {
        if !self.seen_exec_ids.insert(event.exec_id.clone()) {
            debug!("[{}] duplicate execution {} ignored", self.cfg.symbol, event.exec_id);
            return Ok(EngineSignal::None);
        }
        if event.exec_type == ExecType::Funding || event.exec_type == ExecType::Settle {
            return Ok(EngineSignal::None);
        }
        let Some(side) = event.position_side() else {
            warn!("[{}] execution with position_idx {} ignored", self.cfg.symbol, event.position_idx);
            return Ok(EngineSignal::None);
        };

        if !event.is_close() {
            // Open/add confirmations are metrics-only: direct entries were
            // appended at placement, pending fills append on order events.
            debug!(
                "[{}] {side} open execution {} ({} @ {})",
                self.cfg.symbol, event.order_id, event.exec_qty, event.exec_price
            );
            return Ok(EngineSignal::None);
        }

        let reason = classify_close(event);
        self.handle_close(ctx, side, event, reason).await?;

        match reason {
            CloseReason::Liquidation => Ok(EngineSignal::EmergencyStop {
                reason: "Position liquidated".to_string(),
            }),
            CloseReason::Adl => Ok(EngineSignal::EmergencyStop {
                reason: "Position closed by auto-deleveraging".to_string(),
            }),
            _ => {
                self.adaptive_reopen(ctx, side).await?;
                Ok(EngineSignal::None)
            }
        }
    }

    async fn handle_close(
        &mut self,
        ctx: &mut EngineContext<'_>,
        side: PositionSide,
        event: &ExecutionEvent,
        reason: CloseReason,
    ) -> Result<()> {
        info!(
            "💰 [{}] {side} position closed ({}): PnL=${}",
            self.cfg.symbol,
            reason.label(),
            event.exec_pnl
        );
        self.book.record_realized_pnl(side, event.exec_pnl);

        // The TP either just filled or is stale either way; drop it.
        if let Some(tp) = self.book.tp_id(side).map(str::to_string) {
            if tp != PENDING_ORDER_ID && tp != event.order_id {
                match ctx.gateway.cancel_order(&self.cfg.symbol, &tp).await {
                    Ok(()) => {}
                    Err(e) if e.is_order_not_found() => {}
                    Err(e) => warn!("[{}] stale TP cancel failed: {e}", self.cfg.symbol),
                }
            }
        }

        self.book.clear_side(side);
        if self.book.clear_reference_qty_if_both_sides_empty() {
            debug!("[{}] both sides empty; reference quantities wiped", self.cfg.symbol);
        }
        self.persist(ctx)?;
        self.cancel_all_pendings(ctx).await?;
        self.sync_exposure(ctx);

        let mut row = AnalyticsWriter::trade_row(
            &self.cfg.symbol,
            &side.to_string(),
            TradeAction::Close,
            event.exec_price,
            event.exec_qty,
            reason.label(),
        );
        row.pnl = event.exec_pnl;
        row.close_fee = event.exec_fee;
        if let Err(e) = ctx.analytics.record_trade(&row) {
            warn!("[{}] trade row failed: {e}", self.cfg.symbol);
        }
        Ok(())
    }

    /// Order events drive TP and pending-entry lifecycles.
    pub async fn on_order_event(
        &mut self,
        ctx: &mut EngineContext<'_>,
        event: &OrderEvent,
    ) -> Result<()> {
        // Take-profit lifecycle.
        for side in PositionSide::BOTH {
            if self.book.tp_id(side) == Some(event.order_id.as_str()) {
                match event.status {
                    OrderStatus::Cancelled | OrderStatus::Rejected | OrderStatus::Deactivated => {
                        warn!(
                            "⚠️  [{}] {side} TP {} cancelled by exchange; will re-create",
                            self.cfg.symbol, event.order_id
                        );
                        self.book.set_tp_id(side, None);
                        self.persist(ctx)?;
                    }
                    _ => {}
                }
                return Ok(());
            }
        }

        // Pending symmetry lifecycle.
        for side in PositionSide::BOTH {
            let Some(level) = self.book.pending_level_for(side, &event.order_id) else {
                continue;
            };
            match event.status {
                OrderStatus::Filled => {
                    self.book.remove_pending(side, level);
                    if self.book.contains_order(side, &event.order_id) {
                        return Ok(());
                    }
                    // The pending may fill out of level order while the
                    // side is shallower; append at the next contiguous
                    // level to preserve monotonicity.
                    let append_level = self.book.count(side);
                    let price = if event.avg_price > Decimal::ZERO {
                        event.avg_price
                    } else {
                        self.last_price.unwrap_or(Decimal::ZERO)
                    };
                    self.book.append_entry(
                        side,
                        price,
                        event.qty,
                        append_level,
                        Some(event.order_id.clone()),
                        Utc::now(),
                    );
                    self.persist(ctx)?;
                    info!(
                        "🪞 [{}] {side} pending level {level} filled: {} @ ${price}",
                        self.cfg.symbol, event.qty
                    );
                    self.record_open_row(ctx, side, price, event.qty, false, "pending symmetry fill");
                    self.sync_exposure(ctx);
                    self.refresh_tp(ctx, side).await?;
                }
                OrderStatus::PartiallyFilled => {
                    debug!(
                        "[{}] {side} pending level {level} partially filled; waiting",
                        self.cfg.symbol
                    );
                }
                OrderStatus::Cancelled | OrderStatus::Deactivated | OrderStatus::Rejected => {
                    self.book.remove_pending(side, level);
                    self.persist(ctx)?;
                    let retried = self
                        .pending_retry_done
                        .insert((side, level), true)
                        .unwrap_or(false);
                    if retried {
                        warn!(
                            "⚠️  [{}] {side} pending level {level} cancelled again; giving up until next sync",
                            self.cfg.symbol
                        );
                        continue;
                    }
                    warn!(
                        "🔁 [{}] {side} pending level {level} cancelled by exchange; retrying once",
                        self.cfg.symbol
                    );
                    let price = match self.last_price {
                        Some(p) => p,
                        None => ctx.gateway.last_price(&self.cfg.symbol).await?,
                    };
                    self.place_symmetric_pending(ctx, side.opposite(), level, price).await?;
                }
                OrderStatus::New => {}
            }
            return Ok(());
        }
        Ok(())
    }

    // ==================== adaptive reopen ====================

    /// Reopen a closed side two levels shy of the opposite side's depth so
    /// margin remains for emergency rebalancing.
    pub async fn adaptive_reopen(
        &mut self,
        ctx: &mut EngineContext<'_>,
        side: PositionSide,
    ) -> Result<()> {
        let opposite = side.opposite();
        let reopen_level = self
            .book
            .max_level(opposite)
            .map(|l| l.saturating_sub(REOPEN_LEVEL_STEP_BACK))
            .unwrap_or(0);
        let target_margin = ladder_margin_sum(
            self.cfg.initial_position_size_usd,
            self.cfg.averaging_multiplier,
            reopen_level,
        );
        let price = match self.last_price {
            Some(p) => p,
            None => ctx.gateway.last_price(&self.cfg.symbol).await?,
        };
        self.sync_exposure(ctx);

        let budget = if self.reserve_approves(ctx, side, target_margin, price) {
            target_margin
        } else if self.reserve_approves(ctx, side, self.cfg.initial_position_size_usd, price) {
            info!(
                "📉 [{}] {side} reopen downgraded to initial size (reserve rejected ${target_margin})",
                self.cfg.symbol
            );
            self.cfg.initial_position_size_usd
        } else {
            warn!(
                "⚠️  [{}] {side} reopen deferred: reserve rejected even the initial size",
                self.cfg.symbol
            );
            if !self.failed_reopen_sides.contains(&side) {
                self.failed_reopen_sides.push(side);
            }
            return Ok(());
        };

        self.failed_reopen_sides.retain(|s| *s != side);
        self.open_ladder(ctx, side, budget).await
    }

    fn reserve_approves(
        &self,
        ctx: &mut EngineContext<'_>,
        side: PositionSide,
        margin: Decimal,
        price: Decimal,
    ) -> bool {
        let candidate_qty = round_and_clamp(
            margin * Decimal::from(self.cfg.leverage) / price,
            self.instrument.qty_step,
            self.instrument.min_qty,
            self.instrument.max_qty,
        );
        let probe = ReserveProbe {
            symbol: self.cfg.symbol.clone(),
            side,
            candidate_qty,
            candidate_margin: margin,
        };
        ctx.risk
            .check_reserve(&probe, ctx.balances.available_balance())
            .approved
    }

    // ==================== reconciliation ====================

    /// One reconciliation pass against exchange truth. No trading happens
    /// until this returns `Synced`.
    pub async fn reconcile(&mut self, ctx: &mut EngineContext<'_>) -> Result<ReconcileOutcome> {
        let price = ctx.gateway.last_price(&self.cfg.symbol).await?;
        self.last_price = Some(price);
        let positions = ctx.gateway.active_positions(&self.cfg.symbol).await?;

        for side in PositionSide::BOTH {
            let exchange_qty = positions.size(side);
            let local_qty = self.book.total_qty(side);
            let diff = (exchange_qty - local_qty).abs();

            if exchange_qty == Decimal::ZERO && local_qty == Decimal::ZERO {
                // The opposite side may already hold restored entries; use
                // adaptive sizing against it, otherwise the initial size.
                if self.book.is_empty(side.opposite()) {
                    self.open_ladder(ctx, side, self.cfg.initial_position_size_usd).await?;
                } else {
                    self.adaptive_reopen(ctx, side).await?;
                }
            } else if diff <= QTY_MATCH_TOLERANCE {
                if self.book.tp_id(side).is_none() && !self.book.is_empty(side) {
                    self.refresh_tp(ctx, side).await?;
                }
            } else if local_qty == Decimal::ZERO && exchange_qty > Decimal::ZERO {
                match self.restore_side(ctx, side, exchange_qty, &positions).await? {
                    ReconcileOutcome::Synced => {}
                    other => return Ok(other),
                }
            } else {
                return Ok(ReconcileOutcome::EmergencyStop {
                    reason: format!(
                        "position mismatch requires manual intervention: {side} exchange={exchange_qty} local={local_qty}"
                    ),
                });
            }
        }

        self.sync_exposure(ctx);
        self.persist(ctx)?;
        Ok(ReconcileOutcome::Synced)
    }

    async fn restore_side(
        &mut self,
        ctx: &mut EngineContext<'_>,
        side: PositionSide,
        exchange_qty: Decimal,
        positions: &crate::exchange::types::PositionPair,
    ) -> Result<ReconcileOutcome> {
        let exchange_avg = positions
            .side(side)
            .map(|p| p.avg_price)
            .unwrap_or(Decimal::ZERO);
        let history = ctx
            .gateway
            .order_history(&self.cfg.symbol, crate::config::ORDER_HISTORY_LIMIT)
            .await?;

        let plan = match reconstruct_side(&history, side, exchange_qty, exchange_avg) {
            Ok(plan) => plan,
            Err(e) => {
                return Ok(ReconcileOutcome::EmergencyStop {
                    reason: format!("restoration failed for {side}: {e}"),
                })
            }
        };

        match plan {
            RestorePlan::NeedsResync {
                restored_qty,
                exchange_qty,
            } => Ok(ReconcileOutcome::NeedsResync {
                detail: format!(
                    "{side} history explains {restored_qty} of {exchange_qty}"
                ),
            }),
            RestorePlan::Fallback { qty, price } => {
                self.book.append_entry(side, price, qty, 0, None, Utc::now());
                self.book.record_reference_qty(0, qty);
                self.persist(ctx)?;
                self.record_restore_rows(ctx, side);
                self.reset_side_tp(ctx, side).await?;
                info!(
                    "🛟 [{}] {side} restored via fallback: single level-0 entry {qty} @ ${price}",
                    self.cfg.symbol
                );
                Ok(ReconcileOutcome::Synced)
            }
            RestorePlan::Entries(entries) => {
                for entry in &entries {
                    self.book.append_entry(
                        side,
                        entry.price,
                        entry.qty,
                        entry.level,
                        Some(entry.order_id.clone()),
                        entry.timestamp,
                    );
                    self.book.record_reference_qty(entry.level, entry.qty);
                }
                self.persist(ctx)?;
                self.record_restore_rows(ctx, side);
                self.reset_side_tp(ctx, side).await?;
                info!(
                    "🔧 [{}] {side} restored {} grid levels from history",
                    self.cfg.symbol,
                    entries.len()
                );
                Ok(ReconcileOutcome::Synced)
            }
        }
    }

    /// Local TP tracking is stale after a restart: force-cancel every
    /// reduce-only order for the side and place a fresh one.
    async fn reset_side_tp(&mut self, ctx: &mut EngineContext<'_>, side: PositionSide) -> Result<()> {
        let open = ctx.gateway.open_orders(&self.cfg.symbol).await?;
        for order in open
            .iter()
            .filter(|o| o.reduce_only && o.position_idx == side.position_idx())
        {
            match ctx.gateway.cancel_order(&self.cfg.symbol, &order.order_id).await {
                Ok(()) => debug!("[{}] stale reduce-only {} cancelled", self.cfg.symbol, order.order_id),
                Err(e) if e.is_order_not_found() => {}
                Err(e) => warn!("[{}] stale reduce-only cancel failed: {e}", self.cfg.symbol),
            }
        }
        self.book.set_tp_id(side, None);
        self.refresh_tp(ctx, side).await
    }

    fn record_restore_rows(&self, ctx: &mut EngineContext<'_>, side: PositionSide) {
        for entry in self.book.entries(side) {
            let row = AnalyticsWriter::trade_row(
                &self.cfg.symbol,
                &side.to_string(),
                TradeAction::Restore,
                entry.entry_price,
                entry.quantity,
                "restored from order history",
            );
            if let Err(e) = ctx.analytics.record_trade(&row) {
                warn!("[{}] restore row failed: {e}", self.cfg.symbol);
            }
        }
    }

    // ==================== periodic sync ====================

    /// Periodic drift repair. `first_run` additionally cancels every live
    /// order on the symbol so state is clean after outages.
    pub async fn periodic_sync(
        &mut self,
        ctx: &mut EngineContext<'_>,
        first_run: bool,
    ) -> Result<EngineSignal> {
        if first_run {
            let open = ctx.gateway.open_orders(&self.cfg.symbol).await?;
            info!(
                "🧹 [{}] first sync: cancelling {} live orders",
                self.cfg.symbol,
                open.len()
            );
            for order in open {
                match ctx.gateway.cancel_order(&self.cfg.symbol, &order.order_id).await {
                    Ok(()) => {}
                    Err(e) if e.is_order_not_found() => {}
                    Err(e) => warn!("[{}] first-sync cancel failed: {e}", self.cfg.symbol),
                }
            }
            for side in PositionSide::BOTH {
                self.book.set_tp_id(side, None);
                self.book.clear_pending(side);
            }
            self.pending_anchor.clear();
            self.persist(ctx)?;
        }

        let positions = ctx.gateway.active_positions(&self.cfg.symbol).await?;
        for side in PositionSide::BOTH {
            let exchange_qty = positions.size(side);
            let local_qty = self.book.total_qty(side);
            let diff = (exchange_qty - local_qty).abs();

            if diff <= QTY_MATCH_TOLERANCE {
                self.missed_close_since.remove(&side);
                if exchange_qty > Decimal::ZERO && self.book.tp_id(side).is_none() {
                    self.refresh_tp(ctx, side).await?;
                }
            } else if exchange_qty == Decimal::ZERO && local_qty > Decimal::ZERO {
                let since = self.missed_close_since.entry(side).or_insert_with(Instant::now);
                if since.elapsed() < MISSED_CLOSE_DEBOUNCE {
                    debug!("[{}] {side} missed-close candidate; debouncing", self.cfg.symbol);
                    continue;
                }
                self.missed_close_since.remove(&side);
                warn!(
                    "🕳️  [{}] {side} closed on exchange while we were not looking; clearing {local_qty}",
                    self.cfg.symbol
                );
                self.book.clear_side(side);
                self.book.clear_reference_qty_if_both_sides_empty();
                self.persist(ctx)?;
                self.cancel_all_pendings(ctx).await?;
                self.sync_exposure(ctx);
                self.adaptive_reopen(ctx, side).await?;
            } else {
                warn!(
                    "⚠️  [{}] {side} size drift: exchange={exchange_qty} local={local_qty}; not self-healing",
                    self.cfg.symbol
                );
            }
        }

        // Recovery: a one-sided book or a deferred reopen gets another try.
        for side in PositionSide::BOTH {
            let deferred = self.failed_reopen_sides.contains(&side);
            let lopsided = self.book.is_empty(side) && !self.book.is_empty(side.opposite());
            if deferred || lopsided {
                self.adaptive_reopen(ctx, side).await?;
            }
        }

        self.ensure_pendings(ctx).await?;
        self.sync_exposure(ctx);
        Ok(EngineSignal::None)
    }

    // ==================== emergency ====================

    /// Market-close both sides (MM-rate breach path).
    pub async fn close_all_positions(&mut self, ctx: &mut EngineContext<'_>) -> Result<()> {
        for side in PositionSide::BOTH {
            let qty = self.book.total_qty(side);
            if qty == Decimal::ZERO {
                continue;
            }
            let request = OrderRequest::close_market(&self.cfg.symbol, side, qty);
            match ctx.gateway.place_order(&request).await {
                Ok(order_id) => {
                    warn!(
                        "💥 [{}] emergency close {side} {qty} (order {order_id})",
                        self.cfg.symbol
                    );
                    self.book.clear_side(side);
                }
                Err(e) => {
                    warn!("💥 [{}] emergency close {side} failed: {e}", self.cfg.symbol);
                }
            }
        }
        self.book.clear_reference_qty_if_both_sides_empty();
        self.persist(ctx)?;
        self.cancel_all_pendings(ctx).await?;
        self.sync_exposure(ctx);
        Ok(())
    }

    /// Rebalance leg execution: market the lagging side and append a
    /// corrective entry outside the reference ladder.
    pub async fn apply_rebalance_leg(
        &mut self,
        ctx: &mut EngineContext<'_>,
        side: PositionSide,
        qty: Decimal,
    ) -> Result<()> {
        let qty = round_and_clamp(
            qty,
            self.instrument.qty_step,
            self.instrument.min_qty,
            self.instrument.max_qty,
        );
        if qty == Decimal::ZERO {
            return Ok(());
        }
        let price = match self.last_price {
            Some(p) => p,
            None => ctx.gateway.last_price(&self.cfg.symbol).await?,
        };
        let request = OrderRequest::market(&self.cfg.symbol, side, qty);
        let order_id = ctx.gateway.place_order(&request).await?;
        let level = self.book.count(side);
        self.book
            .append_entry(side, price, qty, level, Some(order_id), Utc::now());
        self.persist(ctx)?;
        info!(
            "⚖️  [{}] rebalance: added {qty} to {side} @ ${price} (level {level})",
            self.cfg.symbol
        );
        self.record_open_row(ctx, side, price, qty, true, "adaptive rebalance");
        self.sync_exposure(ctx);
        self.refresh_tp(ctx, side).await?;
        Ok(())
    }

    /// Panic TP management: cancel a specific side's TP without touching
    /// the book entries (reversed by `ensure_tp` once panic clears).
    pub async fn cancel_side_tp(&mut self, ctx: &mut EngineContext<'_>, side: PositionSide) -> Result<()> {
        if let Some(tp) = self.book.tp_id(side).map(str::to_string) {
            if tp != PENDING_ORDER_ID {
                match ctx.gateway.cancel_order(&self.cfg.symbol, &tp).await {
                    Ok(()) => info!("🛑 [{}] trend-side {side} TP {tp} cancelled", self.cfg.symbol),
                    Err(e) if e.is_order_not_found() => {}
                    Err(e) => warn!("[{}] trend TP cancel failed: {e}", self.cfg.symbol),
                }
            }
            self.book.set_tp_id(side, None);
            self.persist(ctx)?;
        }
        Ok(())
    }

    /// Re-create the TP for any populated side missing one.
    pub async fn ensure_tp(&mut self, ctx: &mut EngineContext<'_>) -> Result<()> {
        for side in PositionSide::BOTH {
            if !self.book.is_empty(side) && self.book.tp_id(side).is_none() {
                self.refresh_tp(ctx, side).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::sim::SimExchange;
    use crate::exchange::types::{HistoricOrder, OrderSide};
    use std::time::Duration;

    fn strategy_cfg() -> StrategyConfig {
        StrategyConfig {
            symbol: "SOLUSDT".to_string(),
            leverage: 100,
            initial_position_size_usd: dec!(1),
            grid_step_percent: dec!(1),
            averaging_multiplier: dec!(2),
            take_profit_percent: dec!(1),
            max_grid_levels_per_side: 10,
        }
    }

    fn instrument() -> InstrumentInfo {
        InstrumentInfo {
            symbol: "SOLUSDT".to_string(),
            min_qty: dec!(0.1),
            qty_step: dec!(0.1),
            max_qty: dec!(100000),
            tick_size: dec!(0.01),
        }
    }

    struct Harness {
        sim: SimExchange,
        risk: RiskController,
        balances: BalanceCache,
        store: StateStore,
        analytics: AnalyticsWriter,
        _dir: tempfile::TempDir,
    }

    impl Harness {
        async fn new(balance: Decimal) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let sim = SimExchange::new(balance);
            sim.add_instrument(instrument(), dec!(100)).await;
            sim.set_leverage("SOLUSDT", 100).await.unwrap();
            let mut balances = BalanceCache::new();
            balances.seed(crate::exchange::types::WalletSnapshot {
                available_balance: balance,
                initial_margin: Decimal::ZERO,
                maintenance_margin: Decimal::ZERO,
                mm_rate_pct: Decimal::ZERO,
            });
            Self {
                sim,
                risk: RiskController::new(dec!(15)),
                balances,
                store: StateStore::open(dir.path(), 1).unwrap(),
                analytics: AnalyticsWriter::open(dir.path(), 1).unwrap(),
                _dir: dir,
            }
        }

        fn ctx(&mut self) -> EngineContext<'_> {
            EngineContext {
                gateway: &self.sim,
                risk: &mut self.risk,
                balances: &self.balances,
                store: &mut self.store,
                analytics: &mut self.analytics,
            }
        }
    }

    fn engine() -> SymbolEngine {
        SymbolEngine::new(strategy_cfg(), instrument(), PositionBook::new("SOLUSDT"))
            .with_executor(LimitEntryExecutor::with_timings(
                Duration::from_millis(50),
                1,
                Duration::from_millis(5),
            ))
    }

    fn exec_event(
        side: PositionSide,
        exec_type: ExecType,
        order_type: OrderType,
        exec_pnl: Decimal,
        closed_size: Decimal,
    ) -> ExecutionEvent {
        ExecutionEvent {
            symbol: "SOLUSDT".to_string(),
            exec_id: format!("e-{}", rand_id()),
            order_id: format!("o-{}", rand_id()),
            side: side.close_order_side(),
            position_idx: side.position_idx(),
            exec_type,
            order_type,
            stop_order_type: None,
            exec_qty: closed_size.max(dec!(1)),
            exec_price: dec!(100.5),
            closed_size,
            exec_pnl,
            exec_fee: dec!(0.02),
            exec_time: Utc::now(),
        }
    }

    fn rand_id() -> u128 {
        use std::sync::atomic::{AtomicU64, Ordering};
        static NEXT: AtomicU64 = AtomicU64::new(0);
        NEXT.fetch_add(1, Ordering::Relaxed) as u128
    }

    #[test]
    fn test_honest_tp_formula() {
        // S1: one entry, tp 1% -> 100 * (1 + 1.075/100)
        assert_eq!(
            honest_tp_price(PositionSide::Long, dec!(100), 1, dec!(1)),
            dec!(101.075)
        );
        assert_eq!(
            honest_tp_price(PositionSide::Short, dec!(100), 1, dec!(1)),
            dec!(98.925)
        );
        // Two entries: 1 + 2*0.055 + 0.020 = 1.13%
        let avg = dec!(99.3333333);
        let tp = honest_tp_price(PositionSide::Long, avg, 2, dec!(1));
        assert!((tp - avg * dec!(1.0113)).abs() < dec!(0.0000001));
    }

    #[test]
    fn test_pending_entry_price_mirrors_grid_offset() {
        // Short side pending sells above base; level 1 at 1% -> 99 * 1.01
        let price = pending_entry_price(PositionSide::Short, dec!(99), 1, dec!(1));
        assert_eq!(price, dec!(99.99));
        // Long side pending buys below base.
        let price = pending_entry_price(PositionSide::Long, dec!(100), 2, dec!(1));
        assert_eq!(price, dec!(98));
    }

    #[test]
    fn test_close_classification_table() {
        let mk = |exec_type, order_type, stop, pnl: Decimal| ExecutionEvent {
            stop_order_type: stop,
            ..exec_event(PositionSide::Long, exec_type, order_type, pnl, dec!(1))
        };
        assert_eq!(
            classify_close(&mk(ExecType::BustTrade, OrderType::Market, None, dec!(-5))),
            CloseReason::Liquidation
        );
        assert_eq!(
            classify_close(&mk(ExecType::AdlTrade, OrderType::Market, None, dec!(-1))),
            CloseReason::Adl
        );
        assert_eq!(
            classify_close(&mk(
                ExecType::Trade,
                OrderType::Market,
                Some(StopOrderType::StopLoss),
                dec!(-1)
            )),
            CloseReason::StopLoss
        );
        assert_eq!(
            classify_close(&mk(
                ExecType::Trade,
                OrderType::Market,
                Some(StopOrderType::TakeProfit),
                dec!(1)
            )),
            CloseReason::TakeProfit
        );
        // Our path: limit close with positive pnl.
        assert_eq!(
            classify_close(&mk(ExecType::Trade, OrderType::Limit, None, dec!(1))),
            CloseReason::TakeProfit
        );
        assert_eq!(
            classify_close(&mk(ExecType::Trade, OrderType::Market, None, dec!(-1))),
            CloseReason::StopLoss
        );
        assert_eq!(
            classify_close(&mk(ExecType::Trade, OrderType::Market, None, Decimal::ZERO)),
            CloseReason::Manual
        );
    }

    #[tokio::test]
    async fn test_s1_initial_open_then_first_averaging() {
        let mut harness = Harness::new(dec!(1000)).await;
        let mut engine = engine();

        // Open both sides at level 0 (price 100, $1 margin, 100x -> qty 1).
        {
            let mut ctx = harness.ctx();
            engine.open_ladder(&mut ctx, PositionSide::Long, dec!(1)).await.unwrap();
            engine.open_ladder(&mut ctx, PositionSide::Short, dec!(1)).await.unwrap();
        }
        assert_eq!(engine.book().total_qty(PositionSide::Long), dec!(1));
        assert_eq!(engine.book().total_qty(PositionSide::Short), dec!(1));
        assert_eq!(engine.book().reference_qty(0), Some(dec!(1)));
        assert!(engine.book().tp_id(PositionSide::Long).is_some());
        assert!(engine.book().tp_id(PositionSide::Short).is_some());

        // Price drops 1%: Long averages into level 1 with qty 2 and a
        // pending Sell appears for the Short side at level 1.
        harness.sim.set_price("SOLUSDT", dec!(99)).await;
        {
            let mut ctx = harness.ctx();
            engine.on_price_tick(&mut ctx, dec!(99)).await.unwrap();
        }
        assert_eq!(engine.book().count(PositionSide::Long), 2);
        assert_eq!(engine.book().reference_qty(1), Some(dec!(2)));
        let avg = engine.book().average_entry(PositionSide::Long);
        assert!((avg - dec!(99.34)).abs() < dec!(0.04));
        assert_eq!(
            engine.book().pending_orders(PositionSide::Short).len(),
            1
        );

        // The short pending rests at 99 * 1.01 = 99.99 with qty 2.
        let open = harness.sim.open_orders("SOLUSDT").await.unwrap();
        let pending = open
            .iter()
            .find(|o| !o.reduce_only && o.position_idx == 2)
            .unwrap();
        assert_eq!(pending.qty, dec!(2));
        // Base fill carries the 0.03% maker offset, so the mirrored price
        // sits a hair above the bare 99 * 1.01 = 99.99.
        assert!((pending.price - dec!(99.99)).abs() < dec!(0.05));
        assert_eq!(pending.side, OrderSide::Sell);
    }

    #[tokio::test]
    async fn test_s2_take_profit_close_then_adaptive_reopen() {
        let mut harness = Harness::new(dec!(1000)).await;
        let mut engine = engine();
        {
            let mut ctx = harness.ctx();
            engine.open_ladder(&mut ctx, PositionSide::Long, dec!(1)).await.unwrap();
            engine.open_ladder(&mut ctx, PositionSide::Short, dec!(1)).await.unwrap();
        }
        harness.sim.set_price("SOLUSDT", dec!(99)).await;
        {
            let mut ctx = harness.ctx();
            engine.on_price_tick(&mut ctx, dec!(99)).await.unwrap();
        }
        // Short has max level 1 now? No: short still at level 0, long at 1.
        assert_eq!(engine.book().max_level(PositionSide::Long), Some(1));

        // TP fills on Long: execution close arrives.
        harness.sim.set_price("SOLUSDT", dec!(100.5)).await;
        let close = ExecutionEvent {
            order_type: OrderType::Limit,
            exec_pnl: dec!(1.2),
            closed_size: dec!(3),
            ..exec_event(PositionSide::Long, ExecType::Trade, OrderType::Limit, dec!(1.2), dec!(3))
        };
        let signal = {
            let mut ctx = harness.ctx();
            engine.on_execution(&mut ctx, &close).await.unwrap()
        };
        assert_eq!(signal, EngineSignal::None);

        // Long cleared and reopened; references survive because Short
        // still holds entries; pendings were cancelled.
        assert!(engine.book().count(PositionSide::Long) >= 1);
        assert_eq!(engine.book().reference_qty(0), Some(dec!(1)));
        assert_eq!(engine.book().realized_pnl(PositionSide::Long), dec!(1.2));
        assert!(engine.book().tp_id(PositionSide::Long).is_some());
        // Short max level 0 => reopen to max(0, 0-2) = level 0 only.
        assert_eq!(engine.book().max_level(PositionSide::Long), Some(0));
    }

    #[tokio::test]
    async fn test_s3_liquidation_emergency() {
        let mut harness = Harness::new(dec!(1000)).await;
        let mut engine = engine();
        {
            let mut ctx = harness.ctx();
            engine.open_ladder(&mut ctx, PositionSide::Long, dec!(1)).await.unwrap();
        }
        let bust = exec_event(
            PositionSide::Long,
            ExecType::BustTrade,
            OrderType::Market,
            dec!(-5),
            dec!(1),
        );
        let signal = {
            let mut ctx = harness.ctx();
            engine.on_execution(&mut ctx, &bust).await.unwrap()
        };
        assert_eq!(
            signal,
            EngineSignal::EmergencyStop {
                reason: "Position liquidated".to_string()
            }
        );
        assert!(engine.book().is_empty(PositionSide::Long));
        assert_eq!(engine.book().tp_id(PositionSide::Long), None);
        assert_eq!(engine.book().realized_pnl(PositionSide::Long), dec!(-5));
    }

    #[tokio::test]
    async fn test_duplicate_execution_is_idempotent() {
        let mut harness = Harness::new(dec!(1000)).await;
        let mut engine = engine();
        {
            let mut ctx = harness.ctx();
            engine.open_ladder(&mut ctx, PositionSide::Long, dec!(1)).await.unwrap();
        }
        let close = exec_event(
            PositionSide::Long,
            ExecType::Trade,
            OrderType::Limit,
            dec!(1),
            dec!(1),
        );
        {
            let mut ctx = harness.ctx();
            engine.on_execution(&mut ctx, &close).await.unwrap();
        }
        let pnl_after_first = engine.book().realized_pnl(PositionSide::Long);
        let count_after_first = engine.book().count(PositionSide::Long);
        {
            let mut ctx = harness.ctx();
            engine.on_execution(&mut ctx, &close).await.unwrap();
        }
        assert_eq!(engine.book().realized_pnl(PositionSide::Long), pnl_after_first);
        assert_eq!(engine.book().count(PositionSide::Long), count_after_first);
    }

    #[tokio::test]
    async fn test_funding_execution_is_ignored() {
        let mut harness = Harness::new(dec!(1000)).await;
        let mut engine = engine();
        {
            let mut ctx = harness.ctx();
            engine.open_ladder(&mut ctx, PositionSide::Long, dec!(1)).await.unwrap();
        }
        let funding = exec_event(
            PositionSide::Long,
            ExecType::Funding,
            OrderType::Market,
            dec!(-0.01),
            Decimal::ZERO,
        );
        {
            let mut ctx = harness.ctx();
            engine.on_execution(&mut ctx, &funding).await.unwrap();
        }
        assert_eq!(engine.book().count(PositionSide::Long), 1);
        assert_eq!(engine.book().realized_pnl(PositionSide::Long), Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_max_grid_levels_hard_cap() {
        let mut harness = Harness::new(dec!(100000)).await;
        let mut cfg = strategy_cfg();
        cfg.max_grid_levels_per_side = 2;
        let mut engine = SymbolEngine::new(cfg, instrument(), PositionBook::new("SOLUSDT"))
            .with_executor(LimitEntryExecutor::with_timings(
                Duration::from_millis(50),
                1,
                Duration::from_millis(5),
            ));
        {
            let mut ctx = harness.ctx();
            engine.open_ladder(&mut ctx, PositionSide::Long, dec!(1)).await.unwrap();
        }
        // Two drops of 1%: first averages to level 1, second must be
        // rejected by the cap even though the price condition holds.
        harness.sim.set_price("SOLUSDT", dec!(99)).await;
        {
            let mut ctx = harness.ctx();
            engine.on_price_tick(&mut ctx, dec!(99)).await.unwrap();
        }
        assert_eq!(engine.book().count(PositionSide::Long), 2);
        harness.sim.set_price("SOLUSDT", dec!(97.5)).await;
        {
            let mut ctx = harness.ctx();
            engine.on_price_tick(&mut ctx, dec!(97.5)).await.unwrap();
        }
        assert_eq!(engine.book().count(PositionSide::Long), 2);
    }

    #[tokio::test]
    async fn test_averaging_respects_freeze() {
        let mut harness = Harness::new(dec!(1000)).await;
        let mut engine = engine();
        {
            let mut ctx = harness.ctx();
            engine.open_ladder(&mut ctx, PositionSide::Long, dec!(1)).await.unwrap();
        }
        // Freeze by starving the controller: huge imbalance, no balance.
        harness.risk.update_exposure(SymbolExposure {
            symbol: "SOLUSDT".to_string(),
            long_qty: dec!(100),
            short_qty: Decimal::ZERO,
            long_count: 1,
            short_count: 0,
            price: dec!(100),
            leverage: 100,
        });
        harness.risk.evaluate(dec!(0.5));
        assert!(harness.risk.averaging_frozen());

        harness.sim.set_price("SOLUSDT", dec!(99)).await;
        {
            let mut ctx = harness.ctx();
            engine.on_price_tick(&mut ctx, dec!(99)).await.unwrap();
        }
        assert_eq!(engine.book().count(PositionSide::Long), 1);
    }

    #[tokio::test]
    async fn test_s4_restoration_from_history() {
        let mut harness = Harness::new(dec!(1000)).await;
        harness
            .sim
            .seed_position("SOLUSDT", PositionSide::Long, dec!(3), dec!(99.333))
            .await;
        harness
            .sim
            .seed_history("SOLUSDT", vec![
                HistoricOrder {
                    order_id: "b0".into(),
                    side: OrderSide::Buy,
                    position_idx: 1,
                    qty: dec!(1),
                    avg_price: dec!(100),
                    reduce_only: false,
                    status: OrderStatus::Filled,
                    created_time: Utc::now() - chrono::Duration::seconds(20),
                    updated_time: Utc::now() - chrono::Duration::seconds(19),
                },
                HistoricOrder {
                    order_id: "b1".into(),
                    side: OrderSide::Buy,
                    position_idx: 1,
                    qty: dec!(2),
                    avg_price: dec!(99),
                    reduce_only: false,
                    status: OrderStatus::Filled,
                    created_time: Utc::now() - chrono::Duration::seconds(10),
                    updated_time: Utc::now() - chrono::Duration::seconds(9),
                },
            ])
            .await;
        // The short side is empty on the exchange too: reconcile will open
        // it adaptively after restoring the long.
        let mut engine = engine();
        let outcome = {
            let mut ctx = harness.ctx();
            engine.reconcile(&mut ctx).await.unwrap()
        };
        assert_eq!(outcome, ReconcileOutcome::Synced);
        assert_eq!(engine.book().count(PositionSide::Long), 2);
        assert_eq!(engine.book().reference_qty(0), Some(dec!(1)));
        assert_eq!(engine.book().reference_qty(1), Some(dec!(2)));
        assert!(engine.book().tp_id(PositionSide::Long).is_some());
        // Short opened via adaptive sizing (long max level 1 -> level 0).
        assert!(!engine.book().is_empty(PositionSide::Short));

        // Re-running the procedure against an unchanged exchange leaves
        // the local state exactly where it was.
        let before = engine.book().clone();
        let outcome = {
            let mut ctx = harness.ctx();
            engine.reconcile(&mut ctx).await.unwrap()
        };
        assert_eq!(outcome, ReconcileOutcome::Synced);
        assert_eq!(engine.book(), &before);
    }

    #[tokio::test]
    async fn test_s5_restoration_fallback() {
        let mut harness = Harness::new(dec!(1000)).await;
        harness
            .sim
            .seed_position("SOLUSDT", PositionSide::Long, dec!(0.4), dec!(100.25))
            .await;
        // Only a reduce-only close remains in the window.
        harness
            .sim
            .seed_history("SOLUSDT", vec![HistoricOrder {
                order_id: "tp".into(),
                side: OrderSide::Sell,
                position_idx: 1,
                qty: dec!(0.6),
                avg_price: dec!(100.5),
                reduce_only: true,
                status: OrderStatus::Filled,
                created_time: Utc::now() - chrono::Duration::seconds(10),
                updated_time: Utc::now() - chrono::Duration::seconds(9),
            }])
            .await;
        let mut engine = engine();
        let outcome = {
            let mut ctx = harness.ctx();
            engine.reconcile(&mut ctx).await.unwrap()
        };
        assert_eq!(outcome, ReconcileOutcome::Synced);
        let entries = engine.book().entries(PositionSide::Long);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].quantity, dec!(0.4));
        assert_eq!(entries[0].entry_price, dec!(100.25));
        assert!(engine.book().tp_id(PositionSide::Long).is_some());
    }

    #[tokio::test]
    async fn test_reconcile_mismatch_is_emergency() {
        let mut harness = Harness::new(dec!(1000)).await;
        harness
            .sim
            .seed_position("SOLUSDT", PositionSide::Long, dec!(5), dec!(100))
            .await;
        let mut book = PositionBook::new("SOLUSDT");
        book.append_entry(PositionSide::Long, dec!(100), dec!(1), 0, None, Utc::now());
        // Short side matches (both zero), but Long disagrees 5 vs 1.
        let mut engine = SymbolEngine::new(strategy_cfg(), instrument(), book);
        let outcome = {
            let mut ctx = harness.ctx();
            engine.reconcile(&mut ctx).await.unwrap()
        };
        assert!(matches!(outcome, ReconcileOutcome::EmergencyStop { .. }));
    }

    #[tokio::test]
    async fn test_pending_fill_appends_entry() {
        let mut harness = Harness::new(dec!(1000)).await;
        let mut engine = engine();
        {
            let mut ctx = harness.ctx();
            engine.open_ladder(&mut ctx, PositionSide::Short, dec!(1)).await.unwrap();
        }
        // Track a pending long entry at level 0... level 1 mirrors an
        // averaging; simulate a tracked pending and its fill event.
        engine.book.set_pending(PositionSide::Long, 1, "pend-1".to_string());
        let fill = OrderEvent {
            symbol: "SOLUSDT".to_string(),
            order_id: "pend-1".to_string(),
            status: OrderStatus::Filled,
            side: OrderSide::Buy,
            position_idx: 1,
            qty: dec!(2),
            cum_exec_qty: dec!(2),
            avg_price: dec!(99.99),
            reduce_only: false,
        };
        {
            let mut ctx = harness.ctx();
            engine.on_order_event(&mut ctx, &fill).await.unwrap();
        }
        // Long had no level 0, so the fill lands at the next contiguous
        // level (0) and the TP exists.
        assert_eq!(engine.book().count(PositionSide::Long), 1);
        assert!(engine.book().pending_orders(PositionSide::Long).is_empty());
        assert!(engine.book().tp_id(PositionSide::Long).is_some());
    }

    #[tokio::test]
    async fn test_exchange_cancelled_tp_is_recreated_flag() {
        let mut harness = Harness::new(dec!(1000)).await;
        let mut engine = engine();
        {
            let mut ctx = harness.ctx();
            engine.open_ladder(&mut ctx, PositionSide::Long, dec!(1)).await.unwrap();
        }
        let tp_id = engine.book().tp_id(PositionSide::Long).unwrap().to_string();
        let cancelled = OrderEvent {
            symbol: "SOLUSDT".to_string(),
            order_id: tp_id,
            status: OrderStatus::Cancelled,
            side: OrderSide::Sell,
            position_idx: 1,
            qty: dec!(1),
            cum_exec_qty: Decimal::ZERO,
            avg_price: Decimal::ZERO,
            reduce_only: true,
        };
        {
            let mut ctx = harness.ctx();
            engine.on_order_event(&mut ctx, &cancelled).await.unwrap();
        }
        assert_eq!(engine.book().tp_id(PositionSide::Long), None);
        // ensure_tp re-creates it on the next pass.
        {
            let mut ctx = harness.ctx();
            engine.ensure_tp(&mut ctx).await.unwrap();
        }
        assert!(engine.book().tp_id(PositionSide::Long).is_some());
    }

    #[tokio::test]
    async fn test_rebalance_leg_appends_virtual_entry() {
        let mut harness = Harness::new(dec!(1000)).await;
        let mut engine = engine();
        {
            let mut ctx = harness.ctx();
            engine.open_ladder(&mut ctx, PositionSide::Short, dec!(1)).await.unwrap();
        }
        {
            let mut ctx = harness.ctx();
            engine
                .apply_rebalance_leg(&mut ctx, PositionSide::Long, dec!(2.5))
                .await
                .unwrap();
        }
        assert_eq!(engine.book().total_qty(PositionSide::Long), dec!(2.5));
        // Reference table untouched by rebalance entries beyond the ladder.
        assert_eq!(engine.book().reference_qty(0), Some(dec!(1)));
        assert!(engine.book().tp_id(PositionSide::Long).is_some());
    }
}
