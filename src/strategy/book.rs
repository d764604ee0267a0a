//! Per-symbol position ledger.
//!
//! The book holds the LONG and SHORT grids as ordered entry lists plus the
//! active take-profit order id and pending symmetry orders per side, and
//! the cross-side reference-quantity table that keeps the hedge symmetric.
//!
//! Entries are append-only: fills append, a confirmed full-side close
//! clears the side wholesale. Nothing else mutates the entry list.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::exchange::types::PositionSide;
use crate::utils::decimal::{round_qty_sum, weighted_average_price};

/// One grid fill. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridEntry {
    pub side: PositionSide,
    pub entry_price: Decimal,
    pub quantity: Decimal,
    pub grid_level: u32,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exchange_order_id: Option<String>,
}

/// State of one side of the grid.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SideState {
    entries: Vec<GridEntry>,
    active_tp_order_id: Option<String>,
    /// Symmetry orders waiting on the exchange, keyed by grid level.
    pending_entry_orders: BTreeMap<u32, String>,
}

impl SideState {
    pub fn entries(&self) -> &[GridEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Per-symbol in-memory ledger of both grid sides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionBook {
    pub symbol: String,
    long: SideState,
    short: SideState,
    last_long_entry_price: Option<Decimal>,
    last_short_entry_price: Option<Decimal>,
    /// First fill at a level fixes the quantity for both sides at that
    /// level; wiped only when both sides are simultaneously empty.
    reference_qty_per_level: BTreeMap<u32, Decimal>,
    cumulative_realized_pnl_long: Decimal,
    cumulative_realized_pnl_short: Decimal,
}

impl PositionBook {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            long: SideState::default(),
            short: SideState::default(),
            last_long_entry_price: None,
            last_short_entry_price: None,
            reference_qty_per_level: BTreeMap::new(),
            cumulative_realized_pnl_long: Decimal::ZERO,
            cumulative_realized_pnl_short: Decimal::ZERO,
        }
    }

    fn side(&self, side: PositionSide) -> &SideState {
        match side {
            PositionSide::Long => &self.long,
            PositionSide::Short => &self.short,
        }
    }

    fn side_mut(&mut self, side: PositionSide) -> &mut SideState {
        match side {
            PositionSide::Long => &mut self.long,
            PositionSide::Short => &mut self.short,
        }
    }

    /// Append a confirmed fill. The entry's level must equal the current
    /// entry count so levels stay contiguous (0, 1, 2, ...).
    pub fn append_entry(
        &mut self,
        side: PositionSide,
        price: Decimal,
        qty: Decimal,
        level: u32,
        order_id: Option<String>,
        timestamp: DateTime<Utc>,
    ) {
        debug_assert_eq!(level as usize, self.side(side).entries.len());
        self.side_mut(side).entries.push(GridEntry {
            side,
            entry_price: price,
            quantity: qty,
            grid_level: level,
            timestamp,
            exchange_order_id: order_id,
        });
        match side {
            PositionSide::Long => self.last_long_entry_price = Some(price),
            PositionSide::Short => self.last_short_entry_price = Some(price),
        }
    }

    /// Clear a side after a confirmed full close. TP id and pending
    /// symmetry orders for the side are dropped with it.
    pub fn clear_side(&mut self, side: PositionSide) {
        let state = self.side_mut(side);
        state.entries.clear();
        state.active_tp_order_id = None;
        state.pending_entry_orders.clear();
        match side {
            PositionSide::Long => self.last_long_entry_price = None,
            PositionSide::Short => self.last_short_entry_price = None,
        }
    }

    pub fn entries(&self, side: PositionSide) -> &[GridEntry] {
        &self.side(side).entries
    }

    pub fn count(&self, side: PositionSide) -> u32 {
        self.side(side).entries.len() as u32
    }

    pub fn is_empty(&self, side: PositionSide) -> bool {
        self.side(side).entries.is_empty()
    }

    pub fn both_sides_empty(&self) -> bool {
        self.long.is_empty() && self.short.is_empty()
    }

    /// Total quantity on a side, rounded to 8 dp to absorb drift.
    pub fn total_qty(&self, side: PositionSide) -> Decimal {
        round_qty_sum(
            self.side(side)
                .entries
                .iter()
                .map(|e| e.quantity)
                .sum::<Decimal>(),
        )
    }

    /// Volume-weighted average entry price; zero when the side is empty.
    pub fn average_entry(&self, side: PositionSide) -> Decimal {
        let pairs: Vec<(Decimal, Decimal)> = self
            .side(side)
            .entries
            .iter()
            .map(|e| (e.entry_price, e.quantity))
            .collect();
        weighted_average_price(&pairs)
    }

    pub fn last_entry_price(&self, side: PositionSide) -> Option<Decimal> {
        match side {
            PositionSide::Long => self.last_long_entry_price,
            PositionSide::Short => self.last_short_entry_price,
        }
    }

    /// Highest occupied grid level, `None` when empty.
    pub fn max_level(&self, side: PositionSide) -> Option<u32> {
        self.side(side).entries.last().map(|e| e.grid_level)
    }

    /// True when a fill with this exchange order id is already recorded
    /// on the side; duplicate confirmations key on this.
    pub fn contains_order(&self, side: PositionSide, order_id: &str) -> bool {
        self.side(side)
            .entries
            .iter()
            .any(|e| e.exchange_order_id.as_deref() == Some(order_id))
    }

    // ---- take-profit tracking ----

    pub fn set_tp_id(&mut self, side: PositionSide, id: Option<String>) {
        self.side_mut(side).active_tp_order_id = id;
    }

    pub fn tp_id(&self, side: PositionSide) -> Option<&str> {
        self.side(side).active_tp_order_id.as_deref()
    }

    // ---- pending symmetry orders ----

    pub fn set_pending(&mut self, side: PositionSide, level: u32, order_id: String) {
        self.side_mut(side).pending_entry_orders.insert(level, order_id);
    }

    pub fn remove_pending(&mut self, side: PositionSide, level: u32) -> Option<String> {
        self.side_mut(side).pending_entry_orders.remove(&level)
    }

    pub fn pending_orders(&self, side: PositionSide) -> &BTreeMap<u32, String> {
        &self.side(side).pending_entry_orders
    }

    /// Level of the pending order with this id, if tracked on the side.
    pub fn pending_level_for(&self, side: PositionSide, order_id: &str) -> Option<u32> {
        self.side(side)
            .pending_entry_orders
            .iter()
            .find(|(_, id)| id.as_str() == order_id)
            .map(|(level, _)| *level)
    }

    pub fn clear_pending(&mut self, side: PositionSide) -> Vec<String> {
        let state = self.side_mut(side);
        let ids = state.pending_entry_orders.values().cloned().collect();
        state.pending_entry_orders.clear();
        ids
    }

    // ---- reference quantities ----

    pub fn reference_qty(&self, level: u32) -> Option<Decimal> {
        self.reference_qty_per_level.get(&level).copied()
    }

    /// First writer wins: an existing reference is never overwritten.
    pub fn record_reference_qty(&mut self, level: u32, qty: Decimal) {
        self.reference_qty_per_level.entry(level).or_insert(qty);
    }

    pub fn reference_table(&self) -> &BTreeMap<u32, Decimal> {
        &self.reference_qty_per_level
    }

    /// Wipe references when, and only when, both sides are empty.
    /// Returns true when a wipe happened.
    pub fn clear_reference_qty_if_both_sides_empty(&mut self) -> bool {
        if self.both_sides_empty() && !self.reference_qty_per_level.is_empty() {
            self.reference_qty_per_level.clear();
            true
        } else {
            false
        }
    }

    // ---- realized PnL ledger ----

    pub fn record_realized_pnl(&mut self, side: PositionSide, pnl: Decimal) {
        match side {
            PositionSide::Long => self.cumulative_realized_pnl_long += pnl,
            PositionSide::Short => self.cumulative_realized_pnl_short += pnl,
        }
    }

    pub fn realized_pnl(&self, side: PositionSide) -> Decimal {
        match side {
            PositionSide::Long => self.cumulative_realized_pnl_long,
            PositionSide::Short => self.cumulative_realized_pnl_short,
        }
    }

    pub fn total_realized_pnl(&self) -> Decimal {
        self.cumulative_realized_pnl_long + self.cumulative_realized_pnl_short
    }

    /// Unrealized PnL of a side at `price` (sign follows the side).
    pub fn unrealized_pnl(&self, side: PositionSide, price: Decimal) -> Decimal {
        let qty = self.total_qty(side);
        if qty == Decimal::ZERO {
            return Decimal::ZERO;
        }
        let avg = self.average_entry(side);
        match side {
            PositionSide::Long => (price - avg) * qty,
            PositionSide::Short => (avg - price) * qty,
        }
    }
}
