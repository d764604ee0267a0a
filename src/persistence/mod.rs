//! Durable account state.
//!
//! Each account persists every symbol's position book into
//! `data/{id:03}_bot_state.json`, keyed by symbol. The file is rewritten
//! atomically (write-then-rename) so a crash can never leave a torn image,
//! and every book mutation is persisted before the next external effect.

pub mod analytics;

use anyhow::{Context, Result};
use chrono::DateTime;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::ACCOUNT_ID_PADDING;
use crate::exchange::types::PositionSide;
use crate::strategy::book::PositionBook;
use crate::utils::time::{helsinki_iso, now_helsinki_iso};

/// One grid entry as stored on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedEntry {
    pub side: PositionSide,
    pub entry_price: Decimal,
    pub quantity: Decimal,
    pub grid_level: u32,
    /// ISO-8601, account zone.
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
}

/// One symbol's persisted state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedSymbolState {
    pub timestamp: String,
    pub long_positions: Vec<PersistedEntry>,
    pub short_positions: Vec<PersistedEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub long_tp_order_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub short_tp_order_id: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub reference_qty_per_level: BTreeMap<u32, Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cumulative_realized_pnl: Option<RealizedPnl>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RealizedPnl {
    pub long: Decimal,
    pub short: Decimal,
}

/// Durable, crash-safe store of every symbol book in one account.
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    state: BTreeMap<String, PersistedSymbolState>,
}

impl StateStore {
    /// Open (or create) the account's state file and load its contents.
    pub fn open(data_dir: impl AsRef<Path>, account_id: u16) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        fs::create_dir_all(data_dir)
            .with_context(|| format!("creating {}", data_dir.display()))?;
        let path = data_dir.join(format!(
            "{:0width$}_bot_state.json",
            account_id,
            width = ACCOUNT_ID_PADDING
        ));

        let state = if path.exists() {
            let raw = fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            match serde_json::from_str(&raw) {
                Ok(parsed) => {
                    info!("📂 State loaded from {}", path.display());
                    parsed
                }
                Err(e) => {
                    warn!("⚠️  State file {} unreadable ({e}); starting empty", path.display());
                    BTreeMap::new()
                }
            }
        } else {
            info!("📂 No saved state at {}; starting fresh", path.display());
            BTreeMap::new()
        };

        Ok(Self { path, state })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist one book; the whole file is rewritten atomically.
    pub fn persist_book(&mut self, book: &PositionBook) -> Result<()> {
        self.state
            .insert(book.symbol.clone(), snapshot_from_book(book));
        self.flush()
    }

    /// Reconstruct a book for `symbol` from the loaded state, if present.
    pub fn load_book(&self, symbol: &str) -> Option<PositionBook> {
        self.state.get(symbol).map(|s| book_from_snapshot(symbol, s))
    }

    pub fn symbols(&self) -> impl Iterator<Item = &str> {
        self.state.keys().map(String::as_str)
    }

    pub fn symbol_state(&self, symbol: &str) -> Option<&PersistedSymbolState> {
        self.state.get(symbol)
    }

    fn flush(&self) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.state)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("renaming {} -> {}", tmp.display(), self.path.display()))?;
        debug!("💾 State saved to {}", self.path.display());
        Ok(())
    }
}

fn persist_entries(entries: &[crate::strategy::book::GridEntry]) -> Vec<PersistedEntry> {
    entries
        .iter()
        .map(|e| PersistedEntry {
            side: e.side,
            entry_price: e.entry_price,
            quantity: e.quantity,
            grid_level: e.grid_level,
            timestamp: helsinki_iso(e.timestamp),
            order_id: e.exchange_order_id.clone(),
        })
        .collect()
}

fn snapshot_from_book(book: &PositionBook) -> PersistedSymbolState {
    PersistedSymbolState {
        timestamp: now_helsinki_iso(),
        long_positions: persist_entries(book.entries(PositionSide::Long)),
        short_positions: persist_entries(book.entries(PositionSide::Short)),
        long_tp_order_id: book.tp_id(PositionSide::Long).map(str::to_string),
        short_tp_order_id: book.tp_id(PositionSide::Short).map(str::to_string),
        reference_qty_per_level: book.reference_table().clone(),
        cumulative_realized_pnl: Some(RealizedPnl {
            long: book.realized_pnl(PositionSide::Long),
            short: book.realized_pnl(PositionSide::Short),
        }),
    }
}

fn book_from_snapshot(symbol: &str, state: &PersistedSymbolState) -> PositionBook {
    let mut book = PositionBook::new(symbol);
    for (side, entries) in [
        (PositionSide::Long, &state.long_positions),
        (PositionSide::Short, &state.short_positions),
    ] {
        for entry in entries.iter() {
            let ts = DateTime::parse_from_rfc3339(&entry.timestamp)
                .map(|dt| dt.with_timezone(&chrono::Utc))
                .unwrap_or_else(|_| chrono::Utc::now());
            book.append_entry(
                side,
                entry.entry_price,
                entry.quantity,
                entry.grid_level,
                entry.order_id.clone(),
                ts,
            );
        }
    }
    book.set_tp_id(PositionSide::Long, state.long_tp_order_id.clone());
    book.set_tp_id(PositionSide::Short, state.short_tp_order_id.clone());
    for (level, qty) in &state.reference_qty_per_level {
        book.record_reference_qty(*level, *qty);
    }
    if let Some(pnl) = state.cumulative_realized_pnl {
        book.record_realized_pnl(PositionSide::Long, pnl.long);
        book.record_realized_pnl(PositionSide::Short, pnl.short);
    }
    book
}
