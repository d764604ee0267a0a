//! Per-account analytics writers.
//!
//! Two append-only CSV files per account: a trades history (every open,
//! close, restoration and balance checkpoint) and periodic performance
//! snapshots taken once per sync cycle.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::Serialize;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::config::ACCOUNT_ID_PADDING;
use crate::utils::time::now_helsinki_iso;

/// What a trades-history row records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeAction {
    Open,
    Close,
    Balance,
    Restore,
}

#[derive(Debug, Clone, Serialize)]
pub struct TradeRecord {
    pub timestamp: String,
    pub symbol: String,
    pub side: String,
    pub action: TradeAction,
    pub price: Decimal,
    pub quantity: Decimal,
    pub reason: String,
    pub pnl: Decimal,
    pub open_fee: Decimal,
    pub close_fee: Decimal,
    pub funding_fee: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct PerformanceRecord {
    pub timestamp: String,
    pub symbol: String,
    pub price: Decimal,
    pub long_positions: u32,
    pub short_positions: u32,
    pub long_qty: Decimal,
    pub short_qty: Decimal,
    pub long_pnl: Decimal,
    pub short_pnl: Decimal,
    pub total_pnl: Decimal,
    pub total_trades: u64,
    pub balance: Decimal,
}

/// Append-only CSV writers for one account.
#[derive(Debug)]
pub struct AnalyticsWriter {
    trades_path: PathBuf,
    metrics_path: PathBuf,
    total_trades: u64,
}

impl AnalyticsWriter {
    pub fn open(data_dir: impl AsRef<Path>, account_id: u16) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("creating {}", data_dir.display()))?;
        let prefix = format!("{:0width$}", account_id, width = ACCOUNT_ID_PADDING);
        Ok(Self {
            trades_path: data_dir.join(format!("{prefix}_trades_history.csv")),
            metrics_path: data_dir.join(format!("{prefix}_performance_metrics.csv")),
            total_trades: 0,
        })
    }

    /// Record an OPEN/CLOSE/RESTORE/BALANCE row. OPEN and CLOSE rows bump
    /// the trade counter reported by performance snapshots.
    pub fn record_trade(&mut self, record: &TradeRecord) -> Result<()> {
        if matches!(record.action, TradeAction::Open | TradeAction::Close) {
            self.total_trades += 1;
        }
        append_row(&self.trades_path, record)?;
        debug!(
            "📒 [{}] trade row: {:?} {} {} @ {}",
            record.symbol, record.action, record.side, record.quantity, record.price
        );
        Ok(())
    }

    pub fn record_performance(&mut self, mut record: PerformanceRecord) -> Result<()> {
        record.total_trades = self.total_trades;
        append_row(&self.metrics_path, &record)
    }

    pub fn total_trades(&self) -> u64 {
        self.total_trades
    }

    /// Convenience constructor stamping the current account-zone time.
    pub fn trade_row(
        symbol: &str,
        side: &str,
        action: TradeAction,
        price: Decimal,
        quantity: Decimal,
        reason: &str,
    ) -> TradeRecord {
        TradeRecord {
            timestamp: now_helsinki_iso(),
            symbol: symbol.to_string(),
            side: side.to_string(),
            action,
            price,
            quantity,
            reason: reason.to_string(),
            pnl: Decimal::ZERO,
            open_fee: Decimal::ZERO,
            close_fee: Decimal::ZERO,
            funding_fee: Decimal::ZERO,
        }
    }
}

fn append_row<T: Serialize>(path: &Path, row: &T) -> Result<()> {
    let write_header = !path.exists();
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening {}", path.display()))?;
    let mut writer = csv::WriterBuilder::new()
        .has_headers(write_header)
        .from_writer(file);
    writer
        .serialize(row)
        .with_context(|| format!("appending to {}", path.display()))?;
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_trade_rows_append_with_single_header() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = AnalyticsWriter::open(dir.path(), 1).unwrap();

        let mut row = AnalyticsWriter::trade_row(
            "SOLUSDT",
            "LONG",
            TradeAction::Open,
            dec!(100),
            dec!(1),
            "initial entry",
        );
        writer.record_trade(&row).unwrap();
        row.action = TradeAction::Close;
        row.pnl = dec!(1.07);
        writer.record_trade(&row).unwrap();

        let contents =
            std::fs::read_to_string(dir.path().join("001_trades_history.csv")).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("timestamp,symbol,side,action,price,quantity,reason"));
        assert!(lines[1].contains("OPEN"));
        assert!(lines[2].contains("CLOSE"));
        assert_eq!(writer.total_trades(), 2);
    }

    #[test]
    fn test_balance_rows_do_not_count_as_trades() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = AnalyticsWriter::open(dir.path(), 2).unwrap();
        let row = AnalyticsWriter::trade_row(
            "SOLUSDT",
            "",
            TradeAction::Balance,
            Decimal::ZERO,
            Decimal::ZERO,
            "sync cycle",
        );
        writer.record_trade(&row).unwrap();
        assert_eq!(writer.total_trades(), 0);
    }

    #[test]
    fn test_performance_snapshot_row() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = AnalyticsWriter::open(dir.path(), 3).unwrap();
        writer
            .record_performance(PerformanceRecord {
                timestamp: now_helsinki_iso(),
                symbol: "SOLUSDT".to_string(),
                price: dec!(100),
                long_positions: 2,
                short_positions: 1,
                long_qty: dec!(3),
                short_qty: dec!(1),
                long_pnl: dec!(-0.5),
                short_pnl: dec!(0.2),
                total_pnl: dec!(-0.3),
                total_trades: 0,
                balance: dec!(1000),
            })
            .unwrap();

        let contents =
            std::fs::read_to_string(dir.path().join("003_performance_metrics.csv")).unwrap();
        assert!(contents.starts_with("timestamp,symbol,price,long_positions"));
        assert!(contents.contains("SOLUSDT"));
    }
}
