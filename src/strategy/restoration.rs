//! Grid reconstruction from exchange order history.
//!
//! After a restart the exchange holds the truth. A side with exchange
//! quantity but no local entries is rebuilt from filled order history:
//! everything after the side's last reduce-only close, in chronological
//! order, maps one-to-one onto grid levels.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::QTY_MATCH_TOLERANCE;
use crate::exchange::types::{HistoricOrder, OrderStatus, PositionSide};

/// One reconstructed grid entry.
#[derive(Debug, Clone, PartialEq)]
pub struct RestoredEntry {
    pub level: u32,
    pub qty: Decimal,
    pub price: Decimal,
    pub order_id: String,
    /// Fill time (`updated_time`); ordering used `created_time`.
    pub timestamp: DateTime<Utc>,
}

/// Outcome of reconstructing one side.
#[derive(Debug, Clone, PartialEq)]
pub enum RestorePlan {
    /// History explained the exchange quantity; restore these levels.
    Entries(Vec<RestoredEntry>),
    /// History under-explains the position (truncated window or fills
    /// newer than the snapshot); the caller must re-run the procedure.
    NeedsResync {
        restored_qty: Decimal,
        exchange_qty: Decimal,
    },
    /// No opening orders survive in the window (TP partially closed the
    /// position and the rest scrolled out): restore as one level-0 entry
    /// at the exchange average price.
    Fallback { qty: Decimal, price: Decimal },
}

#[derive(Debug, Error, PartialEq)]
pub enum RestoreError {
    /// More quantity reconstructed than the exchange reports; the local
    /// view cannot be trusted and requires manual intervention.
    #[error("restored more than exchange: restored {restored_qty}, exchange {exchange_qty}")]
    RestoredMoreThanExchange {
        restored_qty: Decimal,
        exchange_qty: Decimal,
    },
}

/// Reconstruct the grid levels of `side` from filled history.
///
/// `history` may arrive in any order; `exchange_qty` and `exchange_avg`
/// come from the positions snapshot taken in the same pass.
pub fn reconstruct_side(
    history: &[HistoricOrder],
    side: PositionSide,
    exchange_qty: Decimal,
    exchange_avg: Decimal,
) -> Result<RestorePlan, RestoreError> {
    // Filled orders of this side's position index, oldest first.
    let mut orders: Vec<&HistoricOrder> = history
        .iter()
        .filter(|o| o.status == OrderStatus::Filled && o.position_idx == side.position_idx())
        .collect();
    orders.sort_by_key(|o| o.created_time);

    // The last reduce-only order with the opposite order side is the last
    // TP close of this side; only opens after it belong to the live grid.
    let boundary = orders
        .iter()
        .rposition(|o| o.reduce_only && o.side == side.close_order_side());

    let opens = match boundary {
        Some(t) => &orders[t + 1..],
        None => &orders[..],
    };

    let mut entries = Vec::new();
    let mut restored_qty = Decimal::ZERO;
    for order in opens {
        if order.reduce_only || order.side != side.open_order_side() {
            continue;
        }
        restored_qty += order.qty;
        entries.push(RestoredEntry {
            level: entries.len() as u32,
            qty: order.qty,
            price: order.avg_price,
            order_id: order.order_id.clone(),
            timestamp: order.updated_time,
        });
    }

    if entries.is_empty() && exchange_qty > Decimal::ZERO {
        warn!(
            "⚠️  no opening orders in history window for {side}; falling back to a single level-0 entry of {exchange_qty} @ {exchange_avg}"
        );
        return Ok(RestorePlan::Fallback {
            qty: exchange_qty,
            price: exchange_avg,
        });
    }

    let diff = restored_qty - exchange_qty;
    if diff > QTY_MATCH_TOLERANCE {
        return Err(RestoreError::RestoredMoreThanExchange {
            restored_qty,
            exchange_qty,
        });
    }
    if diff < -QTY_MATCH_TOLERANCE {
        debug!(
            "restoration under-explains {side}: restored {restored_qty} vs exchange {exchange_qty}"
        );
        return Ok(RestorePlan::NeedsResync {
            restored_qty,
            exchange_qty,
        });
    }

    debug!(
        "restored {} grid levels for {side} totalling {restored_qty}",
        entries.len()
    );
    Ok(RestorePlan::Entries(entries))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::types::OrderSide;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn order(
        id: &str,
        side: OrderSide,
        position_idx: u8,
        qty: Decimal,
        price: Decimal,
        reduce_only: bool,
        created_s: i64,
    ) -> HistoricOrder {
        HistoricOrder {
            order_id: id.to_string(),
            side,
            position_idx,
            qty,
            avg_price: price,
            reduce_only,
            status: OrderStatus::Filled,
            created_time: Utc.timestamp_opt(created_s, 0).unwrap(),
            updated_time: Utc.timestamp_opt(created_s + 1, 0).unwrap(),
        }
    }

    #[test]
    fn test_two_level_reconstruction() {
        // Exchange shows Long 3.0 @ 99.333; history has Buy 1 @ 100 then
        // Buy 2 @ 99, no reduce-only Sell in the window.
        let history = vec![
            order("b0", OrderSide::Buy, 1, dec!(1), dec!(100), false, 100),
            order("b1", OrderSide::Buy, 1, dec!(2), dec!(99), false, 200),
        ];
        let plan =
            reconstruct_side(&history, PositionSide::Long, dec!(3), dec!(99.333)).unwrap();
        let RestorePlan::Entries(entries) = plan else {
            panic!("expected entries, got {plan:?}");
        };
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].level, 0);
        assert_eq!(entries[0].qty, dec!(1));
        assert_eq!(entries[0].price, dec!(100));
        assert_eq!(entries[1].level, 1);
        assert_eq!(entries[1].qty, dec!(2));
    }

    #[test]
    fn test_tp_boundary_cuts_older_opens() {
        // A reduce-only Sell closes the old Long grid; only the Buy after
        // it belongs to the live position.
        let history = vec![
            order("b0", OrderSide::Buy, 1, dec!(1), dec!(100), false, 100),
            order("b1", OrderSide::Buy, 1, dec!(2), dec!(99), false, 200),
            order("tp", OrderSide::Sell, 1, dec!(3), dec!(101), true, 300),
            order("b2", OrderSide::Buy, 1, dec!(1), dec!(102), false, 400),
        ];
        let plan =
            reconstruct_side(&history, PositionSide::Long, dec!(1), dec!(102)).unwrap();
        let RestorePlan::Entries(entries) = plan else {
            panic!("expected entries");
        };
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].order_id, "b2");
        assert_eq!(entries[0].level, 0);
    }

    #[test]
    fn test_other_side_orders_ignored() {
        let history = vec![
            order("s0", OrderSide::Sell, 2, dec!(5), dec!(100), false, 50),
            order("b0", OrderSide::Buy, 1, dec!(1), dec!(100), false, 100),
        ];
        let plan =
            reconstruct_side(&history, PositionSide::Long, dec!(1), dec!(100)).unwrap();
        let RestorePlan::Entries(entries) = plan else {
            panic!("expected entries");
        };
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].order_id, "b0");
    }

    #[test]
    fn test_unsorted_history_is_ordered_by_created_time() {
        let history = vec![
            order("b1", OrderSide::Buy, 1, dec!(2), dec!(99), false, 200),
            order("b0", OrderSide::Buy, 1, dec!(1), dec!(100), false, 100),
        ];
        let plan =
            reconstruct_side(&history, PositionSide::Long, dec!(3), dec!(99.333)).unwrap();
        let RestorePlan::Entries(entries) = plan else {
            panic!("expected entries");
        };
        assert_eq!(entries[0].order_id, "b0");
        assert_eq!(entries[1].order_id, "b1");
    }

    #[test]
    fn test_under_explained_signals_resync() {
        let history = vec![order("b0", OrderSide::Buy, 1, dec!(1), dec!(100), false, 100)];
        let plan = reconstruct_side(&history, PositionSide::Long, dec!(3), dec!(99.5)).unwrap();
        assert_eq!(
            plan,
            RestorePlan::NeedsResync {
                restored_qty: dec!(1),
                exchange_qty: dec!(3),
            }
        );
    }

    #[test]
    fn test_over_explained_is_fatal() {
        let history = vec![order("b0", OrderSide::Buy, 1, dec!(5), dec!(100), false, 100)];
        let err = reconstruct_side(&history, PositionSide::Long, dec!(3), dec!(99.5)).unwrap_err();
        assert_eq!(
            err,
            RestoreError::RestoredMoreThanExchange {
                restored_qty: dec!(5),
                exchange_qty: dec!(3),
            }
        );
    }

    #[test]
    fn test_fallback_single_entry_after_partial_close() {
        // TP closed part of the position and the remaining opens scrolled
        // out of the window: only the reduce-only close remains.
        let history = vec![order("tp", OrderSide::Sell, 1, dec!(0.6), dec!(100.5), true, 100)];
        let plan =
            reconstruct_side(&history, PositionSide::Long, dec!(0.4), dec!(100.25)).unwrap();
        assert_eq!(
            plan,
            RestorePlan::Fallback {
                qty: dec!(0.4),
                price: dec!(100.25),
            }
        );
    }

    #[test]
    fn test_tolerance_accepts_small_drift() {
        let history = vec![order("b0", OrderSide::Buy, 1, dec!(1.0005), dec!(100), false, 100)];
        let plan = reconstruct_side(&history, PositionSide::Long, dec!(1), dec!(100)).unwrap();
        assert!(matches!(plan, RestorePlan::Entries(_)));
    }

    #[test]
    fn test_short_side_uses_sell_opens_and_buy_closes() {
        let history = vec![
            order("s0", OrderSide::Sell, 2, dec!(1), dec!(100), false, 100),
            order("tp", OrderSide::Buy, 2, dec!(1), dec!(99), true, 200),
            order("s1", OrderSide::Sell, 2, dec!(2), dec!(101), false, 300),
        ];
        let plan =
            reconstruct_side(&history, PositionSide::Short, dec!(2), dec!(101)).unwrap();
        let RestorePlan::Entries(entries) = plan else {
            panic!("expected entries");
        };
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].order_id, "s1");
    }
}
