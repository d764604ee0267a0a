//! Grid strategy implementation.
//!
//! Contains the core logic for:
//! - The dual-sided position book and reference quantities
//! - The per-symbol state machine (averaging, take-profit, reopen)
//! - Grid reconstruction from exchange order history
//! - Limit-first order execution

pub mod book;
pub mod engine;
pub mod entry;
pub mod restoration;

pub use book::{GridEntry, PositionBook, SideState};
pub use engine::{EngineContext, EngineSignal, ReconcileOutcome, SymbolEngine};
pub use entry::LimitEntryExecutor;
