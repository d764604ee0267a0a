//! Process-local cache of the account wallet.
//!
//! Seeded once over REST at startup; afterwards the wallet stream is the
//! only writer. All symbol engines in the account read the same snapshot.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::exchange::types::WalletSnapshot;

#[derive(Debug, Clone)]
pub struct BalanceCache {
    snapshot: WalletSnapshot,
    last_update: Option<DateTime<Utc>>,
}

impl BalanceCache {
    pub fn new() -> Self {
        Self {
            snapshot: WalletSnapshot::default(),
            last_update: None,
        }
    }

    /// One-time REST seed before the wallet stream takes over.
    pub fn seed(&mut self, snapshot: WalletSnapshot) {
        self.snapshot = snapshot;
        self.last_update = Some(Utc::now());
    }

    /// Wallet-stream update; the only writer after seeding.
    pub fn apply(&mut self, snapshot: WalletSnapshot) {
        self.snapshot = snapshot;
        self.last_update = Some(Utc::now());
    }

    pub fn snapshot(&self) -> WalletSnapshot {
        self.snapshot
    }

    pub fn available_balance(&self) -> Decimal {
        self.snapshot.available_balance
    }

    pub fn mm_rate_pct(&self) -> Decimal {
        self.snapshot.mm_rate_pct
    }

    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.last_update
    }
}

impl Default for BalanceCache {
    fn default() -> Self {
        Self::new()
    }
}
