//! Cross-symbol risk supervisor.
//!
//! Runs on every price tick and after every book mutation. Owns the
//! account-wide exposure cache, the dynamic safety reserve, the
//! freeze/panic state machine and the adaptive rebalancing planner. The
//! controller only decides; the account supervisor executes its plans.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::config::{ATR_DEFAULT_PCT, PRICE_HISTORY_LEN, WARN_THROTTLE};
use crate::exchange::types::{PositionSide, WalletSnapshot};

/// Available-margin fraction below which the IM status log warns.
pub const IM_WARNING_PCT: Decimal = dec!(30);
/// Available-margin fraction below which the IM status log escalates.
pub const IM_ERROR_PCT: Decimal = dec!(15);

/// Per-symbol quantities the controller reasons over; refreshed by the
/// supervisor after every book mutation and price tick.
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolExposure {
    pub symbol: String,
    pub long_qty: Decimal,
    pub short_qty: Decimal,
    pub long_count: u32,
    pub short_count: u32,
    pub price: Decimal,
    pub leverage: u32,
}

impl SymbolExposure {
    pub fn imbalance_qty(&self) -> Decimal {
        (self.long_qty - self.short_qty).abs()
    }

    /// Margin needed to fully rebalance this symbol's imbalance.
    pub fn rebalance_margin(&self) -> Decimal {
        if self.leverage == 0 {
            return Decimal::ZERO;
        }
        self.imbalance_qty() * self.price / Decimal::from(self.leverage)
    }

    /// The side with less quantity; `None` when balanced.
    pub fn lagging_side(&self) -> Option<PositionSide> {
        if self.long_qty < self.short_qty {
            Some(PositionSide::Long)
        } else if self.short_qty < self.long_qty {
            Some(PositionSide::Short)
        } else {
            None
        }
    }

    /// The side that has averaged more; `None` when counts are equal.
    pub fn trend_side(&self) -> Option<PositionSide> {
        if self.long_count > self.short_count {
            Some(PositionSide::Long)
        } else if self.short_count > self.long_count {
            Some(PositionSide::Short)
        } else {
            None
        }
    }
}

/// Candidate operation submitted to the reserve pre-check.
#[derive(Debug, Clone)]
pub struct ReserveProbe {
    pub symbol: String,
    pub side: PositionSide,
    pub candidate_qty: Decimal,
    pub candidate_margin: Decimal,
}

/// Outcome of a reserve pre-check.
#[derive(Debug, Clone, PartialEq)]
pub struct ReserveDecision {
    pub approved: bool,
    pub available_after: Decimal,
    pub cost_to_balance_after: Decimal,
}

/// One market order the rebalancer wants executed.
#[derive(Debug, Clone, PartialEq)]
pub struct RebalanceLeg {
    pub symbol: String,
    pub side: PositionSide,
    pub qty: Decimal,
}

/// Full rebalance plan across the account.
#[derive(Debug, Clone, PartialEq)]
pub struct RebalancePlan {
    pub scale: Decimal,
    pub legs: Vec<RebalanceLeg>,
    /// Balance below $1: nothing can be done, log and abort.
    pub critical: bool,
}

/// Initial-margin headroom snapshot: what remains tradable once the
/// safety reserve is withheld from the free balance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImStatus {
    pub total_balance: Decimal,
    pub total_initial_margin: Decimal,
    pub total_maintenance_margin: Decimal,
    pub account_mm_rate_pct: Decimal,
    pub safety_reserve: Decimal,
    pub available_for_trading: Decimal,
    /// Available-for-trading as a fraction of total equity (balance + IM).
    pub available_percent: Decimal,
}

/// Escalation band for the IM status log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImBand {
    Normal,
    LowMargin,
    CriticallyLow,
    /// `available_for_trading` went negative: the reserve is breached.
    ReserveBreached,
}

impl ImStatus {
    pub fn band(&self) -> ImBand {
        if self.available_for_trading < Decimal::ZERO {
            ImBand::ReserveBreached
        } else if self.available_percent < IM_ERROR_PCT {
            ImBand::CriticallyLow
        } else if self.available_percent < IM_WARNING_PCT {
            ImBand::LowMargin
        } else {
            ImBand::Normal
        }
    }
}

/// Decisions the supervisor must act on after a tick evaluation.
#[derive(Debug, Clone)]
pub enum RiskDirective {
    /// Entered panic: execute the rebalance plan and cancel the trend-side
    /// TPs listed (counter-trend TPs stay as natural exits).
    EnterPanic {
        reason: String,
        rebalance: RebalancePlan,
        cancel_tp: Vec<(String, PositionSide)>,
    },
    /// Panic cleared: re-create a TP on every side holding positions
    /// without a live one.
    ExitPanic,
}

struct LogThrottle {
    last: Option<Instant>,
    interval: Duration,
}

impl LogThrottle {
    fn new(interval: Duration) -> Self {
        Self { last: None, interval }
    }

    fn ready(&mut self) -> bool {
        match self.last {
            Some(t) if t.elapsed() < self.interval => false,
            _ => {
                self.last = Some(Instant::now());
                true
            }
        }
    }
}

/// Per-account risk controller.
pub struct RiskController {
    buffer_pct: Decimal,
    exposures: BTreeMap<String, SymbolExposure>,
    price_history: BTreeMap<String, VecDeque<Decimal>>,
    averaging_frozen: bool,
    freeze_reason: Option<String>,
    panic_mode: bool,
    panic_reason: Option<String>,
    panic_entered_at: Option<DateTime<Utc>>,
    reserve_skip_throttle: LogThrottle,
}

impl RiskController {
    pub fn new(balance_buffer_percent: Decimal) -> Self {
        Self {
            buffer_pct: balance_buffer_percent,
            exposures: BTreeMap::new(),
            price_history: BTreeMap::new(),
            averaging_frozen: false,
            freeze_reason: None,
            panic_mode: false,
            panic_reason: None,
            panic_entered_at: None,
            reserve_skip_throttle: LogThrottle::new(WARN_THROTTLE),
        }
    }

    pub fn averaging_frozen(&self) -> bool {
        self.averaging_frozen
    }

    pub fn panic_mode(&self) -> bool {
        self.panic_mode
    }

    pub fn panic_entered_at(&self) -> Option<DateTime<Utc>> {
        self.panic_entered_at
    }

    pub fn exposures(&self) -> impl Iterator<Item = &SymbolExposure> {
        self.exposures.values()
    }

    /// Refresh the exposure cache after a book mutation.
    pub fn update_exposure(&mut self, exposure: SymbolExposure) {
        self.exposures.insert(exposure.symbol.clone(), exposure);
    }

    /// Push a tick into the ring buffer and the exposure cache.
    pub fn record_price(&mut self, symbol: &str, price: Decimal) {
        let history = self.price_history.entry(symbol.to_string()).or_default();
        history.push_back(price);
        while history.len() > PRICE_HISTORY_LEN {
            history.pop_front();
        }
        if let Some(exposure) = self.exposures.get_mut(symbol) {
            exposure.price = price;
        }
    }

    /// Mean absolute tick-to-tick move over the ring buffer, as a percent
    /// of the current price. Defaults until two samples exist.
    pub fn atr_pct(&self, symbol: &str) -> Decimal {
        let Some(history) = self.price_history.get(symbol) else {
            return ATR_DEFAULT_PCT;
        };
        if history.len() < 2 {
            return ATR_DEFAULT_PCT;
        }
        let current = *history.back().unwrap_or(&Decimal::ONE);
        if current == Decimal::ZERO {
            return ATR_DEFAULT_PCT;
        }
        let mut sum = Decimal::ZERO;
        let mut prev: Option<Decimal> = None;
        for price in history {
            if let Some(p) = prev {
                sum += (*price - p).abs();
            }
            prev = Some(*price);
        }
        let mean = sum / Decimal::from(history.len() as u64 - 1);
        mean / current * dec!(100)
    }

    /// Volatility- and tier-aware multiplier applied to the base reserve:
    /// 10% base (fees, rounding) + ATR-banded gap (slippage) + 5% tier
    /// (cross-margin tier non-linearity).
    pub fn safety_factor(&self) -> Decimal {
        let worst_atr = self
            .exposures
            .keys()
            .map(|s| self.atr_pct(s))
            .max()
            .unwrap_or(ATR_DEFAULT_PCT);
        let gap = if worst_atr < dec!(1) {
            dec!(0.02)
        } else if worst_atr < dec!(2) {
            dec!(0.05)
        } else {
            dec!(0.10)
        };
        dec!(0.10) + gap + dec!(0.05)
    }

    /// Margin needed to rebalance every symbol's current imbalance.
    pub fn base_reserve(&self) -> Decimal {
        self.exposures.values().map(|e| e.rebalance_margin()).sum()
    }

    /// Safety reserve withheld from the free balance when reporting
    /// tradable headroom.
    pub fn final_reserve(&self) -> Decimal {
        self.base_reserve() * (Decimal::ONE + self.safety_factor())
    }

    /// Initial-margin monitoring: `totalAvailableBalance` already has IM
    /// subtracted by the exchange, so only the safety reserve comes off
    /// here. The percentage is taken against total equity (balance + IM).
    pub fn im_status(&self, wallet: WalletSnapshot) -> ImStatus {
        let safety_reserve = self.final_reserve();
        let available_for_trading = wallet.available_balance - safety_reserve;
        let available_percent = if wallet.available_balance > Decimal::ZERO {
            let total_equity = wallet.available_balance + wallet.initial_margin;
            available_for_trading / total_equity * dec!(100)
        } else {
            Decimal::ZERO
        };
        ImStatus {
            total_balance: wallet.available_balance,
            total_initial_margin: wallet.initial_margin,
            total_maintenance_margin: wallet.maintenance_margin,
            account_mm_rate_pct: wallet.mm_rate_pct,
            safety_reserve,
            available_for_trading,
            available_percent,
        }
    }

    fn buffer_multiplier(&self) -> Decimal {
        Decimal::ONE + self.buffer_pct / dec!(100)
    }

    /// Cost to rebalance all imbalances with the candidate applied, times
    /// the balance buffer.
    fn cost_to_balance_with(&self, probe: Option<&ReserveProbe>) -> Decimal {
        let mut cost = Decimal::ZERO;
        for exposure in self.exposures.values() {
            let mut sim = exposure.clone();
            if let Some(p) = probe {
                if p.symbol == sim.symbol {
                    match p.side {
                        PositionSide::Long => sim.long_qty += p.candidate_qty,
                        PositionSide::Short => sim.short_qty += p.candidate_qty,
                    }
                }
            }
            cost += sim.rebalance_margin();
        }
        cost * self.buffer_multiplier()
    }

    /// Pre-check required before any averaging or reopen. Simulates the
    /// candidate and demands the remaining balance still cover a full
    /// rebalance plus buffer. Unconditionally rejects while frozen.
    pub fn check_reserve(&mut self, probe: &ReserveProbe, available: Decimal) -> ReserveDecision {
        if self.averaging_frozen {
            if self.reserve_skip_throttle.ready() {
                warn!(
                    "🧊 [{}] averaging frozen ({}); {} {} skipped",
                    probe.symbol,
                    self.freeze_reason.as_deref().unwrap_or("unknown"),
                    probe.side,
                    probe.candidate_qty
                );
            }
            return ReserveDecision {
                approved: false,
                available_after: available - probe.candidate_margin,
                cost_to_balance_after: self.cost_to_balance_with(Some(probe)),
            };
        }

        let cost_to_balance_after = self.cost_to_balance_with(Some(probe));
        let available_after = available - probe.candidate_margin;
        let approved = available_after >= cost_to_balance_after;
        if !approved && self.reserve_skip_throttle.ready() {
            warn!(
                "⚠️  [{}] insufficient reserve for {} {}: need ${:.2} after, have ${:.2}",
                probe.symbol, probe.side, probe.candidate_qty, cost_to_balance_after, available_after
            );
        }
        ReserveDecision {
            approved,
            available_after,
            cost_to_balance_after,
        }
    }

    /// The LOW_IM trigger: the free balance cannot cover the buffered cost
    /// of rebalancing the current imbalances.
    pub fn panic_predicate(&self, available: Decimal) -> bool {
        let needed = self.cost_to_balance_with(None);
        needed > Decimal::ZERO && available < needed
    }

    /// Tick-time evaluation of freeze/panic transitions. Early Freeze uses
    /// the panic predicate; only the actions differ.
    pub fn evaluate(&mut self, available: Decimal) -> Vec<RiskDirective> {
        let triggered = self.panic_predicate(available);
        let mut directives = Vec::new();

        if triggered {
            if !self.averaging_frozen {
                self.averaging_frozen = true;
                self.freeze_reason = Some("LOW_IM: balance below rebalance cost".to_string());
                warn!(
                    "🧊 EARLY FREEZE activated: available ${:.2} < rebalance cost ${:.2}",
                    available,
                    self.cost_to_balance_with(None)
                );
            }
            if !self.panic_mode {
                self.panic_mode = true;
                let reason = format!(
                    "LOW_IM: available ${available:.2} below buffered rebalance cost ${:.2}",
                    self.cost_to_balance_with(None)
                );
                self.panic_reason = Some(reason.clone());
                self.panic_entered_at = Some(Utc::now());
                warn!("🚨 PANIC MODE entered: {reason}");
                directives.push(RiskDirective::EnterPanic {
                    reason,
                    rebalance: self.rebalance_plan(available),
                    cancel_tp: self.trend_tp_plan(),
                });
            }
        } else {
            if self.panic_mode {
                self.panic_mode = false;
                self.panic_reason = None;
                info!("✅ Panic cleared; restoring take-profit coverage");
                directives.push(RiskDirective::ExitPanic);
            }
            if self.averaging_frozen {
                self.averaging_frozen = false;
                self.freeze_reason = None;
                info!("✅ Early freeze deactivated; averaging unblocked");
            }
        }

        directives
    }

    /// Build the adaptive rebalance plan: market the lagging side of every
    /// imbalanced symbol towards parity, scaled to the available balance.
    pub fn rebalance_plan(&self, available: Decimal) -> RebalancePlan {
        let mut legs = Vec::new();
        let mut total_margin = Decimal::ZERO;
        for exposure in self.exposures.values() {
            let Some(side) = exposure.lagging_side() else {
                continue;
            };
            let gap = exposure.imbalance_qty();
            if gap == Decimal::ZERO {
                continue;
            }
            total_margin += exposure.rebalance_margin();
            legs.push(RebalanceLeg {
                symbol: exposure.symbol.clone(),
                side,
                qty: gap,
            });
        }

        if legs.is_empty() {
            return RebalancePlan {
                scale: Decimal::ONE,
                legs,
                critical: false,
            };
        }

        if available < Decimal::ONE {
            warn!(
                "💥 rebalance aborted: available ${available:.2} below the $1 floor"
            );
            return RebalancePlan {
                scale: Decimal::ZERO,
                legs: Vec::new(),
                critical: true,
            };
        }

        let scale = if available >= total_margin {
            Decimal::ONE
        } else {
            available / total_margin
        };
        for leg in &mut legs {
            leg.qty *= scale;
        }
        RebalancePlan {
            scale,
            legs,
            critical: false,
        }
    }

    /// Trend-side TPs to cancel while panicking: the side with more
    /// averages is running with the trend; freeing its reduce-only margin
    /// lets it breathe while the counter-trend TP stays as a natural exit.
    pub fn trend_tp_plan(&self) -> Vec<(String, PositionSide)> {
        self.exposures
            .values()
            .filter_map(|e| e.trend_side().map(|side| (e.symbol.clone(), side)))
            .collect()
    }
}
