//! Configuration management for the grid engine.
//!
//! Loads the multi-account YAML file plus environment overrides and
//! validates every strategy parameter before anything trades.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::time::Duration;

/// Exchange fee constants (Bybit linear perpetuals), expressed in percent.
pub const TAKER_FEE_PCT: Decimal = dec!(0.055);
pub const MAKER_FEE_PCT: Decimal = dec!(0.020);

/// Maker-friendly price offset for entry limit orders, in percent.
pub const LIMIT_ORDER_OFFSET_PCT: Decimal = dec!(0.03);
/// How long a limit entry may sit unfilled before cancel-and-retry.
pub const LIMIT_ORDER_TIMEOUT: Duration = Duration::from_secs(10);
/// Retries before falling back to a market order.
pub const LIMIT_ORDER_MAX_RETRIES: u32 = 3;

/// Delay between ladder orders so history preserves ordering.
pub const LADDER_ORDER_DELAY: Duration = Duration::from_millis(100);
/// Exchange/local reconciliation interval.
pub const SYNC_INTERVAL: Duration = Duration::from_secs(60);
/// Minimum gap between repeated warnings of the same kind.
pub const WARN_THROTTLE: Duration = Duration::from_secs(60);
/// Hard ceiling on one restoration attempt.
pub const RESTORATION_TIMEOUT: Duration = Duration::from_secs(30);
/// Missed-close detections must persist this long before acting.
pub const MISSED_CLOSE_DEBOUNCE: Duration = Duration::from_secs(3);

/// Order-history page size (Bybit API maximum) and pagination cap.
pub const ORDER_HISTORY_LIMIT: u32 = 200;
pub const ORDER_HISTORY_MAX_PAGES: u32 = 10;

/// Absolute tolerance when matching local quantity against exchange size.
pub const QTY_MATCH_TOLERANCE: Decimal = dec!(0.001);
/// Price ring buffer length for ATR estimation.
pub const PRICE_HISTORY_LEN: usize = 20;
/// ATR% assumed until the ring buffer has at least two samples.
pub const ATR_DEFAULT_PCT: Decimal = dec!(1.5);
/// Cumulative price drift that forces pending-order re-placement.
pub const PENDING_RECALC_THRESHOLD_PCT: Decimal = dec!(5);
/// Adaptive reopen targets the opposite side's depth minus this many levels.
pub const REOPEN_LEVEL_STEP_BACK: u32 = 2;
/// Account MM rate above which a throttled caution is logged.
pub const MM_RATE_WARNING_PCT: Decimal = dec!(50);
/// Tolerance multiplier when fitting the opening ladder into a margin budget.
pub const LADDER_BUDGET_TOLERANCE: Decimal = dec!(1.01);

/// Sentinel stored as a TP order id between placement and the exchange
/// acknowledging the real id, so a racing order-stream `New` event cannot
/// observe an empty slot.
pub const PENDING_ORDER_ID: &str = "PENDING";

/// Zero-padding width for account ids in file names.
pub const ACCOUNT_ID_PADDING: usize = 3;

/// Top-level configuration: one entry per trading account.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub accounts: Vec<AccountConfig>,
}

/// A single exchange account with its symbols and risk limits.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountConfig {
    /// Account id, 1..=999; used as the zero-padded file prefix.
    pub id: u16,
    pub name: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    /// Environment variable holding the API secret.
    pub api_secret_env: String,
    #[serde(default)]
    pub demo_trading: bool,
    #[serde(default)]
    pub dry_run: bool,
    pub strategies: Vec<StrategyConfig>,
    pub risk_management: RiskConfig,
}

/// Per-symbol grid strategy parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct StrategyConfig {
    pub symbol: String,
    pub leverage: u32,
    /// Margin (not notional) committed to grid level 0, in USD.
    pub initial_position_size_usd: Decimal,
    pub grid_step_percent: Decimal,
    pub averaging_multiplier: Decimal,
    pub take_profit_percent: Decimal,
    pub max_grid_levels_per_side: u32,
}

/// Per-account risk limits.
#[derive(Debug, Clone, Deserialize)]
pub struct RiskConfig {
    /// Account maintenance-margin rate (percent) that triggers the
    /// emergency close-all.
    pub mm_rate_threshold: Decimal,
    /// Extra headroom demanded by the reserve pre-check, in percent.
    #[serde(default = "default_balance_buffer")]
    pub balance_buffer_percent: Decimal,
}

fn default_balance_buffer() -> Decimal {
    dec!(15)
}

impl Config {
    /// Load configuration from `config.yaml` (or an explicit path) merged
    /// with `HG`-prefixed environment overrides.
    pub fn load(path: Option<&str>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let file = path.unwrap_or("config");
        let config = config::Config::builder()
            .add_source(config::File::with_name(file).required(path.is_some()))
            .add_source(config::Environment::default().separator("__").prefix("HG"))
            .build()
            .context("Failed to build configuration")?;

        let parsed: Self = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        parsed.validate()?;
        Ok(parsed)
    }

    /// Validate every account; construction fails on the first violation.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(!self.accounts.is_empty(), "no accounts configured");
        for account in &self.accounts {
            account.validate()?;
        }
        Ok(())
    }
}

impl AccountConfig {
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            (1..=999).contains(&self.id),
            "account id {} out of range 1..=999",
            self.id
        );
        anyhow::ensure!(
            !self.strategies.is_empty(),
            "account {} has no strategies",
            self.id
        );
        anyhow::ensure!(
            !self.api_key_env.is_empty() && !self.api_secret_env.is_empty(),
            "account {} is missing credential env names",
            self.id
        );
        for strategy in &self.strategies {
            strategy.validate().with_context(|| {
                format!("account {} symbol {}", self.id, strategy.symbol)
            })?;
        }
        self.risk_management.validate()?;
        Ok(())
    }

    /// Zero-padded id used as the per-account file prefix.
    pub fn padded_id(&self) -> String {
        format!("{:0width$}", self.id, width = ACCOUNT_ID_PADDING)
    }
}

impl StrategyConfig {
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(!self.symbol.is_empty(), "symbol must not be empty");
        anyhow::ensure!(
            (1..=200).contains(&self.leverage),
            "leverage {} out of range 1..=200",
            self.leverage
        );
        anyhow::ensure!(
            self.initial_position_size_usd >= dec!(0.1)
                && self.initial_position_size_usd <= dec!(100000),
            "initial_position_size_usd {} out of range 0.1..=100000",
            self.initial_position_size_usd
        );
        anyhow::ensure!(
            self.grid_step_percent >= dec!(0.01) && self.grid_step_percent <= dec!(100),
            "grid_step_percent {} out of range 0.01..=100",
            self.grid_step_percent
        );
        anyhow::ensure!(
            self.averaging_multiplier > dec!(1) && self.averaging_multiplier <= dec!(10),
            "averaging_multiplier {} out of range (1, 10]",
            self.averaging_multiplier
        );
        anyhow::ensure!(
            self.take_profit_percent >= dec!(0.01) && self.take_profit_percent <= dec!(100),
            "take_profit_percent {} out of range 0.01..=100",
            self.take_profit_percent
        );
        anyhow::ensure!(
            (1..=50).contains(&self.max_grid_levels_per_side),
            "max_grid_levels_per_side {} out of range 1..=50",
            self.max_grid_levels_per_side
        );
        Ok(())
    }
}

impl RiskConfig {
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.mm_rate_threshold >= Decimal::ZERO && self.mm_rate_threshold <= dec!(100),
            "mm_rate_threshold {} out of range 0..=100",
            self.mm_rate_threshold
        );
        anyhow::ensure!(
            self.balance_buffer_percent >= Decimal::ZERO,
            "balance_buffer_percent must not be negative"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strategy() -> StrategyConfig {
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

    fn account() -> AccountConfig {
        AccountConfig {
            id: 1,
            name: "main".to_string(),
            api_key_env: "BYBIT_API_KEY".to_string(),
            api_secret_env: "BYBIT_API_SECRET".to_string(),
            demo_trading: true,
            dry_run: false,
            strategies: vec![strategy()],
            risk_management: RiskConfig {
                mm_rate_threshold: dec!(80),
                balance_buffer_percent: dec!(15),
            },
        }
    }

    #[test]
    fn test_valid_account_passes() {
        assert!(account().validate().is_ok());
    }

    #[test]
    fn test_padded_id() {
        assert_eq!(account().padded_id(), "001");
        let mut acc = account();
        acc.id = 42;
        assert_eq!(acc.padded_id(), "042");
    }

    #[test]
    fn test_leverage_bounds() {
        let mut acc = account();
        acc.strategies[0].leverage = 0;
        assert!(acc.validate().is_err());
        acc.strategies[0].leverage = 201;
        assert!(acc.validate().is_err());
        acc.strategies[0].leverage = 200;
        assert!(acc.validate().is_ok());
    }

    #[test]
    fn test_multiplier_exclusive_lower_bound() {
        let mut acc = account();
        acc.strategies[0].averaging_multiplier = dec!(1);
        assert!(acc.validate().is_err());
        acc.strategies[0].averaging_multiplier = dec!(1.01);
        assert!(acc.validate().is_ok());
        acc.strategies[0].averaging_multiplier = dec!(10.1);
        assert!(acc.validate().is_err());
    }

    #[test]
    fn test_grid_levels_bounds() {
        let mut acc = account();
        acc.strategies[0].max_grid_levels_per_side = 0;
        assert!(acc.validate().is_err());
        acc.strategies[0].max_grid_levels_per_side = 51;
        assert!(acc.validate().is_err());
    }

    #[test]
    fn test_account_id_bounds() {
        let mut acc = account();
        acc.id = 0;
        assert!(acc.validate().is_err());
    }

    #[test]
    fn test_default_balance_buffer() {
        assert_eq!(default_balance_buffer(), dec!(15));
    }
}
