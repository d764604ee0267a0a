//! Hedge Grid - Main Entry Point
//!
//! Loads the multi-account configuration, refuses accounts with an
//! emergency flag, and runs one supervisor task per account.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hedge_grid::account::AccountSupervisor;
use hedge_grid::config::{AccountConfig, Config};
use hedge_grid::exchange::{
    BybitGateway, ExchangeGateway, InstrumentInfo, SimExchange,
};
use hedge_grid::persistence::StateStore;
use hedge_grid::risk::EmergencyFlagStore;
use rust_decimal_macros::dec;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const DATA_DIR: &str = "data";
const LOG_DIR: &str = "logs";

/// Hedge Grid CLI
#[derive(Parser)]
#[command(name = "hedge-grid")]
#[command(version, about = "Dual-sided martingale grid engine for Bybit perpetuals")]
struct Cli {
    /// Path to the configuration file (default: ./config.yaml)
    #[arg(short, long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate configuration and credentials, then exit
    Check,

    /// Show persisted per-account grid state
    Status {
        /// Show individual grid entries
        #[arg(short, long)]
        verbose: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_logging()?;

    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Some(Commands::Check) => run_check(&config),
        Some(Commands::Status { verbose }) => run_status(&config, verbose),
        None => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("building tokio runtime")?;
            runtime.block_on(run_accounts(config))
        }
    }
}

fn init_logging() -> Result<tracing_appender::non_blocking::WorkerGuard> {
    let file_appender = tracing_appender::rolling::daily(LOG_DIR, "hedge-grid.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false),
        )
        .init();
    Ok(guard)
}

/// Pre-launch validation: ranges were checked at load; here we resolve
/// credentials and the emergency flags, and print the account summary.
fn run_check(config: &Config) -> Result<()> {
    let flags = EmergencyFlagStore::new(DATA_DIR);
    let mut failures = 0usize;

    for account in &config.accounts {
        println!(
            "account {} ({}) — demo={}, dry_run={}",
            account.padded_id(),
            account.name,
            account.demo_trading,
            account.dry_run
        );
        for strategy in &account.strategies {
            println!(
                "  {}: leverage {}x, initial ${}, step {}%, multiplier {}, tp {}%, max levels {}",
                strategy.symbol,
                strategy.leverage,
                strategy.initial_position_size_usd,
                strategy.grid_step_percent,
                strategy.averaging_multiplier,
                strategy.take_profit_percent,
                strategy.max_grid_levels_per_side,
            );
        }

        if let Err(e) = flags.ensure_clear(account.id, &account.name) {
            println!("  ❌ {e:#}");
            failures += 1;
            continue;
        }
        if !account.dry_run {
            match resolve_credentials(account) {
                Ok(_) => println!("  ✅ credentials resolved"),
                Err(e) => {
                    println!("  ❌ {e:#}");
                    failures += 1;
                }
            }
        } else {
            println!("  ✅ dry run (no credentials needed)");
        }
    }

    anyhow::ensure!(failures == 0, "{failures} account(s) failed pre-launch checks");
    println!("all accounts pass pre-launch checks");
    Ok(())
}

fn run_status(config: &Config, verbose: bool) -> Result<()> {
    use hedge_grid::exchange::PositionSide;

    for account in &config.accounts {
        let store = StateStore::open(DATA_DIR, account.id)?;
        println!("account {} ({})", account.padded_id(), account.name);
        let mut any = false;
        for symbol in store.symbols() {
            let Some(book) = store.load_book(symbol) else {
                continue;
            };
            any = true;
            println!(
                "  {symbol}: LONG {} entries / {} qty, SHORT {} entries / {} qty, realized PnL ${}",
                book.count(PositionSide::Long),
                book.total_qty(PositionSide::Long),
                book.count(PositionSide::Short),
                book.total_qty(PositionSide::Short),
                book.total_realized_pnl(),
            );
            if verbose {
                for side in PositionSide::BOTH {
                    for entry in book.entries(side) {
                        println!(
                            "    {side} L{}: {} @ ${} ({})",
                            entry.grid_level,
                            entry.quantity,
                            entry.entry_price,
                            entry.timestamp.to_rfc3339(),
                        );
                    }
                }
            }
        }
        if !any {
            println!("  (no saved state)");
        }
    }
    Ok(())
}

fn resolve_credentials(account: &AccountConfig) -> Result<(String, String)> {
    let api_key = std::env::var(&account.api_key_env).with_context(|| {
        format!(
            "account {}: missing API key env {}",
            account.padded_id(),
            account.api_key_env
        )
    })?;
    let api_secret = std::env::var(&account.api_secret_env).with_context(|| {
        format!(
            "account {}: missing API secret env {}",
            account.padded_id(),
            account.api_secret_env
        )
    })?;
    anyhow::ensure!(
        !api_key.is_empty() && !api_secret.is_empty(),
        "account {}: empty credentials",
        account.padded_id()
    );
    Ok((api_key, api_secret))
}

/// Build the gateway for one account: the live Bybit adapter, or the
/// in-process simulator for dry-run accounts.
async fn build_gateway(account: &AccountConfig) -> Result<Arc<dyn ExchangeGateway>> {
    if account.dry_run {
        info!(
            "📝 [{}] dry run: trading against the in-process simulator",
            account.name
        );
        let sim = SimExchange::new(dec!(10000));
        for strategy in &account.strategies {
            sim.add_instrument(
                InstrumentInfo {
                    symbol: strategy.symbol.clone(),
                    min_qty: dec!(0.1),
                    qty_step: dec!(0.1),
                    max_qty: dec!(1000000),
                    tick_size: dec!(0.01),
                },
                dec!(100),
            )
            .await;
        }
        return Ok(Arc::new(sim));
    }

    let (api_key, api_secret) = resolve_credentials(account)?;
    if account.demo_trading {
        warn!("🧪 [{}] demo trading endpoints in use", account.name);
    } else {
        warn!("⚠️  [{}] LIVE TRADING - real money at risk!", account.name);
    }
    Ok(Arc::new(BybitGateway::new(
        api_key,
        api_secret,
        account.demo_trading,
    )))
}

async fn run_accounts(config: Config) -> Result<()> {
    info!("╔════════════════════════════════════════════════════════╗");
    info!(
        "║        Hedge Grid v{} - {} account(s)                ║",
        env!("CARGO_PKG_VERSION"),
        config.accounts.len()
    );
    info!("╚════════════════════════════════════════════════════════╝");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("🛑 shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    let mut handles = Vec::new();
    for account in config.accounts {
        let name = account.name.clone();
        let gateway = match build_gateway(&account).await {
            Ok(gateway) => gateway,
            Err(e) => {
                error!("❌ [{name}] gateway construction failed: {e:#}");
                std::process::exit(1);
            }
        };
        let supervisor = match AccountSupervisor::init(account, gateway, DATA_DIR).await {
            Ok(supervisor) => supervisor,
            Err(e) => {
                error!("❌ [{name}] initialization failed: {e:#}");
                std::process::exit(1);
            }
        };
        let shutdown = shutdown_rx.clone();
        handles.push((name, tokio::spawn(supervisor.run(shutdown))));
    }

    let mut emergency = false;
    for (name, handle) in handles {
        match handle.await {
            Ok(Ok(stopped)) => {
                if stopped {
                    error!("🚨 [{name}] halted with an emergency stop");
                    emergency = true;
                }
            }
            Ok(Err(e)) => {
                error!("❌ [{name}] account task failed: {e:#}");
                emergency = true;
            }
            Err(e) => {
                error!("❌ [{name}] account task panicked: {e}");
                emergency = true;
            }
        }
    }

    if emergency {
        std::process::exit(1);
    }
    info!("👋 all accounts stopped cleanly");
    Ok(())
}
