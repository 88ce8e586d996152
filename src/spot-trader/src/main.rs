//! Spot trader - pyramiding spot-market bot with a protected runner.
//!
//! One orchestrated tick loop per symbol: consult the decider, manage
//! the lot book with per-lot take-profit/stop/trailing exits, place
//! maker-first orders through async workers, persist the book so a
//! restart is lossless.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use rust_decimal::Decimal;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use common::{Balances, Broker, CsvFeed, MarketFeed, MomentumDecider, PaperBroker};

mod backtest;
mod book;
mod config;
mod exits;
mod metrics;
mod orders;
mod pyramid;
mod server;
mod sizing;
mod state;
mod trader;

use config::Config;
use state::{StateError, StateStore};
use trader::Trader;

/// Spot trader - pyramiding spot bot with runner/scalp exits
#[derive(Parser, Debug)]
#[command(name = "spot-trader")]
#[command(about = "Spot-market trading bot with pyramiding and trailing exits")]
struct Args {
    /// Run the live trading loop
    #[arg(long)]
    live: bool,

    /// Run a CSV backtest instead of trading
    #[arg(long, value_name = "CSV")]
    backtest: Option<PathBuf>,

    /// Tick interval in seconds (overrides TICK_INTERVAL_SEC)
    #[arg(long)]
    interval: Option<u64>,
}

const EXIT_OK: i32 = 0;
const EXIT_CONFIG: i32 = 1;
const EXIT_STATE_CORRUPT: i32 = 2;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    std::process::exit(run().await);
}

async fn run() -> i32 {
    let args = Args::parse();

    let mut cfg = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("configuration error: {}", e);
            return EXIT_CONFIG;
        }
    };
    if let Some(interval) = args.interval {
        if interval == 0 {
            error!("--interval must be positive");
            return EXIT_CONFIG;
        }
        cfg.tick_interval_sec = interval;
    }

    match (&args.backtest, args.live) {
        (Some(_), true) => {
            error!("--live and --backtest are mutually exclusive");
            EXIT_CONFIG
        }
        (None, false) => {
            error!("pass --live or --backtest=<csv>");
            EXIT_CONFIG
        }
        (Some(csv), false) => match backtest::run(&cfg, csv).await {
            Ok(report) => {
                report.print_summary();
                EXIT_OK
            }
            Err(e) => {
                error!("backtest failed: {:#}", e);
                EXIT_CONFIG
            }
        },
        (None, true) => run_live(cfg).await,
    }
}

fn log_banner(cfg: &Config) {
    info!("=== Spot Trader ===");
    info!("Product: {} ({}s candles)", cfg.product_id, cfg.granularity_sec);
    info!("Dry run: {}", cfg.dry_run);
    info!(
        "Risk: {}% per trade, min order {}",
        cfg.risk_per_trade_pct, cfg.order_min_usd
    );
    info!(
        "Pyramiding: {} (max {} lots, adverse {}% decaying to {}%)",
        cfg.allow_pyramiding,
        cfg.max_concurrent_lots,
        cfg.pyramid.min_adverse_pct,
        cfg.pyramid.decay_min_pct
    );
    info!(
        "Exits: gate {}, scalp TP {}% floor {}%, runner trail {}%",
        cfg.exits.profit_gate_usd,
        cfg.exits.take_profit_pct,
        cfg.exits.scalp_tp_min_pct,
        cfg.exits.trail_distance_pct_runner
    );
    info!(
        "Orders: {:?}, offset {} bps, timeout {}s, reprice every {}ms",
        cfg.orders.order_type,
        cfg.orders.limit_price_offset_bps,
        cfg.orders.limit_timeout_sec,
        cfg.orders.reprice_interval_ms
    );
    info!(
        "Breaker: {}% daily loss (mark-to-market: {})",
        cfg.max_daily_loss_pct, cfg.breaker_mark_to_market
    );
    info!("State file: {}", cfg.state_file.display());
}

async fn run_live(cfg: Config) -> i32 {
    log_banner(&cfg);

    let store = Arc::new(StateStore::new(&cfg.state_file));
    let restored = match store.load() {
        Ok(restored) => restored,
        Err(StateError::Corrupt { path, reason }) => {
            // Non-destructive refusal: the operator decides what to do
            // with the broken file.
            error!(
                "state file {} is corrupt ({}); refusing to overwrite",
                path.display(),
                reason
            );
            return EXIT_STATE_CORRUPT;
        }
        Err(e) => {
            error!("cannot read state file: {}", e);
            return EXIT_CONFIG;
        }
    };

    match build_session(&cfg, store, restored).await {
        Ok(session) => {
            run_loop(cfg, session).await;
            EXIT_OK
        }
        Err(e) => {
            error!("startup failed: {:#}", e);
            EXIT_CONFIG
        }
    }
}

struct Session {
    trader: Arc<Trader>,
    broker: Arc<PaperBroker>,
    feed: CsvFeed,
}

async fn build_session(
    cfg: &Config,
    store: Arc<StateStore>,
    restored: Option<state::PersistedState>,
) -> Result<Session> {
    if !cfg.dry_run {
        anyhow::bail!(
            "DRY_RUN=false needs a live venue adapter; none is wired in this build"
        );
    }
    let feed_path = cfg
        .feed_csv
        .as_ref()
        .context("live paper session needs FEED_CSV pointing at a candle file")?;
    let feed = CsvFeed::load(feed_path, backtest::CANDLE_WINDOW)
        .with_context(|| format!("load FEED_CSV {}", feed_path.display()))?;

    let broker = Arc::new(PaperBroker::new(
        backtest::paper_filters(),
        cfg.fee_rate_pct,
        Balances {
            quote: cfg.initial_equity_usd,
            base: Decimal::ZERO,
        },
    ));
    let filters = broker
        .get_filters()
        .await
        .map_err(|e| anyhow::anyhow!("venue filters: {}", e))?;
    info!(
        "[VENUE] paper broker: tick {}, step {}, min notional {}",
        filters.price_tick, filters.base_step, filters.min_notional
    );

    let decider = Box::new(MomentumDecider::new(
        cfg.momentum_lookback,
        cfg.decider_min_prob,
    ));

    let trader = Trader::new(
        cfg.clone(),
        broker.clone() as Arc<dyn Broker>,
        decider,
        filters,
        store,
        restored,
        Utc::now(),
    );
    Ok(Session {
        trader,
        broker,
        feed,
    })
}

async fn run_loop(cfg: Config, session: Session) {
    let Session {
        trader,
        broker,
        mut feed,
    } = session;

    // Health and metrics surface.
    let http_addr = cfg.http_addr;
    tokio::spawn(async move {
        if let Err(e) = server::serve(http_addr).await {
            error!("[HTTP] server stopped: {:#}", e);
        }
    });

    // Reconcile any persisted pending order before the first tick.
    trader.recover(Utc::now()).await;

    let mut last_resync: Option<std::time::Instant> = None;
    let mut tick_interval = tokio::time::interval(Duration::from_secs(cfg.tick_interval_sec));
    tick_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut heartbeat = tokio::time::interval(Duration::from_secs(57));
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    info!(
        "[LOOP] trading every {}s (candle window {})",
        cfg.tick_interval_sec,
        backtest::CANDLE_WINDOW
    );

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("received shutdown signal, exiting...");
                break;
            }
            _ = heartbeat.tick() => {
                info!("[ALIVE] {}", trader.summary());
            }
            _ = tick_interval.tick() => {
                // Candles land on the resync cadence; ticks in between
                // re-evaluate the same bar.
                let resync_due = last_resync
                    .map_or(true, |at: std::time::Instant| {
                        at.elapsed().as_secs() >= cfg.candle_resync_sec
                    });
                if resync_due {
                    if !feed.advance() {
                        warn!("[LOOP] feed exhausted, stopping");
                        break;
                    }
                    last_resync = Some(std::time::Instant::now());
                }
                let candles = feed.candles();
                let tick = if cfg.use_tick_price {
                    feed.tick()
                } else {
                    candles.last().map(|c| c.close)
                };
                let Some(tick) = tick else { continue };
                broker.update_price(tick);

                let now = Utc::now();
                trader.maybe_refresh_equity(now, tick).await;
                let label = trader.step(now, candles, tick).await;
                tracing::debug!("[LOOP] step -> {}", label);
            }
        }
    }

    trader.shutdown().await;
    info!("shutdown complete");
}
