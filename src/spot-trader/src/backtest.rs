//! CSV backtest harness.
//!
//! Reuses the live core: the same `Trader` stepped over a replayed
//! candle file against the paper venue, with the simulated clock taken
//! from candle timestamps. Orders are forced onto the market path so a
//! run is deterministic regardless of wall-clock pacing.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{info, warn};

use common::{
    Balances, Broker, CsvFeed, MarketFeed, MomentumDecider, PaperBroker, ProductFilters,
};

use crate::config::{Config, OrderType};
use crate::metrics;
use crate::state::StateStore;
use crate::trader::Trader;

/// Candle window handed to the decider each tick.
pub const CANDLE_WINDOW: usize = 300;

/// Venue filters used by the paper broker.
pub fn paper_filters() -> ProductFilters {
    ProductFilters {
        price_tick: dec!(0.01),
        base_step: dec!(0.0001),
        min_notional: dec!(1),
    }
}

/// End-of-run results.
#[derive(Debug)]
pub struct BacktestReport {
    pub ticks: usize,
    pub trades_opened: u64,
    pub wins: u64,
    pub losses: u64,
    pub open_lots: usize,
    pub final_equity: Decimal,
    pub realized_pnl: Decimal,
    pub max_drawdown_pct: f64,
}

impl BacktestReport {
    pub fn win_rate(&self) -> f64 {
        let closed = self.wins + self.losses;
        if closed == 0 {
            return 0.0;
        }
        self.wins as f64 / closed as f64 * 100.0
    }

    pub fn print_summary(&self) {
        info!("==============================================================");
        info!("                     BACKTEST SUMMARY                         ");
        info!("==============================================================");
        info!("  Ticks replayed:    {:>10}", self.ticks);
        info!("  Lots opened:       {:>10}", self.trades_opened);
        info!(
            "  Wins / Losses:     {:>4} / {:<4}",
            self.wins, self.losses
        );
        info!("  Win rate:          {:>9.1}%", self.win_rate());
        info!("  Still open:        {:>10}", self.open_lots);
        info!("  Final equity:      {:>10.2}", self.final_equity);
        info!("  Realized PnL:      {:>10.2}", self.realized_pnl);
        info!("  Max drawdown:      {:>9.2}%", self.max_drawdown_pct);
        info!("==============================================================");
    }
}

/// Run the core over a candle CSV and report.
pub async fn run(cfg: &Config, csv_path: &Path) -> Result<BacktestReport> {
    let mut cfg = cfg.clone();
    if cfg.orders.order_type == OrderType::Limit {
        // Resting maker orders need wall-clock pacing; the replay uses
        // immediate fills instead.
        warn!("[BACKTEST] forcing ORDER_TYPE=market for deterministic replay");
        cfg.orders.order_type = OrderType::Market;
    }

    let mut feed = CsvFeed::load(csv_path, CANDLE_WINDOW)
        .with_context(|| format!("load backtest candles from {}", csv_path.display()))?;
    info!("[BACKTEST] {} candles loaded", feed.len());

    let broker = Arc::new(PaperBroker::new(
        paper_filters(),
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

    // The replay persists through the normal machinery, but into a
    // scratch file so a live book is never overwritten.
    let state_path = std::env::temp_dir().join(format!(
        "spot-trader-backtest-{}-{}.json",
        cfg.product_id.to_lowercase(),
        std::process::id()
    ));
    let store = Arc::new(StateStore::new(&state_path));

    let decider = Box::new(MomentumDecider::new(
        cfg.momentum_lookback,
        cfg.decider_min_prob,
    ));

    let wins0 = metrics::TRADES_TOTAL.with_label_values(&["win"]).get();
    let losses0 = metrics::TRADES_TOTAL.with_label_values(&["loss"]).get();
    let opens0 = metrics::TRADES_TOTAL.with_label_values(&["open"]).get();

    let trader = Trader::new(
        cfg.clone(),
        broker.clone() as Arc<dyn Broker>,
        decider,
        filters,
        store,
        None,
        feed.now().unwrap_or_else(chrono::Utc::now),
    );

    let start_equity = trader.equity();
    let mut peak_equity = start_equity;
    let mut max_drawdown_pct = 0.0f64;
    let mut ticks = 0usize;

    while feed.advance() {
        let Some(now) = feed.now() else { break };
        let Some(tick) = feed.tick() else { continue };
        broker.update_price(tick);
        trader.step(now, feed.candles(), tick).await;
        ticks += 1;

        let equity = trader.equity();
        if equity > peak_equity {
            peak_equity = equity;
        } else if peak_equity > Decimal::ZERO {
            let dd = ((peak_equity - equity) / peak_equity * dec!(100))
                .to_f64()
                .unwrap_or_default();
            if dd > max_drawdown_pct {
                max_drawdown_pct = dd;
            }
        }

        if cfg.backtest_speed_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(cfg.backtest_speed_ms)).await;
        }
    }

    let snapshot = trader.snapshot();
    let report = BacktestReport {
        ticks,
        trades_opened: metrics::TRADES_TOTAL.with_label_values(&["open"]).get() - opens0,
        wins: metrics::TRADES_TOTAL.with_label_values(&["win"]).get() - wins0,
        losses: metrics::TRADES_TOTAL.with_label_values(&["loss"]).get() - losses0,
        open_lots: snapshot.book_buy.lots.len() + snapshot.book_sell.lots.len(),
        final_equity: snapshot.equity_usd,
        realized_pnl: snapshot.equity_usd - start_equity,
        max_drawdown_pct,
    };

    let _ = std::fs::remove_file(&state_path);
    Ok(report)
}
