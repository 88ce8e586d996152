//! Pyramiding gate: decides whether a same-side add is allowed.
//!
//! Three conditions, all required: the side is under its lot cap, the
//! minimum spacing since the last add has passed, and price has moved
//! adversely by a threshold that decays with time since the last add.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::debug;

use common::Side;

use crate::config::PyramidConfig;

/// Why an add was blocked; surfaced in logs and step labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PyramidBlock {
    LotCap,
    Spacing,
    AdverseMove,
}

impl PyramidBlock {
    pub fn as_str(&self) -> &'static str {
        match self {
            PyramidBlock::LotCap => "lot-cap",
            PyramidBlock::Spacing => "spacing",
            PyramidBlock::AdverseMove => "adverse-move",
        }
    }
}

/// Inputs the gate needs from the book and clock.
#[derive(Debug, Clone, Copy)]
pub struct AddContext {
    pub now: DateTime<Utc>,
    pub price: Decimal,
    pub last_entry_price: Decimal,
    pub side_size: usize,
    /// Open time of the oldest lot on the side, used to seed the
    /// last-add clock after a restart.
    pub oldest_open_time: Option<DateTime<Utc>>,
    pub daily_start: DateTime<Utc>,
}

/// Per-side last-add clocks. Not persisted: the seeding rule
/// reconstructs a conservative value after restart.
#[derive(Debug, Default)]
pub struct PyramidGate {
    last_add_buy: Option<DateTime<Utc>>,
    last_add_sell: Option<DateTime<Utc>>,
}

impl PyramidGate {
    fn last_add(&self, side: Side) -> Option<DateTime<Utc>> {
        match side {
            Side::Buy => self.last_add_buy,
            Side::Sell => self.last_add_sell,
        }
    }

    /// Record a successful append.
    pub fn mark_add(&mut self, side: Side, now: DateTime<Utc>) {
        match side {
            Side::Buy => self.last_add_buy = Some(now),
            Side::Sell => self.last_add_sell = Some(now),
        }
    }

    /// Effective adverse-move percent after decay.
    pub fn effective_adverse_pct(cfg: &PyramidConfig, minutes_since_last_add: f64) -> f64 {
        let decayed =
            cfg.min_adverse_pct * (-cfg.decay_lambda * minutes_since_last_add).exp();
        decayed.max(cfg.decay_min_pct)
    }

    /// Check whether an add on `side` is allowed right now.
    pub fn check(
        &self,
        side: Side,
        cfg: &PyramidConfig,
        max_lots: usize,
        ctx: &AddContext,
    ) -> Result<(), PyramidBlock> {
        if ctx.side_size >= max_lots {
            return Err(PyramidBlock::LotCap);
        }

        let last_add = self
            .last_add(side)
            .or(ctx.oldest_open_time)
            .unwrap_or(ctx.daily_start);

        let elapsed_secs = (ctx.now - last_add).num_seconds();
        if elapsed_secs < cfg.min_seconds_between {
            return Err(PyramidBlock::Spacing);
        }

        let minutes = elapsed_secs as f64 / 60.0;
        let eff_pct = Self::effective_adverse_pct(cfg, minutes);
        let eff = Decimal::try_from(eff_pct / 100.0).unwrap_or(Decimal::ZERO);
        let threshold = match side {
            Side::Buy => ctx.last_entry_price * (Decimal::ONE - eff),
            Side::Sell => ctx.last_entry_price * (Decimal::ONE + eff),
        };
        let adverse_enough = match side {
            Side::Buy => ctx.price <= threshold,
            Side::Sell => ctx.price >= threshold,
        };
        if !adverse_enough {
            debug!(
                "[PYRAMID] {} blocked: price {} vs threshold {} (eff {:.3}%)",
                side, ctx.price, threshold, eff_pct
            );
            return Err(PyramidBlock::AdverseMove);
        }
        Ok(())
    }
}
