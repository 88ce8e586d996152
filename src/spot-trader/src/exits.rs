//! Per-lot exit evaluation: profit-gate arming, take profit, trailing
//! stops and the hard stop backstop.
//!
//! Evaluation mutates the lot's arming and trailing state in place and
//! returns at most one exit reason per tick. Orders are the caller's
//! concern; this module only classifies.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use common::Side;

use crate::book::Lot;
use crate::config::{DecayMode, ExitConfig};

/// Why a lot should close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    TrailingStop,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::StopLoss => "STOP_LOSS",
            ExitReason::TakeProfit => "TAKE_PROFIT",
            ExitReason::TrailingStop => "TRAILING_STOP",
        }
    }
}

/// Net PnL of a lot at `price`, including the entry fee already paid
/// and the estimated exit fee at the fallback rate.
pub fn net_pnl(lot: &Lot, price: Decimal, fee_rate_pct: Decimal) -> Decimal {
    let gross = (price - lot.open_price) * lot.base_size * lot.side.sign();
    let exit_fee = price * lot.base_size * fee_rate_pct / dec!(100);
    gross - lot.entry_fee - exit_fee
}

/// Hard stop price for a fresh lot. A very large percentage pushes the
/// stop to zero (BUY) which disables it.
pub fn initial_stop_price(side: Side, open_price: Decimal, stop_loss_pct: Decimal) -> Decimal {
    let offset = open_price * stop_loss_pct / dec!(100);
    match side {
        Side::Buy => (open_price - offset).max(Decimal::ZERO),
        Side::Sell => open_price + offset,
    }
}

/// Fixed take price at a percent distance from the open.
pub fn take_price(side: Side, open_price: Decimal, tp_pct: Decimal) -> Decimal {
    let offset = open_price * tp_pct / dec!(100);
    match side {
        Side::Buy => open_price + offset,
        Side::Sell => open_price - offset,
    }
}

/// Scalp take-profit percent for the k-th scalp, decayed and floored.
pub fn scalp_tp_pct(cfg: &ExitConfig, k: usize) -> Decimal {
    let decayed = match cfg.scalp_tp_decay_mode {
        DecayMode::Exp => {
            let factor = cfg.scalp_tp_decay_factor.powi(k as i32);
            cfg.take_profit_pct * Decimal::try_from(factor).unwrap_or(Decimal::ONE)
        }
        DecayMode::Linear => {
            cfg.take_profit_pct - cfg.scalp_tp_decay_step_pct * Decimal::from(k as u64)
        }
    };
    decayed.max(cfg.scalp_tp_min_pct)
}

fn stop_hit(lot: &Lot, price: Decimal) -> bool {
    match lot.side {
        Side::Buy => lot.stop_price > Decimal::ZERO && price <= lot.stop_price,
        Side::Sell => price >= lot.stop_price,
    }
}

fn take_hit(lot: &Lot, price: Decimal) -> bool {
    match (lot.side, lot.take_price) {
        (Side::Buy, Some(take)) => price >= take,
        (Side::Sell, Some(take)) => price <= take,
        _ => false,
    }
}

/// Evaluate one lot against the current price. Updates arming and
/// trailing state; returns the exit to take this tick, if any.
pub fn evaluate(
    lot: &mut Lot,
    price: Decimal,
    fee_rate_pct: Decimal,
    cfg: &ExitConfig,
) -> Option<ExitReason> {
    // The hard backstop fires regardless of arming.
    if stop_hit(lot, price) {
        return Some(ExitReason::StopLoss);
    }

    let net = net_pnl(lot, price, fee_rate_pct);
    if !lot.armed && net >= cfg.profit_gate_usd {
        lot.armed = true;
    }
    if !lot.armed {
        return None;
    }

    if take_hit(lot, price) {
        return Some(ExitReason::TakeProfit);
    }

    let (activate_usd, distance_pct) = if lot.runner {
        (cfg.trail_activate_usd_runner, cfg.trail_distance_pct_runner)
    } else {
        (cfg.trail_activate_usd_scalp, cfg.trail_distance_pct_scalp)
    };

    if !lot.trail_active && net >= activate_usd {
        lot.trail_active = true;
        lot.trail_peak = Some(price);
    }

    if lot.trail_active {
        let peak = match lot.trail_peak {
            Some(peak) => match lot.side {
                Side::Buy => peak.max(price),
                Side::Sell => peak.min(price),
            },
            None => price,
        };
        lot.trail_peak = Some(peak);
        let distance = peak * distance_pct / dec!(100);
        let stop = match lot.side {
            Side::Buy => peak - distance,
            Side::Sell => peak + distance,
        };
        lot.trail_stop = Some(stop);

        let crossed = match lot.side {
            Side::Buy => price <= stop,
            Side::Sell => price >= stop,
        };
        if crossed {
            return Some(ExitReason::TrailingStop);
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn cfg() -> ExitConfig {
        ExitConfig {
            take_profit_pct: dec!(1.9),
            scalp_tp_decay_mode: DecayMode::Exp,
            scalp_tp_decay_factor: 0.85,
            scalp_tp_decay_step_pct: dec!(0.2),
            scalp_tp_min_pct: dec!(0.4),
            stop_loss_pct: dec!(100),
            profit_gate_usd: dec!(0.25),
            trail_activate_usd_runner: dec!(1.0),
            trail_distance_pct_runner: dec!(0.6),
            trail_activate_usd_scalp: dec!(0.5),
            trail_distance_pct_scalp: dec!(0.35),
        }
    }

    fn lot(side: Side, runner: bool) -> Lot {
        Lot {
            id: 1,
            side,
            open_price: dec!(100),
            base_size: dec!(1),
            entry_fee: dec!(0.1),
            open_time: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            stop_price: if side == Side::Buy { Decimal::ZERO } else { dec!(200) },
            take_price: (!runner).then(|| take_price(side, dec!(100), dec!(1.9))),
            runner,
            armed: false,
            trail_active: false,
            trail_peak: None,
            trail_stop: None,
            reason: "signal".to_string(),
        }
    }

    #[test]
    fn test_net_pnl_subtracts_both_fees() {
        let l = lot(Side::Buy, true);
        // gross 1.95, entry fee 0.1, exit fee 0.1% of 101.95
        let net = net_pnl(&l, dec!(101.95), dec!(0.1));
        assert_eq!(net, dec!(1.95) - dec!(0.1) - dec!(0.10195));
    }

    #[test]
    fn test_arming_latches() {
        let mut l = lot(Side::Buy, true);
        // Below gate: no arming.
        assert!(evaluate(&mut l, dec!(100.10), dec!(0.1), &cfg()).is_none());
        assert!(!l.armed);
        // Above gate: arms.
        assert!(evaluate(&mut l, dec!(100.60), dec!(0.1), &cfg()).is_none());
        assert!(l.armed);
        // Falls back below gate: stays armed.
        assert!(evaluate(&mut l, dec!(100.10), dec!(0.1), &cfg()).is_none());
        assert!(l.armed);
    }

    #[test]
    fn test_scalp_take_profit_fires_only_when_armed() {
        let mut l = lot(Side::Buy, false);
        // TP at 101.9; first tick jumps straight past it.
        let reason = evaluate(&mut l, dec!(102.00), dec!(0.1), &cfg());
        // Net pnl ~1.8 is above gate, so armed then TP.
        assert_eq!(reason, Some(ExitReason::TakeProfit));
    }

    #[test]
    fn test_runner_trails_and_exits_on_pullback() {
        let mut l = lot(Side::Buy, true);
        assert!(evaluate(&mut l, dec!(102.00), dec!(0.1), &cfg()).is_none());
        assert!(l.trail_active);
        assert_eq!(l.trail_peak, Some(dec!(102.00)));

        // New high moves the peak and the stop.
        assert!(evaluate(&mut l, dec!(103.00), dec!(0.1), &cfg()).is_none());
        assert_eq!(l.trail_peak, Some(dec!(103.00)));
        let stop = l.trail_stop.unwrap();
        assert_eq!(stop, dec!(103.00) - dec!(103.00) * dec!(0.6) / dec!(100));

        // Pullback through the stop exits.
        let reason = evaluate(&mut l, stop - dec!(0.01), dec!(0.1), &cfg());
        assert_eq!(reason, Some(ExitReason::TrailingStop));
    }

    #[test]
    fn test_sell_side_trailing_mirrors() {
        let mut l = lot(Side::Sell, true);
        assert!(evaluate(&mut l, dec!(98.00), dec!(0.1), &cfg()).is_none());
        assert!(l.trail_active);
        assert!(evaluate(&mut l, dec!(97.00), dec!(0.1), &cfg()).is_none());
        assert_eq!(l.trail_peak, Some(dec!(97.00)));
        let stop = l.trail_stop.unwrap();
        assert!(stop > dec!(97.00));
        let reason = evaluate(&mut l, stop + dec!(0.01), dec!(0.1), &cfg());
        assert_eq!(reason, Some(ExitReason::TrailingStop));
    }

    #[test]
    fn test_hard_stop_fires_unarmed() {
        let mut l = lot(Side::Buy, true);
        l.stop_price = dec!(98.00);
        let reason = evaluate(&mut l, dec!(97.50), dec!(0.1), &cfg());
        assert_eq!(reason, Some(ExitReason::StopLoss));
        assert!(!l.armed);
    }

    #[test]
    fn test_default_stop_is_noop_for_buy() {
        let l = lot(Side::Buy, true);
        assert_eq!(l.stop_price, Decimal::ZERO);
        assert!(!stop_hit(&l, dec!(0.50)));
    }

    #[test]
    fn test_scalp_tp_decay_exp_floors() {
        let c = cfg();
        assert_eq!(scalp_tp_pct(&c, 0), dec!(1.9));
        let k1 = scalp_tp_pct(&c, 1);
        assert!(k1 < dec!(1.9) && k1 > dec!(1.6));
        // Deep in the ladder the floor holds.
        assert_eq!(scalp_tp_pct(&c, 50), dec!(0.4));
    }

    #[test]
    fn test_scalp_tp_decay_linear() {
        let mut c = cfg();
        c.scalp_tp_decay_mode = DecayMode::Linear;
        assert_eq!(scalp_tp_pct(&c, 0), dec!(1.9));
        assert_eq!(scalp_tp_pct(&c, 2), dec!(1.5));
        assert_eq!(scalp_tp_pct(&c, 50), dec!(0.4));
    }

    #[test]
    fn test_initial_stop_price_sides() {
        assert_eq!(initial_stop_price(Side::Buy, dec!(100), dec!(2)), dec!(98));
        assert_eq!(initial_stop_price(Side::Sell, dec!(100), dec!(2)), dec!(102));
        assert_eq!(initial_stop_price(Side::Buy, dec!(100), dec!(100)), dec!(0));
    }
}
