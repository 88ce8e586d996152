//! Entry sizing: risk percent of equity with optional ramping and a
//! volatility risk multiplier.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use common::{Candle, ProductFilters};

use crate::config::{Config, RampMode};

/// Effective risk percent for the next lot on a side with `lot_index`
/// lots already open (0 = first lot).
pub fn effective_risk_pct(cfg: &Config, lot_index: usize, vol_factor: f64) -> Decimal {
    let base_pct = if cfg.ramp.enable {
        let pct = match cfg.ramp.mode {
            RampMode::Linear => {
                cfg.ramp.start_pct + cfg.ramp.step_pct * Decimal::from(lot_index as u64)
            }
            RampMode::Exp => {
                let growth = cfg.ramp.growth.powi(lot_index as i32);
                cfg.ramp.start_pct * Decimal::try_from(growth).unwrap_or(Decimal::ONE)
            }
        };
        pct.min(cfg.ramp.max_pct)
    } else {
        cfg.risk_per_trade_pct
    };
    let factor = Decimal::try_from(vol_factor).unwrap_or(Decimal::ONE);
    base_pct * factor
}

/// Quote currency to commit to the next entry.
pub fn entry_quote(cfg: &Config, equity: Decimal, lot_index: usize, vol_factor: f64) -> Decimal {
    let pct = effective_risk_pct(cfg, lot_index, vol_factor);
    let sized = pct / dec!(100) * equity;
    sized.max(cfg.order_min_usd)
}

/// Base size for a quote amount at `price`, floored to the venue step.
pub fn base_for(quote: Decimal, price: Decimal, filters: &ProductFilters) -> Decimal {
    if price <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    filters.snap_base(quote / price)
}

/// Volatility risk multiplier from the candle window's realized
/// volatility: `target / realized`, clamped. Returns 1.0 when disabled
/// or when the window is too short to estimate.
pub fn vol_risk_factor(cfg: &Config, candles: &[Candle]) -> f64 {
    if !cfg.vol.adjust {
        return 1.0;
    }
    let closes: Vec<f64> = candles
        .iter()
        .filter_map(|c| c.close.to_f64())
        .filter(|c| *c > 0.0)
        .collect();
    if closes.len() < 3 {
        return 1.0;
    }
    let returns: Vec<f64> = closes.windows(2).map(|w| (w[1] / w[0]).ln()).collect();
    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let var = returns
        .iter()
        .map(|r| (r - mean) * (r - mean))
        .sum::<f64>()
        / returns.len() as f64;
    let realized_pct = var.sqrt() * (returns.len() as f64).sqrt() * 100.0;
    if realized_pct <= f64::EPSILON {
        return cfg.vol.factor_max;
    }
    (cfg.vol.target_pct / realized_pct).clamp(cfg.vol.factor_min, cfg.vol.factor_max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serial_test::serial;

    fn base_cfg() -> Config {
        // Build from env defaults; tests override fields directly.
        std::env::remove_var("RISK_PER_TRADE_PCT");
        crate::config::Config::from_env_only().expect("default config")
    }

    #[test]
    #[serial]
    fn test_flat_risk_pct() {
        let cfg = base_cfg();
        assert_eq!(effective_risk_pct(&cfg, 0, 1.0), dec!(10));
        assert_eq!(effective_risk_pct(&cfg, 3, 1.0), dec!(10));
    }

    #[test]
    #[serial]
    fn test_linear_ramp_caps() {
        let mut cfg = base_cfg();
        cfg.ramp.enable = true;
        cfg.ramp.mode = RampMode::Linear;
        cfg.ramp.start_pct = dec!(5);
        cfg.ramp.step_pct = dec!(2.5);
        cfg.ramp.max_pct = dec!(10);
        assert_eq!(effective_risk_pct(&cfg, 0, 1.0), dec!(5));
        assert_eq!(effective_risk_pct(&cfg, 1, 1.0), dec!(7.5));
        assert_eq!(effective_risk_pct(&cfg, 4, 1.0), dec!(10));
    }

    #[test]
    #[serial]
    fn test_exp_ramp() {
        let mut cfg = base_cfg();
        cfg.ramp.enable = true;
        cfg.ramp.mode = RampMode::Exp;
        cfg.ramp.start_pct = dec!(4);
        cfg.ramp.growth = 1.5;
        cfg.ramp.max_pct = dec!(25);
        assert_eq!(effective_risk_pct(&cfg, 0, 1.0), dec!(4));
        assert_eq!(effective_risk_pct(&cfg, 1, 1.0), dec!(6));
        assert_eq!(effective_risk_pct(&cfg, 2, 1.0), dec!(9));
    }

    #[test]
    #[serial]
    fn test_entry_quote_respects_minimum() {
        let cfg = base_cfg();
        // 10% of 1000 = 100.
        assert_eq!(entry_quote(&cfg, dec!(1000), 0, 1.0), dec!(100));
        // 10% of 10 = 1, below the order minimum.
        assert_eq!(entry_quote(&cfg, dec!(10), 0, 1.0), cfg.order_min_usd);
    }

    #[test]
    fn test_base_for_floors_to_step() {
        let filters = ProductFilters {
            price_tick: dec!(0.01),
            base_step: dec!(0.0001),
            min_notional: dec!(1),
        };
        assert_eq!(base_for(dec!(100), dec!(100), &filters), dec!(1));
        assert_eq!(base_for(dec!(1), dec!(100), &filters), dec!(0.01));
        assert_eq!(base_for(dec!(1), dec!(97), &filters), dec!(0.0103));
    }

    #[test]
    #[serial]
    fn test_vol_factor_disabled_is_unity() {
        let cfg = base_cfg();
        assert_eq!(vol_risk_factor(&cfg, &[]), 1.0);
    }

    #[test]
    #[serial]
    fn test_vol_factor_shrinks_in_high_vol() {
        let mut cfg = base_cfg();
        cfg.vol.adjust = true;
        cfg.vol.target_pct = 0.5;
        let mut price = 100.0f64;
        let candles: Vec<Candle> = (0..60)
            .map(|i| {
                // Alternate ±2% moves: very volatile window.
                price *= if i % 2 == 0 { 1.02 } else { 0.98 };
                let close = Decimal::try_from(price).unwrap();
                Candle {
                    time: Utc.timestamp_opt(1_700_000_000 + i * 60, 0).unwrap(),
                    open: close,
                    high: close,
                    low: close,
                    close,
                    volume: dec!(1),
                }
            })
            .collect();
        let factor = vol_risk_factor(&cfg, &candles);
        assert_eq!(factor, cfg.vol.factor_min);
    }
}
