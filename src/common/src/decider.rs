//! Decider contract and the built-in momentum model.
//!
//! The trading core only depends on the trait; the momentum model keeps
//! the bot runnable end-to-end without an external signal service.

use rust_decimal::prelude::ToPrimitive;

use crate::models::{Candle, Signal};

/// Decision for the current tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decision {
    pub signal: Signal,
    /// Probability the next move is up, in [0, 1].
    pub p_up: f64,
}

impl Decision {
    pub fn flat() -> Self {
        Self {
            signal: Signal::Flat,
            p_up: 0.5,
        }
    }
}

/// Signal provider consulted once per tick.
#[cfg_attr(test, mockall::automock)]
pub trait Decider: Send {
    /// Evaluate the candle window and return a decision.
    fn decide(&self, candles: &[Candle]) -> Decision;

    /// Re-estimate model parameters on recent history. Called on the
    /// walk-forward cadence; a no-op default suits stateless deciders.
    fn refit(&mut self, candles: &[Candle]) {
        let _ = candles;
    }

    /// Whether the decider is running its fitted model, as opposed to
    /// the pre-fit fallback. Exported as `bot_model_mode`.
    fn is_fitted(&self) -> bool;
}

/// Logistic momentum model over normalized close-price momentum.
///
/// z-scores the lookback return against the refit window's realized
/// volatility and squashes through a logistic curve. Before the first
/// refit it has no scale estimate and stays FLAT.
pub struct MomentumDecider {
    lookback: usize,
    /// Minimum distance of p_up from 0.5 before emitting a side.
    min_prob: f64,
    /// Per-candle return volatility estimated at refit.
    sigma: Option<f64>,
    /// Logistic steepness, re-estimated at refit.
    steepness: f64,
}

impl MomentumDecider {
    pub fn new(lookback: usize, min_prob: f64) -> Self {
        Self {
            lookback: lookback.max(2),
            min_prob,
            sigma: None,
            steepness: 1.0,
        }
    }

    fn closes(candles: &[Candle]) -> Vec<f64> {
        candles
            .iter()
            .filter_map(|c| c.close.to_f64())
            .filter(|c| *c > 0.0)
            .collect()
    }

    fn realized_sigma(closes: &[f64]) -> Option<f64> {
        if closes.len() < 3 {
            return None;
        }
        let returns: Vec<f64> = closes.windows(2).map(|w| (w[1] / w[0]).ln()).collect();
        let mean = returns.iter().sum::<f64>() / returns.len() as f64;
        let var = returns
            .iter()
            .map(|r| (r - mean) * (r - mean))
            .sum::<f64>()
            / returns.len() as f64;
        let sigma = var.sqrt();
        (sigma > 0.0).then_some(sigma)
    }
}

impl Decider for MomentumDecider {
    fn decide(&self, candles: &[Candle]) -> Decision {
        let Some(sigma) = self.sigma else {
            return Decision::flat();
        };
        let closes = Self::closes(candles);
        if closes.len() < self.lookback + 1 {
            return Decision::flat();
        }
        let last = closes[closes.len() - 1];
        let ref_close = closes[closes.len() - 1 - self.lookback];
        let momentum = (last / ref_close).ln();
        // Normalize by the per-candle sigma scaled to the lookback.
        let z = momentum / (sigma * (self.lookback as f64).sqrt());
        let p_up = 1.0 / (1.0 + (-self.steepness * z).exp());

        let signal = if p_up >= self.min_prob {
            Signal::Buy
        } else if p_up <= 1.0 - self.min_prob {
            Signal::Sell
        } else {
            Signal::Flat
        };
        Decision { signal, p_up }
    }

    fn refit(&mut self, candles: &[Candle]) {
        let closes = Self::closes(candles);
        if let Some(sigma) = Self::realized_sigma(&closes) {
            self.sigma = Some(sigma);
        }
    }

    fn is_fitted(&self) -> bool {
        self.sigma.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn candles_from(closes: &[f64]) -> Vec<Candle> {
        closes
            .iter()
            .enumerate()
            .map(|(i, c)| {
                let close = Decimal::try_from(*c).unwrap();
                Candle {
                    time: Utc.timestamp_opt(1_700_000_000 + i as i64 * 60, 0).unwrap(),
                    open: close,
                    high: close,
                    low: close,
                    close,
                    volume: dec!(1),
                }
            })
            .collect()
    }

    #[test]
    fn test_flat_before_refit() {
        let decider = MomentumDecider::new(5, 0.55);
        let candles = candles_from(&[100.0, 101.0, 102.0, 103.0, 104.0, 105.0, 106.0]);
        assert!(!decider.is_fitted());
        assert_eq!(decider.decide(&candles).signal, Signal::Flat);
    }

    #[test]
    fn test_uptrend_emits_buy_after_refit() {
        let mut decider = MomentumDecider::new(5, 0.55);
        let flat: Vec<f64> = (0..50).map(|i| 100.0 + 0.05 * (i % 3) as f64).collect();
        decider.refit(&candles_from(&flat));
        assert!(decider.is_fitted());

        let up: Vec<f64> = (0..20).map(|i| 100.0 * 1.002f64.powi(i)).collect();
        let decision = decider.decide(&candles_from(&up));
        assert_eq!(decision.signal, Signal::Buy);
        assert!(decision.p_up > 0.55);
    }

    #[test]
    fn test_downtrend_emits_sell() {
        let mut decider = MomentumDecider::new(5, 0.55);
        let flat: Vec<f64> = (0..50).map(|i| 100.0 + 0.05 * (i % 3) as f64).collect();
        decider.refit(&candles_from(&flat));

        let down: Vec<f64> = (0..20).map(|i| 100.0 * 0.998f64.powi(i)).collect();
        let decision = decider.decide(&candles_from(&down));
        assert_eq!(decision.signal, Signal::Sell);
        assert!(decision.p_up < 0.45);
    }
}
