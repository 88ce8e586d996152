//! Shared data models for market data and order plumbing.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Sign of the position direction: +1 for long, -1 for short.
    pub fn sign(&self) -> Decimal {
        match self {
            Side::Buy => Decimal::ONE,
            Side::Sell => Decimal::NEGATIVE_ONE,
        }
    }

    /// The order side that closes a position on this side.
    pub fn closing(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Signal emitted by the decider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Signal {
    Buy,
    Sell,
    Flat,
}

impl Signal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Signal::Buy => "BUY",
            Signal::Sell => "SELL",
            Signal::Flat => "FLAT",
        }
    }

    /// The entry side this signal maps to, if any.
    pub fn side(&self) -> Option<Side> {
        match self {
            Signal::Buy => Some(Side::Buy),
            Signal::Sell => Some(Side::Sell),
            Signal::Flat => None,
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One OHLCV candle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

/// Exchange trading filters for a product.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ProductFilters {
    /// Minimum price increment.
    pub price_tick: Decimal,
    /// Minimum base size increment.
    pub base_step: Decimal,
    /// Minimum order notional in quote currency.
    pub min_notional: Decimal,
}

impl ProductFilters {
    /// Floor a value to a multiple of `step`. Returns zero for a
    /// non-positive step.
    pub fn floor_to(value: Decimal, step: Decimal) -> Decimal {
        if step <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        (value / step).floor() * step
    }

    /// Snap a price down to the price tick.
    pub fn snap_price(&self, price: Decimal) -> Decimal {
        Self::floor_to(price, self.price_tick)
    }

    /// Floor a base size to the base step.
    pub fn snap_base(&self, base: Decimal) -> Decimal {
        Self::floor_to(base, self.base_step)
    }
}

/// Venue-side order status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Open,
    Filled,
    Cancelled,
}

/// Account balances in quote and base currency.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Balances {
    pub quote: Decimal,
    pub base: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_side_sign_and_closing() {
        assert_eq!(Side::Buy.sign(), Decimal::ONE);
        assert_eq!(Side::Sell.sign(), Decimal::NEGATIVE_ONE);
        assert_eq!(Side::Buy.closing(), Side::Sell);
        assert_eq!(Side::Sell.closing(), Side::Buy);
    }

    #[test]
    fn test_floor_to_step() {
        assert_eq!(
            ProductFilters::floor_to(dec!(0.010379), dec!(0.0001)),
            dec!(0.0103)
        );
        assert_eq!(ProductFilters::floor_to(dec!(5), dec!(0)), dec!(0));
    }

    #[test]
    fn test_snap_price() {
        let f = ProductFilters {
            price_tick: dec!(0.01),
            base_step: dec!(0.0001),
            min_notional: dec!(1),
        };
        assert_eq!(f.snap_price(dec!(100.0499)), dec!(100.04));
        assert_eq!(f.snap_base(dec!(0.012345)), dec!(0.0123));
    }

    #[test]
    fn test_signal_side() {
        assert_eq!(Signal::Buy.side(), Some(Side::Buy));
        assert_eq!(Signal::Flat.side(), None);
    }
}
