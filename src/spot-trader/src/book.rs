//! Position book: per-side lot lists with runner designation.
//!
//! Lots are ordered by open time; sequence ids are monotonically
//! increasing and never reused. Each non-empty side has exactly one
//! runner; when the runner closes, the newest survivor is promoted.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use common::Side;

/// One open position fragment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lot {
    pub id: u64,
    pub side: Side,
    pub open_price: Decimal,
    pub base_size: Decimal,
    /// Entry commission in quote currency, pro-rated down on shrink.
    pub entry_fee: Decimal,
    pub open_time: DateTime<Utc>,
    /// Hard stop; zero (or below for SELL, above for BUY far away)
    /// means the configured backstop is a no-op.
    pub stop_price: Decimal,
    /// Fixed take target. Runners exit on trailing only.
    pub take_price: Option<Decimal>,
    pub runner: bool,
    /// Latched once net PnL reaches the profit gate.
    pub armed: bool,
    pub trail_active: bool,
    /// Best favorable price seen since trailing activated.
    pub trail_peak: Option<Decimal>,
    pub trail_stop: Option<Decimal>,
    /// Entry reason code, e.g. `signal` or `pyramid`.
    pub reason: String,
}

/// Fields for a lot about to enter the book; id and runner flag are
/// assigned by the book.
#[derive(Debug, Clone)]
pub struct NewLot {
    pub side: Side,
    pub open_price: Decimal,
    pub base_size: Decimal,
    pub entry_fee: Decimal,
    pub open_time: DateTime<Utc>,
    pub stop_price: Decimal,
    pub take_price: Option<Decimal>,
    pub reason: String,
}

/// Outcome of a shrink: the fragment's share of the entry fee, and the
/// whole lot when the residual fell to dust.
#[derive(Debug)]
pub struct ShrinkOutcome {
    pub fragment_entry_fee: Decimal,
    pub removed: Option<Lot>,
}

/// Lots of one side, ordered by open time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SideBook {
    pub lots: Vec<Lot>,
    pub runner_id: Option<u64>,
}

/// The full position book.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Book {
    pub buy: SideBook,
    pub sell: SideBook,
    pub next_lot_seq: u64,
}

impl Default for Book {
    fn default() -> Self {
        Self {
            buy: SideBook::default(),
            sell: SideBook::default(),
            next_lot_seq: 1,
        }
    }
}

impl Book {
    pub fn side(&self, side: Side) -> &SideBook {
        match side {
            Side::Buy => &self.buy,
            Side::Sell => &self.sell,
        }
    }

    fn side_mut(&mut self, side: Side) -> &mut SideBook {
        match side {
            Side::Buy => &mut self.buy,
            Side::Sell => &mut self.sell,
        }
    }

    pub fn size(&self, side: Side) -> usize {
        self.side(side).lots.len()
    }

    pub fn lots(&self, side: Side) -> &[Lot] {
        &self.side(side).lots
    }

    pub fn runner_of(&self, side: Side) -> Option<&Lot> {
        let book = self.side(side);
        book.runner_id
            .and_then(|id| book.lots.iter().find(|l| l.id == id))
    }

    pub fn lot(&self, id: u64) -> Option<&Lot> {
        self.buy
            .lots
            .iter()
            .chain(self.sell.lots.iter())
            .find(|l| l.id == id)
    }

    pub fn lot_mut(&mut self, id: u64) -> Option<&mut Lot> {
        self.buy
            .lots
            .iter_mut()
            .chain(self.sell.lots.iter_mut())
            .find(|l| l.id == id)
    }

    /// Open time of the oldest lot on a side.
    pub fn oldest_open_time(&self, side: Side) -> Option<DateTime<Utc>> {
        self.side(side).lots.first().map(|l| l.open_time)
    }

    /// Open price of the most recent lot on a side.
    pub fn last_entry_price(&self, side: Side) -> Option<Decimal> {
        self.side(side).lots.last().map(|l| l.open_price)
    }

    /// Count of non-runner lots on a side.
    pub fn scalp_count(&self, side: Side) -> usize {
        let book = self.side(side);
        book.lots.iter().filter(|l| !l.runner).count()
    }

    /// Total open base size on a side.
    pub fn base_inventory(&self, side: Side) -> Decimal {
        self.side(side)
            .lots
            .iter()
            .map(|l| l.base_size)
            .sum()
    }

    /// Append a freshly filled lot. The first lot of a side becomes the
    /// runner. Returns the assigned lot id.
    pub fn append(&mut self, new: NewLot) -> u64 {
        let id = self.next_lot_seq;
        self.next_lot_seq += 1;
        let side = new.side;
        let book = self.side_mut(side);
        let runner = book.runner_id.is_none();
        let lot = Lot {
            id,
            side,
            open_price: new.open_price,
            base_size: new.base_size,
            entry_fee: new.entry_fee,
            open_time: new.open_time,
            stop_price: new.stop_price,
            take_price: new.take_price,
            runner,
            armed: false,
            trail_active: false,
            trail_peak: None,
            trail_stop: None,
            reason: new.reason,
        };
        book.lots.push(lot);
        if runner {
            book.runner_id = Some(id);
        }
        debug_assert!(self.invariants_hold());
        id
    }

    /// Remove a lot; if it carried the runner flag, promote the newest
    /// survivor.
    pub fn remove(&mut self, id: u64) -> Option<Lot> {
        let side = self.lot(id)?.side;
        let book = self.side_mut(side);
        let idx = book.lots.iter().position(|l| l.id == id)?;
        let lot = book.lots.remove(idx);
        if book.runner_id == Some(id) {
            book.runner_id = None;
            self.promote_newest(side);
        }
        debug_assert!(self.invariants_hold());
        Some(lot)
    }

    /// Reduce a lot in place after a partial close. The fragment's
    /// share of the entry fee is removed pro-rata; the lot itself is
    /// removed once the residual is at or below `base_step`.
    pub fn shrink(&mut self, id: u64, filled_base: Decimal, base_step: Decimal) -> Option<ShrinkOutcome> {
        let lot = self.lot_mut(id)?;
        if filled_base <= Decimal::ZERO || lot.base_size <= Decimal::ZERO {
            return None;
        }
        let filled = filled_base.min(lot.base_size);
        let fraction = filled / lot.base_size;
        let fragment_entry_fee = lot.entry_fee * fraction;
        lot.base_size -= filled;
        lot.entry_fee -= fragment_entry_fee;

        let dust = lot.base_size <= base_step;
        let removed = if dust { self.remove(id) } else { None };
        debug_assert!(self.invariants_hold());
        Some(ShrinkOutcome {
            fragment_entry_fee,
            removed,
        })
    }

    /// Promote the newest lot of a side to runner and reset its
    /// trailing state. No-op when the side is empty or already has a
    /// runner.
    pub fn promote_newest(&mut self, side: Side) {
        let book = self.side_mut(side);
        if book.runner_id.is_some() {
            return;
        }
        let newest = book
            .lots
            .iter_mut()
            .max_by_key(|l| (l.open_time, l.id));
        if let Some(lot) = newest {
            lot.runner = true;
            // Trailing state restarts for the promoted lot; the caller
            // extends its take to the runner policy.
            lot.trail_active = false;
            lot.trail_peak = None;
            lot.trail_stop = None;
            book.runner_id = Some(lot.id);
        }
    }

    /// Structural invariants; used by debug assertions and tests.
    pub fn invariants_hold(&self) -> bool {
        for side in [Side::Buy, Side::Sell] {
            let book = self.side(side);
            let runners = book.lots.iter().filter(|l| l.runner).count();
            if runners > 1 {
                return false;
            }
            if !book.lots.is_empty() && runners != 1 {
                return false;
            }
            match book.runner_id {
                Some(id) => {
                    if !book.lots.iter().any(|l| l.id == id && l.runner) {
                        return false;
                    }
                }
                None => {
                    if runners != 0 {
                        return false;
                    }
                }
            }
            if book
                .lots
                .iter()
                .any(|l| l.base_size <= Decimal::ZERO || l.open_price <= Decimal::ZERO)
            {
                return false;
            }
            if book.lots.iter().any(|l| l.id >= self.next_lot_seq) {
                return false;
            }
            if book.lots.windows(2).any(|w| w[0].open_time > w[1].open_time) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn ts(offset_secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + offset_secs, 0).unwrap()
    }

    fn new_lot(side: Side, price: Decimal, at: i64) -> NewLot {
        NewLot {
            side,
            open_price: price,
            base_size: dec!(0.01),
            entry_fee: dec!(0.1),
            open_time: ts(at),
            stop_price: Decimal::ZERO,
            take_price: Some(price * dec!(1.019)),
            reason: "signal".to_string(),
        }
    }

    #[test]
    fn test_first_lot_becomes_runner() {
        let mut book = Book::default();
        let id = book.append(new_lot(Side::Buy, dec!(100), 0));
        assert_eq!(id, 1);
        let runner = book.runner_of(Side::Buy).unwrap();
        assert_eq!(runner.id, 1);
        assert!(runner.take_price.is_some());
    }

    #[test]
    fn test_adds_are_scalps_with_takes() {
        let mut book = Book::default();
        book.append(new_lot(Side::Buy, dec!(100), 0));
        let id2 = book.append(new_lot(Side::Buy, dec!(99), 10));
        let lot2 = book.lot(id2).unwrap();
        assert!(!lot2.runner);
        assert!(lot2.take_price.is_some());
        assert_eq!(book.scalp_count(Side::Buy), 1);
        assert_eq!(book.size(Side::Buy), 2);
    }

    #[test]
    fn test_sequence_ids_monotone_across_sides() {
        let mut book = Book::default();
        let a = book.append(new_lot(Side::Buy, dec!(100), 0));
        let b = book.append(new_lot(Side::Sell, dec!(101), 5));
        let c = book.append(new_lot(Side::Buy, dec!(99), 10));
        assert!(a < b && b < c);
        assert_eq!(book.next_lot_seq, 4);
    }

    #[test]
    fn test_runner_close_promotes_newest() {
        let mut book = Book::default();
        let runner_id = book.append(new_lot(Side::Buy, dec!(100), 0));
        let mid_id = book.append(new_lot(Side::Buy, dec!(99), 10));
        let newest_id = book.append(new_lot(Side::Buy, dec!(98), 20));

        // Give the future runner some trailing state to confirm reset.
        {
            let lot = book.lot_mut(newest_id).unwrap();
            lot.trail_active = true;
            lot.trail_peak = Some(dec!(99.5));
            lot.trail_stop = Some(dec!(99.0));
        }

        book.remove(runner_id).unwrap();
        let promoted = book.runner_of(Side::Buy).unwrap();
        assert_eq!(promoted.id, newest_id);
        assert!(!promoted.trail_active);
        assert!(promoted.trail_peak.is_none());
        assert!(promoted.trail_stop.is_none());
        assert!(!book.lot(mid_id).unwrap().runner);
        assert!(book.invariants_hold());
    }

    #[test]
    fn test_scalp_close_keeps_runner() {
        let mut book = Book::default();
        let runner_id = book.append(new_lot(Side::Buy, dec!(100), 0));
        let scalp_id = book.append(new_lot(Side::Buy, dec!(99), 10));
        book.remove(scalp_id).unwrap();
        assert_eq!(book.runner_of(Side::Buy).unwrap().id, runner_id);
    }

    #[test]
    fn test_shrink_prorates_entry_fee() {
        let mut book = Book::default();
        let id = book.append(NewLot {
            base_size: dec!(0.02),
            ..new_lot(Side::Buy, dec!(100), 0)
        });

        let outcome = book.shrink(id, dec!(0.012), dec!(0.0001)).unwrap();
        assert_eq!(outcome.fragment_entry_fee, dec!(0.06));
        assert!(outcome.removed.is_none());

        let lot = book.lot(id).unwrap();
        assert_eq!(lot.base_size, dec!(0.008));
        assert_eq!(lot.entry_fee, dec!(0.04));
    }

    #[test]
    fn test_shrink_to_dust_removes_lot() {
        let mut book = Book::default();
        let id = book.append(NewLot {
            base_size: dec!(0.02),
            ..new_lot(Side::Buy, dec!(100), 0)
        });
        let outcome = book.shrink(id, dec!(0.0199), dec!(0.0001)).unwrap();
        assert!(outcome.removed.is_some());
        assert_eq!(book.size(Side::Buy), 0);
        assert!(book.runner_of(Side::Buy).is_none());
    }

    #[test]
    fn test_base_inventory_sums_open_lots() {
        let mut book = Book::default();
        book.append(new_lot(Side::Buy, dec!(100), 0));
        book.append(new_lot(Side::Buy, dec!(99), 10));
        assert_eq!(book.base_inventory(Side::Buy), dec!(0.02));
        assert_eq!(book.base_inventory(Side::Sell), Decimal::ZERO);
    }
}
