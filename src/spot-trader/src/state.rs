//! Durable bot state: the persisted document and its atomic store.
//!
//! Snapshots are written after every mutation: serialize, write to a
//! sibling `.tmp` file, fsync, rename over the target. A file that
//! fails to parse on startup is never overwritten.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use common::Side;

use crate::book::{Book, SideBook};

#[derive(Debug, Error)]
pub enum StateError {
    #[error("state io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("state file {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },
}

/// A pending open order, persisted so a crash between reprice and
/// commit can be reconciled by polling the stored order id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct PendingOrderState {
    pub side: Side,
    #[serde(rename = "OrderID")]
    pub order_id: Option<String>,
    pub limit_price: Decimal,
    pub base_size: Decimal,
    pub quote: Decimal,
    pub take_price: Option<Decimal>,
    pub stop_price: Decimal,
    pub reason: String,
    pub created_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub reprice_count: u32,
}

/// The full persisted document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PersistedState {
    #[serde(rename = "EquityUSD")]
    pub equity_usd: Decimal,
    /// UTC midnight boundary the daily counters were last reset at.
    pub daily_start: DateTime<Utc>,
    #[serde(rename = "DailyStartEquityUSD")]
    pub daily_start_equity: Decimal,
    #[serde(rename = "DailyPnL")]
    pub daily_pnl: Decimal,
    pub next_lot_seq: u64,
    pub book_buy: SideBook,
    pub book_sell: SideBook,
    pub pending_buy: Option<PendingOrderState>,
    pub pending_sell: Option<PendingOrderState>,
    pub pending_recheck_buy: bool,
    pub pending_recheck_sell: bool,
    pub last_fit: Option<DateTime<Utc>>,
}

impl PersistedState {
    pub fn book(&self) -> Book {
        Book {
            buy: self.book_buy.clone(),
            sell: self.book_sell.clone(),
            next_lot_seq: self.next_lot_seq,
        }
    }
}

/// Serialized writer for the state file. At most one writer at a time;
/// readers only exist at startup.
pub struct StateStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the state file. Missing file is a fresh start; an
    /// unparseable file is surfaced as corruption and left untouched.
    pub fn load(&self) -> Result<Option<PersistedState>, StateError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StateError::Io(e)),
        };
        match serde_json::from_str(&raw) {
            Ok(state) => Ok(Some(state)),
            Err(e) => Err(StateError::Corrupt {
                path: self.path.clone(),
                reason: e.to_string(),
            }),
        }
    }

    /// Atomically replace the state file with `state`.
    pub fn save(&self, state: &PersistedState) -> Result<(), StateError> {
        let _guard = self.write_lock.lock().expect("state write lock");
        let tmp = self.path.with_extension("tmp");
        let payload = serde_json::to_vec_pretty(state).map_err(|e| StateError::Corrupt {
            path: tmp.clone(),
            reason: e.to_string(),
        })?;

        let mut file = File::create(&tmp)?;
        file.write_all(&payload)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::book::NewLot;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn sample_state() -> PersistedState {
        let mut book = Book::default();
        book.append(NewLot {
            side: Side::Buy,
            open_price: dec!(100),
            base_size: dec!(0.01),
            entry_fee: dec!(0.1),
            open_time: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            stop_price: Decimal::ZERO,
            take_price: Some(dec!(101.9)),
            reason: "signal".to_string(),
        });
        book.append(NewLot {
            side: Side::Buy,
            open_price: dec!(99),
            base_size: dec!(0.02),
            entry_fee: dec!(0.2),
            open_time: Utc.timestamp_opt(1_700_000_600, 0).unwrap(),
            stop_price: Decimal::ZERO,
            take_price: Some(dec!(100.88)),
            reason: "pyramid".to_string(),
        });
        PersistedState {
            equity_usd: dec!(1000.55),
            daily_start: Utc.timestamp_opt(1_699_920_000, 0).unwrap(),
            daily_start_equity: dec!(995),
            daily_pnl: dec!(5.55),
            next_lot_seq: book.next_lot_seq,
            book_buy: book.buy.clone(),
            book_sell: book.sell.clone(),
            pending_buy: Some(PendingOrderState {
                side: Side::Buy,
                order_id: Some("abc-123".to_string()),
                limit_price: dec!(99.95),
                base_size: dec!(0.01),
                quote: dec!(100),
                take_price: Some(dec!(101.85)),
                stop_price: Decimal::ZERO,
                reason: "signal".to_string(),
                created_at: Utc.timestamp_opt(1_700_000_700, 0).unwrap(),
                deadline: Utc.timestamp_opt(1_700_000_880, 0).unwrap(),
                reprice_count: 3,
            }),
            pending_sell: None,
            pending_recheck_buy: false,
            pending_recheck_sell: true,
            last_fit: Some(Utc.timestamp_opt(1_699_999_000, 0).unwrap()),
        }
    }

    #[test]
    fn test_round_trip_preserves_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        let state = sample_state();

        store.save(&state).unwrap();
        let restored = store.load().unwrap().unwrap();

        assert_eq!(restored.equity_usd, state.equity_usd);
        assert_eq!(restored.daily_pnl, state.daily_pnl);
        assert_eq!(restored.next_lot_seq, state.next_lot_seq);
        assert_eq!(restored.book_buy.lots.len(), 2);
        assert_eq!(restored.book_buy.runner_id, state.book_buy.runner_id);
        assert_eq!(restored.pending_buy, state.pending_buy);
        assert!(restored.pending_recheck_sell);
        assert_eq!(restored.last_fit, state.last_fit);

        let book = restored.book();
        assert!(book.invariants_hold());
    }

    #[test]
    fn test_missing_file_is_fresh_start() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("nope.json"));
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn test_corrupt_file_refused_and_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "{not json").unwrap();

        let store = StateStore::new(&path);
        let err = store.load().unwrap_err();
        assert!(matches!(err, StateError::Corrupt { .. }));
        // The broken file is still there, byte for byte.
        assert_eq!(fs::read_to_string(&path).unwrap(), "{not json");
    }

    #[test]
    fn test_save_overwrites_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        let mut state = sample_state();

        store.save(&state).unwrap();
        state.equity_usd = dec!(2000);
        store.save(&state).unwrap();

        let restored = store.load().unwrap().unwrap();
        assert_eq!(restored.equity_usd, dec!(2000));
        // No stray tmp file remains.
        assert!(!dir.path().join("state.tmp").exists());
    }

    #[test]
    fn test_layout_field_names() {
        let state = sample_state();
        let raw = serde_json::to_string(&state).unwrap();
        for field in [
            "\"EquityUSD\"",
            "\"DailyStart\"",
            "\"DailyPnL\"",
            "\"NextLotSeq\"",
            "\"BookBuy\"",
            "\"BookSell\"",
            "\"PendingBuy\"",
            "\"OrderID\"",
            "\"PendingRecheckBuy\"",
            "\"LastFit\"",
        ] {
            assert!(raw.contains(field), "missing {} in {}", field, raw);
        }
    }
}
