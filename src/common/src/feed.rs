//! Market data feed contract and CSV replay implementation.
//!
//! The live venue feed is an external collaborator; in-tree the bot
//! runs on `CsvFeed`, which replays OHLCV history for backtests and
//! paper sessions.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::models::Candle;

/// Candle window plus latest tick, advanced once per loop iteration.
pub trait MarketFeed: Send {
    /// The rolling candle window ending at the cursor, oldest first.
    fn candles(&self) -> &[Candle];

    /// Latest tick price, if any data has been consumed yet.
    fn tick(&self) -> Option<Decimal>;

    /// Timestamp of the candle at the cursor.
    fn now(&self) -> Option<DateTime<Utc>>;

    /// Move to the next tick. Returns false when the feed is exhausted.
    fn advance(&mut self) -> bool;
}

/// CSV row: `time,open,high,low,close,volume`. `time` accepts unix
/// seconds or RFC3339.
#[derive(Debug, Deserialize)]
struct CsvRow {
    time: String,
    open: Decimal,
    high: Decimal,
    low: Decimal,
    close: Decimal,
    volume: Decimal,
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(secs) = raw.parse::<i64>() {
        return Utc
            .timestamp_opt(secs, 0)
            .single()
            .with_context(|| format!("unix timestamp out of range: {}", raw));
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("unparseable candle time: {}", raw))
}

/// Replays candles from a CSV file, exposing a bounded rolling window.
pub struct CsvFeed {
    candles: Vec<Candle>,
    window: usize,
    /// Index one past the last candle already delivered.
    cursor: usize,
}

impl CsvFeed {
    /// Load a candle file. Rows must be in ascending time order.
    pub fn load(path: impl AsRef<Path>, window: usize) -> Result<Self> {
        let path = path.as_ref();
        let mut reader = csv::Reader::from_path(path)
            .with_context(|| format!("open candle csv {}", path.display()))?;
        let mut candles: Vec<Candle> = Vec::new();
        for (i, row) in reader.deserialize::<CsvRow>().enumerate() {
            let row = row.with_context(|| format!("candle csv row {}", i + 1))?;
            let candle = Candle {
                time: parse_time(&row.time)?,
                open: row.open,
                high: row.high,
                low: row.low,
                close: row.close,
                volume: row.volume,
            };
            if let Some(prev) = candles.last() {
                anyhow::ensure!(
                    candle.time > prev.time,
                    "candle csv not in ascending time order at row {}",
                    i + 1
                );
            }
            candles.push(candle);
        }
        anyhow::ensure!(!candles.is_empty(), "candle csv {} is empty", path.display());
        Ok(Self {
            candles,
            window: window.max(1),
            cursor: 0,
        })
    }

    /// Total number of candles in the file.
    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }
}

impl MarketFeed for CsvFeed {
    fn candles(&self) -> &[Candle] {
        let start = self.cursor.saturating_sub(self.window);
        &self.candles[start..self.cursor]
    }

    fn tick(&self) -> Option<Decimal> {
        self.cursor
            .checked_sub(1)
            .and_then(|i| self.candles.get(i))
            .map(|c| c.close)
    }

    fn now(&self) -> Option<DateTime<Utc>> {
        self.cursor
            .checked_sub(1)
            .and_then(|i| self.candles.get(i))
            .map(|c| c.time)
    }

    fn advance(&mut self) -> bool {
        if self.cursor >= self.candles.len() {
            return false;
        }
        self.cursor += 1;
        true
    }
}
