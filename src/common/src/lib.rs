//! Common library for the spot trader.
//!
//! Provides the thin seams the trading core depends on:
//! - Shared market data models (candles, ticks, filters)
//! - The `Broker` contract and its error taxonomy
//! - `PaperBroker`, the dry-run venue simulation
//! - The `Decider` contract plus a small momentum model
//! - The `MarketFeed` contract and CSV replay feed

pub mod broker;
pub mod decider;
pub mod feed;
pub mod models;
pub mod paper;

pub use broker::{Broker, BrokerError, OrderSnapshot, PlacedMarket};
pub use decider::{Decider, Decision, MomentumDecider};
pub use feed::{CsvFeed, MarketFeed};
pub use models::{Balances, Candle, OrderStatus, ProductFilters, Side, Signal};
pub use paper::PaperBroker;
