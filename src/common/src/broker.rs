//! Broker contract for order placement and account queries.
//!
//! This module abstracts the venue behind a trait so the trading core
//! can run against a mock in tests and the paper venue in dry-run mode.

use async_trait::async_trait;
use rust_decimal::Decimal;
use thiserror::Error;

use crate::models::{Balances, OrderStatus, ProductFilters, Side};

/// Broker failure kinds. Callers branch on the kind, not the message.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("transient broker error: {0}")]
    Transient(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("filter violation: {0}")]
    FilterViolation(String),

    #[error("post-only order would cross: {0}")]
    PostOnlyWouldCross(String),

    #[error("unknown order id: {0}")]
    UnknownOrder(String),
}

impl BrokerError {
    /// Whether a worker may retry the call before its deadline.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BrokerError::Transient(_) | BrokerError::RateLimited(_)
        )
    }
}

/// Result of a market order, reported at execution time.
#[derive(Debug, Clone)]
pub struct PlacedMarket {
    /// Volume-weighted execution price.
    pub price: Decimal,
    /// Base size actually executed.
    pub base_size: Decimal,
    /// Commission in quote currency.
    pub commission: Decimal,
    /// True if the venue only filled part of the requested quote.
    pub partial: bool,
}

/// Point-in-time view of a resting order.
#[derive(Debug, Clone)]
pub struct OrderSnapshot {
    pub status: OrderStatus,
    /// Cumulative filled base size.
    pub cumulative_base: Decimal,
    /// Volume-weighted average fill price, zero when nothing filled.
    pub avg_price: Decimal,
    /// Commission accrued so far, in quote currency.
    pub commission: Decimal,
}

/// Venue operations the trading core consumes.
///
/// Implementations must be safe for concurrent use: the orchestrator
/// and order workers call into the broker from separate tasks.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Broker: Send + Sync {
    /// Place a post-only limit order. Returns the venue order id.
    async fn place_limit_post_only(
        &self,
        side: Side,
        price: Decimal,
        base: Decimal,
    ) -> Result<String, BrokerError>;

    /// Place a market order sized in quote currency.
    async fn place_market_quote(
        &self,
        side: Side,
        quote: Decimal,
    ) -> Result<PlacedMarket, BrokerError>;

    /// Cancel a resting order. Cancelling an already-filled order is
    /// not an error; callers re-poll to learn the fill.
    async fn cancel_order(&self, order_id: &str) -> Result<(), BrokerError>;

    /// Fetch the current state of an order.
    async fn get_order(&self, order_id: &str) -> Result<OrderSnapshot, BrokerError>;

    /// Fetch account balances.
    async fn get_accounts(&self) -> Result<Balances, BrokerError>;

    /// Fetch trading filters for the product.
    async fn get_filters(&self) -> Result<ProductFilters, BrokerError>;
}
