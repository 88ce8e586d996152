//! Paper venue for dry-run and backtest sessions.
//!
//! Simulates the subset of venue behavior the trading core exercises:
//! post-only limit orders resting until the tick price crosses them,
//! immediate market fills at the current tick, maker/taker commission
//! at a flat rate, and balance accounting.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::debug;
use uuid::Uuid;

use crate::broker::{Broker, BrokerError, OrderSnapshot, PlacedMarket};
use crate::models::{Balances, OrderStatus, ProductFilters, Side};

#[derive(Debug, Clone)]
struct Resting {
    side: Side,
    price: Decimal,
    base: Decimal,
    filled_base: Decimal,
    commission: Decimal,
}

#[derive(Debug, Clone)]
struct Completed {
    status: OrderStatus,
    cumulative_base: Decimal,
    avg_price: Decimal,
    commission: Decimal,
}

#[derive(Debug, Default)]
struct Inner {
    price: Decimal,
    balances: Balances,
    resting: HashMap<String, Resting>,
    completed: HashMap<String, Completed>,
    /// Errors injected by tests, consumed by the next placement call.
    fail_queue: VecDeque<BrokerError>,
}

/// Simulated venue driven by tick prices pushed via [`PaperBroker::update_price`].
pub struct PaperBroker {
    inner: Mutex<Inner>,
    filters: ProductFilters,
    fee_rate_pct: Decimal,
}

impl PaperBroker {
    pub fn new(filters: ProductFilters, fee_rate_pct: Decimal, starting: Balances) -> Self {
        Self {
            inner: Mutex::new(Inner {
                balances: starting,
                ..Inner::default()
            }),
            filters,
            fee_rate_pct,
        }
    }

    fn fee(&self, notional: Decimal) -> Decimal {
        notional * self.fee_rate_pct / dec!(100)
    }

    /// Push a new tick price and fill any resting orders it crosses.
    pub fn update_price(&self, price: Decimal) {
        let mut inner = self.inner.lock().expect("paper lock");
        inner.price = price;

        let crossed: Vec<String> = inner
            .resting
            .iter()
            .filter(|(_, o)| match o.side {
                Side::Buy => price <= o.price,
                Side::Sell => price >= o.price,
            })
            .map(|(id, _)| id.clone())
            .collect();

        for id in crossed {
            let order = inner.resting.remove(&id).expect("crossed order present");
            let remaining = order.base - order.filled_base;
            let notional = remaining * order.price;
            let fee = self.fee(notional);
            match order.side {
                Side::Buy => {
                    inner.balances.quote -= notional + fee;
                    inner.balances.base += remaining;
                }
                Side::Sell => {
                    inner.balances.base -= remaining;
                    inner.balances.quote += notional - fee;
                }
            }
            debug!(
                "[PAPER] limit fill {} {} {} @ {}",
                id, order.side, remaining, order.price
            );
            inner.completed.insert(
                id,
                Completed {
                    status: OrderStatus::Filled,
                    cumulative_base: order.base,
                    avg_price: order.price,
                    commission: order.commission + fee,
                },
            );
        }
    }

    /// Current simulated tick price.
    pub fn price(&self) -> Decimal {
        self.inner.lock().expect("paper lock").price
    }

    /// Inject an error consumed by the next placement call. Test hook.
    pub fn fail_next(&self, err: BrokerError) {
        self.inner.lock().expect("paper lock").fail_queue.push_back(err);
    }

    /// Ids of currently resting orders. Test hook.
    pub fn resting_order_ids(&self) -> Vec<String> {
        self.inner
            .lock()
            .expect("paper lock")
            .resting
            .keys()
            .cloned()
            .collect()
    }

    /// Partially fill a resting order without removing it. Test hook.
    pub fn fill_partially(&self, order_id: &str, base: Decimal) {
        let mut inner = self.inner.lock().expect("paper lock");
        if let Some(order) = inner.resting.get_mut(order_id) {
            let fee_rate = self.fee_rate_pct;
            order.filled_base += base;
            order.commission += base * order.price * fee_rate / dec!(100);
            let (side, price) = (order.side, order.price);
            match side {
                Side::Buy => {
                    inner.balances.quote -= base * price;
                    inner.balances.base += base;
                }
                Side::Sell => {
                    inner.balances.base -= base;
                    inner.balances.quote += base * price;
                }
            }
        }
    }

    fn take_injected(&self, inner: &mut Inner) -> Option<BrokerError> {
        inner.fail_queue.pop_front()
    }
}

#[async_trait]
impl Broker for PaperBroker {
    async fn place_limit_post_only(
        &self,
        side: Side,
        price: Decimal,
        base: Decimal,
    ) -> Result<String, BrokerError> {
        let mut inner = self.inner.lock().expect("paper lock");
        if let Some(err) = self.take_injected(&mut inner) {
            return Err(err);
        }
        if price <= Decimal::ZERO || base <= Decimal::ZERO {
            return Err(BrokerError::FilterViolation(format!(
                "non-positive price {} or base {}",
                price, base
            )));
        }
        if base < self.filters.base_step {
            return Err(BrokerError::FilterViolation(format!(
                "base {} below step {}",
                base, self.filters.base_step
            )));
        }
        if base * price < self.filters.min_notional {
            return Err(BrokerError::FilterViolation(format!(
                "notional {} below minimum {}",
                base * price,
                self.filters.min_notional
            )));
        }
        // Post-only orders must rest: the tick stands in for the touch.
        let crosses = match side {
            Side::Buy => inner.price > Decimal::ZERO && price >= inner.price,
            Side::Sell => inner.price > Decimal::ZERO && price <= inner.price,
        };
        if crosses {
            return Err(BrokerError::PostOnlyWouldCross(format!(
                "{} {} vs tick {}",
                side, price, inner.price
            )));
        }
        if side == Side::Buy {
            let required = price * base * (Decimal::ONE + self.fee_rate_pct / dec!(100));
            if required > inner.balances.quote {
                return Err(BrokerError::InsufficientFunds(format!(
                    "need {} quote, have {}",
                    required, inner.balances.quote
                )));
            }
        } else if base > inner.balances.base {
            return Err(BrokerError::InsufficientFunds(format!(
                "need {} base, have {}",
                base, inner.balances.base
            )));
        }

        let id = Uuid::new_v4().to_string();
        inner.resting.insert(
            id.clone(),
            Resting {
                side,
                price,
                base,
                filled_base: Decimal::ZERO,
                commission: Decimal::ZERO,
            },
        );
        debug!("[PAPER] resting {} {} {} @ {}", id, side, base, price);
        Ok(id)
    }

    async fn place_market_quote(
        &self,
        side: Side,
        quote: Decimal,
    ) -> Result<PlacedMarket, BrokerError> {
        let mut inner = self.inner.lock().expect("paper lock");
        if let Some(err) = self.take_injected(&mut inner) {
            return Err(err);
        }
        let price = inner.price;
        if price <= Decimal::ZERO {
            return Err(BrokerError::Transient("no tick price yet".into()));
        }
        let base = ProductFilters::floor_to(quote / price, self.filters.base_step);
        if base * price < self.filters.min_notional {
            return Err(BrokerError::FilterViolation(format!(
                "notional {} below minimum {}",
                base * price,
                self.filters.min_notional
            )));
        }
        let notional = base * price;
        let fee = self.fee(notional);
        match side {
            Side::Buy => {
                if notional + fee > inner.balances.quote {
                    return Err(BrokerError::InsufficientFunds(format!(
                        "need {} quote, have {}",
                        notional + fee,
                        inner.balances.quote
                    )));
                }
                inner.balances.quote -= notional + fee;
                inner.balances.base += base;
            }
            Side::Sell => {
                if base > inner.balances.base {
                    return Err(BrokerError::InsufficientFunds(format!(
                        "need {} base, have {}",
                        base, inner.balances.base
                    )));
                }
                inner.balances.base -= base;
                inner.balances.quote += notional - fee;
            }
        }
        debug!("[PAPER] market fill {} {} @ {}", side, base, price);
        Ok(PlacedMarket {
            price,
            base_size: base,
            commission: fee,
            partial: false,
        })
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock().expect("paper lock");
        if let Some(order) = inner.resting.remove(order_id) {
            let avg_price = if order.filled_base > Decimal::ZERO {
                order.price
            } else {
                Decimal::ZERO
            };
            inner.completed.insert(
                order_id.to_string(),
                Completed {
                    status: OrderStatus::Cancelled,
                    cumulative_base: order.filled_base,
                    avg_price,
                    commission: order.commission,
                },
            );
            return Ok(());
        }
        // Cancelling a filled or already-cancelled order mirrors venue
        // behavior: the call succeeds and the snapshot tells the truth.
        if inner.completed.contains_key(order_id) {
            return Ok(());
        }
        Err(BrokerError::UnknownOrder(order_id.to_string()))
    }

    async fn get_order(&self, order_id: &str) -> Result<OrderSnapshot, BrokerError> {
        let inner = self.inner.lock().expect("paper lock");
        if let Some(order) = inner.resting.get(order_id) {
            let avg_price = if order.filled_base > Decimal::ZERO {
                order.price
            } else {
                Decimal::ZERO
            };
            return Ok(OrderSnapshot {
                status: OrderStatus::Open,
                cumulative_base: order.filled_base,
                avg_price,
                commission: order.commission,
            });
        }
        if let Some(done) = inner.completed.get(order_id) {
            return Ok(OrderSnapshot {
                status: done.status,
                cumulative_base: done.cumulative_base,
                avg_price: done.avg_price,
                commission: done.commission,
            });
        }
        Err(BrokerError::UnknownOrder(order_id.to_string()))
    }

    async fn get_accounts(&self) -> Result<Balances, BrokerError> {
        Ok(self.inner.lock().expect("paper lock").balances)
    }

    async fn get_filters(&self) -> Result<ProductFilters, BrokerError> {
        Ok(self.filters)
    }
}
