//! Maker-first order lifecycle.
//!
//! Each in-flight order is owned by a spawned worker: place a post-only
//! limit, poll on the reprice cadence, chase the mid within drift and
//! count bounds, cancel at the deadline. Workers never touch the book;
//! they report through a buffered channel drained at the start of the
//! next `step`, and rotate order ids through a persistence hook so a
//! crash can be reconciled from the state file.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use common::{Broker, BrokerError, OrderStatus, PlacedMarket, ProductFilters, Side};

use crate::config::OrderConfig;

/// What an order does to the book when it fills.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderKind {
    Open,
    Close { lot_id: u64 },
}

/// Immutable description of one order attempt.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    /// Side sent to the venue.
    pub exec_side: Side,
    /// Position side the fill affects (equals `exec_side` for opens).
    pub book_side: Side,
    pub kind: OrderKind,
    pub limit_price: Decimal,
    pub base_size: Decimal,
    pub quote: Decimal,
    pub take_price: Option<Decimal>,
    pub stop_price: Decimal,
    pub reason: String,
    pub created_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
}

/// Terminal result of a worker, drained by the orchestrator.
#[derive(Debug)]
pub enum OrderOutcome {
    Filled {
        req: OrderRequest,
        price: Decimal,
        base: Decimal,
        commission: Decimal,
        partial: bool,
    },
    TimedOut {
        req: OrderRequest,
    },
    Cancelled {
        req: OrderRequest,
    },
    Failed {
        req: OrderRequest,
        error: String,
    },
}

/// Hook invoked whenever the worker's resting order id changes, so the
/// rotation is persisted before the next broker call.
pub type OrderIdHook = Arc<dyn Fn(&OrderRequest, Option<&str>, u32) + Send + Sync>;

/// Maker price at a bps offset from the mid, snapped to the tick on
/// the passive side.
pub fn maker_price(
    side: Side,
    mid: Decimal,
    offset_bps: Decimal,
    filters: &ProductFilters,
) -> Decimal {
    let offset = mid * offset_bps / dec!(10000);
    match side {
        Side::Buy => filters.snap_price(mid - offset),
        Side::Sell => ceil_to_tick(mid + offset, filters.price_tick),
    }
}

fn ceil_to_tick(value: Decimal, tick: Decimal) -> Decimal {
    if tick <= Decimal::ZERO {
        return value;
    }
    (value / tick).ceil() * tick
}

/// Extra randomized wait on top of the poll cadence when the venue
/// pushes back.
async fn backoff_jitter(interval_ms: u64) {
    let jitter = rand::rng().random_range(0..=interval_ms.max(2) / 2);
    tokio::time::sleep(Duration::from_millis(interval_ms + jitter)).await;
}

/// Market order with the insufficient-funds fallback: one retry at the
/// configured order minimum, then the error surfaces.
pub async fn place_market_with_fallback(
    broker: &dyn Broker,
    side: Side,
    quote: Decimal,
    order_min_usd: Decimal,
) -> Result<PlacedMarket, BrokerError> {
    match broker.place_market_quote(side, quote).await {
        Err(BrokerError::InsufficientFunds(msg)) if quote > order_min_usd => {
            warn!(
                "[ORDER] market {} for {} rejected ({}), retrying at minimum {}",
                side, quote, msg, order_min_usd
            );
            broker.place_market_quote(side, order_min_usd).await
        }
        other => other,
    }
}

/// Spawn the async lifecycle for one limit order.
pub fn spawn_limit_worker(
    broker: Arc<dyn Broker>,
    cfg: OrderConfig,
    filters: ProductFilters,
    req: OrderRequest,
    price_rx: watch::Receiver<Decimal>,
    outcome_tx: mpsc::Sender<OrderOutcome>,
    shutdown_rx: watch::Receiver<bool>,
    on_order_id: OrderIdHook,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let outcome =
            run_limit_order(broker, cfg, filters, req, price_rx, shutdown_rx, on_order_id).await;
        if outcome_tx.send(outcome).await.is_err() {
            warn!("[ORDER] outcome channel closed, result dropped");
        }
    })
}

async fn run_limit_order(
    broker: Arc<dyn Broker>,
    cfg: OrderConfig,
    filters: ProductFilters,
    req: OrderRequest,
    price_rx: watch::Receiver<Decimal>,
    mut shutdown_rx: watch::Receiver<bool>,
    on_order_id: OrderIdHook,
) -> OrderOutcome {
    let original_px = req.limit_price;
    let mut current_px = req.limit_price;
    let mut base = req.base_size;
    let mut order_id: Option<String> = None;
    let mut reprices: u32 = 0;
    let interval = Duration::from_millis(cfg.reprice_interval_ms);

    loop {
        if order_id.is_none() {
            match broker
                .place_limit_post_only(req.exec_side, current_px, base)
                .await
            {
                Ok(id) => {
                    on_order_id(&req, Some(&id), reprices);
                    debug!(
                        "[ORDER] resting {} {} {} @ {} (reprice {})",
                        id, req.exec_side, base, current_px, reprices
                    );
                    order_id = Some(id);
                }
                Err(BrokerError::PostOnlyWouldCross(msg)) => {
                    // The touch moved through our price; wait for the
                    // next snapped price and try again.
                    debug!("[ORDER] post-only would cross: {}", msg);
                    let mid = *price_rx.borrow();
                    if mid > Decimal::ZERO {
                        current_px = maker_price(req.exec_side, mid, cfg.limit_price_offset_bps, &filters);
                        if req.kind == OrderKind::Open && current_px > Decimal::ZERO {
                            base = filters.snap_base(req.quote / current_px);
                        }
                    }
                }
                Err(BrokerError::RateLimited(msg)) => {
                    debug!("[ORDER] rate limited: {}", msg);
                    backoff_jitter(cfg.reprice_interval_ms).await;
                }
                Err(e) if e.is_retryable() => {
                    debug!("[ORDER] transient place failure: {}", e);
                }
                Err(e) => {
                    return OrderOutcome::Failed {
                        req,
                        error: e.to_string(),
                    };
                }
            }
        }

        let shutdown = tokio::select! {
            _ = tokio::time::sleep(interval) => false,
            changed = shutdown_rx.changed() => {
                if changed.is_ok() {
                    *shutdown_rx.borrow()
                } else {
                    // Sender gone; no further signals will arrive.
                    tokio::time::sleep(interval).await;
                    false
                }
            }
        };
        if shutdown {
            if let Some(id) = &order_id {
                let _ = broker.cancel_order(id).await;
                if let Ok(snap) = broker.get_order(id).await {
                    if snap.cumulative_base > Decimal::ZERO {
                        let partial = snap.cumulative_base < base;
                        return OrderOutcome::Filled {
                            req,
                            price: snap.avg_price,
                            base: snap.cumulative_base,
                            commission: snap.commission,
                            partial,
                        };
                    }
                }
            }
            return OrderOutcome::Cancelled { req };
        }

        let now = Utc::now();
        let Some(id) = order_id.clone() else {
            if now >= req.deadline {
                return OrderOutcome::TimedOut { req };
            }
            continue;
        };

        let snap = match broker.get_order(&id).await {
            Ok(snap) => snap,
            Err(BrokerError::RateLimited(msg)) => {
                debug!("[ORDER] poll rate limited: {}", msg);
                backoff_jitter(cfg.reprice_interval_ms).await;
                continue;
            }
            Err(BrokerError::UnknownOrder(_)) => {
                // Broker inconsistency: the order vanished. Cancel
                // best-effort and treat it as a timeout.
                warn!("[ORDER] order {} vanished at the venue", id);
                let _ = broker.cancel_order(&id).await;
                return OrderOutcome::TimedOut { req };
            }
            Err(e) if e.is_retryable() => continue,
            Err(e) => {
                warn!("[ORDER] poll failed for {}: {}", id, e);
                continue;
            }
        };

        if snap.status == OrderStatus::Filled {
            let partial = snap.cumulative_base < base;
            return OrderOutcome::Filled {
                req,
                price: snap.avg_price,
                base: snap.cumulative_base,
                commission: snap.commission,
                partial,
            };
        }

        if now >= req.deadline {
            let _ = broker.cancel_order(&id).await;
            // Re-poll to catch a fill that raced the cancel, and to
            // commit any partial as a fragment.
            if let Ok(fin) = broker.get_order(&id).await {
                if fin.cumulative_base > Decimal::ZERO {
                    let partial = fin.cumulative_base < base;
                    return OrderOutcome::Filled {
                        req,
                        price: fin.avg_price,
                        base: fin.cumulative_base,
                        commission: fin.commission,
                        partial,
                    };
                }
            }
            return OrderOutcome::TimedOut { req };
        }

        if !cfg.reprice_enable || reprices >= cfg.reprice_max_count {
            continue;
        }
        let mid = *price_rx.borrow();
        if mid <= Decimal::ZERO {
            continue;
        }
        let new_px = maker_price(req.exec_side, mid, cfg.limit_price_offset_bps, &filters);
        if new_px <= Decimal::ZERO || new_px == current_px {
            continue;
        }
        let improv_ticks = (new_px - current_px).abs() / filters.price_tick;
        let drift_bps = (new_px - original_px).abs() / original_px * dec!(10000);
        if improv_ticks < Decimal::from(cfg.reprice_min_improv_ticks)
            || drift_bps > cfg.reprice_max_drift_bps
        {
            continue;
        }

        let _ = broker.cancel_order(&id).await;
        match broker.get_order(&id).await {
            Ok(fin) if fin.status == OrderStatus::Filled || fin.cumulative_base > Decimal::ZERO => {
                // Filled (possibly partially) before the cancel landed.
                let partial = fin.cumulative_base < base;
                return OrderOutcome::Filled {
                    req,
                    price: fin.avg_price,
                    base: fin.cumulative_base,
                    commission: fin.commission,
                    partial,
                };
            }
            _ => {}
        }
        reprices += 1;
        on_order_id(&req, None, reprices);
        order_id = None;
        debug!(
            "[ORDER] reprice {} -> {} ({} of {})",
            current_px, new_px, reprices, cfg.reprice_max_count
        );
        current_px = new_px;
        if req.kind == OrderKind::Open && current_px > Decimal::ZERO {
            base = filters.snap_base(req.quote / current_px);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{Balances, PaperBroker};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn filters() -> ProductFilters {
        ProductFilters {
            price_tick: dec!(0.01),
            base_step: dec!(0.0001),
            min_notional: dec!(1),
        }
    }

    fn order_cfg() -> OrderConfig {
        OrderConfig {
            order_type: crate::config::OrderType::Limit,
            limit_price_offset_bps: dec!(5),
            limit_timeout_sec: 180,
            reprice_enable: true,
            reprice_interval_ms: 10,
            reprice_min_improv_ticks: 1,
            reprice_max_drift_bps: dec!(25),
            reprice_max_count: 20,
        }
    }

    fn open_request(limit: Decimal, deadline_offset: i64) -> OrderRequest {
        OrderRequest {
            exec_side: Side::Buy,
            book_side: Side::Buy,
            kind: OrderKind::Open,
            limit_price: limit,
            base_size: dec!(1),
            quote: dec!(100),
            take_price: Some(dec!(101.9)),
            stop_price: Decimal::ZERO,
            reason: "signal".to_string(),
            created_at: Utc::now(),
            deadline: Utc::now() + chrono::Duration::seconds(deadline_offset),
        }
    }

    fn paper(price: Decimal) -> Arc<PaperBroker> {
        let broker = Arc::new(PaperBroker::new(
            filters(),
            dec!(0.1),
            Balances {
                quote: dec!(10000),
                base: dec!(10),
            },
        ));
        broker.update_price(price);
        broker
    }

    struct Harness {
        outcome_rx: mpsc::Receiver<OrderOutcome>,
        price_tx: watch::Sender<Decimal>,
        shutdown_tx: watch::Sender<bool>,
    }

    fn launch(broker: Arc<PaperBroker>, req: OrderRequest, hook: OrderIdHook) -> Harness {
        let (outcome_tx, outcome_rx) = mpsc::channel(8);
        let (price_tx, price_rx) = watch::channel(broker.price());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        spawn_limit_worker(
            broker,
            order_cfg(),
            filters(),
            req,
            price_rx,
            outcome_tx,
            shutdown_rx,
            hook,
        );
        Harness {
            outcome_rx,
            price_tx,
            shutdown_tx,
        }
    }

    fn noop_hook() -> OrderIdHook {
        Arc::new(|_, _, _| {})
    }

    #[test]
    fn test_maker_price_snaps_both_sides() {
        let f = filters();
        // 5 bps below 100.00 is 99.95.
        assert_eq!(maker_price(Side::Buy, dec!(100.00), dec!(5), &f), dec!(99.95));
        // Sell side rounds up to stay passive.
        assert_eq!(maker_price(Side::Sell, dec!(100.00), dec!(5), &f), dec!(100.05));
        // Snapping floors an awkward mid for buys.
        assert_eq!(
            maker_price(Side::Buy, dec!(100.013), dec!(5), &f),
            dec!(99.96)
        );
    }

    #[tokio::test]
    async fn test_worker_fills_when_price_crosses() {
        let broker = paper(dec!(100.00));
        let mut h = launch(broker.clone(), open_request(dec!(99.95), 60), noop_hook());

        // Let the worker place, then cross its limit.
        tokio::time::sleep(Duration::from_millis(30)).await;
        broker.update_price(dec!(99.90));

        let outcome = tokio::time::timeout(Duration::from_secs(2), h.outcome_rx.recv())
            .await
            .expect("worker result")
            .expect("channel open");
        match outcome {
            OrderOutcome::Filled {
                price,
                base,
                partial,
                ..
            } => {
                assert_eq!(price, dec!(99.95));
                assert_eq!(base, dec!(1));
                assert!(!partial);
            }
            other => panic!("expected fill, got {:?}", other),
        }
        let _ = h.price_tx;
        let _ = h.shutdown_tx;
    }

    #[tokio::test]
    async fn test_worker_times_out_and_cancels() {
        let broker = paper(dec!(100.00));
        // Deadline already passed: first poll cancels and reports.
        let mut h = launch(broker.clone(), open_request(dec!(99.95), -1), noop_hook());

        let outcome = tokio::time::timeout(Duration::from_secs(2), h.outcome_rx.recv())
            .await
            .expect("worker result")
            .expect("channel open");
        assert!(matches!(outcome, OrderOutcome::TimedOut { .. }));
        let _ = h.price_tx;
        let _ = h.shutdown_tx;
    }

    #[tokio::test]
    async fn test_worker_reprices_toward_drifting_mid() {
        let broker = paper(dec!(100.00));
        let rotations = Arc::new(AtomicU32::new(0));
        let hook: OrderIdHook = {
            let rotations = rotations.clone();
            Arc::new(move |_req, id, _count| {
                if id.is_some() {
                    rotations.fetch_add(1, Ordering::SeqCst);
                }
            })
        };
        let mut h = launch(broker.clone(), open_request(dec!(99.95), 60), hook);

        // Mid drifts up; the worker should chase it.
        tokio::time::sleep(Duration::from_millis(30)).await;
        h.price_tx.send(dec!(100.05)).unwrap();
        broker.update_price(dec!(100.05));
        tokio::time::sleep(Duration::from_millis(50)).await;
        // New snapped price is 99.99; crossing it fills the replacement.
        broker.update_price(dec!(99.99));

        let outcome = tokio::time::timeout(Duration::from_secs(2), h.outcome_rx.recv())
            .await
            .expect("worker result")
            .expect("channel open");
        match outcome {
            OrderOutcome::Filled { price, .. } => {
                assert_eq!(price, dec!(99.99));
            }
            other => panic!("expected fill after reprice, got {:?}", other),
        }
        assert!(rotations.load(Ordering::SeqCst) >= 2);
        let _ = h.shutdown_tx;
    }

    #[tokio::test]
    async fn test_shutdown_cancels_worker() {
        let broker = paper(dec!(100.00));
        let mut h = launch(broker.clone(), open_request(dec!(99.95), 60), noop_hook());

        tokio::time::sleep(Duration::from_millis(30)).await;
        h.shutdown_tx.send(true).unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(2), h.outcome_rx.recv())
            .await
            .expect("worker result")
            .expect("channel open");
        assert!(matches!(outcome, OrderOutcome::Cancelled { .. }));
    }

    #[tokio::test]
    async fn test_market_fallback_retries_at_minimum() {
        let broker = paper(dec!(100.00));
        broker.fail_next(BrokerError::InsufficientFunds("simulated".into()));

        let placed = place_market_with_fallback(broker.as_ref(), Side::Buy, dec!(500), dec!(5))
            .await
            .unwrap();
        // The retry went through at the order minimum.
        assert_eq!(placed.base_size, dec!(0.05));
    }

    #[tokio::test]
    async fn test_market_fallback_surfaces_second_failure() {
        let broker = paper(dec!(100.00));
        broker.fail_next(BrokerError::InsufficientFunds("first".into()));
        broker.fail_next(BrokerError::InsufficientFunds("second".into()));

        let err = place_market_with_fallback(broker.as_ref(), Side::Buy, dec!(500), dec!(5))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::InsufficientFunds(_)));
    }
}
