//! Tick orchestrator and accounting.
//!
//! `step` is single-flight and sequences: drain worker results, daily
//! rollover and circuit breaker, exit pass, entry/add pass, persist.
//! All broker and disk I/O happens outside the state lock: intent is
//! computed under the lock, the call is made, and the result is
//! committed under the lock again.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::{mpsc, watch, Mutex as TokioMutex};
use tracing::{debug, error, info, warn};

use common::{Broker, Candle, Decider, ProductFilters, Side};

use crate::book::{Book, NewLot};
use crate::config::{Config, OrderType};
use crate::exits::{self, ExitReason};
use crate::metrics;
use crate::orders::{
    self, maker_price, spawn_limit_worker, OrderIdHook, OrderKind, OrderOutcome, OrderRequest,
};
use crate::pyramid::{AddContext, PyramidGate};
use crate::sizing;
use crate::state::{PendingOrderState, PersistedState, StateStore};

/// In-memory trading state guarded by one mutex.
pub struct TraderState {
    pub equity_usd: Decimal,
    pub daily_start: DateTime<Utc>,
    pub daily_start_equity: Decimal,
    pub daily_pnl: Decimal,
    pub book: Book,
    pub pending_buy: Option<PendingOrderState>,
    pub pending_sell: Option<PendingOrderState>,
    /// Lot id with a close order in flight, one per side. Not
    /// persisted: a crash leaves the lot open and a later tick
    /// re-evaluates its exit.
    pub pending_close_buy: Option<u64>,
    pub pending_close_sell: Option<u64>,
    pub pending_recheck_buy: bool,
    pub pending_recheck_sell: bool,
    pub last_fit: Option<DateTime<Utc>>,
    /// Realized PnL accumulated per open lot across partial closes,
    /// used to classify win/loss when the remainder goes.
    lot_realized: HashMap<u64, Decimal>,
    gate: PyramidGate,
    last_equity_refresh: Option<DateTime<Utc>>,
    breaker_logged: bool,
    dirty: bool,
}

impl TraderState {
    fn fresh(cfg: &Config, now: DateTime<Utc>) -> Self {
        Self {
            equity_usd: cfg.initial_equity_usd,
            daily_start: day_start(now),
            daily_start_equity: cfg.initial_equity_usd,
            daily_pnl: Decimal::ZERO,
            book: Book::default(),
            pending_buy: None,
            pending_sell: None,
            pending_close_buy: None,
            pending_close_sell: None,
            pending_recheck_buy: false,
            pending_recheck_sell: false,
            last_fit: None,
            lot_realized: HashMap::new(),
            gate: PyramidGate::default(),
            last_equity_refresh: None,
            breaker_logged: false,
            dirty: true,
        }
    }

    fn from_persisted(p: PersistedState) -> Self {
        Self {
            equity_usd: p.equity_usd,
            daily_start: p.daily_start,
            daily_start_equity: p.daily_start_equity,
            daily_pnl: p.daily_pnl,
            book: p.book(),
            pending_buy: p.pending_buy,
            pending_sell: p.pending_sell,
            pending_close_buy: None,
            pending_close_sell: None,
            pending_recheck_buy: p.pending_recheck_buy,
            pending_recheck_sell: p.pending_recheck_sell,
            last_fit: p.last_fit,
            lot_realized: HashMap::new(),
            gate: PyramidGate::default(),
            last_equity_refresh: None,
            breaker_logged: false,
            dirty: false,
        }
    }

    fn pending(&self, side: Side) -> &Option<PendingOrderState> {
        match side {
            Side::Buy => &self.pending_buy,
            Side::Sell => &self.pending_sell,
        }
    }

    fn pending_mut(&mut self, side: Side) -> &mut Option<PendingOrderState> {
        match side {
            Side::Buy => &mut self.pending_buy,
            Side::Sell => &mut self.pending_sell,
        }
    }

    fn pending_close_mut(&mut self, side: Side) -> &mut Option<u64> {
        match side {
            Side::Buy => &mut self.pending_close_buy,
            Side::Sell => &mut self.pending_close_sell,
        }
    }

    fn set_recheck(&mut self, side: Side) {
        match side {
            Side::Buy => self.pending_recheck_buy = true,
            Side::Sell => self.pending_recheck_sell = true,
        }
        self.dirty = true;
    }

    /// The recheck flag asks the next entry evaluation to re-derive
    /// sizes; evaluating is what consumes it.
    fn consume_recheck(&mut self, side: Side) {
        let flag = match side {
            Side::Buy => &mut self.pending_recheck_buy,
            Side::Sell => &mut self.pending_recheck_sell,
        };
        if *flag {
            *flag = false;
            self.dirty = true;
        }
    }

    fn snapshot(&self) -> PersistedState {
        PersistedState {
            equity_usd: self.equity_usd,
            daily_start: self.daily_start,
            daily_start_equity: self.daily_start_equity,
            daily_pnl: self.daily_pnl,
            next_lot_seq: self.book.next_lot_seq,
            book_buy: self.book.buy.clone(),
            book_sell: self.book.sell.clone(),
            pending_buy: self.pending_buy.clone(),
            pending_sell: self.pending_sell.clone(),
            pending_recheck_buy: self.pending_recheck_buy,
            pending_recheck_sell: self.pending_recheck_sell,
            last_fit: self.last_fit,
        }
    }
}

fn day_start(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive()
        .and_hms_opt(0, 0, 0)
        .expect("midnight exists")
        .and_utc()
}

/// Exit intent collected under the lock and dispatched outside it.
#[derive(Debug, Clone)]
struct ExitIntent {
    lot_id: u64,
    lot_side: Side,
    base: Decimal,
    reason: ExitReason,
}

/// Entry intent computed under the lock and dispatched outside it.
enum EntryPlan {
    Market {
        side: Side,
        quote: Decimal,
        take: Option<Decimal>,
        stop: Decimal,
        reason: String,
    },
    Limit(OrderRequest),
}

/// One trading symbol's state machine. All trading state lives here so
/// multi-symbol is additive.
pub struct Trader {
    cfg: Config,
    broker: Arc<dyn Broker>,
    decider: StdMutex<Box<dyn Decider>>,
    filters: ProductFilters,
    state: StdMutex<TraderState>,
    /// True while the state mutex is held; lets tests assert the
    /// no-broker-I/O-under-lock rule.
    lock_held: Arc<AtomicBool>,
    store: Arc<StateStore>,
    step_gate: TokioMutex<()>,
    outcome_tx: mpsc::Sender<OrderOutcome>,
    outcome_rx: TokioMutex<mpsc::Receiver<OrderOutcome>>,
    price_tx: watch::Sender<Decimal>,
    shutdown_tx: watch::Sender<bool>,
}

impl Trader {
    pub fn new(
        cfg: Config,
        broker: Arc<dyn Broker>,
        decider: Box<dyn Decider>,
        filters: ProductFilters,
        store: Arc<StateStore>,
        restored: Option<PersistedState>,
        now: DateTime<Utc>,
    ) -> Arc<Self> {
        let state = match restored {
            Some(p) => {
                info!(
                    "[STATE] restored book: {} buy lots, {} sell lots, equity {}",
                    p.book_buy.lots.len(),
                    p.book_sell.lots.len(),
                    p.equity_usd
                );
                TraderState::from_persisted(p)
            }
            None => TraderState::fresh(&cfg, now),
        };
        metrics::EQUITY_USD.set(state.equity_usd.to_f64().unwrap_or_default());

        // Buffered at least two results per side.
        let (outcome_tx, outcome_rx) = mpsc::channel(8);
        let (price_tx, _) = watch::channel(Decimal::ZERO);
        let (shutdown_tx, _) = watch::channel(false);

        Arc::new(Self {
            cfg,
            broker,
            decider: StdMutex::new(decider),
            filters,
            state: StdMutex::new(state),
            lock_held: Arc::new(AtomicBool::new(false)),
            store,
            step_gate: TokioMutex::new(()),
            outcome_tx,
            outcome_rx: TokioMutex::new(outcome_rx),
            price_tx,
            shutdown_tx,
        })
    }

    /// Shared flag that is true while the state mutex is held. Test
    /// brokers assert it is false on every RPC.
    pub fn lock_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.lock_held)
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut TraderState) -> R) -> R {
        let mut guard = self.state.lock().expect("trader state lock");
        self.lock_held.store(true, Ordering::SeqCst);
        let out = f(&mut guard);
        self.lock_held.store(false, Ordering::SeqCst);
        out
    }

    pub fn equity(&self) -> Decimal {
        self.with_state(|s| s.equity_usd)
    }

    pub fn daily_pnl(&self) -> Decimal {
        self.with_state(|s| s.daily_pnl)
    }

    pub fn open_lots(&self, side: Side) -> usize {
        self.with_state(|s| s.book.size(side))
    }

    pub fn has_pending(&self) -> bool {
        self.with_state(|s| {
            s.pending_buy.is_some()
                || s.pending_sell.is_some()
                || s.pending_close_buy.is_some()
                || s.pending_close_sell.is_some()
        })
    }

    /// Clone of the persisted view, for tests and the final summary.
    pub fn snapshot(&self) -> PersistedState {
        self.with_state(|s| s.snapshot())
    }

    /// One-line status for heartbeat and shutdown logs.
    pub fn summary(&self) -> String {
        self.with_state(|s| {
            format!(
                "equity {:.2}, daily pnl {:.2}, lots {}B/{}S, pending open {}/{}",
                s.equity_usd,
                s.daily_pnl,
                s.book.size(Side::Buy),
                s.book.size(Side::Sell),
                s.pending_buy.is_some(),
                s.pending_sell.is_some(),
            )
        })
    }

    fn persist(&self) {
        let snapshot = self.with_state(|s| {
            s.dirty = false;
            s.snapshot()
        });
        if let Err(e) = self.store.save(&snapshot) {
            // Keep trading on in-memory state; retry on next mutation.
            error!("[STATE] persist failed: {}", e);
            self.with_state(|s| s.dirty = true);
        }
    }

    fn persist_if_dirty(&self) {
        if self.with_state(|s| s.dirty) {
            self.persist();
        }
    }

    /// Reconcile persisted pending order ids after a restart: consume
    /// any fill as a lot, cancel what still rests, clear the slots.
    pub async fn recover(&self, now: DateTime<Utc>) {
        for side in [Side::Buy, Side::Sell] {
            let pending = self.with_state(|s| s.pending(side).clone());
            let Some(p) = pending else { continue };

            if let Some(order_id) = &p.order_id {
                info!("[RECOVER] polling persisted {} order {}", side, order_id);
                match self.broker.get_order(order_id).await {
                    Ok(snap) => {
                        if snap.cumulative_base > Decimal::ZERO {
                            info!(
                                "[RECOVER] {} order {} filled {} @ {}, committing lot",
                                side, order_id, snap.cumulative_base, snap.avg_price
                            );
                            self.commit_open_fill(
                                side,
                                snap.avg_price,
                                snap.cumulative_base,
                                snap.commission,
                                p.take_price,
                                p.stop_price,
                                p.reason.clone(),
                                now,
                            );
                        }
                        if snap.status == common::OrderStatus::Open {
                            if let Err(e) = self.broker.cancel_order(order_id).await {
                                warn!("[RECOVER] cancel {} failed: {}", order_id, e);
                            }
                        }
                    }
                    Err(e) => {
                        warn!("[RECOVER] order {} not reconcilable: {}", order_id, e);
                    }
                }
            }
            self.with_state(|s| {
                *s.pending_mut(side) = None;
                s.set_recheck(side);
            });
            metrics::PENDING_OPEN.with_label_values(&[side.as_str()]).set(0);
        }
        self.persist_if_dirty();
    }

    /// Rebase equity from live balances on the refresh cadence. Runs
    /// between ticks, never inside `step`.
    pub async fn maybe_refresh_equity(&self, now: DateTime<Utc>, tick_price: Decimal) {
        if !self.cfg.use_live_equity {
            return;
        }
        let due = self.with_state(|s| match s.last_equity_refresh {
            None => true,
            Some(at) => (now - at).num_seconds() >= self.cfg.equity_refresh_sec as i64,
        });
        if !due {
            return;
        }
        match self.broker.get_accounts().await {
            Ok(balances) => {
                let base_value = if tick_price > Decimal::ZERO {
                    balances.base * tick_price
                } else {
                    Decimal::ZERO
                };
                let equity = balances.quote + base_value;
                self.with_state(|s| {
                    // The daily breaker baseline stays pinned to the
                    // rollover snapshot.
                    s.equity_usd = equity;
                    s.last_equity_refresh = Some(now);
                    s.dirty = true;
                });
                metrics::EQUITY_USD.set(equity.to_f64().unwrap_or_default());
                debug!("[EQUITY] rebased to {}", equity);
            }
            Err(e) => warn!("[EQUITY] balance refresh failed: {}", e),
        }
    }

    /// One synchronized tick. Returns an action label for logs and
    /// tests.
    pub async fn step(
        self: &Arc<Self>,
        now: DateTime<Utc>,
        candles: &[Candle],
        tick_price: Decimal,
    ) -> String {
        let _flight = self.step_gate.lock().await;
        // send_replace stores the tick even before any worker exists.
        self.price_tx.send_replace(tick_price);

        // 1. Drain completed order workers.
        self.drain_outcomes(now).await;

        // 2. Daily rollover and circuit breaker.
        let halted = self.with_state(|s| {
            if now.date_naive() != s.daily_start.date_naive() {
                info!(
                    "[DAILY] rollover: equity {}, realized {}",
                    s.equity_usd, s.daily_pnl
                );
                s.daily_start = day_start(now);
                s.daily_start_equity = s.equity_usd;
                s.daily_pnl = Decimal::ZERO;
                s.breaker_logged = false;
                s.dirty = true;
            }
            let mut day_total = s.daily_pnl;
            if self.cfg.breaker_mark_to_market && tick_price > Decimal::ZERO {
                // Pending (unfilled) orders carry no position and do
                // not mark; only open lots count.
                for side in [Side::Buy, Side::Sell] {
                    for lot in s.book.lots(side) {
                        day_total += exits::net_pnl(lot, tick_price, self.cfg.fee_rate_pct);
                    }
                }
            }
            let limit = s.daily_start_equity * self.cfg.max_daily_loss_pct / dec!(100);
            let halted = day_total <= -limit;
            if halted && !s.breaker_logged {
                warn!(
                    "[BREAKER] daily loss {} breaches {} of start equity {}, entries halted",
                    day_total, limit, s.daily_start_equity
                );
                s.breaker_logged = true;
            }
            halted
        });

        // 3. Walk-forward refit on its cadence.
        self.maybe_refit(now, candles);

        // 4. Exit pass.
        let exit_intents = self.collect_exit_intents(tick_price);
        for intent in &exit_intents {
            self.dispatch_close(intent, now, tick_price).await;
        }

        // 5. Entry/add pass. Exits take precedence within a tick.
        let decision = {
            let decider = self.decider.lock().expect("decider lock");
            decider.decide(candles)
        };
        metrics::DECISIONS_TOTAL
            .with_label_values(&[decision.signal.as_str()])
            .inc();

        let label = if !exit_intents.is_empty() {
            format!("exit:{}", exit_intents[0].reason.as_str())
        } else if halted {
            "halted".to_string()
        } else {
            match decision.signal.side() {
                None => "flat".to_string(),
                Some(side) => self.entry_pass(side, now, candles, tick_price).await,
            }
        };

        // 6. Persist if anything changed.
        self.persist_if_dirty();
        label
    }

    fn maybe_refit(&self, now: DateTime<Utc>, candles: &[Candle]) {
        if candles.is_empty() {
            return;
        }
        let due = self.with_state(|s| match s.last_fit {
            None => true,
            Some(at) => (now - at).num_minutes() >= self.cfg.walk_forward_min,
        });
        let fitted = {
            let mut decider = self.decider.lock().expect("decider lock");
            if due {
                decider.refit(candles);
                metrics::WALK_FORWARD_FITS_TOTAL.inc();
            }
            decider.is_fitted()
        };
        if due {
            self.with_state(|s| {
                s.last_fit = Some(now);
                s.dirty = true;
            });
            debug!("[FIT] walk-forward refit at {}", now);
        }
        metrics::set_model_mode(fitted);
    }

    fn collect_exit_intents(&self, tick_price: Decimal) -> Vec<ExitIntent> {
        if tick_price <= Decimal::ZERO {
            return Vec::new();
        }
        self.with_state(|s| {
            let mut intents = Vec::new();
            for side in [Side::Buy, Side::Sell] {
                // One pending close per side; close wins priority.
                if s.pending_close_mut(side).is_some() {
                    continue;
                }
                let lots = match side {
                    Side::Buy => &mut s.book.buy.lots,
                    Side::Sell => &mut s.book.sell.lots,
                };
                for lot in lots.iter_mut() {
                    let before = (lot.armed, lot.trail_active, lot.trail_peak, lot.trail_stop);
                    let reason =
                        exits::evaluate(lot, tick_price, self.cfg.fee_rate_pct, &self.cfg.exits);
                    if before != (lot.armed, lot.trail_active, lot.trail_peak, lot.trail_stop) {
                        s.dirty = true;
                    }
                    if let Some(reason) = reason {
                        intents.push(ExitIntent {
                            lot_id: lot.id,
                            lot_side: side,
                            base: lot.base_size,
                            reason,
                        });
                        // One exit per side per tick.
                        break;
                    }
                }
            }
            for intent in &intents {
                *s.pending_close_mut(intent.lot_side) = Some(intent.lot_id);
            }
            intents
        })
    }

    async fn dispatch_close(self: &Arc<Self>, intent: &ExitIntent, now: DateTime<Utc>, tick_price: Decimal) {
        let exec_side = intent.lot_side.closing();
        info!(
            "[EXIT] {} lot {} ({} {}) via {:?}",
            intent.reason.as_str(),
            intent.lot_id,
            intent.lot_side,
            intent.base,
            self.cfg.orders.order_type,
        );

        match self.cfg.orders.order_type {
            OrderType::Market => {
                metrics::ORDERS_TOTAL
                    .with_label_values(&["market", exec_side.as_str()])
                    .inc();
                let quote = intent.base * tick_price;
                match orders::place_market_with_fallback(
                    self.broker.as_ref(),
                    exec_side,
                    quote,
                    self.cfg.order_min_usd,
                )
                .await
                {
                    Ok(placed) => {
                        self.commit_close_fill(
                            intent.lot_side,
                            intent.lot_id,
                            placed.price,
                            placed.base_size,
                            placed.commission,
                        );
                        self.with_state(|s| *s.pending_close_mut(intent.lot_side) = None);
                    }
                    Err(e) => {
                        warn!("[EXIT] market close of lot {} failed: {}", intent.lot_id, e);
                        self.with_state(|s| *s.pending_close_mut(intent.lot_side) = None);
                    }
                }
            }
            OrderType::Limit => {
                let limit_price = maker_price(
                    exec_side,
                    tick_price,
                    self.cfg.orders.limit_price_offset_bps,
                    &self.filters,
                );
                let req = OrderRequest {
                    exec_side,
                    book_side: intent.lot_side,
                    kind: OrderKind::Close {
                        lot_id: intent.lot_id,
                    },
                    limit_price,
                    base_size: intent.base,
                    quote: intent.base * limit_price,
                    take_price: None,
                    stop_price: Decimal::ZERO,
                    reason: intent.reason.as_str().to_string(),
                    created_at: now,
                    deadline: now + chrono::Duration::seconds(self.cfg.orders.limit_timeout_sec),
                };
                metrics::ORDERS_TOTAL
                    .with_label_values(&["limit", exec_side.as_str()])
                    .inc();
                // Close rotations are not persisted; the lot itself is.
                let hook: OrderIdHook = Arc::new(|_, _, _| {});
                spawn_limit_worker(
                    Arc::clone(&self.broker),
                    self.cfg.orders,
                    self.filters,
                    req,
                    self.price_tx.subscribe(),
                    self.outcome_tx.clone(),
                    self.shutdown_tx.subscribe(),
                    hook,
                );
            }
        }
    }

    async fn entry_pass(
        self: &Arc<Self>,
        side: Side,
        now: DateTime<Utc>,
        candles: &[Candle],
        tick_price: Decimal,
    ) -> String {
        if tick_price <= Decimal::ZERO {
            return "no-tick".to_string();
        }
        if side == Side::Sell && self.cfg.long_only {
            return "sell-blocked".to_string();
        }

        let vol_factor = sizing::vol_risk_factor(&self.cfg, candles);
        metrics::VOL_RISK_FACTOR.set(vol_factor);

        let plan = self.with_state(|s| {
            if s.pending(side).is_some() {
                info!("OPEN-PENDING: {} entry skipped, order in flight", side);
                return Err("open-pending".to_string());
            }
            s.consume_recheck(side);
            if side == Side::Sell
                && self.cfg.require_base_for_short
                && s.book.base_inventory(Side::Buy) <= Decimal::ZERO
            {
                return Err("no-inventory".to_string());
            }

            let side_size = s.book.size(side);
            let reason = if side_size == 0 {
                "signal"
            } else {
                if !self.cfg.allow_pyramiding {
                    return Err("in-position".to_string());
                }
                let ctx = AddContext {
                    now,
                    price: tick_price,
                    last_entry_price: s.book.last_entry_price(side).unwrap_or(tick_price),
                    side_size,
                    oldest_open_time: s.book.oldest_open_time(side),
                    daily_start: s.daily_start,
                };
                if let Err(block) =
                    s.gate
                        .check(side, &self.cfg.pyramid, self.cfg.max_concurrent_lots, &ctx)
                {
                    return Err(format!("blocked:{}", block.as_str()));
                }
                "pyramid"
            };

            let quote = sizing::entry_quote(&self.cfg, s.equity_usd, side_size, vol_factor);
            let k = s.book.scalp_count(side);
            let tp_pct = exits::scalp_tp_pct(&self.cfg.exits, k);

            match self.cfg.orders.order_type {
                OrderType::Market => {
                    let base = sizing::base_for(quote, tick_price, &self.filters);
                    if base * tick_price < self.filters.min_notional {
                        s.set_recheck(side);
                        return Err("min-notional".to_string());
                    }
                    Ok(EntryPlan::Market {
                        side,
                        quote,
                        take: Some(exits::take_price(side, tick_price, tp_pct)),
                        stop: exits::initial_stop_price(
                            side,
                            tick_price,
                            self.cfg.exits.stop_loss_pct,
                        ),
                        reason: reason.to_string(),
                    })
                }
                OrderType::Limit => {
                    let limit_price = maker_price(
                        side,
                        tick_price,
                        self.cfg.orders.limit_price_offset_bps,
                        &self.filters,
                    );
                    if limit_price <= Decimal::ZERO {
                        s.set_recheck(side);
                        return Err("bad-limit".to_string());
                    }
                    let base = sizing::base_for(quote, limit_price, &self.filters);
                    if base * limit_price < self.filters.min_notional {
                        s.set_recheck(side);
                        return Err("min-notional".to_string());
                    }
                    let req = OrderRequest {
                        exec_side: side,
                        book_side: side,
                        kind: OrderKind::Open,
                        limit_price,
                        base_size: base,
                        quote,
                        take_price: Some(exits::take_price(side, limit_price, tp_pct)),
                        stop_price: exits::initial_stop_price(
                            side,
                            limit_price,
                            self.cfg.exits.stop_loss_pct,
                        ),
                        reason: reason.to_string(),
                        created_at: now,
                        deadline: now
                            + chrono::Duration::seconds(self.cfg.orders.limit_timeout_sec),
                    };
                    *s.pending_mut(side) = Some(PendingOrderState {
                        side,
                        order_id: None,
                        limit_price,
                        base_size: base,
                        quote,
                        take_price: req.take_price,
                        stop_price: req.stop_price,
                        reason: req.reason.clone(),
                        created_at: req.created_at,
                        deadline: req.deadline,
                        reprice_count: 0,
                    });
                    s.dirty = true;
                    Ok(EntryPlan::Limit(req))
                }
            }
        });

        let plan = match plan {
            Ok(plan) => plan,
            Err(label) => return label,
        };

        match plan {
            EntryPlan::Market {
                side,
                quote,
                take,
                stop,
                reason,
            } => {
                metrics::ORDERS_TOTAL
                    .with_label_values(&["market", side.as_str()])
                    .inc();
                match orders::place_market_with_fallback(
                    self.broker.as_ref(),
                    side,
                    quote,
                    self.cfg.order_min_usd,
                )
                .await
                {
                    Ok(placed) => {
                        self.commit_open_fill(
                            side,
                            placed.price,
                            placed.base_size,
                            placed.commission,
                            take,
                            stop,
                            reason.clone(),
                            now,
                        );
                        format!("open:{}", reason)
                    }
                    Err(e) => {
                        warn!("[OPEN] market {} failed: {}", side, e);
                        self.with_state(|s| s.set_recheck(side));
                        "open-failed".to_string()
                    }
                }
            }
            EntryPlan::Limit(req) => {
                metrics::ORDERS_TOTAL
                    .with_label_values(&["limit", req.exec_side.as_str()])
                    .inc();
                metrics::PENDING_OPEN
                    .with_label_values(&[req.book_side.as_str()])
                    .set(1);
                let trader = Arc::clone(self);
                let hook: OrderIdHook = Arc::new(move |req, order_id, count| {
                    trader.with_state(|s| {
                        if let Some(p) = s.pending_mut(req.book_side).as_mut() {
                            p.order_id = order_id.map(str::to_string);
                            p.reprice_count = count;
                        }
                    });
                    // Rotated ids hit disk before the next broker call.
                    trader.persist();
                });
                let reason = req.reason.clone();
                spawn_limit_worker(
                    Arc::clone(&self.broker),
                    self.cfg.orders,
                    self.filters,
                    req,
                    self.price_tx.subscribe(),
                    self.outcome_tx.clone(),
                    self.shutdown_tx.subscribe(),
                    hook,
                );
                self.persist();
                format!("open-dispatched:{}", reason)
            }
        }
    }

    async fn drain_outcomes(&self, now: DateTime<Utc>) {
        let mut rx = self.outcome_rx.lock().await;
        while let Ok(outcome) = rx.try_recv() {
            self.apply_outcome(outcome, now);
        }
    }

    fn apply_outcome(&self, outcome: OrderOutcome, now: DateTime<Utc>) {
        match outcome {
            OrderOutcome::Filled {
                req,
                price,
                base,
                commission,
                partial,
            } => match req.kind {
                OrderKind::Open => {
                    debug!(
                        "[DRAIN] open fill {} {} @ {} (partial: {})",
                        req.book_side, base, price, partial
                    );
                    self.clear_pending_open(req.book_side);
                    self.commit_open_fill(
                        req.book_side,
                        price,
                        base,
                        commission,
                        req.take_price,
                        req.stop_price,
                        req.reason,
                        now,
                    );
                }
                OrderKind::Close { lot_id } => {
                    debug!(
                        "[DRAIN] close fill lot {} {} @ {} (partial: {})",
                        lot_id, base, price, partial
                    );
                    self.with_state(|s| *s.pending_close_mut(req.book_side) = None);
                    self.commit_close_fill(req.book_side, lot_id, price, base, commission);
                }
            },
            OrderOutcome::TimedOut { req } => match req.kind {
                OrderKind::Open => {
                    info!("[DRAIN] open {} timed out, recheck next tick", req.book_side);
                    self.clear_pending_open(req.book_side);
                    self.with_state(|s| s.set_recheck(req.book_side));
                }
                OrderKind::Close { lot_id } => {
                    info!("[DRAIN] close of lot {} timed out", lot_id);
                    self.with_state(|s| *s.pending_close_mut(req.book_side) = None);
                }
            },
            OrderOutcome::Cancelled { req } => match req.kind {
                OrderKind::Open => {
                    self.clear_pending_open(req.book_side);
                    self.with_state(|s| s.set_recheck(req.book_side));
                }
                OrderKind::Close { .. } => {
                    self.with_state(|s| *s.pending_close_mut(req.book_side) = None);
                }
            },
            OrderOutcome::Failed { req, error } => {
                warn!("[DRAIN] {} order failed: {}", req.book_side, error);
                match req.kind {
                    OrderKind::Open => {
                        self.clear_pending_open(req.book_side);
                        self.with_state(|s| s.set_recheck(req.book_side));
                    }
                    OrderKind::Close { .. } => {
                        self.with_state(|s| *s.pending_close_mut(req.book_side) = None);
                    }
                }
            }
        }
    }

    fn clear_pending_open(&self, side: Side) {
        self.with_state(|s| {
            *s.pending_mut(side) = None;
            s.dirty = true;
        });
        metrics::PENDING_OPEN
            .with_label_values(&[side.as_str()])
            .set(0);
    }

    /// Fall back to the configured fee rate when the venue did not
    /// report a commission.
    fn commission_or_fallback(&self, commission: Decimal, price: Decimal, base: Decimal) -> Decimal {
        if commission > Decimal::ZERO {
            commission
        } else {
            price * base * self.cfg.fee_rate_pct / dec!(100)
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn commit_open_fill(
        &self,
        side: Side,
        price: Decimal,
        base: Decimal,
        commission: Decimal,
        take: Option<Decimal>,
        stop: Decimal,
        reason: String,
        now: DateTime<Utc>,
    ) {
        if base <= Decimal::ZERO || price <= Decimal::ZERO {
            warn!("[OPEN] ignoring empty fill on {}", side);
            return;
        }
        let entry_fee = self.commission_or_fallback(commission, price, base);
        let lot_id = self.with_state(|s| {
            let id = s.book.append(NewLot {
                side,
                open_price: price,
                base_size: base,
                entry_fee,
                open_time: now,
                stop_price: stop,
                take_price: take,
                reason,
            });
            s.gate.mark_add(side, now);
            s.dirty = true;
            id
        });
        metrics::TRADES_TOTAL.with_label_values(&["open"]).inc();
        info!(
            "[OPEN] lot {} {} {} @ {} (fee {})",
            lot_id, side, base, price, entry_fee
        );
    }

    fn commit_close_fill(
        &self,
        lot_side: Side,
        lot_id: u64,
        price: Decimal,
        base: Decimal,
        commission: Decimal,
    ) {
        if base <= Decimal::ZERO || price <= Decimal::ZERO {
            warn!("[EXIT] ignoring empty close fill on lot {}", lot_id);
            return;
        }
        let exit_fee = self.commission_or_fallback(commission, price, base);
        let result = self.with_state(|s| {
            let open_price = match s.book.lot(lot_id) {
                Some(lot) => lot.open_price,
                None => {
                    warn!("[EXIT] close fill for unknown lot {}", lot_id);
                    return None;
                }
            };
            let outcome = s.book.shrink(lot_id, base, self.filters.base_step)?;
            if outcome.removed.as_ref().is_some_and(|l| l.runner) {
                // Promotion happened inside the book; extend the new
                // runner's take from the decayed scalp target to the
                // full base percentage.
                if let Some(promoted_id) = s.book.side(lot_side).runner_id {
                    if let Some(lot) = s.book.lot_mut(promoted_id) {
                        lot.take_price = Some(exits::take_price(
                            lot_side,
                            lot.open_price,
                            self.cfg.exits.take_profit_pct,
                        ));
                    }
                }
            }
            let pnl = (price - open_price) * base * lot_side.sign()
                - outcome.fragment_entry_fee
                - exit_fee;
            s.equity_usd += pnl;
            s.daily_pnl += pnl;
            let total = s.lot_realized.entry(lot_id).or_insert(Decimal::ZERO);
            *total += pnl;
            let total = *total;
            let fully_closed = outcome.removed.is_some();
            if fully_closed {
                s.lot_realized.remove(&lot_id);
            }
            s.dirty = true;
            Some((pnl, total, fully_closed, s.equity_usd))
        });

        let Some((pnl, total, fully_closed, equity)) = result else {
            return;
        };
        metrics::EQUITY_USD.set(equity.to_f64().unwrap_or_default());
        if fully_closed {
            let result = if total >= Decimal::ZERO { "win" } else { "loss" };
            metrics::TRADES_TOTAL.with_label_values(&[result]).inc();
            info!(
                "[EXIT] lot {} closed: fragment pnl {:.4}, lot pnl {:.4} ({})",
                lot_id, pnl, total, result
            );
        } else {
            info!(
                "[EXIT] lot {} shrunk by {}: fragment pnl {:.4}",
                lot_id, base, pnl
            );
        }
    }

    /// Signal workers, wait a bounded time for cancels to flush, then
    /// persist.
    pub async fn shutdown(self: &Arc<Self>) {
        info!("[SHUTDOWN] cancelling in-flight orders");
        let _ = self.shutdown_tx.send(true);
        let now = Utc::now();
        for _ in 0..20 {
            self.drain_outcomes(now).await;
            if !self.has_pending() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
        self.drain_outcomes(now).await;
        self.persist();
        info!("[SHUTDOWN] final state: {}", self.summary());
    }
}
