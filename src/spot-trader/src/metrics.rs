//! Prometheus metrics for the trading core.
//!
//! The registry is a process-wide singleton; trading state stays inside
//! the `Trader`, so a second symbol would only add label values here.

use once_cell::sync::Lazy;
use prometheus::{
    register_gauge_with_registry, register_int_counter_vec_with_registry,
    register_int_counter_with_registry, register_int_gauge_vec_with_registry, Encoder, Gauge,
    IntCounter, IntCounterVec, IntGaugeVec, Registry, TextEncoder,
};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

/// Orders sent to the broker, by placement mode and side.
pub static ORDERS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec_with_registry!(
        "bot_orders_total",
        "Orders placed, by mode and side",
        &["mode", "side"],
        REGISTRY
    )
    .expect("register bot_orders_total")
});

/// Decider outputs per tick.
pub static DECISIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec_with_registry!(
        "bot_decisions_total",
        "Decider signals observed",
        &["signal"],
        REGISTRY
    )
    .expect("register bot_decisions_total")
});

/// Trade lifecycle events: lot opened, closed at a win, closed at a loss.
pub static TRADES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec_with_registry!(
        "bot_trades_total",
        "Trade outcomes",
        &["result"],
        REGISTRY
    )
    .expect("register bot_trades_total")
});

pub static EQUITY_USD: Lazy<Gauge> = Lazy::new(|| {
    register_gauge_with_registry!("bot_equity_usd", "Current equity in quote currency", REGISTRY)
        .expect("register bot_equity_usd")
});

/// 0/1 gauge per decider mode; exactly one mode is set at a time.
pub static MODEL_MODE: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec_with_registry!(
        "bot_model_mode",
        "Active decider mode",
        &["mode"],
        REGISTRY
    )
    .expect("register bot_model_mode")
});

pub static VOL_RISK_FACTOR: Lazy<Gauge> = Lazy::new(|| {
    register_gauge_with_registry!(
        "bot_vol_risk_factor",
        "Volatility risk multiplier applied to sizing",
        REGISTRY
    )
    .expect("register bot_vol_risk_factor")
});

pub static WALK_FORWARD_FITS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter_with_registry!(
        "bot_walk_forward_fits_total",
        "Walk-forward decider refits",
        REGISTRY
    )
    .expect("register bot_walk_forward_fits_total")
});

/// 0/1 gauge per side: a pending open is in flight.
pub static PENDING_OPEN: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec_with_registry!(
        "pending_open_side",
        "Pending open order in flight, by side",
        &["side"],
        REGISTRY
    )
    .expect("register pending_open_side")
});

/// Flip the model-mode gauge between `model` and `heuristic`.
pub fn set_model_mode(fitted: bool) {
    MODEL_MODE
        .with_label_values(&["model"])
        .set(if fitted { 1 } else { 0 });
    MODEL_MODE
        .with_label_values(&["heuristic"])
        .set(if fitted { 0 } else { 1 });
}

/// Render the registry in Prometheus text exposition format.
pub fn render() -> String {
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("[METRICS] encode failed: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_registered_series() {
        ORDERS_TOTAL.with_label_values(&["limit", "BUY"]).inc();
        DECISIONS_TOTAL.with_label_values(&["FLAT"]).inc();
        TRADES_TOTAL.with_label_values(&["open"]).inc();
        EQUITY_USD.set(1234.5);
        set_model_mode(false);
        PENDING_OPEN.with_label_values(&["BUY"]).set(1);

        let out = render();
        assert!(out.contains("bot_orders_total"));
        assert!(out.contains("bot_decisions_total"));
        assert!(out.contains("bot_trades_total"));
        assert!(out.contains("bot_equity_usd"));
        assert!(out.contains("bot_model_mode"));
        assert!(out.contains("pending_open_side"));
    }

    #[test]
    fn test_model_mode_is_exclusive() {
        set_model_mode(true);
        assert_eq!(MODEL_MODE.with_label_values(&["model"]).get(), 1);
        assert_eq!(MODEL_MODE.with_label_values(&["heuristic"]).get(), 0);
        set_model_mode(false);
        assert_eq!(MODEL_MODE.with_label_values(&["model"]).get(), 0);
        assert_eq!(MODEL_MODE.with_label_values(&["heuristic"]).get(), 1);
    }
}
