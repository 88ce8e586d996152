//! Configuration loading from environment variables.
//!
//! Every knob has a default so a bare environment starts a paper
//! session; invalid values are fatal at startup.

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {0}: {1}")]
    Invalid(String, String),

    #[error("{0}")]
    Constraint(String),
}

fn parse_env<T: FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| ConfigError::Invalid(key.to_string(), raw)),
        Err(_) => Ok(default),
    }
}

fn parse_bool(key: &str, default: bool) -> Result<bool, ConfigError> {
    match env::var(key) {
        Ok(raw) => match raw.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid(key.to_string(), raw)),
        },
        Err(_) => Ok(default),
    }
}

/// Order placement mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderType {
    Market,
    Limit,
}

impl FromStr for OrderType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "market" => Ok(OrderType::Market),
            "limit" => Ok(OrderType::Limit),
            other => Err(other.to_string()),
        }
    }
}

/// Lot-size ramp shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RampMode {
    Linear,
    Exp,
}

impl FromStr for RampMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "linear" => Ok(RampMode::Linear),
            "exp" => Ok(RampMode::Exp),
            other => Err(other.to_string()),
        }
    }
}

/// Scalp take-profit decay shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecayMode {
    Linear,
    Exp,
}

impl FromStr for DecayMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "linear" => Ok(DecayMode::Linear),
            "exp" => Ok(DecayMode::Exp),
            other => Err(other.to_string()),
        }
    }
}

/// Pyramiding gate parameters (§ adds spacing and adverse-move decay).
#[derive(Debug, Clone, Copy)]
pub struct PyramidConfig {
    pub min_seconds_between: i64,
    pub min_adverse_pct: f64,
    pub decay_lambda: f64,
    pub decay_min_pct: f64,
}

/// Lot-size ramping parameters.
#[derive(Debug, Clone, Copy)]
pub struct RampConfig {
    pub enable: bool,
    pub mode: RampMode,
    pub start_pct: Decimal,
    pub step_pct: Decimal,
    pub growth: f64,
    pub max_pct: Decimal,
}

/// Volatility risk adjustment parameters.
#[derive(Debug, Clone, Copy)]
pub struct VolConfig {
    pub adjust: bool,
    pub target_pct: f64,
    pub factor_min: f64,
    pub factor_max: f64,
}

/// Exit engine parameters.
#[derive(Debug, Clone, Copy)]
pub struct ExitConfig {
    pub take_profit_pct: Decimal,
    pub scalp_tp_decay_mode: DecayMode,
    pub scalp_tp_decay_factor: f64,
    pub scalp_tp_decay_step_pct: Decimal,
    pub scalp_tp_min_pct: Decimal,
    pub stop_loss_pct: Decimal,
    pub profit_gate_usd: Decimal,
    pub trail_activate_usd_runner: Decimal,
    pub trail_distance_pct_runner: Decimal,
    pub trail_activate_usd_scalp: Decimal,
    pub trail_distance_pct_scalp: Decimal,
}

/// Order lifecycle parameters consumed by the maker-first worker.
#[derive(Debug, Clone, Copy)]
pub struct OrderConfig {
    pub order_type: OrderType,
    pub limit_price_offset_bps: Decimal,
    pub limit_timeout_sec: i64,
    pub reprice_enable: bool,
    pub reprice_interval_ms: u64,
    pub reprice_min_improv_ticks: u32,
    pub reprice_max_drift_bps: Decimal,
    pub reprice_max_count: u32,
}

/// Full bot configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub product_id: String,
    pub granularity_sec: u64,
    pub use_tick_price: bool,
    pub tick_interval_sec: u64,
    pub candle_resync_sec: u64,
    pub dry_run: bool,

    pub long_only: bool,
    pub require_base_for_short: bool,
    pub allow_pyramiding: bool,
    pub max_concurrent_lots: usize,
    pub pyramid: PyramidConfig,

    pub risk_per_trade_pct: Decimal,
    pub order_min_usd: Decimal,
    pub ramp: RampConfig,
    pub vol: VolConfig,

    pub exits: ExitConfig,
    pub orders: OrderConfig,

    pub fee_rate_pct: Decimal,
    pub state_file: PathBuf,
    pub max_daily_loss_pct: Decimal,
    pub breaker_mark_to_market: bool,
    pub use_live_equity: bool,
    pub equity_refresh_sec: u64,
    pub initial_equity_usd: Decimal,

    pub walk_forward_min: i64,
    pub momentum_lookback: usize,
    pub decider_min_prob: f64,

    pub http_addr: SocketAddr,
    pub feed_csv: Option<PathBuf>,
    pub backtest_speed_ms: u64,
}

impl Config {
    /// Load configuration from environment variables, `.env` included.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_env_only()
    }

    /// Load from the process environment only. Useful for testing.
    pub fn from_env_only() -> Result<Self, ConfigError> {
        let cfg = Self {
            product_id: parse_env("PRODUCT_ID", "BTC-USD".to_string())?,
            granularity_sec: parse_env("GRANULARITY", 60u64)?,
            use_tick_price: parse_bool("USE_TICK_PRICE", true)?,
            tick_interval_sec: parse_env("TICK_INTERVAL_SEC", 2u64)?,
            candle_resync_sec: parse_env("CANDLE_RESYNC_SEC", 30u64)?,
            dry_run: parse_bool("DRY_RUN", true)?,

            long_only: parse_bool("LONG_ONLY", true)?,
            require_base_for_short: parse_bool("REQUIRE_BASE_FOR_SHORT", true)?,
            allow_pyramiding: parse_bool("ALLOW_PYRAMIDING", true)?,
            max_concurrent_lots: parse_env("MAX_CONCURRENT_LOTS", 6usize)?,
            pyramid: PyramidConfig {
                min_seconds_between: parse_env("PYRAMID_MIN_SECONDS_BETWEEN", 180i64)?,
                min_adverse_pct: parse_env("PYRAMID_MIN_ADVERSE_PCT", 1.5f64)?,
                decay_lambda: parse_env("PYRAMID_DECAY_LAMBDA", 0.02f64)?,
                decay_min_pct: parse_env("PYRAMID_DECAY_MIN_PCT", 0.4f64)?,
            },

            risk_per_trade_pct: parse_env("RISK_PER_TRADE_PCT", dec!(10))?,
            order_min_usd: parse_env("ORDER_MIN_USD", dec!(5))?,
            ramp: RampConfig {
                enable: parse_bool("RAMP_ENABLE", false)?,
                mode: parse_env("RAMP_MODE", RampMode::Linear)?,
                start_pct: parse_env("RAMP_START_PCT", dec!(5))?,
                step_pct: parse_env("RAMP_STEP_PCT", dec!(2.5))?,
                growth: parse_env("RAMP_GROWTH", 1.5f64)?,
                max_pct: parse_env("RAMP_MAX_PCT", dec!(25))?,
            },
            vol: VolConfig {
                adjust: parse_bool("VOL_RISK_ADJUST", false)?,
                target_pct: parse_env("VOL_TARGET_PCT", 1.0f64)?,
                factor_min: parse_env("VOL_FACTOR_MIN", 0.25f64)?,
                factor_max: parse_env("VOL_FACTOR_MAX", 2.0f64)?,
            },

            exits: ExitConfig {
                take_profit_pct: parse_env("TAKE_PROFIT_PCT", dec!(1.9))?,
                scalp_tp_decay_mode: parse_env("SCALP_TP_DECAY_MODE", DecayMode::Exp)?,
                scalp_tp_decay_factor: parse_env("SCALP_TP_DECAY_FACTOR", 0.85f64)?,
                scalp_tp_decay_step_pct: parse_env("SCALP_TP_DECAY_STEP_PCT", dec!(0.2))?,
                scalp_tp_min_pct: parse_env("SCALP_TP_MIN_PCT", dec!(0.4))?,
                stop_loss_pct: parse_env("STOP_LOSS_PCT", dec!(100))?,
                profit_gate_usd: parse_env("PROFIT_GATE_USD", dec!(0.25))?,
                trail_activate_usd_runner: parse_env("TRAIL_ACTIVATE_USD_RUNNER", dec!(1.0))?,
                trail_distance_pct_runner: parse_env("TRAIL_DISTANCE_PCT_RUNNER", dec!(0.6))?,
                trail_activate_usd_scalp: parse_env("TRAIL_ACTIVATE_USD_SCALP", dec!(0.5))?,
                trail_distance_pct_scalp: parse_env("TRAIL_DISTANCE_PCT_SCALP", dec!(0.35))?,
            },
            orders: OrderConfig {
                order_type: parse_env("ORDER_TYPE", OrderType::Limit)?,
                limit_price_offset_bps: parse_env("LIMIT_PRICE_OFFSET_BPS", dec!(5))?,
                limit_timeout_sec: parse_env("LIMIT_TIMEOUT_SEC", 180i64)?,
                reprice_enable: parse_bool("REPRICE_ENABLE", true)?,
                reprice_interval_ms: parse_env("REPRICE_INTERVAL_MS", 1200u64)?,
                reprice_min_improv_ticks: parse_env("REPRICE_MIN_IMPROV_TICKS", 1u32)?,
                reprice_max_drift_bps: parse_env("REPRICE_MAX_DRIFT_BPS", dec!(25))?,
                reprice_max_count: parse_env("REPRICE_MAX_COUNT", 20u32)?,
            },

            fee_rate_pct: parse_env("FEE_RATE_PCT", dec!(0.1))?,
            state_file: PathBuf::from(parse_env(
                "STATE_FILE",
                "bot_state.json".to_string(),
            )?),
            max_daily_loss_pct: parse_env("MAX_DAILY_LOSS_PCT", dec!(3))?,
            breaker_mark_to_market: parse_bool("DAILY_BREAKER_MARK_TO_MARKET", false)?,
            use_live_equity: parse_bool("USE_LIVE_EQUITY", false)?,
            equity_refresh_sec: parse_env("EQUITY_REFRESH_SEC", 300u64)?,
            initial_equity_usd: parse_env("INITIAL_EQUITY_USD", dec!(1000))?,

            walk_forward_min: parse_env("WALK_FORWARD_MIN", 60i64)?,
            momentum_lookback: parse_env("MOMENTUM_LOOKBACK", 12usize)?,
            decider_min_prob: parse_env("DECIDER_MIN_PROB", 0.55f64)?,

            http_addr: parse_env("HTTP_ADDR", "127.0.0.1:9912".parse().expect("default addr"))?,
            feed_csv: env::var("FEED_CSV").ok().filter(|v| !v.is_empty()).map(PathBuf::from),
            backtest_speed_ms: parse_env("BACKTEST_SPEED", 0u64)?,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let constraint = |msg: &str| Err(ConfigError::Constraint(msg.to_string()));

        if self.product_id.is_empty() {
            return constraint("PRODUCT_ID must not be empty");
        }
        if self.granularity_sec == 0 || self.tick_interval_sec == 0 {
            return constraint("GRANULARITY and TICK_INTERVAL_SEC must be positive");
        }
        if self.max_concurrent_lots == 0 {
            return constraint("MAX_CONCURRENT_LOTS must be at least 1");
        }
        if self.pyramid.min_adverse_pct < 0.0
            || self.pyramid.decay_lambda < 0.0
            || self.pyramid.decay_min_pct < 0.0
        {
            return constraint("PYRAMID_* percentages must be non-negative");
        }
        if self.risk_per_trade_pct <= Decimal::ZERO || self.risk_per_trade_pct > dec!(100) {
            return constraint("RISK_PER_TRADE_PCT must be in (0, 100]");
        }
        if self.order_min_usd <= Decimal::ZERO {
            return constraint("ORDER_MIN_USD must be positive");
        }
        if self.ramp.enable {
            if self.ramp.start_pct <= Decimal::ZERO || self.ramp.max_pct < self.ramp.start_pct {
                return constraint("RAMP_START_PCT must be positive and <= RAMP_MAX_PCT");
            }
            if self.ramp.mode == RampMode::Exp && self.ramp.growth <= 0.0 {
                return constraint("RAMP_GROWTH must be positive");
            }
        }
        if self.exits.take_profit_pct <= Decimal::ZERO
            || self.exits.scalp_tp_min_pct <= Decimal::ZERO
        {
            return constraint("TAKE_PROFIT_PCT and SCALP_TP_MIN_PCT must be positive");
        }
        if self.exits.stop_loss_pct <= Decimal::ZERO {
            return constraint("STOP_LOSS_PCT must be positive (100 disables the backstop)");
        }
        if self.exits.trail_distance_pct_runner <= Decimal::ZERO
            || self.exits.trail_distance_pct_scalp <= Decimal::ZERO
        {
            return constraint("TRAIL_DISTANCE_PCT_* must be positive");
        }
        if self.orders.limit_timeout_sec <= 0 {
            return constraint("LIMIT_TIMEOUT_SEC must be positive");
        }
        if self.orders.reprice_interval_ms == 0 {
            return constraint("REPRICE_INTERVAL_MS must be positive");
        }
        if self.fee_rate_pct < Decimal::ZERO {
            return constraint("FEE_RATE_PCT must be non-negative");
        }
        if self.max_daily_loss_pct <= Decimal::ZERO || self.max_daily_loss_pct > dec!(100) {
            return constraint("MAX_DAILY_LOSS_PCT must be in (0, 100]");
        }
        if self.initial_equity_usd <= Decimal::ZERO {
            return constraint("INITIAL_EQUITY_USD must be positive");
        }
        if !(0.5..1.0).contains(&self.decider_min_prob) {
            return constraint("DECIDER_MIN_PROB must be in [0.5, 1.0)");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_bot_env() {
        for (key, _) in env::vars() {
            let prefixes = [
                "PRODUCT_", "GRANULARITY", "USE_", "TICK_", "CANDLE_", "DRY_", "LONG_",
                "REQUIRE_", "ALLOW_", "MAX_", "PYRAMID_", "RISK_", "ORDER_", "RAMP_",
                "VOL_", "TAKE_", "SCALP_", "STOP_", "PROFIT_", "TRAIL_", "LIMIT_",
                "REPRICE_", "FEE_", "STATE_", "DAILY_", "EQUITY_", "INITIAL_", "WALK_",
                "MOMENTUM_", "DECIDER_", "HTTP_", "FEED_", "BACKTEST_",
            ];
            if prefixes.iter().any(|p| key.starts_with(p)) {
                env::remove_var(&key);
            }
        }
    }

    #[test]
    #[serial]
    fn test_defaults() {
        clear_bot_env();
        let cfg = Config::from_env_only().unwrap();
        assert_eq!(cfg.product_id, "BTC-USD");
        assert!(cfg.dry_run);
        assert!(cfg.long_only);
        assert_eq!(cfg.max_concurrent_lots, 6);
        assert_eq!(cfg.orders.order_type, OrderType::Limit);
        assert_eq!(cfg.exits.profit_gate_usd, dec!(0.25));
        assert_eq!(cfg.state_file, PathBuf::from("bot_state.json"));
    }

    #[test]
    #[serial]
    fn test_invalid_order_type_rejected() {
        clear_bot_env();
        env::set_var("ORDER_TYPE", "stop");
        let err = Config::from_env_only().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_, _)));
        env::remove_var("ORDER_TYPE");
    }

    #[test]
    #[serial]
    fn test_out_of_range_rejected() {
        clear_bot_env();
        env::set_var("MAX_DAILY_LOSS_PCT", "0");
        let err = Config::from_env_only().unwrap_err();
        assert!(matches!(err, ConfigError::Constraint(_)));
        env::remove_var("MAX_DAILY_LOSS_PCT");
    }

    #[test]
    #[serial]
    fn test_overrides_applied() {
        clear_bot_env();
        env::set_var("PRODUCT_ID", "ETH-USD");
        env::set_var("ORDER_TYPE", "market");
        env::set_var("RISK_PER_TRADE_PCT", "2.5");
        let cfg = Config::from_env_only().unwrap();
        assert_eq!(cfg.product_id, "ETH-USD");
        assert_eq!(cfg.orders.order_type, OrderType::Market);
        assert_eq!(cfg.risk_per_trade_pct, dec!(2.5));
        env::remove_var("PRODUCT_ID");
        env::remove_var("ORDER_TYPE");
        env::remove_var("RISK_PER_TRADE_PCT");
    }
}
