use chrono::{Duration as ChronoDuration, NaiveTime};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::EngineError;
use crate::execution::TradeSettings;
use crate::market::TradingSession;
use crate::models::Timeframe;
use crate::strategy::DetectorSettings;
use crate::Result;

/// Environment variable prefix, e.g. `BREAKOUT_PAPER_MODE=false`
pub const ENV_PREFIX: &str = "BREAKOUT";

pub const DEFAULT_CONFIG_FILE: &str = "breakout.toml";

/// Engine configuration. Every field has a default, so an empty file is valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub max_api_calls_per_minute: usize,
    pub target_per_unit: f64,
    pub consecutive_violation_threshold: usize,
    pub gap_threshold_points: f64,
    pub retest_band_points: f64,
    pub signal_freshness_window_minutes: i64,
    pub tick_interval_seconds: u64,
    pub lot_size: u32,
    pub paper_mode: bool,

    pub database_url: String,
    pub broker_base_url: String,
    #[serde(skip_serializing)]
    pub broker_session_token: Option<String>,

    pub monitoring_timeframe: Timeframe,
    pub strike_step: u32,
    pub underlying: String,
    pub order_confirm_delay_seconds: u64,
    pub throttle_backoff_seconds: u64,
    pub atr_period: usize,
    pub atr_fallback: f64,
    pub opening_range_candles: usize,
    pub ledger_write_retries: u32,
    pub session_open: String,
    pub session_close: String,
    pub exchange_timezone: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_api_calls_per_minute: 95,
            target_per_unit: 10.0,
            consecutive_violation_threshold: 2,
            gap_threshold_points: 50.0,
            retest_band_points: 20.0,
            signal_freshness_window_minutes: 5,
            tick_interval_seconds: 15,
            lot_size: 75,
            paper_mode: true,
            database_url: "postgres://localhost/breakout".to_string(),
            broker_base_url: "https://api.icicidirect.com/breezeapi/api/v1".to_string(),
            broker_session_token: None,
            monitoring_timeframe: Timeframe::FiveMin,
            strike_step: 100,
            underlying: "NIFTY".to_string(),
            order_confirm_delay_seconds: 2,
            throttle_backoff_seconds: 1,
            atr_period: 14,
            atr_fallback: 50.0,
            opening_range_candles: 3,
            ledger_write_retries: 3,
            session_open: "09:15".to_string(),
            session_close: "15:30".to_string(),
            exchange_timezone: "Asia/Kolkata".to_string(),
        }
    }
}

fn parse_time(field: &str, value: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(value, "%H:%M")
        .map_err(|e| EngineError::Config(format!("{} '{}': {}", field, value, e)))
}

impl EngineConfig {
    /// Load from an optional TOML file, then `BREAKOUT_*` environment overrides
    pub fn load(path: Option<&str>) -> Result<Self> {
        let file = path.unwrap_or(DEFAULT_CONFIG_FILE);

        let settings = config::Config::builder()
            .add_source(config::File::with_name(file).required(path.is_some()))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?;

        let cfg: EngineConfig = settings.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        let reject = |msg: &str| Err(EngineError::Config(msg.to_string()));

        if self.max_api_calls_per_minute == 0 {
            return reject("max_api_calls_per_minute must be > 0");
        }
        if self.lot_size == 0 {
            return reject("lot_size must be > 0");
        }
        if self.target_per_unit <= 0.0 {
            return reject("target_per_unit must be positive");
        }
        if self.consecutive_violation_threshold == 0 {
            return reject("consecutive_violation_threshold must be >= 1");
        }
        if self.tick_interval_seconds == 0 {
            return reject("tick_interval_seconds must be > 0");
        }
        if self.strike_step == 0 {
            return reject("strike_step must be > 0");
        }
        if self.opening_range_candles == 0 {
            return reject("opening_range_candles must be >= 1");
        }
        if self.atr_fallback <= 0.0 {
            return reject("atr_fallback must be positive");
        }
        if self.signal_freshness_window_minutes < 0 {
            return reject("signal_freshness_window_minutes must not be negative");
        }
        if !self.paper_mode && self.broker_session_token.is_none() {
            return reject("live mode requires broker_session_token");
        }

        // surfaces bad times or timezone names
        let session = self.trading_session()?;
        let date = chrono::Utc::now().date_naive();
        if session.open_at(date) >= session.close_at(date) {
            return reject("session_open must be before session_close");
        }

        Ok(())
    }

    pub fn trading_session(&self) -> Result<TradingSession> {
        let tz: Tz = self.exchange_timezone.parse().map_err(|e| {
            EngineError::Config(format!("exchange_timezone '{}': {}", self.exchange_timezone, e))
        })?;
        Ok(TradingSession::new(
            tz,
            parse_time("session_open", &self.session_open)?,
            parse_time("session_close", &self.session_close)?,
        ))
    }

    pub fn detector_settings(&self) -> DetectorSettings {
        DetectorSettings {
            freshness_window: ChronoDuration::minutes(self.signal_freshness_window_minutes),
            gap_threshold_points: self.gap_threshold_points,
            retest_band_points: self.retest_band_points,
        }
    }

    pub fn trade_settings(&self) -> TradeSettings {
        TradeSettings {
            underlying: self.underlying.clone(),
            strike_step: self.strike_step,
            lot_size: self.lot_size,
            target_per_unit: self.target_per_unit,
            violation_threshold: self.consecutive_violation_threshold,
            monitoring_timeframe: self.monitoring_timeframe,
            order_confirm_delay: Duration::from_secs(self.order_confirm_delay_seconds),
            ledger_write_retries: self.ledger_write_retries,
            ledger_retry_delay: Duration::from_secs(1),
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_seconds)
    }

    pub fn throttle_backoff(&self) -> Duration {
        Duration::from_secs(self.throttle_backoff_seconds)
    }
}
