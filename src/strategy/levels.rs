use chrono::{DateTime, Days, NaiveDate, Utc};
use std::sync::Arc;

use crate::error::EngineError;
use crate::indicators::{atr_or_default, ATR_PERIOD, DEFAULT_ATR};
use crate::market::TradingSession;
use crate::models::{Candle, Level, LevelKind, LevelMap, Timeframe};
use crate::store::CandleStore;
use crate::Result;

pub const OPENING_RANGE: &str = "Opening Range";
pub const TODAY_SESSION: &str = "Today Session";
pub const PREVIOUS_DAY: &str = "Previous Day";
pub const FIRST_CANDLE: &str = "First Candle";

/// Rolling daily windows: (name, calendar days back from today)
pub const ROLLING_WINDOWS: [(&str, u64); 3] = [("1 Week", 7), ("2 Weeks", 14), ("1 Month", 30)];

/// Derives named price levels and the daily ATR from the candle store.
///
/// Everything is computed "as of" an instant: candles that start at or after
/// `as_of`, or that are still forming at `as_of`, are never used. Levels whose
/// inputs are missing are left out of the map instead of being zero-filled.
#[derive(Clone)]
pub struct LevelAggregator {
    store: Arc<dyn CandleStore>,
    session: TradingSession,
    monitoring_timeframe: Timeframe,
    opening_range_candles: usize,
    atr_period: usize,
    atr_fallback: f64,
}

impl LevelAggregator {
    pub fn new(
        store: Arc<dyn CandleStore>,
        session: TradingSession,
        monitoring_timeframe: Timeframe,
    ) -> Self {
        Self {
            store,
            session,
            monitoring_timeframe,
            opening_range_candles: 3,
            atr_period: ATR_PERIOD,
            atr_fallback: DEFAULT_ATR,
        }
    }

    pub fn with_opening_range_candles(mut self, count: usize) -> Self {
        self.opening_range_candles = count;
        self
    }

    pub fn with_atr(mut self, period: usize, fallback: f64) -> Self {
        self.atr_period = period;
        self.atr_fallback = fallback;
        self
    }

    pub fn monitoring_timeframe(&self) -> Timeframe {
        self.monitoring_timeframe
    }

    pub fn session(&self) -> &TradingSession {
        &self.session
    }

    /// Completed monitoring candles of `as_of`'s session, oldest first
    pub async fn session_candles(&self, as_of: DateTime<Utc>) -> Result<Vec<Candle>> {
        let today = self.session.session_date(as_of);
        let open = self.session.open_at(today);
        if as_of <= open {
            return Ok(Vec::new());
        }

        let candles = self
            .store
            .candles_between(self.monitoring_timeframe, open, as_of)
            .await?;

        Ok(candles
            .into_iter()
            .filter(|c| c.is_complete_at(as_of) && self.session.contains_candle(c))
            .collect())
    }

    /// Up to `n` most recent monitoring candles completed by `as_of`, oldest first
    pub async fn recent_completed(&self, as_of: DateTime<Utc>, n: usize) -> Result<Vec<Candle>> {
        // one extra in case the newest stored candle is still forming
        let candles = self
            .store
            .latest_candles(self.monitoring_timeframe, as_of, n + 1)
            .await?;

        let mut completed: Vec<Candle> = candles
            .into_iter()
            .filter(|c| c.is_complete_at(as_of))
            .collect();
        let excess = completed.len().saturating_sub(n);
        completed.drain(..excess);
        Ok(completed)
    }

    /// The latest daily candle that starts before `date`'s local midnight
    async fn previous_day_candle(&self, date: NaiveDate) -> Result<Option<Candle>> {
        let mut daily = self
            .store
            .latest_candles(Timeframe::OneDay, self.session.day_start(date), 1)
            .await?;
        Ok(daily.pop())
    }

    /// Compute every evaluable level as of `as_of`.
    ///
    /// Errors with `DataUnavailable` only when the store holds no monitoring
    /// candle at all before `as_of`.
    pub async fn compute_levels(&self, as_of: DateTime<Utc>) -> Result<LevelMap> {
        let any = self
            .store
            .latest_candles(self.monitoring_timeframe, as_of, 1)
            .await?;
        if any.is_empty() {
            return Err(EngineError::DataUnavailable(format!(
                "no {} candles before {}",
                self.monitoring_timeframe, as_of
            )));
        }

        let mut levels = LevelMap::new();
        let today = self.session.session_date(as_of);
        let session_candles = self.session_candles(as_of).await?;

        if session_candles.len() >= self.opening_range_candles {
            if let Some(level) = Level::from_candles(
                OPENING_RANGE,
                self.monitoring_timeframe,
                LevelKind::OpeningRange,
                &session_candles[..self.opening_range_candles],
            ) {
                levels.insert(level.name.clone(), level);
            }
        }

        if let Some(level) = Level::from_candles(
            TODAY_SESSION,
            self.monitoring_timeframe,
            LevelKind::SessionRange,
            &session_candles,
        ) {
            levels.insert(level.name.clone(), level);
        }

        match self.previous_day_candle(today).await? {
            Some(candle) => {
                if let Some(level) = Level::from_candles(
                    PREVIOUS_DAY,
                    Timeframe::OneDay,
                    LevelKind::PreviousDay,
                    std::slice::from_ref(&candle),
                ) {
                    levels.insert(level.name.clone(), level);
                }
            }
            None => tracing::warn!("No previous-day candle before {}; level not evaluable", today),
        }

        let today_start = self.session.day_start(today);
        for (name, days) in ROLLING_WINDOWS {
            let Some(from) = today.checked_sub_days(Days::new(days)) else {
                continue;
            };
            let daily = self
                .store
                .candles_between(Timeframe::OneDay, self.session.day_start(from), today_start)
                .await?;
            if let Some(level) =
                Level::from_candles(name, Timeframe::OneDay, LevelKind::RollingNDays, &daily)
            {
                levels.insert(level.name.clone(), level);
            }
        }

        tracing::debug!("Computed {} levels as of {}", levels.len(), as_of);

        Ok(levels)
    }

    /// Daily ATR from the bars before `as_of`'s session date, never zero
    pub async fn compute_atr(&self, as_of: DateTime<Utc>) -> Result<f64> {
        let today = self.session.session_date(as_of);
        let daily = self
            .store
            .latest_candles(
                Timeframe::OneDay,
                self.session.day_start(today),
                self.atr_period + 1,
            )
            .await?;

        Ok(atr_or_default(&daily, self.atr_period, self.atr_fallback))
    }

    /// High/low of the session's first monitoring candle
    pub async fn first_candle_level(&self, as_of: DateTime<Utc>) -> Result<Option<Level>> {
        let session_candles = self.session_candles(as_of).await?;
        Ok(Level::from_candles(
            FIRST_CANDLE,
            self.monitoring_timeframe,
            LevelKind::OpeningRange,
            &session_candles[..session_candles.len().min(1)],
        ))
    }
}
