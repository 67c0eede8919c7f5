use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use crate::error::EngineError;
use crate::models::{Candle, Timeframe};
use crate::store::CandleStore;
use crate::Result;

/// Thread-safe in-memory candle store
///
/// Keeps one ordered series per timeframe. Used for paper sessions and tests.
#[derive(Clone, Default)]
pub struct InMemoryCandleStore {
    data: Arc<RwLock<HashMap<Timeframe, BTreeMap<DateTime<Utc>, Candle>>>>,
}

impl InMemoryCandleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a candle. Rewriting an existing timestamp with different values is rejected.
    pub fn add_candle(&self, candle: Candle) -> Result<()> {
        let mut data = self
            .data
            .write()
            .map_err(|e| EngineError::Store(e.to_string()))?;

        let series = data.entry(candle.timeframe).or_default();

        if let Some(existing) = series.get(&candle.start_time) {
            if *existing != candle {
                return Err(EngineError::Store(format!(
                    "{} candle at {} is already written",
                    candle.timeframe, candle.start_time
                )));
            }
            return Ok(());
        }

        series.insert(candle.start_time, candle);
        Ok(())
    }

    pub fn add_candles(&self, candles: impl IntoIterator<Item = Candle>) -> Result<()> {
        for candle in candles {
            self.add_candle(candle)?;
        }
        Ok(())
    }

    /// Get count of candles for a timeframe
    pub fn candle_count(&self, timeframe: Timeframe) -> Result<usize> {
        let data = self
            .data
            .read()
            .map_err(|e| EngineError::Store(e.to_string()))?;
        Ok(data.get(&timeframe).map(|s| s.len()).unwrap_or(0))
    }
}

#[async_trait]
impl CandleStore for InMemoryCandleStore {
    async fn candles_between(
        &self,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>> {
        if end <= start {
            return Ok(Vec::new());
        }

        let data = self
            .data
            .read()
            .map_err(|e| EngineError::Store(e.to_string()))?;

        Ok(data
            .get(&timeframe)
            .map(|series| series.range(start..end).map(|(_, c)| c.clone()).collect())
            .unwrap_or_default())
    }

    async fn latest_candles(
        &self,
        timeframe: Timeframe,
        before: DateTime<Utc>,
        n: usize,
    ) -> Result<Vec<Candle>> {
        let data = self
            .data
            .read()
            .map_err(|e| EngineError::Store(e.to_string()))?;

        Ok(data
            .get(&timeframe)
            .map(|series| {
                let mut recent: Vec<Candle> = series
                    .range(..before)
                    .rev()
                    .take(n)
                    .map(|(_, c)| c.clone())
                    .collect();
                recent.reverse();
                recent
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn create_test_candle(minutes: i64, price: f64) -> Candle {
        Candle {
            timeframe: Timeframe::FiveMin,
            start_time: Utc.with_ymd_and_hms(2025, 11, 11, 3, 45, 0).unwrap()
                + Duration::minutes(minutes),
            open: price,
            high: price,
            low: price,
            close: price,
            volume: 1000.0,
        }
    }

    #[tokio::test]
    async fn test_candles_between_is_half_open() {
        let store = InMemoryCandleStore::new();
        for i in 0..5 {
            store.add_candle(create_test_candle(i * 5, 100.0 + i as f64)).unwrap();
        }

        let start = create_test_candle(5, 0.0).start_time;
        let end = create_test_candle(20, 0.0).start_time;
        let candles = store
            .candles_between(Timeframe::FiveMin, start, end)
            .await
            .unwrap();

        assert_eq!(candles.len(), 3);
        assert_eq!(candles[0].close, 101.0);
        assert_eq!(candles[2].close, 103.0);
    }

    #[tokio::test]
    async fn test_latest_candles_oldest_first() {
        let store = InMemoryCandleStore::new();
        for i in 0..10 {
            store.add_candle(create_test_candle(i * 5, 100.0 + i as f64)).unwrap();
        }

        let before = create_test_candle(45, 0.0).start_time;
        let recent = store
            .latest_candles(Timeframe::FiveMin, before, 3)
            .await
            .unwrap();

        // Candle 9 starts exactly at `before` and is excluded
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].close, 106.0);
        assert_eq!(recent[2].close, 108.0);
    }

    #[tokio::test]
    async fn test_timeframes_are_separate() {
        let store = InMemoryCandleStore::new();
        store.add_candle(create_test_candle(0, 100.0)).unwrap();

        let daily = store
            .latest_candles(Timeframe::OneDay, Utc::now(), 5)
            .await
            .unwrap();
        assert!(daily.is_empty());
        assert_eq!(store.candle_count(Timeframe::FiveMin).unwrap(), 1);
    }

    #[test]
    fn test_written_candles_are_immutable() {
        let store = InMemoryCandleStore::new();
        store.add_candle(create_test_candle(0, 100.0)).unwrap();

        // Identical rewrite is a no-op
        assert!(store.add_candle(create_test_candle(0, 100.0)).is_ok());
        // Different values for the same timestamp are rejected
        assert!(store.add_candle(create_test_candle(0, 101.0)).is_err());
        assert_eq!(store.candle_count(Timeframe::FiveMin).unwrap(), 1);
    }
}
