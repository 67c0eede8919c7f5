// Read side of the candle store shared with the ingestion process
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{Candle, Timeframe};
use crate::Result;

pub use memory::InMemoryCandleStore;

/// Append-only, timestamp-keyed OHLCV series written by the ingestion process.
///
/// The engine only reads. Results are always ordered by `start_time`, oldest first.
#[async_trait]
pub trait CandleStore: Send + Sync {
    /// Candles with `start <= start_time < end`
    async fn candles_between(
        &self,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>>;

    /// The `n` most recent candles with `start_time < before`
    async fn latest_candles(
        &self,
        timeframe: Timeframe,
        before: DateTime<Utc>,
        n: usize,
    ) -> Result<Vec<Candle>>;
}
