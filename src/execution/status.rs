use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::broker::{GatewayUsage, RateLimitedGateway};
use crate::error::EngineError;
use crate::ledger::TradeLedger;
use crate::models::{Level, LevelKind, LevelMap, Trade};
use crate::strategy::{probability_for_distance, LevelAggregator};
use crate::Result;

/// One level relative to the current price
#[derive(Debug, Clone, Serialize)]
pub struct LevelStatus {
    pub name: String,
    pub kind: LevelKind,
    pub high: f64,
    pub low: f64,
    pub distance_to_high: f64,
    pub distance_to_low: f64,
    pub distance_to_high_atr: f64,
    pub distance_to_low_atr: f64,
    /// Step-function probability for the nearer edge
    pub probability: u8,
    pub broken_high: bool,
    pub broken_low: bool,
}

impl LevelStatus {
    pub fn from_level(level: &Level, price: f64, atr: f64) -> Self {
        let distance_to_high = level.high - price;
        let distance_to_low = price - level.low;
        let nearest = distance_to_high.abs().min(distance_to_low.abs());

        Self {
            name: level.name.clone(),
            kind: level.kind,
            high: level.high,
            low: level.low,
            distance_to_high,
            distance_to_low,
            distance_to_high_atr: distance_to_high / atr,
            distance_to_low_atr: distance_to_low / atr,
            probability: probability_for_distance(nearest / atr),
            broken_high: price > level.high,
            broken_low: price < level.low,
        }
    }
}

/// Read-only snapshot for the operator
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub as_of: DateTime<Utc>,
    pub market_open: bool,
    pub price: Option<f64>,
    pub atr: f64,
    pub levels: Vec<LevelStatus>,
    /// Candles this process has evaluated; absent when the report comes from a
    /// process with no running detector
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed_candles: Option<usize>,
    pub gateway: GatewayUsage,
    pub open_trades: Vec<Trade>,
    pub recent_closed: Vec<Trade>,
}

pub async fn build_status(
    levels: &LevelAggregator,
    ledger: &dyn TradeLedger,
    gateway: &RateLimitedGateway,
    processed_candles: Option<usize>,
    recent: usize,
    now: DateTime<Utc>,
) -> Result<StatusReport> {
    let price = levels.recent_completed(now, 1).await?.last().map(|c| c.close);
    let atr = levels.compute_atr(now).await?;

    let mut level_map = match levels.compute_levels(now).await {
        Ok(map) => map,
        Err(EngineError::DataUnavailable(reason)) => {
            tracing::warn!("Levels unavailable: {}", reason);
            LevelMap::new()
        }
        Err(e) => return Err(e),
    };
    if let Some(first) = levels.first_candle_level(now).await? {
        level_map.insert(first.name.clone(), first);
    }

    let level_status = match price {
        Some(p) => level_map
            .values()
            .map(|l| LevelStatus::from_level(l, p, atr))
            .collect(),
        None => Vec::new(),
    };

    Ok(StatusReport {
        as_of: now,
        market_open: levels.session().is_open(now),
        price,
        atr,
        levels: level_status,
        processed_candles,
        gateway: gateway.usage().await,
        open_trades: ledger.open_trades().await?,
        recent_closed: ledger.recent_closed(recent).await?,
    })
}
