use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::error::EngineError;
use crate::ledger::TradeLedger;
use crate::models::{Trade, TradeStatus};
use crate::Result;

/// Trade ledger kept in process memory
#[derive(Clone, Default)]
pub struct InMemoryLedger {
    trades: Arc<Mutex<Vec<Trade>>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every trade ever written, in insertion order
    pub fn all_trades(&self) -> Result<Vec<Trade>> {
        let trades = self
            .trades
            .lock()
            .map_err(|e| EngineError::Ledger(e.to_string()))?;
        Ok(trades.clone())
    }
}

#[async_trait]
impl TradeLedger for InMemoryLedger {
    async fn insert_trade(&self, trade: &Trade) -> Result<()> {
        if trade.status != TradeStatus::Open {
            return Err(EngineError::Ledger(format!(
                "refusing to insert trade {} in state {}",
                trade.id,
                trade.status.as_str()
            )));
        }

        let mut trades = self
            .trades
            .lock()
            .map_err(|e| EngineError::Ledger(e.to_string()))?;

        if trades.iter().any(|t| t.id == trade.id) {
            return Err(EngineError::Ledger(format!("trade {} already exists", trade.id)));
        }

        trades.push(trade.clone());
        Ok(())
    }

    async fn record_violation_count(
        &self,
        trade_id: Uuid,
        count: u32,
        checked_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut trades = self
            .trades
            .lock()
            .map_err(|e| EngineError::Ledger(e.to_string()))?;

        let trade = trades
            .iter_mut()
            .find(|t| t.id == trade_id && t.status == TradeStatus::Open)
            .ok_or_else(|| EngineError::Ledger(format!("no open trade {}", trade_id)))?;

        trade.consecutive_violation_count = count;
        trade.last_sl_check_time = Some(checked_at);
        Ok(())
    }

    async fn close_trade(&self, trade: &Trade) -> Result<()> {
        let mut trades = self
            .trades
            .lock()
            .map_err(|e| EngineError::Ledger(e.to_string()))?;

        let stored = trades
            .iter_mut()
            .find(|t| t.id == trade.id)
            .ok_or_else(|| EngineError::Ledger(format!("trade {} not found", trade.id)))?;

        if stored.status == TradeStatus::Closed {
            return Err(EngineError::Ledger(format!("trade {} already closed", trade.id)));
        }

        *stored = trade.clone();
        Ok(())
    }

    async fn find_trade(&self, trade_id: Uuid) -> Result<Option<Trade>> {
        let trades = self
            .trades
            .lock()
            .map_err(|e| EngineError::Ledger(e.to_string()))?;
        Ok(trades.iter().find(|t| t.id == trade_id).cloned())
    }

    async fn open_trades(&self) -> Result<Vec<Trade>> {
        let trades = self
            .trades
            .lock()
            .map_err(|e| EngineError::Ledger(e.to_string()))?;

        let mut open: Vec<Trade> = trades.iter().filter(|t| t.is_open()).cloned().collect();
        open.sort_by_key(|t| t.entry_time);
        Ok(open)
    }

    async fn recent_closed(&self, limit: usize) -> Result<Vec<Trade>> {
        let trades = self
            .trades
            .lock()
            .map_err(|e| EngineError::Ledger(e.to_string()))?;

        let mut closed: Vec<Trade> = trades
            .iter()
            .filter(|t| t.status == TradeStatus::Closed)
            .cloned()
            .collect();
        closed.sort_by(|a, b| b.exit_time.cmp(&a.exit_time));
        closed.truncate(limit);
        Ok(closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        Direction, ExitReason, LevelKind, OptionContract, OptionRight, OrderState, Signal,
        SignalKind,
    };
    use chrono::{Duration, NaiveDate};

    fn open_trade(entry_offset_min: i64) -> Trade {
        let now = Utc::now();
        let signal = Signal {
            kind: SignalKind::Breakout,
            direction: Direction::Long,
            level_name: "Opening Range".to_string(),
            level_kind: LevelKind::OpeningRange,
            level_value: 100.0,
            candle_close: 101.0,
            candle_time: now,
            probability: 90,
            distance_atr: 0.02,
        };
        let contract = OptionContract {
            underlying: "NIFTY".to_string(),
            strike: 100,
            right: OptionRight::Call,
            expiry: NaiveDate::from_ymd_opt(2025, 11, 13).unwrap(),
        };
        let mut trade = Trade::pending(
            &signal,
            contract,
            50.0,
            75,
            "ORD1".to_string(),
            now + Duration::minutes(entry_offset_min),
        );
        trade.status = TradeStatus::Open;
        trade.entry_order_status = OrderState::Executed;
        trade
    }

    fn close(mut trade: Trade, exit_offset_min: i64) -> Trade {
        trade.status = TradeStatus::Closed;
        trade.exit_price = Some(60.0);
        trade.exit_time = Some(Utc::now() + Duration::minutes(exit_offset_min));
        trade.exit_reason = Some(ExitReason::Target);
        trade.pnl = Some(trade.realized_pnl(60.0));
        trade
    }

    #[tokio::test]
    async fn test_rejects_non_open_insert() {
        let ledger = InMemoryLedger::new();
        let mut trade = open_trade(0);
        trade.status = TradeStatus::PendingEntry;

        assert!(ledger.insert_trade(&trade).await.is_err());
        assert!(ledger.all_trades().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_open_and_recent_closed_queries() {
        let ledger = InMemoryLedger::new();
        let t1 = open_trade(0);
        let t2 = open_trade(1);
        let t3 = open_trade(2);
        for t in [&t1, &t2, &t3] {
            ledger.insert_trade(t).await.unwrap();
        }

        ledger.close_trade(&close(t1.clone(), 10)).await.unwrap();
        ledger.close_trade(&close(t2.clone(), 20)).await.unwrap();

        let open = ledger.open_trades().await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, t3.id);

        let closed = ledger.recent_closed(1).await.unwrap();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].id, t2.id);
    }

    #[tokio::test]
    async fn test_cannot_close_twice() {
        let ledger = InMemoryLedger::new();
        let trade = open_trade(0);
        ledger.insert_trade(&trade).await.unwrap();

        ledger.close_trade(&close(trade.clone(), 5)).await.unwrap();
        let result = ledger.close_trade(&close(trade.clone(), 6)).await;
        assert!(result.unwrap_err().to_string().contains("already closed"));

        let stored = ledger.find_trade(trade.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TradeStatus::Closed);
        assert!(ledger.find_trade(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_record_violation_count() {
        let ledger = InMemoryLedger::new();
        let trade = open_trade(0);
        ledger.insert_trade(&trade).await.unwrap();

        let checked_at = Utc::now();
        ledger
            .record_violation_count(trade.id, 1, checked_at)
            .await
            .unwrap();

        let open = ledger.open_trades().await.unwrap();
        assert_eq!(open[0].consecutive_violation_count, 1);
        assert_eq!(open[0].last_sl_check_time, Some(checked_at));
    }
}
