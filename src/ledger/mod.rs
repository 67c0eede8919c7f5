// Durable record of trades and their lifecycle
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::Trade;
use crate::Result;

pub use memory::InMemoryLedger;

/// Persisted trade state.
///
/// Only `OPEN` trades are ever inserted; a trade that fails entry never reaches the
/// ledger. `close_trade` writes the status transition and every exit field at once.
#[async_trait]
pub trait TradeLedger: Send + Sync {
    async fn insert_trade(&self, trade: &Trade) -> Result<()>;

    /// Record the latest stop-loss streak for an open trade
    async fn record_violation_count(
        &self,
        trade_id: Uuid,
        count: u32,
        checked_at: DateTime<Utc>,
    ) -> Result<()>;

    async fn close_trade(&self, trade: &Trade) -> Result<()>;

    /// Any trade by id, whatever its status
    async fn find_trade(&self, trade_id: Uuid) -> Result<Option<Trade>>;

    /// All currently `OPEN` trades, oldest entry first
    async fn open_trades(&self) -> Result<Vec<Trade>>;

    /// Most recent `limit` `CLOSED` trades, newest exit first
    async fn recent_closed(&self, limit: usize) -> Result<Vec<Trade>>;
}
