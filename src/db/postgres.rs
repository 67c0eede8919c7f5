use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::{postgres::PgPoolOptions, postgres::PgRow, PgPool, Row};
use uuid::Uuid;

use crate::error::EngineError;
use crate::ledger::TradeLedger;
use crate::models::{
    Candle, Direction, ExitReason, OptionContract, OptionRight, OrderState, Timeframe, Trade,
    TradeStatus,
};
use crate::store::CandleStore;
use crate::Result;

const TRADE_COLUMNS: &str = r#"
    id, direction, level_name, reference_level, probability,
    underlying, strike, option_right, expiry,
    entry_price, entry_time, quantity, order_id, entry_order_status, status,
    consecutive_violation_count, last_sl_check_time,
    exit_price, exit_time, exit_reason, exit_order_id, exit_order_status, pnl
"#;

/// Postgres-backed candle store and trade ledger
#[derive(Clone)]
pub struct PostgresPersistence {
    pool: PgPool,
}

fn store_err(e: impl std::fmt::Display) -> EngineError {
    EngineError::Store(e.to_string())
}

fn ledger_err(e: impl std::fmt::Display) -> EngineError {
    EngineError::Ledger(e.to_string())
}

fn to_f64(value: Decimal) -> Result<f64> {
    value.to_string().parse().map_err(ledger_err)
}

impl PostgresPersistence {
    /// Connect to Postgres and apply pending migrations
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(store_err)?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(store_err)?;

        tracing::info!("Connected to Postgres");

        Ok(Self { pool })
    }

    /// Seed a candle the way the ingestion process writes them. The engine itself
    /// only reads candles.
    #[cfg(test)]
    async fn save_candle(&self, candle: &Candle) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO candles (timeframe, start_time, open, high, low, close, volume)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (timeframe, start_time) DO NOTHING
            "#,
        )
        .bind(candle.timeframe.as_str())
        .bind(candle.start_time)
        .bind(candle.open)
        .bind(candle.high)
        .bind(candle.low)
        .bind(candle.close)
        .bind(candle.volume)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(())
    }

    fn candle_from_row(timeframe: Timeframe, row: &PgRow) -> Result<Candle> {
        let decimal = |col: &str| -> Result<f64> {
            let v: Decimal = row.try_get(col).map_err(store_err)?;
            v.to_string().parse().map_err(store_err)
        };

        Ok(Candle {
            timeframe,
            start_time: row.try_get("start_time").map_err(store_err)?,
            open: decimal("open")?,
            high: decimal("high")?,
            low: decimal("low")?,
            close: decimal("close")?,
            volume: decimal("volume")?,
        })
    }

    fn trade_from_row(row: &PgRow) -> Result<Trade> {
        let direction: String = row.try_get("direction").map_err(ledger_err)?;
        let right: String = row.try_get("option_right").map_err(ledger_err)?;
        let status: String = row.try_get("status").map_err(ledger_err)?;
        let entry_order_status: String = row.try_get("entry_order_status").map_err(ledger_err)?;
        let exit_reason: Option<String> = row.try_get("exit_reason").map_err(ledger_err)?;
        let exit_order_status: Option<String> =
            row.try_get("exit_order_status").map_err(ledger_err)?;

        let reference_level: Decimal = row.try_get("reference_level").map_err(ledger_err)?;
        let entry_price: Decimal = row.try_get("entry_price").map_err(ledger_err)?;
        let exit_price: Option<Decimal> = row.try_get("exit_price").map_err(ledger_err)?;
        let pnl: Option<Decimal> = row.try_get("pnl").map_err(ledger_err)?;

        let probability: i16 = row.try_get("probability").map_err(ledger_err)?;
        let strike: i32 = row.try_get("strike").map_err(ledger_err)?;
        let quantity: i32 = row.try_get("quantity").map_err(ledger_err)?;
        let violations: i32 = row
            .try_get("consecutive_violation_count")
            .map_err(ledger_err)?;
        let expiry: NaiveDate = row.try_get("expiry").map_err(ledger_err)?;

        Ok(Trade {
            id: row.try_get("id").map_err(ledger_err)?,
            direction: direction.parse::<Direction>().map_err(ledger_err)?,
            level_name: row.try_get("level_name").map_err(ledger_err)?,
            reference_level: to_f64(reference_level)?,
            probability: probability as u8,
            contract: OptionContract {
                underlying: row.try_get("underlying").map_err(ledger_err)?,
                strike: strike as u32,
                right: right.parse::<OptionRight>().map_err(ledger_err)?,
                expiry,
            },
            entry_price: to_f64(entry_price)?,
            entry_time: row.try_get("entry_time").map_err(ledger_err)?,
            quantity: quantity as u32,
            order_id: row.try_get("order_id").map_err(ledger_err)?,
            entry_order_status: OrderState::from_broker(&entry_order_status),
            status: status.parse::<TradeStatus>().map_err(ledger_err)?,
            consecutive_violation_count: violations as u32,
            last_sl_check_time: row.try_get("last_sl_check_time").map_err(ledger_err)?,
            exit_price: exit_price.map(to_f64).transpose()?,
            exit_time: row.try_get("exit_time").map_err(ledger_err)?,
            exit_reason: exit_reason
                .map(|r| r.parse::<ExitReason>())
                .transpose()
                .map_err(ledger_err)?,
            exit_order_id: row.try_get("exit_order_id").map_err(ledger_err)?,
            exit_order_status: exit_order_status.map(|s| OrderState::from_broker(&s)),
            pnl: pnl.map(to_f64).transpose()?,
        })
    }

    /// Delete all rows (testing only)
    #[cfg(test)]
    pub async fn clear_all(&self) -> Result<()> {
        sqlx::query("DELETE FROM trades")
            .execute(&self.pool)
            .await
            .map_err(ledger_err)?;
        sqlx::query("DELETE FROM candles")
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }
}

#[async_trait]
impl CandleStore for PostgresPersistence {
    async fn candles_between(
        &self,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>> {
        let rows = sqlx::query(
            r#"
            SELECT start_time, open, high, low, close, volume
            FROM candles
            WHERE timeframe = $1 AND start_time >= $2 AND start_time < $3
            ORDER BY start_time ASC
            "#,
        )
        .bind(timeframe.as_str())
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        rows.iter()
            .map(|row| Self::candle_from_row(timeframe, row))
            .collect()
    }

    async fn latest_candles(
        &self,
        timeframe: Timeframe,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Candle>> {
        let rows = sqlx::query(
            r#"
            SELECT start_time, open, high, low, close, volume
            FROM candles
            WHERE timeframe = $1 AND start_time < $2
            ORDER BY start_time DESC
            LIMIT $3
            "#,
        )
        .bind(timeframe.as_str())
        .bind(before)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        let mut candles = rows
            .iter()
            .map(|row| Self::candle_from_row(timeframe, row))
            .collect::<Result<Vec<_>>>()?;
        candles.reverse();
        Ok(candles)
    }
}

#[async_trait]
impl TradeLedger for PostgresPersistence {
    async fn insert_trade(&self, trade: &Trade) -> Result<()> {
        if trade.status != TradeStatus::Open {
            return Err(EngineError::Ledger(format!(
                "refusing to insert trade {} in state {}",
                trade.id,
                trade.status.as_str()
            )));
        }

        sqlx::query(
            r#"
            INSERT INTO trades (
                id, direction, level_name, reference_level, probability,
                underlying, strike, option_right, expiry,
                entry_price, entry_time, quantity, order_id, entry_order_status, status,
                consecutive_violation_count
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(trade.id)
        .bind(trade.direction.as_str())
        .bind(&trade.level_name)
        .bind(trade.reference_level)
        .bind(trade.probability as i16)
        .bind(&trade.contract.underlying)
        .bind(trade.contract.strike as i32)
        .bind(trade.contract.right.as_str())
        .bind(trade.contract.expiry)
        .bind(trade.entry_price)
        .bind(trade.entry_time)
        .bind(trade.quantity as i32)
        .bind(&trade.order_id)
        .bind(trade.entry_order_status.as_str())
        .bind(trade.status.as_str())
        .bind(trade.consecutive_violation_count as i32)
        .execute(&self.pool)
        .await
        .map_err(ledger_err)?;

        tracing::debug!("Saved trade {} on {} to Postgres", trade.id, trade.contract);

        Ok(())
    }

    async fn record_violation_count(
        &self,
        trade_id: Uuid,
        count: u32,
        checked_at: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE trades
            SET consecutive_violation_count = $1, last_sl_check_time = $2, updated_at = NOW()
            WHERE id = $3 AND status = 'OPEN'
            "#,
        )
        .bind(count as i32)
        .bind(checked_at)
        .bind(trade_id)
        .execute(&self.pool)
        .await
        .map_err(ledger_err)?;

        if result.rows_affected() == 0 {
            return Err(EngineError::Ledger(format!("no open trade {}", trade_id)));
        }

        Ok(())
    }

    async fn close_trade(&self, trade: &Trade) -> Result<()> {
        // Single statement: status and exit fields land together or not at all
        let result = sqlx::query(
            r#"
            UPDATE trades
            SET status = 'CLOSED',
                consecutive_violation_count = $1,
                last_sl_check_time = $2,
                exit_price = $3,
                exit_time = $4,
                exit_reason = $5,
                exit_order_id = $6,
                exit_order_status = $7,
                pnl = $8,
                updated_at = NOW()
            WHERE id = $9 AND status = 'OPEN'
            "#,
        )
        .bind(trade.consecutive_violation_count as i32)
        .bind(trade.last_sl_check_time)
        .bind(trade.exit_price)
        .bind(trade.exit_time)
        .bind(trade.exit_reason.map(|r| r.as_str()))
        .bind(trade.exit_order_id.as_deref())
        .bind(trade.exit_order_status.map(|s| s.as_str()))
        .bind(trade.pnl)
        .bind(trade.id)
        .execute(&self.pool)
        .await
        .map_err(ledger_err)?;

        if result.rows_affected() == 0 {
            return Err(EngineError::Ledger(format!(
                "trade {} not found or already closed",
                trade.id
            )));
        }

        tracing::debug!("Closed trade {} in Postgres", trade.id);

        Ok(())
    }

    async fn find_trade(&self, trade_id: Uuid) -> Result<Option<Trade>> {
        let sql = format!("SELECT {} FROM trades WHERE id = $1", TRADE_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(trade_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(ledger_err)?;

        row.as_ref().map(Self::trade_from_row).transpose()
    }

    async fn open_trades(&self) -> Result<Vec<Trade>> {
        let sql = format!(
            "SELECT {} FROM trades WHERE status = 'OPEN' ORDER BY entry_time ASC",
            TRADE_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(ledger_err)?;

        let trades = rows
            .iter()
            .map(Self::trade_from_row)
            .collect::<Result<Vec<_>>>()?;

        tracing::debug!("Loaded {} open trades from Postgres", trades.len());

        Ok(trades)
    }

    async fn recent_closed(&self, limit: usize) -> Result<Vec<Trade>> {
        let sql = format!(
            "SELECT {} FROM trades WHERE status = 'CLOSED' ORDER BY exit_time DESC LIMIT $1",
            TRADE_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(ledger_err)?;

        rows.iter().map(Self::trade_from_row).collect()
    }
}
