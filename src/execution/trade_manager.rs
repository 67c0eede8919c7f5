use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::broker::RateLimitedGateway;
use crate::error::EngineError;
use crate::ledger::TradeLedger;
use crate::market::{contract_for, TradingSession};
use crate::models::{
    Candle, Direction, ExitReason, OptionContract, OrderSide, OrderState, OrderStatus, Signal,
    Timeframe, Trade, TradeStatus,
};
use crate::store::CandleStore;
use crate::Result;

#[derive(Debug, Clone)]
pub struct TradeSettings {
    pub underlying: String,
    pub strike_step: u32,
    pub lot_size: u32,
    pub target_per_unit: f64,
    /// Consecutive adverse closes that trigger the level stop-loss
    pub violation_threshold: usize,
    pub monitoring_timeframe: Timeframe,
    /// Wait between submitting an order and polling its status
    pub order_confirm_delay: Duration,
    pub ledger_write_retries: u32,
    pub ledger_retry_delay: Duration,
}

impl Default for TradeSettings {
    fn default() -> Self {
        Self {
            underlying: "NIFTY".to_string(),
            strike_step: 100,
            lot_size: 75,
            target_per_unit: 10.0,
            violation_threshold: 2,
            monitoring_timeframe: Timeframe::FiveMin,
            order_confirm_delay: Duration::from_secs(2),
            ledger_write_retries: 3,
            ledger_retry_delay: Duration::from_secs(1),
        }
    }
}

/// Premium move has reached the fixed per-unit target
pub fn target_hit(trade: &Trade, current_price: f64, target_per_unit: f64) -> bool {
    trade.pnl_per_unit(current_price) >= target_per_unit
}

/// A close on the wrong side of the breakout level
pub fn is_violation(direction: Direction, reference_level: f64, close: f64) -> bool {
    match direction {
        Direction::Long => close < reference_level,
        Direction::Short => close > reference_level,
    }
}

/// Length of the adverse streak ending at the latest candle
pub fn trailing_violations(direction: Direction, reference_level: f64, candles: &[Candle]) -> u32 {
    candles
        .iter()
        .rev()
        .take_while(|c| is_violation(direction, reference_level, c.close))
        .count() as u32
}

/// The stored trade already carries this exit
fn same_close(stored: &Trade, closing: &Trade) -> bool {
    stored.status == TradeStatus::Closed
        && stored.exit_order_id == closing.exit_order_id
        && stored.exit_reason == closing.exit_reason
        && match (stored.exit_price, closing.exit_price) {
            (Some(a), Some(b)) => (a - b).abs() < 1e-6,
            _ => false,
        }
}

/// Close once. A failed write whose close nevertheless committed counts as done,
/// so retries never turn a slow commit into an inconsistency.
async fn close_once(ledger: &dyn TradeLedger, trade: &Trade) -> Result<()> {
    let Err(e) = ledger.close_trade(trade).await else {
        return Ok(());
    };

    match ledger.find_trade(trade.id).await {
        Ok(Some(stored)) if same_close(&stored, trade) => {
            tracing::warn!("Close of trade {} reported {} but was recorded", trade.id, e);
            Ok(())
        }
        _ => Err(e),
    }
}

/// Owns every trade from entry to exit.
///
/// Open trades are mirrored in memory and written through to the ledger. A trade
/// only reaches the ledger once its entry order is confirmed, and leaves the open
/// set only after its exit order has been accepted by the broker.
///
/// The ledger is shared with other processes (`emergency-exit`), so it wins over the
/// in-memory copy: every monitor pass re-syncs, and every exit re-checks it.
pub struct TradeLifecycleManager {
    gateway: RateLimitedGateway,
    ledger: Arc<dyn TradeLedger>,
    store: Arc<dyn CandleStore>,
    session: TradingSession,
    settings: TradeSettings,
    open_trades: Vec<Trade>,
}

impl TradeLifecycleManager {
    pub fn new(
        gateway: RateLimitedGateway,
        ledger: Arc<dyn TradeLedger>,
        store: Arc<dyn CandleStore>,
        session: TradingSession,
        settings: TradeSettings,
    ) -> Self {
        Self {
            gateway,
            ledger,
            store,
            session,
            settings,
            open_trades: Vec::new(),
        }
    }

    /// Reload `OPEN` trades from the ledger so monitoring resumes after a restart
    pub async fn restore(&mut self) -> Result<usize> {
        self.open_trades = self.ledger.open_trades().await?;
        tracing::info!("Restored {} open trades from ledger", self.open_trades.len());
        Ok(self.open_trades.len())
    }

    /// Re-read `OPEN` trades from the ledger, keeping in-memory state for trades
    /// that are still open there
    async fn sync_with_ledger(&mut self) -> Result<()> {
        let stored = self.ledger.open_trades().await?;
        let known = std::mem::take(&mut self.open_trades);

        for trade in &known {
            if !stored.iter().any(|s| s.id == trade.id) {
                tracing::warn!(
                    "Trade {} is no longer OPEN in the ledger; dropped from monitoring",
                    trade.id
                );
            }
        }

        self.open_trades = stored
            .into_iter()
            .map(|s| known.iter().find(|t| t.id == s.id).cloned().unwrap_or(s))
            .collect();
        Ok(())
    }

    pub fn open_trades(&self) -> &[Trade] {
        &self.open_trades
    }

    pub fn settings(&self) -> &TradeSettings {
        &self.settings
    }

    /// Run a ledger write, retrying before escalating to `LedgerInconsistent`
    async fn write_with_retries<F, Fut>(&self, trade_id: Uuid, what: &str, mut op: F) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let attempts = self.settings.ledger_write_retries.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match op().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::error!(
                        "❌ Ledger {} for trade {} failed (attempt {}/{}): {}",
                        what,
                        trade_id,
                        attempt,
                        attempts,
                        e
                    );
                    last_error = e.to_string();
                    if attempt < attempts {
                        tokio::time::sleep(self.settings.ledger_retry_delay).await;
                    }
                }
            }
        }

        Err(EngineError::LedgerInconsistent {
            trade_id,
            reason: format!("{} failed after {} attempts: {}", what, attempts, last_error),
        })
    }

    /// Open a trade for `signal`.
    ///
    /// Returns `Ok(None)` when no position was taken: no quote, failed submission or
    /// a rejected order. Nothing is written to the ledger in those cases.
    pub async fn enter(&mut self, signal: &Signal, now: DateTime<Utc>) -> Result<Option<Trade>> {
        let today = self.session.session_date(now);
        let contract = contract_for(
            &self.settings.underlying,
            signal.direction,
            signal.candle_close,
            self.settings.strike_step,
            today,
        );
        let quantity = self.settings.lot_size;

        tracing::info!(
            "🚀 {} signal on {} @ {:.2} -> buying {} x{}",
            signal.direction.as_str(),
            signal.level_name,
            signal.level_value,
            contract,
            quantity
        );

        let Some(premium) = self.gateway.quote(&contract).await else {
            tracing::warn!("No premium for {}; skipping entry", contract);
            return Ok(None);
        };

        let Some(order_id) = self
            .gateway
            .place_order(&contract, OrderSide::Buy, quantity)
            .await
        else {
            tracing::warn!("Entry order for {} not submitted; no trade recorded", contract);
            return Ok(None);
        };

        let mut trade = Trade::pending(signal, contract, premium, quantity, order_id, now);

        tokio::time::sleep(self.settings.order_confirm_delay).await;
        let status = self
            .gateway
            .order_status(&trade.order_id)
            .await
            .unwrap_or_else(OrderStatus::unknown);
        trade.entry_order_status = status.state;

        if status.state.is_failed() {
            tracing::warn!(
                "Entry order {} {}; discarding trade",
                trade.order_id,
                status.state.as_str()
            );
            return Ok(None);
        }
        if status.state == OrderState::Unknown {
            tracing::warn!(
                "Entry order {} status unknown; tracking as open",
                trade.order_id
            );
        }

        if let Some(fill) = status.fill_price {
            trade.entry_price = fill;
        }
        trade.status = TradeStatus::Open;

        let ledger = self.ledger.clone();
        self.write_with_retries(trade.id, "insert", || ledger.insert_trade(&trade))
            .await?;

        tracing::info!(
            "✅ Trade {} OPEN: {} x{} @ ₹{:.2} (order {}, {})",
            trade.id,
            trade.contract,
            trade.quantity,
            trade.entry_price,
            trade.order_id,
            trade.entry_order_status.as_str()
        );

        self.open_trades.push(trade.clone());
        Ok(Some(trade))
    }

    /// Completed in-session monitoring candles of today, oldest first
    async fn stop_loss_candles(&self, now: DateTime<Utc>) -> Result<Vec<Candle>> {
        let today = self.session.session_date(now);
        let candles = self
            .store
            .candles_between(
                self.settings.monitoring_timeframe,
                self.session.open_at(today),
                now,
            )
            .await?;

        Ok(candles
            .into_iter()
            .filter(|c| c.is_complete_at(now) && self.session.contains_candle(c))
            .collect())
    }

    /// Violations among the last `threshold` qualifying candles, or None when
    /// there are not enough candles yet
    pub async fn evaluate_stop_loss(&self, trade: &Trade, now: DateTime<Utc>) -> Result<Option<u32>> {
        let threshold = self.settings.violation_threshold;
        let candles = self.stop_loss_candles(now).await?;
        if candles.len() < threshold {
            return Ok(None);
        }

        let recent = &candles[candles.len() - threshold..];
        Ok(Some(trailing_violations(
            trade.direction,
            trade.reference_level,
            recent,
        )))
    }

    /// Check every open trade for target or stop-loss, exiting where triggered.
    /// Returns the trades closed this pass.
    pub async fn monitor(&mut self, now: DateTime<Utc>) -> Result<Vec<Trade>> {
        if let Err(e) = self.sync_with_ledger().await {
            tracing::warn!("Ledger unavailable, monitoring skipped this tick: {}", e);
            return Ok(Vec::new());
        }

        let mut closed = Vec::new();
        let ids: Vec<Uuid> = self.open_trades.iter().map(|t| t.id).collect();

        for id in ids {
            let Some(trade) = self.open_trades.iter().find(|t| t.id == id).cloned() else {
                continue;
            };

            let Some(current) = self.gateway.quote(&trade.contract).await else {
                tracing::warn!("No premium for {}; monitoring skipped this tick", trade.contract);
                continue;
            };

            tracing::info!(
                "📊 {} {} entry ₹{:.2} now ₹{:.2} ({:+.2}/unit)",
                trade.contract,
                trade.direction.as_str(),
                trade.entry_price,
                current,
                trade.pnl_per_unit(current)
            );

            if target_hit(&trade, current, self.settings.target_per_unit) {
                tracing::info!("🎯 Target reached on {}", trade.contract);
                if let Some(done) = self.exit(id, ExitReason::Target, Some(current), now).await? {
                    closed.push(done);
                }
                continue;
            }

            let violations = match self.evaluate_stop_loss(&trade, now).await {
                Ok(Some(count)) => count,
                Ok(None) => {
                    tracing::debug!("Not enough session candles for stop-loss on {}", trade.id);
                    continue;
                }
                Err(e) => {
                    tracing::warn!("Stop-loss check for {} skipped: {}", trade.id, e);
                    continue;
                }
            };

            if let Some(t) = self.open_trades.iter_mut().find(|t| t.id == id) {
                t.consecutive_violation_count = violations;
                t.last_sl_check_time = Some(now);
            }
            if let Err(e) = self.ledger.record_violation_count(id, violations, now).await {
                tracing::warn!("Could not record violation count for {}: {}", id, e);
            }

            if violations as usize >= self.settings.violation_threshold {
                tracing::warn!(
                    "🛑 {} consecutive closes beyond {:.2} on {}; stopping out",
                    violations,
                    trade.reference_level,
                    trade.contract
                );
                if let Some(done) = self
                    .exit(id, ExitReason::StopLossLevel, Some(current), now)
                    .await?
                {
                    closed.push(done);
                }
            }
        }

        Ok(closed)
    }

    /// Square off one open trade and record the exit.
    ///
    /// Returns `Ok(None)` when the broker did not take the exit; the trade stays
    /// `OPEN` and is retried on a later tick.
    pub async fn exit(
        &mut self,
        trade_id: Uuid,
        reason: ExitReason,
        trigger_price: Option<f64>,
        now: DateTime<Utc>,
    ) -> Result<Option<Trade>> {
        let Some(pos) = self.open_trades.iter().position(|t| t.id == trade_id) else {
            return Ok(None);
        };
        let mut trade = self.open_trades[pos].clone();

        match self.ledger.find_trade(trade_id).await {
            Ok(Some(stored)) if stored.is_open() => {}
            Ok(_) => {
                tracing::warn!(
                    "Trade {} was closed elsewhere; skipping {} exit",
                    trade_id,
                    reason.as_str()
                );
                self.open_trades.remove(pos);
                return Ok(None);
            }
            Err(e) => {
                tracing::warn!("Cannot confirm trade {} is open, exit deferred: {}", trade_id, e);
                return Ok(None);
            }
        }

        let Some(exit_order_id) = self
            .gateway
            .square_off(&trade.contract, trade.quantity)
            .await
        else {
            tracing::error!(
                "Exit ({}) for trade {} not submitted; still OPEN",
                reason.as_str(),
                trade.id
            );
            return Ok(None);
        };

        tokio::time::sleep(self.settings.order_confirm_delay).await;
        let status = self
            .gateway
            .order_status(&exit_order_id)
            .await
            .unwrap_or_else(OrderStatus::unknown);

        if status.state.is_failed() {
            tracing::error!(
                "Exit order {} for trade {} {}; still OPEN",
                exit_order_id,
                trade.id,
                status.state.as_str()
            );
            return Ok(None);
        }

        let exit_price = match status.fill_price.or(trigger_price) {
            Some(price) => price,
            None => {
                tracing::warn!(
                    "No exit fill or quote for trade {}; booking at entry price",
                    trade.id
                );
                trade.entry_price
            }
        };

        trade.status = TradeStatus::Closed;
        trade.exit_price = Some(exit_price);
        trade.exit_time = Some(now);
        trade.exit_reason = Some(reason);
        trade.exit_order_id = Some(exit_order_id);
        trade.exit_order_status = Some(status.state);
        trade.pnl = Some(trade.realized_pnl(exit_price));

        // The broker position is gone; never square it off twice
        self.open_trades.remove(pos);

        let ledger = self.ledger.clone();
        self.write_with_retries(trade.id, "close", || close_once(ledger.as_ref(), &trade))
            .await?;

        tracing::info!(
            "💰 Trade {} CLOSED ({}): exit ₹{:.2}, P&L ₹{:.2}",
            trade.id,
            reason.as_str(),
            exit_price,
            trade.pnl.unwrap_or_default()
        );

        Ok(Some(trade))
    }

    /// Close every open trade with `EMERGENCY_EXIT`, bypassing target and stop-loss.
    ///
    /// Every trade is attempted; the first fatal ledger error is returned afterwards.
    pub async fn emergency_exit_all(&mut self, now: DateTime<Utc>) -> Result<Vec<Trade>> {
        tracing::warn!(
            "🚨 Emergency exit of {} open trades",
            self.open_trades.len()
        );

        let mut closed = Vec::new();
        let mut failure: Option<EngineError> = None;
        let targets: Vec<(Uuid, OptionContract)> = self
            .open_trades
            .iter()
            .map(|t| (t.id, t.contract.clone()))
            .collect();

        for (id, contract) in targets {
            let quote = self.gateway.quote(&contract).await;
            match self.exit(id, ExitReason::EmergencyExit, quote, now).await {
                Ok(Some(trade)) => closed.push(trade),
                Ok(None) => tracing::error!("Emergency exit of {} failed; still OPEN", id),
                Err(e) => {
                    tracing::error!("Emergency exit of {} not recorded: {}", id, e);
                    failure.get_or_insert(e);
                }
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(closed),
        }
    }
}
