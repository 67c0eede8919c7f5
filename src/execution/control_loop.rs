use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::broker::RateLimitedGateway;
use crate::context::TradingContext;
use crate::error::EngineError;
use crate::execution::status::{build_status, StatusReport};
use crate::execution::TradeLifecycleManager;
use crate::ledger::TradeLedger;
use crate::market::TradingSession;
use crate::models::{Signal, Trade};
use crate::strategy::{BreakoutDetector, DetectionInput, LevelAggregator};
use crate::Result;

/// What one tick did
#[derive(Debug, Default)]
pub struct TickReport {
    pub market_open: bool,
    pub closed: Vec<Trade>,
    pub signal: Option<Signal>,
    pub entered: Option<Trade>,
}

/// Requests a clean stop of a running [`ControlLoop`]
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { tx: Arc::new(tx) }, rx)
    }

    pub fn shutdown(&self) {
        // receivers may already be gone
        let _ = self.tx.send(true);
    }
}

/// Single cooperative driver: monitor open trades, look for one new breakout,
/// maybe enter, sleep.
pub struct ControlLoop {
    levels: LevelAggregator,
    detector: BreakoutDetector,
    trades: TradeLifecycleManager,
    gateway: RateLimitedGateway,
    ledger: Arc<dyn TradeLedger>,
    session: TradingSession,
    tick_interval: Duration,
}

impl ControlLoop {
    pub fn new(ctx: &TradingContext) -> Self {
        Self {
            levels: ctx.level_aggregator(),
            detector: ctx.detector(),
            trades: ctx.trade_manager(),
            gateway: ctx.gateway.clone(),
            ledger: ctx.ledger.clone(),
            session: ctx.session.clone(),
            tick_interval: ctx.config.tick_interval(),
        }
    }

    pub fn trade_manager(&self) -> &TradeLifecycleManager {
        &self.trades
    }

    pub fn trade_manager_mut(&mut self) -> &mut TradeLifecycleManager {
        &mut self.trades
    }

    pub fn detector(&self) -> &BreakoutDetector {
        &self.detector
    }

    /// Reload open trades before the first tick
    pub async fn restore(&mut self) -> Result<usize> {
        self.trades.restore().await
    }

    /// Run ticks until shutdown is requested or a fatal error occurs.
    ///
    /// Shutdown is only observed between ticks, so an exit that is in flight
    /// always completes and gets recorded.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            "🔄 Control loop started (tick every {:?}, {} open trades)",
            self.tick_interval,
            self.trades.open_trades().len()
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            if *shutdown.borrow() {
                break;
            }

            match self.tick_at(Utc::now()).await {
                Ok(_) => {}
                Err(e) if e.is_fatal() => {
                    tracing::error!(
                        "🚨 {}. Stopping; reconcile with the broker and run `breakout-engine emergency-exit`",
                        e
                    );
                    return Err(e);
                }
                Err(e) => tracing::warn!("Tick failed: {}", e),
            }
        }

        tracing::info!(
            "👋 Control loop stopped with {} open trades",
            self.trades.open_trades().len()
        );
        Ok(())
    }

    /// One tick at a specific time (for deterministic evaluation)
    pub async fn tick_at(&mut self, now: DateTime<Utc>) -> Result<TickReport> {
        let mut report = TickReport::default();

        if !self.session.is_open(now) {
            tracing::debug!("Market closed at {}", now);
            return Ok(report);
        }
        report.market_open = true;

        report.closed = self.trades.monitor(now).await?;

        match self.evaluate_breakout(now).await {
            Ok(Some(signal)) => {
                report.entered = self.trades.enter(&signal, now).await?;
                report.signal = Some(signal);
            }
            Ok(None) => {}
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => tracing::warn!("No decision this tick: {}", e),
        }

        let usage = self.gateway.usage().await;
        tracing::info!(
            "📡 API {}/{} in last 60s ({:.0}%), {} this session{}",
            usage.calls_in_window,
            usage.max_calls,
            usage.usage_pct,
            usage.total_session_calls,
            if usage.is_safe { "" } else { " ⚠️" }
        );

        Ok(report)
    }

    /// Latest completed candle against levels as of its start
    async fn evaluate_breakout(&mut self, now: DateTime<Utc>) -> Result<Option<Signal>> {
        let recent = self.levels.recent_completed(now, 2).await?;
        let Some(current) = recent.last() else {
            return Err(EngineError::DataUnavailable(format!(
                "no completed {} candle before {}",
                self.levels.monitoring_timeframe(),
                now
            )));
        };

        let session_date = self.session.session_date(current.start_time);
        let previous = recent
            .len()
            .checked_sub(2)
            .map(|i| &recent[i])
            .filter(|p| self.session.session_date(p.start_time) == session_date);

        let levels = self.levels.compute_levels(current.start_time).await?;
        let atr = self.levels.compute_atr(now).await?;
        let session_candles = self.levels.session_candles(now).await?;

        Ok(self.detector.detect_signal_at(
            DetectionInput {
                current,
                previous,
                levels: &levels,
                atr,
                session_candles: &session_candles,
            },
            now,
        ))
    }

    pub async fn status(&self, recent: usize, now: DateTime<Utc>) -> Result<StatusReport> {
        build_status(
            &self.levels,
            self.ledger.as_ref(),
            &self.gateway,
            Some(self.detector.processed().len()),
            recent,
            now,
        )
        .await
    }
}
