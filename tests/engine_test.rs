use async_trait::async_trait;
use breakout_engine::broker::{RateLimitedGateway, SimulatedBrokerage};
use breakout_engine::config::EngineConfig;
use breakout_engine::execution::ControlLoop;
use breakout_engine::ledger::{InMemoryLedger, TradeLedger};
use breakout_engine::store::InMemoryCandleStore;
use breakout_engine::*;
use chrono::{DateTime, TimeZone, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_test::{assert_err, assert_ok};
use uuid::Uuid;

// ============================================================================
// Fixtures
// ============================================================================

fn ist(h: u32, m: u32, s: u32) -> DateTime<Utc> {
    chrono_tz::Asia::Kolkata
        .with_ymd_and_hms(2025, 11, 11, h, m, s)
        .unwrap()
        .with_timezone(&Utc)
}

fn bar(h: u32, m: u32, open: f64, high: f64, low: f64, close: f64) -> Candle {
    Candle {
        timeframe: Timeframe::FiveMin,
        start_time: ist(h, m, 0),
        open,
        high,
        low,
        close,
        volume: 1000.0,
    }
}

/// Previous session: high 25713.80, low 25450.85
fn previous_day() -> Candle {
    Candle {
        timeframe: Timeframe::OneDay,
        start_time: chrono_tz::Asia::Kolkata
            .with_ymd_and_hms(2025, 11, 10, 0, 0, 0)
            .unwrap()
            .with_timezone(&Utc),
        open: 25500.0,
        high: 25713.80,
        low: 25450.85,
        close: 25690.0,
        volume: 0.0,
    }
}

/// Ledger that can be told to fail writes
#[derive(Clone, Default)]
struct FlakyLedger {
    inner: InMemoryLedger,
    fail_writes: Arc<AtomicBool>,
}

#[async_trait]
impl TradeLedger for FlakyLedger {
    async fn insert_trade(&self, trade: &Trade) -> breakout_engine::Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(EngineError::Ledger("disk full".into()));
        }
        self.inner.insert_trade(trade).await
    }

    async fn record_violation_count(
        &self,
        trade_id: Uuid,
        count: u32,
        checked_at: DateTime<Utc>,
    ) -> breakout_engine::Result<()> {
        self.inner
            .record_violation_count(trade_id, count, checked_at)
            .await
    }

    async fn close_trade(&self, trade: &Trade) -> breakout_engine::Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(EngineError::Ledger("disk full".into()));
        }
        self.inner.close_trade(trade).await
    }

    async fn find_trade(&self, trade_id: Uuid) -> breakout_engine::Result<Option<Trade>> {
        self.inner.find_trade(trade_id).await
    }

    async fn open_trades(&self) -> breakout_engine::Result<Vec<Trade>> {
        self.inner.open_trades().await
    }

    async fn recent_closed(&self, limit: usize) -> breakout_engine::Result<Vec<Trade>> {
        self.inner.recent_closed(limit).await
    }
}

struct Fixture {
    ctx: TradingContext,
    store: InMemoryCandleStore,
    ledger: FlakyLedger,
    broker: Arc<SimulatedBrokerage>,
}

fn fixture() -> Fixture {
    let config = EngineConfig {
        order_confirm_delay_seconds: 0,
        ..EngineConfig::default()
    };
    let store = InMemoryCandleStore::new();
    let ledger = FlakyLedger::default();
    let broker = Arc::new(SimulatedBrokerage::new());

    let ctx = TradingContext::new(
        config,
        Arc::new(store.clone()),
        Arc::new(ledger.clone()),
        broker.clone(),
    )
    .unwrap();

    Fixture {
        ctx,
        store,
        ledger,
        broker,
    }
}

/// Quiet open inside yesterday's range, then a close through the opening-range high
fn seed_opening_range_breakout(store: &InMemoryCandleStore) {
    store
        .add_candles(vec![
            previous_day(),
            bar(9, 15, 25600.0, 25620.0, 25590.0, 25610.0),
            bar(9, 20, 25610.0, 25630.0, 25600.0, 25625.0),
            bar(9, 25, 25625.0, 25640.0, 25615.0, 25630.0),
            bar(9, 30, 25630.0, 25660.0, 25628.0, 25655.0),
        ])
        .unwrap();
}

// ============================================================================
// Signal tests
// ============================================================================

#[tokio::test]
async fn test_full_tick_enters_once_per_candle() {
    let f = fixture();
    seed_opening_range_breakout(&f.store);
    let mut control = ControlLoop::new(&f.ctx);

    let report = assert_ok!(control.tick_at(ist(9, 35, 30)).await);
    let signal = report.signal.expect("opening range breakout");
    assert_eq!(signal.kind, SignalKind::Breakout);
    assert_eq!(signal.direction, Direction::Long);
    assert_eq!(signal.level_name, "Opening Range");
    assert_eq!(signal.level_value, 25640.0);
    assert_eq!(signal.probability, 90);

    let trade = report.entered.expect("paper order fills");
    assert_eq!(trade.contract.strike, 25700);
    assert_eq!(trade.contract.right, OptionRight::Call);
    assert_eq!(trade.reference_level, 25640.0);
    assert_eq!(trade.status, TradeStatus::Open);

    // same candle on a later tick: already processed
    let again = control.tick_at(ist(9, 37, 0)).await.unwrap();
    assert!(again.signal.is_none());
    assert!(again.entered.is_none());
    assert_eq!(f.ledger.open_trades().await.unwrap().len(), 1);
    assert_eq!(control.detector().processed().len(), 1);
}

#[tokio::test]
async fn test_freshness_boundary() {
    // 09:30 candle completes at 09:35:00
    let f = fixture();
    seed_opening_range_breakout(&f.store);
    let mut control = ControlLoop::new(&f.ctx);
    let report = control.tick_at(ist(9, 39, 59)).await.unwrap();
    assert!(report.signal.is_some(), "4:59 after completion is fresh");

    let f = fixture();
    seed_opening_range_breakout(&f.store);
    let mut control = ControlLoop::new(&f.ctx);
    let report = control.tick_at(ist(9, 40, 1)).await.unwrap();
    assert!(report.signal.is_none(), "5:01 after completion is stale");
    assert!(f.ledger.open_trades().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_gap_up_without_retest_is_suppressed() {
    let f = fixture();
    f.store
        .add_candles(vec![
            previous_day(),
            bar(9, 15, 25850.0, 25862.0, 25840.0, 25860.0),
            bar(9, 20, 25855.0, 25858.0, 25845.0, 25855.0),
            bar(9, 25, 25852.0, 25855.0, 25842.0, 25850.0),
            bar(9, 30, 25850.0, 25875.0, 25848.0, 25870.0),
        ])
        .unwrap();
    let mut control = ControlLoop::new(&f.ctx);

    let report = control.tick_at(ist(9, 35, 10)).await.unwrap();

    assert!(report.signal.is_none());
    assert!(report.entered.is_none());
    assert_eq!(f.broker.call_count(), 0);
    // suppressed candles still count as evaluated
    assert_eq!(control.detector().processed().len(), 1);
}

#[tokio::test]
async fn test_gap_up_with_retest_is_allowed() {
    let f = fixture();
    f.store
        .add_candles(vec![
            previous_day(),
            bar(9, 15, 25850.0, 25855.0, 25760.0, 25780.0),
            bar(9, 20, 25780.0, 25790.0, 25730.0, 25740.0),
            bar(9, 25, 25740.0, 25745.0, 25685.0, 25690.0),
            bar(9, 30, 25690.0, 25725.0, 25688.0, 25720.0),
        ])
        .unwrap();
    let mut control = ControlLoop::new(&f.ctx);

    let report = control.tick_at(ist(9, 35, 10)).await.unwrap();

    let signal = report.signal.expect("retest of previous-day high");
    assert_eq!(signal.direction, Direction::Long);
    assert_eq!(signal.level_value, 25713.80);
    assert_eq!(signal.candle_close, 25720.0);
}

#[tokio::test]
async fn test_failed_submission_leaves_no_trade() {
    let f = fixture();
    seed_opening_range_breakout(&f.store);
    f.broker.set_fail_orders(true).unwrap();
    let mut control = ControlLoop::new(&f.ctx);

    let report = control.tick_at(ist(9, 35, 30)).await.unwrap();
    assert!(report.signal.is_some());
    assert!(report.entered.is_none());

    assert!(f.ledger.open_trades().await.unwrap().is_empty());
    assert!(f.ledger.inner.all_trades().unwrap().is_empty());
    assert!(control.trade_manager().open_trades().is_empty());

    // the opportunity is consumed; no retry on the same candle
    f.broker.set_fail_orders(false).unwrap();
    let report = control.tick_at(ist(9, 36, 0)).await.unwrap();
    assert!(report.signal.is_none());
}

// ============================================================================
// Trade lifecycle tests
// ============================================================================

fn open_long(reference_level: f64, entry_price: f64) -> Trade {
    let signal = Signal {
        kind: SignalKind::Breakout,
        direction: Direction::Long,
        level_name: "Opening Range".to_string(),
        level_kind: LevelKind::OpeningRange,
        level_value: reference_level,
        candle_close: reference_level + 1.0,
        candle_time: ist(9, 30, 0),
        probability: 90,
        distance_atr: 0.02,
    };
    let contract = market::contract_for("NIFTY", Direction::Long, 25_800.0, 100, ist(9, 35, 0).date_naive());
    let mut trade = Trade::pending(&signal, contract, entry_price, 75, "PAPER1".into(), ist(9, 35, 0));
    trade.status = TradeStatus::Open;
    trade.entry_order_status = OrderState::Executed;
    trade
}

#[tokio::test]
async fn test_consecutive_stop_loss() {
    // closes {99, 99}: both below the level
    let f = fixture();
    f.ledger.insert_trade(&open_long(100.0, 100.0)).await.unwrap();
    f.store
        .add_candles(vec![
            bar(10, 0, 100.0, 100.0, 98.0, 99.0),
            bar(10, 5, 99.0, 100.0, 98.0, 99.0),
        ])
        .unwrap();
    let mut control = ControlLoop::new(&f.ctx);
    control.restore().await.unwrap();

    let report = control.tick_at(ist(10, 10, 5)).await.unwrap();
    assert_eq!(report.closed.len(), 1);
    assert_eq!(report.closed[0].exit_reason, Some(ExitReason::StopLossLevel));

    // closes {99, 101}: streak broken
    let f = fixture();
    let trade = open_long(100.0, 100.0);
    f.ledger.insert_trade(&trade).await.unwrap();
    f.store
        .add_candles(vec![
            bar(10, 0, 100.0, 100.0, 98.0, 99.0),
            bar(10, 5, 99.0, 101.5, 98.5, 101.0),
        ])
        .unwrap();
    let mut control = ControlLoop::new(&f.ctx);
    control.restore().await.unwrap();

    let report = control.tick_at(ist(10, 10, 5)).await.unwrap();
    assert!(report.closed.is_empty());
    let still_open = f.ledger.open_trades().await.unwrap();
    assert!(still_open.iter().any(|t| t.id == trade.id));
    let tracked = control
        .trade_manager()
        .open_trades()
        .iter()
        .find(|t| t.id == trade.id)
        .unwrap();
    assert_eq!(tracked.consecutive_violation_count, 0);
}

#[tokio::test]
async fn test_single_candle_is_not_enough_for_stop_loss() {
    let f = fixture();
    f.ledger.insert_trade(&open_long(100.0, 100.0)).await.unwrap();
    f.store
        .add_candle(bar(9, 15, 100.0, 100.0, 98.0, 99.0))
        .unwrap();
    let mut control = ControlLoop::new(&f.ctx);
    control.restore().await.unwrap();

    let report = control.tick_at(ist(9, 20, 5)).await.unwrap();
    assert!(report.closed.is_empty());
}

#[tokio::test]
async fn test_target_exactness_and_round_trip() {
    let f = fixture();
    let trade = open_long(25_640.0, 50.0);
    f.ledger.insert_trade(&trade).await.unwrap();
    let mut control = ControlLoop::new(&f.ctx);
    control.restore().await.unwrap();

    f.broker.set_quote(59.99).unwrap();
    let report = control.tick_at(ist(10, 0, 0)).await.unwrap();
    assert!(report.closed.is_empty());

    f.broker.set_quote(60.0).unwrap();
    let report = control.tick_at(ist(10, 0, 15)).await.unwrap();
    assert_eq!(report.closed.len(), 1);

    let closed = &f.ledger.recent_closed(1).await.unwrap()[0];
    assert_eq!(closed.id, trade.id);
    assert_eq!(closed.status, TradeStatus::Closed);
    assert_eq!(closed.exit_reason, Some(ExitReason::Target));
    let exit_price = closed.exit_price.expect("exit price");
    assert!(closed.exit_time.is_some());
    assert!(closed.exit_order_id.is_some());
    let expected = (exit_price - closed.entry_price) * closed.quantity as f64;
    assert!((closed.pnl.unwrap() - expected).abs() < 1e-9);
    assert!((closed.pnl.unwrap() - 750.0).abs() < 1e-9);
}

#[tokio::test(start_paused = true)]
async fn test_ledger_failure_after_exit_is_fatal() {
    let f = fixture();
    f.ledger.insert_trade(&open_long(25_640.0, 50.0)).await.unwrap();
    let mut control = ControlLoop::new(&f.ctx);
    control.restore().await.unwrap();

    f.ledger.fail_writes.store(true, Ordering::SeqCst);
    f.broker.set_quote(65.0).unwrap();

    let err = assert_err!(control.tick_at(ist(10, 0, 0)).await);
    assert!(err.is_fatal());
    assert!(matches!(err, EngineError::LedgerInconsistent { .. }));
}

#[tokio::test]
async fn test_emergency_exit_closes_everything() {
    let f = fixture();
    f.ledger.insert_trade(&open_long(25_640.0, 50.0)).await.unwrap();
    f.ledger.insert_trade(&open_long(25_700.0, 40.0)).await.unwrap();
    let mut control = ControlLoop::new(&f.ctx);
    control.restore().await.unwrap();

    let closed = assert_ok!(
        control
            .trade_manager_mut()
            .emergency_exit_all(ist(11, 0, 0))
            .await
    );

    assert_eq!(closed.len(), 2);
    for trade in &closed {
        assert_eq!(trade.exit_reason, Some(ExitReason::EmergencyExit));
        assert!(trade.pnl.is_some());
    }
    assert!(f.ledger.open_trades().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_running_loop_respects_emergency_exit_from_another_process() {
    let f = fixture();
    f.ledger.insert_trade(&open_long(25_640.0, 50.0)).await.unwrap();
    let mut control = ControlLoop::new(&f.ctx);
    control.restore().await.unwrap();

    // operator closes everything through a separate manager on the same ledger
    let mut operator = f.ctx.trade_manager();
    operator.restore().await.unwrap();
    let closed = assert_ok!(operator.emergency_exit_all(ist(10, 0, 0)).await);
    assert_eq!(closed.len(), 1);

    // a quote that would hit the target must not trigger a second square-off
    f.broker.set_quote(65.0).unwrap();
    let calls_before = f.broker.call_count();
    let report = assert_ok!(control.tick_at(ist(10, 0, 15)).await);

    assert!(report.closed.is_empty());
    assert_eq!(f.broker.call_count(), calls_before);
    assert!(control.trade_manager().open_trades().is_empty());
    assert_eq!(f.ledger.recent_closed(5).await.unwrap().len(), 1);
}

// ============================================================================
// Gateway and status tests
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_rate_limit_holds_across_callers() {
    let broker = Arc::new(SimulatedBrokerage::new());
    let gateway = RateLimitedGateway::new(broker, 4, std::time::Duration::from_secs(1));
    let contract = market::contract_for(
        "NIFTY",
        Direction::Short,
        25_500.0,
        100,
        ist(10, 0, 0).date_naive(),
    );

    let mut handles = Vec::new();
    for _ in 0..13 {
        let gw = gateway.clone();
        let c = contract.clone();
        handles.push(tokio::spawn(async move {
            gw.quote(&c).await;
            tokio::time::Instant::now()
        }));
    }

    let mut stamps = Vec::new();
    for h in handles {
        stamps.push(h.await.unwrap());
    }
    stamps.sort();

    for window_start in &stamps {
        let in_window = stamps
            .iter()
            .filter(|t| **t >= *window_start && t.duration_since(*window_start) < std::time::Duration::from_secs(60))
            .count();
        assert!(in_window <= 4, "{} calls inside one 60s window", in_window);
    }
}

#[tokio::test]
async fn test_status_report() {
    let f = fixture();
    seed_opening_range_breakout(&f.store);
    let mut control = ControlLoop::new(&f.ctx);
    control.tick_at(ist(9, 35, 30)).await.unwrap();

    let report = control.status(5, ist(9, 36, 0)).await.unwrap();

    assert!(report.market_open);
    assert_eq!(report.price, Some(25655.0));
    assert_eq!(report.atr, 50.0);
    assert_eq!(report.processed_candles, Some(1));
    assert_eq!(report.open_trades.len(), 1);
    assert!(report.recent_closed.is_empty());

    let names: Vec<&str> = report.levels.iter().map(|l| l.name.as_str()).collect();
    assert!(names.contains(&"First Candle"));
    assert!(names.contains(&"Previous Day"));

    let opening = report
        .levels
        .iter()
        .find(|l| l.name == "Opening Range")
        .unwrap();
    assert!(opening.broken_high);

    let json = serde_json::to_string(&report).unwrap();
    assert!(json.contains("\"Opening Range\""));
}
