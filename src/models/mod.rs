use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Candle granularity stored in the candle store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "5m")]
    FiveMin,
    #[serde(rename = "15m")]
    FifteenMin,
    #[serde(rename = "1d")]
    OneDay,
}

impl Timeframe {
    pub fn duration(&self) -> Duration {
        match self {
            Timeframe::FiveMin => Duration::minutes(5),
            Timeframe::FifteenMin => Duration::minutes(15),
            Timeframe::OneDay => Duration::days(1),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::FiveMin => "5m",
            Timeframe::FifteenMin => "15m",
            Timeframe::OneDay => "1d",
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "5m" => Ok(Timeframe::FiveMin),
            "15m" => Ok(Timeframe::FifteenMin),
            "1d" => Ok(Timeframe::OneDay),
            other => Err(format!("unknown timeframe '{}'", other)),
        }
    }
}

/// OHLCV candle. Immutable once written to the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timeframe: Timeframe,
    pub start_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    /// Instant at which this candle is complete (start + duration)
    pub fn completion_time(&self) -> DateTime<Utc> {
        self.start_time + self.timeframe.duration()
    }

    pub fn is_complete_at(&self, now: DateTime<Utc>) -> bool {
        self.completion_time() <= now
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LevelKind {
    OpeningRange,
    SessionRange,
    PreviousDay,
    RollingNDays,
}

/// Derived price level. Never persisted, never zero-filled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Level {
    pub name: String,
    pub timeframe_scope: Timeframe,
    pub high: f64,
    pub low: f64,
    pub kind: LevelKind,
}

impl Level {
    /// Build a level spanning the given candles. Returns None when there is no data.
    pub fn from_candles(
        name: &str,
        timeframe_scope: Timeframe,
        kind: LevelKind,
        candles: &[Candle],
    ) -> Option<Level> {
        if candles.is_empty() {
            return None;
        }

        let high = candles.iter().map(|c| c.high).fold(f64::MIN, f64::max);
        let low = candles.iter().map(|c| c.low).fold(f64::MAX, f64::min);

        Some(Level {
            name: name.to_string(),
            timeframe_scope,
            high,
            low,
            kind,
        })
    }
}

/// Levels keyed by name
pub type LevelMap = BTreeMap<String, Level>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalKind {
    Breakout,
    Breakdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Long => "LONG",
            Direction::Short => "SHORT",
        }
    }

    /// Option right bought to express this direction
    pub fn option_right(&self) -> OptionRight {
        match self {
            Direction::Long => OptionRight::Call,
            Direction::Short => OptionRight::Put,
        }
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "LONG" => Ok(Direction::Long),
            "SHORT" => Ok(Direction::Short),
            other => Err(format!("unknown direction '{}'", other)),
        }
    }
}

/// Breakout decision produced by the detector and consumed once by the trade manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub kind: SignalKind,
    pub direction: Direction,
    pub level_name: String,
    pub level_kind: LevelKind,
    pub level_value: f64,
    pub candle_close: f64,
    pub candle_time: DateTime<Utc>,
    pub probability: u8,
    /// |close - level| / ATR
    pub distance_atr: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OptionRight {
    Call,
    Put,
}

impl OptionRight {
    pub fn as_str(&self) -> &'static str {
        match self {
            OptionRight::Call => "call",
            OptionRight::Put => "put",
        }
    }
}

impl FromStr for OptionRight {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "call" => Ok(OptionRight::Call),
            "put" => Ok(OptionRight::Put),
            other => Err(format!("unknown option right '{}'", other)),
        }
    }
}

/// Index option traded for a signal
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OptionContract {
    pub underlying: String,
    pub strike: u32,
    pub right: OptionRight,
    pub expiry: NaiveDate,
}

impl fmt::Display for OptionContract {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {}",
            self.underlying,
            self.expiry.format("%d%b"),
            self.strike,
            self.right.as_str().to_uppercase()
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        }
    }
}

/// Broker-reported order state. `Unknown` is an uncertain state, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderState {
    Executed,
    Pending,
    Rejected,
    Cancelled,
    Unknown,
}

impl OrderState {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderState::Executed => "Executed",
            OrderState::Pending => "Pending",
            OrderState::Rejected => "Rejected",
            OrderState::Cancelled => "Cancelled",
            OrderState::Unknown => "Unknown",
        }
    }

    /// Lenient parse of broker status strings
    pub fn from_broker(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "executed" | "complete" | "filled" => OrderState::Executed,
            "pending" | "ordered" | "open" | "requested" => OrderState::Pending,
            "rejected" => OrderState::Rejected,
            "cancelled" | "canceled" => OrderState::Cancelled,
            _ => OrderState::Unknown,
        }
    }

    /// True when the broker definitely did not take the order
    pub fn is_failed(&self) -> bool {
        matches!(self, OrderState::Rejected | OrderState::Cancelled)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderStatus {
    pub state: OrderState,
    pub fill_price: Option<f64>,
}

impl OrderStatus {
    pub fn unknown() -> Self {
        Self {
            state: OrderState::Unknown,
            fill_price: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeStatus {
    PendingEntry,
    Open,
    Closed,
}

impl TradeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeStatus::PendingEntry => "PENDING_ENTRY",
            TradeStatus::Open => "OPEN",
            TradeStatus::Closed => "CLOSED",
        }
    }
}

impl FromStr for TradeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING_ENTRY" => Ok(TradeStatus::PendingEntry),
            "OPEN" => Ok(TradeStatus::Open),
            "CLOSED" => Ok(TradeStatus::Closed),
            other => Err(format!("unknown trade status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitReason {
    Target,
    StopLossLevel,
    EmergencyExit,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::Target => "TARGET",
            ExitReason::StopLossLevel => "STOP_LOSS_LEVEL",
            ExitReason::EmergencyExit => "EMERGENCY_EXIT",
        }
    }
}

impl FromStr for ExitReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TARGET" => Ok(ExitReason::Target),
            "STOP_LOSS_LEVEL" => Ok(ExitReason::StopLossLevel),
            "EMERGENCY_EXIT" => Ok(ExitReason::EmergencyExit),
            other => Err(format!("unknown exit reason '{}'", other)),
        }
    }
}

/// One option position from entry to exit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: Uuid,
    pub direction: Direction,
    pub level_name: String,
    pub reference_level: f64,
    pub probability: u8,
    pub contract: OptionContract,
    pub entry_price: f64,
    pub entry_time: DateTime<Utc>,
    pub quantity: u32,
    pub order_id: String,
    pub entry_order_status: OrderState,
    pub status: TradeStatus,
    pub consecutive_violation_count: u32,
    pub last_sl_check_time: Option<DateTime<Utc>>,
    pub exit_price: Option<f64>,
    pub exit_time: Option<DateTime<Utc>>,
    pub exit_reason: Option<ExitReason>,
    pub exit_order_id: Option<String>,
    pub exit_order_status: Option<OrderState>,
    pub pnl: Option<f64>,
}

impl Trade {
    /// Trade whose entry order has been submitted but not yet confirmed
    pub fn pending(
        signal: &Signal,
        contract: OptionContract,
        entry_price: f64,
        quantity: u32,
        order_id: String,
        entry_time: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            direction: signal.direction,
            level_name: signal.level_name.clone(),
            reference_level: signal.level_value,
            probability: signal.probability,
            contract,
            entry_price,
            entry_time,
            quantity,
            order_id,
            entry_order_status: OrderState::Unknown,
            status: TradeStatus::PendingEntry,
            consecutive_violation_count: 0,
            last_sl_check_time: None,
            exit_price: None,
            exit_time: None,
            exit_reason: None,
            exit_order_id: None,
            exit_order_status: None,
            pnl: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == TradeStatus::Open
    }

    /// Premium P&L per unit at the given price
    pub fn pnl_per_unit(&self, current_price: f64) -> f64 {
        current_price - self.entry_price
    }

    /// Realized P&L for an exit at `exit_price`.
    ///
    /// Both directions are expressed by buying an option (CALL for long, PUT for short),
    /// so the premium position is always long and the sign is the same for both.
    pub fn realized_pnl(&self, exit_price: f64) -> f64 {
        self.pnl_per_unit(exit_price) * self.quantity as f64
    }
}
