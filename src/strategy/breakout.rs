use chrono::{DateTime, Duration, Utc};
use std::collections::HashSet;

use crate::models::{Candle, Direction, Level, LevelKind, LevelMap, Signal, SignalKind};
use crate::strategy::levels::PREVIOUS_DAY;

/// Probability assigned to a fresh opening-range break
pub const OPENING_RANGE_PROBABILITY: u8 = 90;

/// Breakout probability as a step function of ATR-normalized distance to the level
pub fn probability_for_distance(distance_atr: f64) -> u8 {
    let d = distance_atr.abs();
    if d < 0.25 {
        85
    } else if d < 0.5 {
        70
    } else if d < 1.0 {
        55
    } else if d < 2.0 {
        40
    } else {
        25
    }
}

/// Candle start times already evaluated during this process lifetime
#[derive(Debug, Clone, Default)]
pub struct ProcessedCandleSet {
    seen: HashSet<DateTime<Utc>>,
}

impl ProcessedCandleSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, start_time: &DateTime<Utc>) -> bool {
        self.seen.contains(start_time)
    }

    /// Returns false if the candle was already marked
    pub fn mark(&mut self, start_time: DateTime<Utc>) -> bool {
        self.seen.insert(start_time)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GapDirection {
    Up,
    Down,
}

/// Session opened beyond the previous day's range
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Gap {
    pub direction: GapDirection,
    /// Previous-day level price must come back to
    pub retest_level: f64,
    pub points: f64,
}

impl Gap {
    /// Classify the session open against the previous day's range
    pub fn detect(session_open: f64, previous_day: &Level, threshold: f64) -> Option<Gap> {
        let gap_up = session_open - previous_day.high;
        let gap_down = previous_day.low - session_open;

        if gap_up > threshold {
            Some(Gap {
                direction: GapDirection::Up,
                retest_level: previous_day.high,
                points: gap_up,
            })
        } else if gap_down > threshold {
            Some(Gap {
                direction: GapDirection::Down,
                retest_level: previous_day.low,
                points: gap_down,
            })
        } else {
            None
        }
    }

    pub fn is_retest(&self, close: f64, band: f64) -> bool {
        (close - self.retest_level).abs() <= band
    }
}

#[derive(Debug, Clone)]
pub struct DetectorSettings {
    pub freshness_window: Duration,
    pub gap_threshold_points: f64,
    pub retest_band_points: f64,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            freshness_window: Duration::minutes(5),
            gap_threshold_points: 50.0,
            retest_band_points: 20.0,
        }
    }
}

/// Inputs for one detector evaluation
pub struct DetectionInput<'a> {
    /// Latest completed monitoring candle
    pub current: &'a Candle,
    /// Monitoring candle immediately before `current`
    pub previous: Option<&'a Candle>,
    /// Levels computed as of `current.start_time`
    pub levels: &'a LevelMap,
    pub atr: f64,
    /// Today's completed monitoring candles up to and including `current`
    pub session_candles: &'a [Candle],
}

/// Turns freshly completed monitoring candles into at most one signal each.
///
/// Gates run in order: freshness, idempotency, gap/retest, then fresh crossing and
/// selection. A candle that passes the idempotency gate is marked processed whether
/// or not it yields a signal.
#[derive(Debug, Clone, Default)]
pub struct BreakoutDetector {
    settings: DetectorSettings,
    processed: ProcessedCandleSet,
}

impl BreakoutDetector {
    pub fn new(settings: DetectorSettings) -> Self {
        Self {
            settings,
            processed: ProcessedCandleSet::new(),
        }
    }

    pub fn processed(&self) -> &ProcessedCandleSet {
        &self.processed
    }

    pub fn is_fresh_at(&self, candle: &Candle, now: DateTime<Utc>) -> bool {
        let age = now - candle.completion_time();
        age >= Duration::zero() && age <= self.settings.freshness_window
    }

    pub fn detect_signal(&mut self, input: DetectionInput<'_>) -> Option<Signal> {
        self.detect_signal_at(input, Utc::now())
    }

    /// Detect signal at a specific time (for deterministic evaluation)
    pub fn detect_signal_at(
        &mut self,
        input: DetectionInput<'_>,
        now: DateTime<Utc>,
    ) -> Option<Signal> {
        let current = input.current;

        if !self.is_fresh_at(current, now) {
            tracing::debug!(
                "Candle {} not fresh at {} (completed {})",
                current.start_time,
                now,
                current.completion_time()
            );
            return None;
        }

        if !self.processed.mark(current.start_time) {
            return None;
        }

        if let Some(gap) = self.blocking_gap(&input) {
            tracing::info!(
                "Gap {:?} of {:.2} pts: close {:.2} is outside the retest band of {:.2}; signal suppressed",
                gap.direction,
                gap.points,
                current.close,
                gap.retest_level
            );
            return None;
        }

        let previous = input.previous?;
        let candidates = fresh_crossings(previous, current, input.levels, input.atr);

        let selected = candidates.into_iter().max_by(|a, b| {
            a.probability.cmp(&b.probability).then(
                b.distance_atr
                    .partial_cmp(&a.distance_atr)
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
        });

        if let Some(signal) = &selected {
            tracing::info!(
                "🎯 {:?} {} through {} @ {:.2} (close {:.2}, probability {}%)",
                signal.kind,
                signal.direction.as_str(),
                signal.level_name,
                signal.level_value,
                signal.candle_close,
                signal.probability
            );
        }

        selected
    }

    /// Gap that blocks a signal on the current candle, if any.
    ///
    /// The gap is measured from the session's first monitoring candle. While the
    /// session is gapped, only a candle that itself closes within the retest band of
    /// the gapped level may signal.
    fn blocking_gap(&self, input: &DetectionInput<'_>) -> Option<Gap> {
        let previous_day = input.levels.get(PREVIOUS_DAY)?;
        let first = input.session_candles.first()?;
        let gap = Gap::detect(first.open, previous_day, self.settings.gap_threshold_points)?;

        if gap.is_retest(input.current.close, self.settings.retest_band_points) {
            None
        } else {
            Some(gap)
        }
    }
}

/// Every level edge crossed between the previous and current close
pub fn fresh_crossings(
    previous: &Candle,
    current: &Candle,
    levels: &LevelMap,
    atr: f64,
) -> Vec<Signal> {
    let mut signals = Vec::new();

    for level in levels.values() {
        if previous.close <= level.high && current.close > level.high {
            signals.push(build_signal(
                SignalKind::Breakout,
                Direction::Long,
                level,
                level.high,
                current,
                atr,
            ));
        }
        if previous.close >= level.low && current.close < level.low {
            signals.push(build_signal(
                SignalKind::Breakdown,
                Direction::Short,
                level,
                level.low,
                current,
                atr,
            ));
        }
    }

    signals
}

fn build_signal(
    kind: SignalKind,
    direction: Direction,
    level: &Level,
    level_value: f64,
    current: &Candle,
    atr: f64,
) -> Signal {
    let distance_atr = (current.close - level_value).abs() / atr;
    let probability = match level.kind {
        LevelKind::OpeningRange => OPENING_RANGE_PROBABILITY,
        _ => probability_for_distance(distance_atr),
    };

    Signal {
        kind,
        direction,
        level_name: level.name.clone(),
        level_kind: level.kind,
        level_value,
        candle_close: current.close,
        candle_time: current.start_time,
        probability,
        distance_atr,
    }
}
