// Level derivation and breakout detection
pub mod breakout;
pub mod levels;

pub use breakout::{
    probability_for_distance, BreakoutDetector, DetectionInput, DetectorSettings, Gap,
    GapDirection, ProcessedCandleSet,
};
pub use levels::LevelAggregator;
