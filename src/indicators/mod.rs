// Technical indicators module
pub mod atr;

pub use atr::{atr_or_default, calculate_atr, true_ranges, ATR_PERIOD, DEFAULT_ATR};
