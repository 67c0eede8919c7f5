// Exchange calendar and option contract resolution
pub mod contract;
pub mod session;

pub use contract::{contract_for, nearest_strike, next_weekly_expiry};
pub use session::TradingSession;
