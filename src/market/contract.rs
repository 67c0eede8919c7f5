use chrono::{Datelike, Duration, NaiveDate};

use crate::models::{Direction, OptionContract};

/// Round the underlying price to the nearest strike
pub fn nearest_strike(underlying_price: f64, strike_step: u32) -> u32 {
    let step = strike_step.max(1) as f64;
    ((underlying_price / step).round() * step) as u32
}

/// Next weekly expiry (Thursday). On Thursday or later, rolls to the following week.
pub fn next_weekly_expiry(today: NaiveDate) -> NaiveDate {
    let weekday = today.weekday().num_days_from_monday() as i64;
    let mut days_ahead = 3 - weekday;
    if days_ahead <= 0 {
        days_ahead += 7;
    }
    today + Duration::days(days_ahead)
}

/// Option bought to trade a breakout in `direction`
pub fn contract_for(
    underlying: &str,
    direction: Direction,
    underlying_price: f64,
    strike_step: u32,
    today: NaiveDate,
) -> OptionContract {
    OptionContract {
        underlying: underlying.to_string(),
        strike: nearest_strike(underlying_price, strike_step),
        right: direction.option_right(),
        expiry: next_weekly_expiry(today),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OptionRight;

    #[test]
    fn test_nearest_strike() {
        assert_eq!(nearest_strike(25870.0, 100), 25900);
        assert_eq!(nearest_strike(25849.99, 100), 25800);
        assert_eq!(nearest_strike(25850.0, 100), 25900);
        assert_eq!(nearest_strike(25720.0, 50), 25700);
    }

    #[test]
    fn test_next_weekly_expiry() {
        // Tuesday -> Thursday of the same week
        let tue = NaiveDate::from_ymd_opt(2025, 11, 11).unwrap();
        assert_eq!(next_weekly_expiry(tue), NaiveDate::from_ymd_opt(2025, 11, 13).unwrap());

        // Thursday -> next Thursday
        let thu = NaiveDate::from_ymd_opt(2025, 11, 13).unwrap();
        assert_eq!(next_weekly_expiry(thu), NaiveDate::from_ymd_opt(2025, 11, 20).unwrap());

        // Saturday -> next Thursday
        let sat = NaiveDate::from_ymd_opt(2025, 11, 15).unwrap();
        assert_eq!(next_weekly_expiry(sat), NaiveDate::from_ymd_opt(2025, 11, 20).unwrap());
    }

    #[test]
    fn test_contract_for_direction() {
        let today = NaiveDate::from_ymd_opt(2025, 11, 11).unwrap();
        let call = contract_for("NIFTY", Direction::Long, 25870.0, 100, today);
        assert_eq!(call.right, OptionRight::Call);
        assert_eq!(call.strike, 25900);

        let put = contract_for("NIFTY", Direction::Short, 25870.0, 100, today);
        assert_eq!(put.right, OptionRight::Put);
    }
}
