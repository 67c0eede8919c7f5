use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

use crate::models::Candle;

/// Exchange trading session calendar.
///
/// Candle timestamps are stored in UTC; session boundaries and trading dates are
/// evaluated in the exchange timezone (IST for NSE index options).
#[derive(Debug, Clone)]
pub struct TradingSession {
    tz: Tz,
    open: NaiveTime,
    close: NaiveTime,
}

impl Default for TradingSession {
    fn default() -> Self {
        Self {
            tz: chrono_tz::Asia::Kolkata,
            open: NaiveTime::from_hms_opt(9, 15, 0).unwrap_or_default(),
            close: NaiveTime::from_hms_opt(15, 30, 0).unwrap_or_default(),
        }
    }
}

impl TradingSession {
    pub fn new(tz: Tz, open: NaiveTime, close: NaiveTime) -> Self {
        Self { tz, open, close }
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    /// Exchange-local trading date for an instant
    pub fn session_date(&self, t: DateTime<Utc>) -> NaiveDate {
        t.with_timezone(&self.tz).date_naive()
    }

    fn local_to_utc(&self, date: NaiveDate, time: NaiveTime) -> DateTime<Utc> {
        let naive = date.and_time(time);
        self.tz
            .from_local_datetime(&naive)
            .earliest()
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|| naive.and_utc())
    }

    /// Local midnight of `date`, in UTC. Daily candles start here.
    pub fn day_start(&self, date: NaiveDate) -> DateTime<Utc> {
        self.local_to_utc(date, NaiveTime::MIN)
    }

    pub fn open_at(&self, date: NaiveDate) -> DateTime<Utc> {
        self.local_to_utc(date, self.open)
    }

    pub fn close_at(&self, date: NaiveDate) -> DateTime<Utc> {
        self.local_to_utc(date, self.close)
    }

    /// Market hours predicate (open and close inclusive)
    pub fn is_open(&self, t: DateTime<Utc>) -> bool {
        let date = self.session_date(t);
        self.open_at(date) <= t && t <= self.close_at(date)
    }

    /// True when the candle lies entirely inside its day's trading hours
    pub fn contains_candle(&self, candle: &Candle) -> bool {
        let date = self.session_date(candle.start_time);
        candle.start_time >= self.open_at(date) && candle.completion_time() <= self.close_at(date)
    }
}
