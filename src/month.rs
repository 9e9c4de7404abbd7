//! Calendar months, the time buckets of the corpus
//!
//! The store records time as a whole number of months since an epoch month,
//! while the wire format and the chart use UTC month-start timestamps in
//! milliseconds. [`YearMonth`] sits between the two so that year rollover is
//! handled in exactly one place.

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use std::{fmt, str::FromStr};

/// Calendar month of the proleptic Gregorian calendar
///
/// Internally a count of months since January of year 0, which makes month
/// offsets plain additions. Only months that chrono can represent are
/// constructible.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct YearMonth(i64);
//
impl YearMonth {
    /// Month from a year and a 1-based month number
    pub fn new(year: i32, month: u32) -> Option<Self> {
        NaiveDate::from_ymd_opt(year, month, 1)?;
        Some(Self(i64::from(year) * 12 + i64::from(month) - 1))
    }

    /// Month containing a UTC timestamp in milliseconds
    pub fn from_timestamp_millis(millis: i64) -> Option<Self> {
        let date = DateTime::<Utc>::from_timestamp_millis(millis)?;
        Self::new(date.year(), date.month())
    }

    /// Gregorian year
    pub fn year(self) -> i32 {
        // In range thanks to the constructor's validation
        self.0.div_euclid(12) as i32
    }

    /// 1-based month number
    pub fn month(self) -> u32 {
        self.0.rem_euclid(12) as u32 + 1
    }

    /// Month that comes `offset` months after this one (before it if negative)
    pub fn add_months(self, offset: i64) -> Option<Self> {
        let target = self.0.checked_add(offset)?;
        let year = i32::try_from(target.div_euclid(12)).ok()?;
        Self::new(year, target.rem_euclid(12) as u32 + 1)
    }

    /// Number of months elapsed since `epoch` (negative if before it)
    pub fn months_since(self, epoch: Self) -> i64 {
        self.0 - epoch.0
    }

    /// Next calendar month
    pub fn succ(self) -> Option<Self> {
        self.add_months(1)
    }

    /// UTC timestamp of the first millisecond of this month
    pub fn timestamp_millis(self) -> i64 {
        NaiveDate::from_ymd_opt(self.year(), self.month(), 1)
            .and_then(|date| date.and_hms_opt(0, 0, 0))
            .expect("YearMonth construction should only accept representable months")
            .and_utc()
            .timestamp_millis()
    }
}
//
impl fmt::Display for YearMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year(), self.month())
    }
}
//
impl FromStr for YearMonth {
    type Err = String;

    /// Parse a `YYYY-MM` month
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || format!("expected a YYYY-MM month, got {s:?}");
        let (year, month) = s.trim().split_once('-').ok_or_else(invalid)?;
        let year = year.parse::<i32>().map_err(|_| invalid())?;
        let month = month.parse::<u32>().map_err(|_| invalid())?;
        Self::new(year, month).ok_or_else(invalid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_roll_over_years() {
        let epoch = YearMonth::new(2017, 1).unwrap();
        assert_eq!(epoch.add_months(6), YearMonth::new(2017, 7));
        assert_eq!(epoch.add_months(12), YearMonth::new(2018, 1));
        assert_eq!(epoch.add_months(29), YearMonth::new(2019, 6));
        assert_eq!(epoch.add_months(-1), YearMonth::new(2016, 12));
        assert_eq!(YearMonth::new(2019, 6).unwrap().months_since(epoch), 29);
    }

    #[test]
    fn timestamps_match_utc_month_starts() {
        let july = YearMonth::new(2017, 7).unwrap();
        // Date.UTC(2017, 6)
        assert_eq!(july.timestamp_millis(), 1_498_867_200_000);
        assert_eq!(YearMonth::from_timestamp_millis(1_498_867_200_000), Some(july));
        // Last millisecond of June still belongs to June
        assert_eq!(
            YearMonth::from_timestamp_millis(1_498_867_199_999),
            YearMonth::new(2017, 6)
        );
    }

    #[test]
    fn parsing_and_display() {
        let month = "2017-07".parse::<YearMonth>().unwrap();
        assert_eq!(month, YearMonth::new(2017, 7).unwrap());
        assert_eq!(month.to_string(), "2017-07");
        assert!("2017-13".parse::<YearMonth>().is_err());
        assert!("2017".parse::<YearMonth>().is_err());
        assert!("July 2017".parse::<YearMonth>().is_err());
    }

    #[test]
    fn unrepresentable_months_are_rejected() {
        let month = YearMonth::new(2017, 1).unwrap();
        assert_eq!(month.add_months(i64::MAX), None);
        assert_eq!(YearMonth::new(2017, 0), None);
    }
}
