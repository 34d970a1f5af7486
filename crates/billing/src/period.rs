//! Calendar period windows for consumable usage
//!
//! Windows are UTC calendar windows, not rolling ones. `start` is inclusive,
//! `end` is exclusive and equals the next window's `start`, so every instant
//! belongs to exactly one window. Weeks start on Monday.

use serde::Serialize;
use time::{Date, Duration, Month, OffsetDateTime, UtcOffset};

use crate::error::{BillingError, BillingResult};
use crate::models::LimitPeriod;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PeriodWindow {
    pub period: LimitPeriod,
    #[serde(with = "time::serde::rfc3339")]
    pub start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub end: OffsetDateTime,
}

impl PeriodWindow {
    /// The window of `period` containing `at`.
    pub fn containing(period: LimitPeriod, at: OffsetDateTime) -> BillingResult<Self> {
        let date = at.to_offset(UtcOffset::UTC).date();

        let (start, end) = match period {
            LimitPeriod::Daily => (date, next_day(date)?),
            LimitPeriod::Weekly => {
                let monday = date - Duration::days(date.weekday().number_days_from_monday() as i64);
                (monday, monday + Duration::days(7))
            }
            LimitPeriod::Monthly => {
                let first = calendar_date(date.year(), date.month(), 1)?;
                let next = if date.month() == Month::December {
                    calendar_date(date.year() + 1, Month::January, 1)?
                } else {
                    calendar_date(date.year(), date.month().next(), 1)?
                };
                (first, next)
            }
            LimitPeriod::Yearly => (
                calendar_date(date.year(), Month::January, 1)?,
                calendar_date(date.year() + 1, Month::January, 1)?,
            ),
        };

        Ok(Self {
            period,
            start: start.midnight().assume_utc(),
            end: end.midnight().assume_utc(),
        })
    }

    pub fn contains(&self, at: OffsetDateTime) -> bool {
        at >= self.start && at < self.end
    }
}

fn next_day(date: Date) -> BillingResult<Date> {
    date.next_day()
        .ok_or_else(|| BillingError::Internal(format!("No day after {}", date)))
}

fn calendar_date(year: i32, month: Month, day: u8) -> BillingResult<Date> {
    Date::from_calendar_date(year, month, day)
        .map_err(|e| BillingError::Internal(format!("Invalid calendar date: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_monthly_window() {
        let w = PeriodWindow::containing(LimitPeriod::Monthly, datetime!(2024-02-15 13:45 UTC))
            .unwrap();
        assert_eq!(w.start, datetime!(2024-02-01 00:00 UTC));
        assert_eq!(w.end, datetime!(2024-03-01 00:00 UTC));
    }

    #[test]
    fn test_december_rolls_into_next_year() {
        let w = PeriodWindow::containing(LimitPeriod::Monthly, datetime!(2023-12-31 23:59:59 UTC))
            .unwrap();
        assert_eq!(w.start, datetime!(2023-12-01 00:00 UTC));
        assert_eq!(w.end, datetime!(2024-01-01 00:00 UTC));
    }

    #[test]
    fn test_weekly_window_starts_monday() {
        // 2024-05-16 is a Thursday
        let w = PeriodWindow::containing(LimitPeriod::Weekly, datetime!(2024-05-16 08:00 UTC))
            .unwrap();
        assert_eq!(w.start, datetime!(2024-05-13 00:00 UTC));
        assert_eq!(w.end, datetime!(2024-05-20 00:00 UTC));

        // Sunday belongs to the week that started the previous Monday
        let sunday = PeriodWindow::containing(LimitPeriod::Weekly, datetime!(2024-05-19 23:00 UTC))
            .unwrap();
        assert_eq!(sunday.start, w.start);
    }

    #[test]
    fn test_boundary_lands_in_exactly_one_window() {
        let boundary = datetime!(2024-03-01 00:00 UTC);
        let before = PeriodWindow::containing(LimitPeriod::Monthly, boundary - Duration::nanoseconds(1))
            .unwrap();
        let at = PeriodWindow::containing(LimitPeriod::Monthly, boundary).unwrap();

        assert!(!before.contains(boundary));
        assert!(at.contains(boundary));
        assert_eq!(before.end, at.start);
    }

    #[test]
    fn test_non_utc_offsets_normalise_to_utc() {
        // 2024-01-01 01:00 +02:00 is still 2023-12-31 in UTC
        let w = PeriodWindow::containing(LimitPeriod::Daily, datetime!(2024-01-01 01:00 +2))
            .unwrap();
        assert_eq!(w.start, datetime!(2023-12-31 00:00 UTC));

        let y = PeriodWindow::containing(LimitPeriod::Yearly, datetime!(2024-01-01 01:00 +2))
            .unwrap();
        assert_eq!(y.start, datetime!(2023-01-01 00:00 UTC));
        assert_eq!(y.end, datetime!(2024-01-01 00:00 UTC));
    }
}
