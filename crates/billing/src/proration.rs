//! Proration estimates for mid-period upgrades
//!
//! Display-only: nothing here charges or refunds. Prices are integer cents and
//! the net amount is rounded once, to the nearest cent, half away from zero.

use serde::Serialize;
use time::OffsetDateTime;

const SECONDS_PER_DAY: i64 = 86_400;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ProrationEstimate {
    pub days_remaining: i64,
    /// Unused value of the current plan for the rest of the period.
    pub credit_cents: i64,
    /// Cost of the target plan for the rest of the period.
    pub charge_cents: i64,
    /// `credit - charge`. Positive is owed to the user, negative is an extra charge.
    pub proration_amount_cents: i64,
}

/// Whole days left in the period, rounded up, never negative.
pub fn days_remaining(period_end: OffsetDateTime, now: OffsetDateTime) -> i64 {
    let secs = (period_end - now).whole_seconds();
    if secs <= 0 {
        return 0;
    }
    (secs + SECONDS_PER_DAY - 1) / SECONDS_PER_DAY
}

/// `numerator / denominator` rounded half away from zero. `denominator > 0`.
fn div_round(numerator: i128, denominator: i128) -> i64 {
    let quotient = numerator / denominator;
    let remainder = numerator % denominator;
    let rounded = if remainder.abs() * 2 >= denominator {
        quotient + numerator.signum()
    } else {
        quotient
    };
    i64::try_from(rounded).unwrap_or(if rounded < 0 { i64::MIN } else { i64::MAX })
}

/// Estimate for moving from `current_price_cents` to `target_price_cents`
/// with the current period ending at `period_end`.
///
/// Zero when there is no period end (free plan), no time left, or the period
/// has no length. Daily rates are the monthly price over `billing_period_days`.
pub fn calculate_proration(
    current_price_cents: i64,
    target_price_cents: i64,
    period_start: OffsetDateTime,
    period_end: Option<OffsetDateTime>,
    now: OffsetDateTime,
    billing_period_days: i64,
) -> ProrationEstimate {
    let Some(period_end) = period_end else {
        return ProrationEstimate::default();
    };
    if period_end <= period_start || billing_period_days <= 0 {
        return ProrationEstimate::default();
    }

    let days = days_remaining(period_end, now);
    if days <= 0 {
        return ProrationEstimate::default();
    }

    let days = i128::from(days);
    let period = i128::from(billing_period_days);
    let current = i128::from(current_price_cents);
    let target = i128::from(target_price_cents);

    ProrationEstimate {
        days_remaining: days as i64,
        credit_cents: div_round(current * days, period),
        charge_cents: div_round(target * days, period),
        proration_amount_cents: div_round((current - target) * days, period),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;
    use time::Duration;

    #[test]
    fn test_pro_to_premium_half_period() {
        let now = datetime!(2026-03-16 00:00 UTC);
        let estimate = calculate_proration(
            499,
            999,
            now - Duration::days(15),
            Some(now + Duration::days(15)),
            now,
            30,
        );
        assert_eq!(estimate.days_remaining, 15);
        assert_eq!(estimate.credit_cents, 250);
        assert_eq!(estimate.charge_cents, 500);
        assert_eq!(estimate.proration_amount_cents, -250);
    }

    #[test]
    fn test_partial_day_rounds_up() {
        let now = datetime!(2026-03-16 00:00 UTC);
        assert_eq!(days_remaining(now + Duration::hours(1), now), 1);
        assert_eq!(days_remaining(now + Duration::days(2), now), 2);
        assert_eq!(days_remaining(now - Duration::hours(1), now), 0);
    }

    #[test]
    fn test_no_period_end_is_zero() {
        let now = OffsetDateTime::now_utc();
        assert_eq!(
            calculate_proration(0, 999, now, None, now, 30),
            ProrationEstimate::default()
        );
    }

    #[test]
    fn test_elapsed_period_is_zero() {
        let now = datetime!(2026-03-16 00:00 UTC);
        let estimate = calculate_proration(
            499,
            999,
            now - Duration::days(31),
            Some(now - Duration::days(1)),
            now,
            30,
        );
        assert_eq!(estimate.proration_amount_cents, 0);
    }

    #[test]
    fn test_zero_length_period_is_zero() {
        let now = datetime!(2026-03-16 00:00 UTC);
        let estimate = calculate_proration(499, 999, now + Duration::days(5), Some(now + Duration::days(5)), now, 30);
        assert_eq!(estimate, ProrationEstimate::default());
    }

    #[test]
    fn test_rounds_half_away_from_zero() {
        assert_eq!(div_round(5, 10), 1);
        assert_eq!(div_round(-5, 10), -1);
        assert_eq!(div_round(4, 10), 0);
        assert_eq!(div_round(-14, 10), -1);
        assert_eq!(div_round(-15, 10), -2);
    }
}
