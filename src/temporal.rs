// ⏰ Temporal Model - Effective dates for rule sets
//
// A RuleSet is effective from the first day of its quarter (or an explicit
// activation date) until the day before its successor takes over.

use crate::rules::Period;
use chrono::{Duration, NaiveDate};

/// First calendar day of (year, period)
pub fn period_start(year: i32, period: Period) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(year, period.start_month(), 1)
}

/// Last calendar day of (year, period)
pub fn period_end(year: i32, period: Period) -> Option<NaiveDate> {
    let next_start = match period {
        Period::Q4 => NaiveDate::from_ymd_opt(year + 1, 1, 1)?,
        _ => NaiveDate::from_ymd_opt(year, period.start_month() + 3, 1)?,
    };
    next_start.pred_opt()
}

/// Effective-to for the set being replaced: one day before the successor starts
pub fn close_before(successor_from: NaiveDate) -> NaiveDate {
    successor_from - Duration::days(1)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn test_period_bounds() {
        assert_eq!(period_start(2025, Period::Q1), Some(d(2025, 1, 1)));
        assert_eq!(period_end(2025, Period::Q1), Some(d(2025, 3, 31)));
        assert_eq!(period_start(2025, Period::Q3), Some(d(2025, 7, 1)));
        assert_eq!(period_end(2025, Period::Q2), Some(d(2025, 6, 30)));
        assert_eq!(period_end(2025, Period::Q4), Some(d(2025, 12, 31)));
    }

    #[test]
    fn test_close_before_crosses_year_boundary() {
        assert_eq!(close_before(d(2025, 1, 1)), d(2024, 12, 31));
        assert_eq!(close_before(d(2025, 4, 1)), d(2025, 3, 31));
        assert_eq!(close_before(d(2024, 3, 1)), d(2024, 2, 29));
    }
}
