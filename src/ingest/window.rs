use chrono::{Months, NaiveDate};
use serde::{Deserialize, Serialize};

/// A closed day range, both ends inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl std::fmt::Display for DateWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

/// Reporting window length for scheduled and manual runs, in days.
const SWEEP_WINDOW_DAYS: i64 = 28;

/// The window a run triggered on `today` reports over: the 28 closed days
/// ending yesterday. Same trigger date, same window — re-runs overwrite the
/// same snapshot rows.
pub fn sweep_window(today: NaiveDate) -> DateWindow {
    let end = today.pred_opt().unwrap_or(today);
    let start = end - chrono::Duration::days(SWEEP_WINDOW_DAYS - 1);
    DateWindow { start, end }
}

/// Split the span covering the past `months` whole months into contiguous
/// closed month windows, the last ending at `today`.
pub fn backfill_windows(today: NaiveDate, months: u32) -> Vec<DateWindow> {
    let mut windows = Vec::with_capacity(months as usize);
    for i in (1..=months).rev() {
        let start = today
            .checked_sub_months(Months::new(i))
            .unwrap_or(today);
        let end = if i == 1 {
            today
        } else {
            today
                .checked_sub_months(Months::new(i - 1))
                .and_then(|d| d.pred_opt())
                .unwrap_or(today)
        };
        windows.push(DateWindow { start, end });
    }
    windows
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    #[test]
    fn test_sweep_window_is_deterministic_and_ends_yesterday() {
        let today = date("2026-08-06");
        let window = sweep_window(today);
        assert_eq!(window.end, date("2026-08-05"));
        assert_eq!(window.start, date("2026-07-09"));
        assert_eq!(window, sweep_window(today));
        assert_eq!((window.end - window.start).num_days(), SWEEP_WINDOW_DAYS - 1);
    }

    #[test]
    fn test_backfill_windows_contiguous_and_end_today() {
        let today = date("2026-08-06");
        let windows = backfill_windows(today, 3);

        assert_eq!(windows.len(), 3);
        assert_eq!(windows[0].start, date("2026-05-06"));
        assert_eq!(windows.last().unwrap().end, today);
        for pair in windows.windows(2) {
            assert_eq!(pair[0].end.succ_opt().unwrap(), pair[1].start);
        }
    }

    #[test]
    fn test_backfill_windows_across_year_boundary() {
        let today = date("2026-01-15");
        let windows = backfill_windows(today, 3);
        assert_eq!(windows[0].start, date("2025-10-15"));
        assert_eq!(windows[0].end, date("2025-11-14"));
        assert_eq!(windows[2].end, today);
    }

    #[test]
    fn test_backfill_handles_month_length_clamp() {
        // March 31 minus one month clamps to Feb 28.
        let today = date("2026-03-31");
        let windows = backfill_windows(today, 1);
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].start, date("2026-02-28"));
        assert_eq!(windows[0].end, today);
    }
}
