//! Daily sweep daemon.
//!
//! Fires the scheduled sweep once per day at a fixed UTC wall-clock hour and
//! only logs the outcome; per-tenant errors never leave the run summary.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{error, info};

use super::orchestrator::Orchestrator;

/// Start the daily sweep loop.
pub async fn sweep_daemon(orchestrator: Arc<Orchestrator>, hour_utc: u32) {
    info!("Sweep daemon started (daily at {:02}:00 UTC)", hour_utc % 24);

    loop {
        let wait = duration_until_hour(Utc::now(), hour_utc);
        tokio::time::sleep(wait).await;

        if let Err(e) = orchestrator.run_scheduled_sweep().await {
            error!("Scheduled sweep error: {e}");
        }
    }
}

/// Time until the next occurrence of `hour_utc:00:00`. If `now` is exactly on
/// the mark, the next occurrence is tomorrow.
pub fn duration_until_hour(now: DateTime<Utc>, hour_utc: u32) -> Duration {
    let hour = hour_utc % 24;
    let today_run = match now.date_naive().and_hms_opt(hour, 0, 0) {
        Some(dt) => dt.and_utc(),
        // hour is always < 24 here; retry shortly if chrono disagrees
        None => return Duration::from_secs(60),
    };

    let next = if now < today_run {
        today_run
    } else {
        today_run + chrono::Duration::days(1)
    };

    (next - now).to_std().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[test]
    fn test_later_today() {
        let now = at("2026-08-06T04:30:00Z");
        assert_eq!(
            duration_until_hour(now, 6),
            Duration::from_secs(90 * 60)
        );
    }

    #[test]
    fn test_rolls_over_to_tomorrow() {
        let now = at("2026-08-06T06:00:01Z");
        assert_eq!(
            duration_until_hour(now, 6),
            Duration::from_secs(24 * 3600 - 1)
        );
    }

    #[test]
    fn test_exactly_on_the_hour_waits_a_full_day() {
        let now = at("2026-08-06T06:00:00Z");
        assert_eq!(duration_until_hour(now, 6), Duration::from_secs(24 * 3600));
    }

    #[test]
    fn test_out_of_range_hour_wraps() {
        let now = at("2026-08-06T01:00:00Z");
        assert_eq!(duration_until_hour(now, 26), Duration::from_secs(3600));
    }
}
