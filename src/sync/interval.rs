//! # Resync Interval
//!
//! Computes how long to wait before reconciling an external service again.
//! Services that changed are resynced soon; quiet services back off
//! exponentially up to [`MAX_SYNC_INTERVAL_SECONDS`].

use chrono::{DateTime, Duration, Utc};

use crate::sync::diff::Diff;

/// Upper bound on the backoff interval (8 hours).
pub const MAX_SYNC_INTERVAL_SECONDS: i64 = 8 * 60 * 60;

/// Next resync delay for a batch pass that produced `diff`.
pub fn calc_sync_interval(
    now: DateTime<Utc>,
    last_sync: Option<DateTime<Utc>>,
    min_interval: Duration,
    diff: &Diff,
) -> Duration {
    let Some(last_sync) = last_sync else {
        return min_interval;
    };
    if diff.has_changes() {
        return min_interval;
    }
    backoff(now, last_sync, min_interval)
}

/// Next resync delay for a streaming pass.
///
/// A pass that changed something resyncs soon only if it also finished
/// without errors; an errored pass backs off like a quiet one.
pub fn calc_streaming_sync_interval(
    now: DateTime<Utc>,
    last_sync: Option<DateTime<Utc>>,
    min_interval: Duration,
    modified: bool,
    errored: bool,
) -> Duration {
    let Some(last_sync) = last_sync else {
        return min_interval;
    };
    if modified && !errored {
        return min_interval;
    }
    backoff(now, last_sync, min_interval)
}

fn backoff(now: DateTime<Utc>, last_sync: DateTime<Utc>, min_interval: Duration) -> Duration {
    let interval = (now - last_sync) * 2;
    if interval < min_interval {
        return min_interval;
    }
    let max = Duration::seconds(MAX_SYNC_INTERVAL_SECONDS);
    if interval > max {
        return max;
    }
    interval
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Repo;

    fn changed() -> Diff {
        Diff {
            added: vec![Repo::default()],
            ..Default::default()
        }
    }

    #[test]
    fn never_synced_uses_min_interval() {
        let now = Utc::now();
        assert_eq!(
            calc_sync_interval(now, None, Duration::minutes(1), &changed()),
            Duration::minutes(1)
        );
        assert_eq!(
            calc_sync_interval(now, None, Duration::minutes(1), &Diff::default()),
            Duration::minutes(1)
        );
    }

    #[test]
    fn change_resets_to_min_interval() {
        let now = Utc::now();
        let last = now - Duration::hours(3);
        assert_eq!(
            calc_sync_interval(now, Some(last), Duration::minutes(1), &changed()),
            Duration::minutes(1)
        );
    }

    #[test]
    fn quiet_service_backs_off_within_bounds() {
        let now = Utc::now();
        let min = Duration::minutes(1);

        assert_eq!(
            calc_sync_interval(now, Some(now - Duration::hours(16)), min, &Diff::default()),
            Duration::hours(8)
        );
        assert_eq!(
            calc_sync_interval(now, Some(now - Duration::seconds(30)), min, &Diff::default()),
            min
        );
        assert_eq!(
            calc_sync_interval(now, Some(now - Duration::minutes(20)), min, &Diff::default()),
            Duration::minutes(40)
        );
    }

    #[test]
    fn unchanged_diff_with_unmodified_repos_still_backs_off() {
        let now = Utc::now();
        let diff = Diff {
            unmodified: vec![Repo::default()],
            ..Default::default()
        };
        assert_eq!(
            calc_sync_interval(now, Some(now - Duration::hours(1)), Duration::minutes(1), &diff),
            Duration::hours(2)
        );
    }

    #[test]
    fn streaming_errors_back_off_even_when_modified() {
        let now = Utc::now();
        let last = Some(now - Duration::hours(1));
        let min = Duration::minutes(1);

        assert_eq!(calc_streaming_sync_interval(now, last, min, true, false), min);
        assert_eq!(
            calc_streaming_sync_interval(now, last, min, true, true),
            Duration::hours(2)
        );
        assert_eq!(
            calc_streaming_sync_interval(now, last, min, false, false),
            Duration::hours(2)
        );
        assert_eq!(calc_streaming_sync_interval(now, None, min, false, true), min);
    }
}
