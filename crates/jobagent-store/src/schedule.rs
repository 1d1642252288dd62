use chrono::{DateTime, Datelike, Duration, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// When a job becomes due again after a run.
///
/// Stored as JSON in `job.schedule`. A job without a schedule runs only when
/// someone sets its `next_run`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Schedule {
    /// Run exactly once at the given UTC instant.
    Once { at: DateTime<Utc> },

    /// Run repeatedly with a fixed interval in seconds.
    Interval { every_secs: u64 },

    /// Run every day at the given hour and minute (UTC).
    Daily { hour: u8, minute: u8 },

    /// Run on a specific weekday (0 = Monday … 6 = Sunday) at the given time (UTC).
    Weekly { day: u8, hour: u8, minute: u8 },
}

/// Next UTC run time for `schedule` strictly after `from`.
///
/// `None` means the schedule is exhausted or holds an impossible time of day.
pub fn compute_next_run(schedule: &Schedule, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match schedule {
        Schedule::Once { at } => (*at > from).then_some(*at),

        Schedule::Interval { every_secs } => {
            let secs = i64::try_from(*every_secs).ok()?.max(1);
            Some(from + Duration::seconds(secs))
        }

        Schedule::Daily { hour, minute } => {
            let candidate = at_time_of_day(from, *hour, *minute)?;
            if candidate > from {
                Some(candidate)
            } else {
                Some(candidate + Duration::days(1))
            }
        }

        Schedule::Weekly { day, hour, minute } => {
            let today = i64::from(from.weekday().num_days_from_monday());
            let target = i64::from((*day).min(6));
            let candidate =
                at_time_of_day(from, *hour, *minute)? + Duration::days((target - today).rem_euclid(7));
            if candidate > from {
                Some(candidate)
            } else {
                Some(candidate + Duration::days(7))
            }
        }
    }
}

fn at_time_of_day(day: DateTime<Utc>, hour: u8, minute: u8) -> Option<DateTime<Utc>> {
    let time = NaiveTime::from_hms_opt(u32::from(hour), u32::from(minute), 0)?;
    Some(Utc.from_utc_datetime(&day.date_naive().and_time(time)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn once_fires_only_in_the_future() {
        let at = utc("2024-03-01T12:00:00Z");
        let schedule = Schedule::Once { at };
        assert_eq!(compute_next_run(&schedule, utc("2024-03-01T11:00:00Z")), Some(at));
        assert_eq!(compute_next_run(&schedule, at), None);
    }

    #[test]
    fn interval_adds_seconds() {
        let from = utc("2024-03-01T12:00:00Z");
        let next = compute_next_run(&Schedule::Interval { every_secs: 90 }, from);
        assert_eq!(next, Some(utc("2024-03-01T12:01:30Z")));
    }

    #[test]
    fn daily_rolls_to_tomorrow_once_passed() {
        let schedule = Schedule::Daily { hour: 9, minute: 30 };
        assert_eq!(
            compute_next_run(&schedule, utc("2024-03-01T08:00:00Z")),
            Some(utc("2024-03-01T09:30:00Z"))
        );
        assert_eq!(
            compute_next_run(&schedule, utc("2024-03-01T09:30:00Z")),
            Some(utc("2024-03-02T09:30:00Z"))
        );
    }

    #[test]
    fn weekly_finds_the_next_matching_weekday() {
        // 2024-03-01 is a Friday.
        let monday = Schedule::Weekly { day: 0, hour: 6, minute: 0 };
        assert_eq!(
            compute_next_run(&monday, utc("2024-03-01T10:00:00Z")),
            Some(utc("2024-03-04T06:00:00Z"))
        );

        let friday_late = Schedule::Weekly { day: 4, hour: 22, minute: 0 };
        assert_eq!(
            compute_next_run(&friday_late, utc("2024-03-01T10:00:00Z")),
            Some(utc("2024-03-01T22:00:00Z"))
        );

        let friday_early = Schedule::Weekly { day: 4, hour: 6, minute: 0 };
        assert_eq!(
            compute_next_run(&friday_early, utc("2024-03-01T10:00:00Z")),
            Some(utc("2024-03-08T06:00:00Z"))
        );
    }

    #[test]
    fn invalid_time_of_day_yields_none() {
        let schedule = Schedule::Daily { hour: 25, minute: 0 };
        assert_eq!(compute_next_run(&schedule, Utc::now()), None);
    }

    #[test]
    fn schedule_json_is_tagged() {
        let json = serde_json::to_string(&Schedule::Interval { every_secs: 60 }).unwrap();
        assert_eq!(json, r#"{"kind":"interval","every_secs":60}"#);
    }
}
