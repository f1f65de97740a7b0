//! Schedule evaluation: is a rule active at a given instant?
//!
//! `now` is expected in the rule owner's reference timezone; the weekday and
//! wall-clock time are read from it directly. Absolute comparisons
//! (`duration`, `custom`) convert to UTC first, so they are offset-free.
//! Every malformed or unknown schedule evaluates to `false`.

use chrono::{DateTime, Datelike, TimeDelta, TimeZone, Timelike, Utc, Weekday};
use tracing::debug;

use crate::guard::types::{Schedule, ScheduleMode, TimeWindow};

/// Evaluate a schedule at `now`.
///
/// `created_at` anchors `duration` schedules; without it they are inactive.
pub fn evaluate_time_window<Tz: TimeZone>(
    schedule: &Schedule,
    created_at: Option<DateTime<Utc>>,
    now: &DateTime<Tz>,
) -> bool {
    let instant = now.with_timezone(&Utc);
    match &schedule.mode {
        ScheduleMode::Always => true,
        ScheduleMode::Duration => match (created_at, schedule.duration_hours) {
            (Some(start), Some(hours)) => match hours_to_delta(hours) {
                Some(span) => start <= instant && instant < start + span,
                None => false,
            },
            _ => false,
        },
        ScheduleMode::TimeWindow => match &schedule.time_window {
            Some(window) => in_window(window, now),
            None => false,
        },
        ScheduleMode::Custom => match (schedule.start_time, schedule.end_time) {
            (Some(start), Some(end)) => start <= instant && instant < end,
            _ => false,
        },
        ScheduleMode::Other(mode) => {
            debug!(mode = %mode, "Unknown schedule mode, treating as inactive");
            false
        }
    }
}

/// Convert a fractional hour count to a positive duration.
pub(crate) fn hours_to_delta(hours: f64) -> Option<TimeDelta> {
    if !hours.is_finite() || hours <= 0.0 {
        return None;
    }
    TimeDelta::try_milliseconds((hours * 3_600_000.0).round() as i64)
}

fn in_window<Tz: TimeZone>(window: &TimeWindow, now: &DateTime<Tz>) -> bool {
    let (Some(start_hour), Some(end_hour)) = (window.start_hour, window.end_hour) else {
        return false;
    };
    let start_minute = window.start_minute.unwrap_or(0);
    let end_minute = window.end_minute.unwrap_or(0);
    if start_hour > 23 || end_hour > 23 || start_minute > 59 || end_minute > 59 {
        return false;
    }

    let start = start_hour * 60 + start_minute;
    let end = end_hour * 60 + end_minute;
    let current = now.hour() * 60 + now.minute();
    let today = now.weekday();

    // The day check applies to the day the window opened on.
    let opened_on = if start < end {
        (start <= current && current < end).then_some(today)
    } else if start > end {
        if current >= start {
            Some(today)
        } else if current < end {
            Some(today.pred())
        } else {
            None
        }
    } else {
        None
    };

    match opened_on {
        Some(day) => window
            .days
            .iter()
            .filter_map(|d| parse_day(d))
            .any(|d| d == day),
        None => false,
    }
}

/// Parse "mon", "Monday", "MON" and friends.
fn parse_day(name: &str) -> Option<Weekday> {
    let prefix: String = name.trim().chars().take(3).collect::<String>().to_lowercase();
    match prefix.as_str() {
        "mon" => Some(Weekday::Mon),
        "tue" => Some(Weekday::Tue),
        "wed" => Some(Weekday::Wed),
        "thu" => Some(Weekday::Thu),
        "fri" => Some(Weekday::Fri),
        "sat" => Some(Weekday::Sat),
        "sun" => Some(Weekday::Sun),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::FixedOffset;

    const ALL_DAYS: [&str; 7] = ["mon", "tue", "wed", "thu", "fri", "sat", "sun"];

    fn window(start: u32, end: u32, days: &[&str]) -> Schedule {
        Schedule {
            mode: ScheduleMode::TimeWindow,
            time_window: Some(TimeWindow {
                start_hour: Some(start),
                end_hour: Some(end),
                days: days.iter().map(|d| d.to_string()).collect(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// 2026-01-12 is a Monday.
    fn at(day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, day, hour, minute, 0).unwrap()
    }

    #[test]
    fn always_is_active() {
        let schedule = Schedule::default();
        assert!(evaluate_time_window(&schedule, None, &at(12, 3, 0)));
    }

    #[test]
    fn overnight_window_wraps_midnight() {
        let s = window(22, 7, &ALL_DAYS);
        assert!(evaluate_time_window(&s, None, &at(13, 23, 0)));
        assert!(evaluate_time_window(&s, None, &at(13, 3, 0)));
        assert!(!evaluate_time_window(&s, None, &at(13, 12, 0)));
        assert!(evaluate_time_window(&s, None, &at(13, 22, 0)));
        assert!(!evaluate_time_window(&s, None, &at(13, 7, 0)));
        assert!(evaluate_time_window(&s, None, &at(13, 6, 59)));
    }

    #[test]
    fn daytime_window_is_half_open() {
        let s = window(9, 17, &["mon", "tue", "wed", "thu", "fri"]);
        assert!(evaluate_time_window(&s, None, &at(12, 9, 0)));
        assert!(evaluate_time_window(&s, None, &at(12, 16, 59)));
        assert!(!evaluate_time_window(&s, None, &at(12, 17, 0)));
        assert!(!evaluate_time_window(&s, None, &at(12, 8, 59)));
    }

    #[test]
    fn weekday_filter_excludes_weekend() {
        let s = window(9, 17, &["mon", "tue", "wed", "thu", "fri"]);
        // 2026-01-17 is a Saturday.
        assert!(!evaluate_time_window(&s, None, &at(17, 10, 0)));
    }

    #[test]
    fn overnight_day_check_uses_start_day() {
        // Friday night only.
        let s = window(22, 7, &["fri"]);
        // Friday 23:00 -> opened Friday.
        assert!(evaluate_time_window(&s, None, &at(16, 23, 0)));
        // Saturday 03:00 -> still Friday's window.
        assert!(evaluate_time_window(&s, None, &at(17, 3, 0)));
        // Friday 03:00 -> that window opened Thursday.
        assert!(!evaluate_time_window(&s, None, &at(16, 3, 0)));
        // Saturday 23:00 -> Saturday's window, not listed.
        assert!(!evaluate_time_window(&s, None, &at(17, 23, 0)));
    }

    #[test]
    fn local_offset_drives_the_clock() {
        let s = window(22, 7, &ALL_DAYS);
        // 04:00 UTC is 23:00 the previous evening in UTC-5.
        let eastern = FixedOffset::west_opt(5 * 3600).unwrap();
        let local = at(13, 4, 0).with_timezone(&eastern);
        assert_eq!(local.hour(), 23);
        assert!(evaluate_time_window(&s, None, &local));
        // 17:00 UTC is 12:00 local.
        let noon = at(13, 17, 0).with_timezone(&eastern);
        assert!(!evaluate_time_window(&s, None, &noon));
    }

    #[test]
    fn minutes_refine_boundaries() {
        let mut s = window(22, 7, &ALL_DAYS);
        if let Some(w) = s.time_window.as_mut() {
            w.start_minute = Some(30);
            w.end_minute = Some(15);
        }
        assert!(!evaluate_time_window(&s, None, &at(13, 22, 15)));
        assert!(evaluate_time_window(&s, None, &at(13, 22, 30)));
        assert!(evaluate_time_window(&s, None, &at(14, 7, 14)));
        assert!(!evaluate_time_window(&s, None, &at(14, 7, 15)));
    }

    #[test]
    fn degenerate_windows_are_inactive() {
        assert!(!evaluate_time_window(&window(8, 8, &ALL_DAYS), None, &at(13, 8, 0)));
        assert!(!evaluate_time_window(&window(25, 7, &ALL_DAYS), None, &at(13, 3, 0)));
        assert!(!evaluate_time_window(&window(22, 7, &[]), None, &at(13, 23, 0)));

        let missing = Schedule {
            mode: ScheduleMode::TimeWindow,
            ..Default::default()
        };
        assert!(!evaluate_time_window(&missing, None, &at(13, 23, 0)));
    }

    #[test]
    fn day_names_are_lenient() {
        let s = window(9, 17, &["Monday", "TUE"]);
        assert!(evaluate_time_window(&s, None, &at(12, 10, 0)));
        assert!(evaluate_time_window(&s, None, &at(13, 10, 0)));
        assert!(!evaluate_time_window(&s, None, &at(14, 10, 0)));
    }

    #[test]
    fn duration_counts_from_creation() {
        let s = Schedule {
            mode: ScheduleMode::Duration,
            duration_hours: Some(2.0),
            ..Default::default()
        };
        let created = at(12, 10, 0);
        assert!(evaluate_time_window(&s, Some(created), &at(12, 10, 0)));
        assert!(evaluate_time_window(&s, Some(created), &at(12, 11, 59)));
        assert!(!evaluate_time_window(&s, Some(created), &at(12, 12, 0)));
        assert!(!evaluate_time_window(&s, Some(created), &at(12, 9, 59)));
        assert!(!evaluate_time_window(&s, None, &at(12, 10, 30)));
    }

    #[test]
    fn duration_rejects_non_positive_hours() {
        let s = Schedule {
            mode: ScheduleMode::Duration,
            duration_hours: Some(0.0),
            ..Default::default()
        };
        assert!(!evaluate_time_window(&s, Some(at(12, 10, 0)), &at(12, 10, 0)));
    }

    #[test]
    fn custom_range_is_half_open() {
        let s = Schedule {
            mode: ScheduleMode::Custom,
            start_time: Some(at(12, 9, 0)),
            end_time: Some(at(12, 17, 0)),
            ..Default::default()
        };
        assert!(evaluate_time_window(&s, None, &at(12, 9, 0)));
        assert!(!evaluate_time_window(&s, None, &at(12, 17, 0)));

        let open_ended = Schedule {
            end_time: None,
            ..s
        };
        assert!(!evaluate_time_window(&open_ended, None, &at(12, 10, 0)));
    }

    #[test]
    fn unknown_mode_is_inactive() {
        let s = Schedule {
            mode: ScheduleMode::Other("lunar".into()),
            ..Default::default()
        };
        assert!(!evaluate_time_window(&s, None, &at(12, 10, 0)));
    }
}
