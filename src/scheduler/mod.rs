//! Persisted cron jobs that run the backup pipeline.
//!
//! Expressions use the five crontab fields (minute hour day month weekday) with
//! crontab weekday numbering, 0 or 7 for Sunday. They are evaluated in local time.

use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use cron::Schedule;

use crate::errors::{Result, VaultError};

mod runner;
mod store;

pub use runner::{BackupJobRunner, JobRunner, MISFIRE_GRACE, Scheduler};
pub use store::{JobStore, ScheduleEntry};

/// Parses a five-field crontab expression.
pub fn parse_cron(expr: &str) -> Result<Schedule> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(VaultError::Scheduler(format!(
            "cron expression must have 5 fields (minute hour day month weekday), got {:?}",
            expr
        )));
    }
    let weekday = translate_weekday(fields[4])?;
    let full = format!(
        "0 {} {} {} {} {weekday}",
        fields[0], fields[1], fields[2], fields[3]
    );
    Schedule::from_str(&full)
        .map_err(|e| VaultError::Scheduler(format!("invalid cron expression {expr:?}: {e}")))
}

/// crontab weekday numbers (0-7, Sunday = 0 or 7) to the cron crate's (1-7, Sunday = 1).
/// Names, `*` and `?` pass through.
fn translate_weekday(field: &str) -> Result<String> {
    let invalid = || VaultError::Scheduler(format!("invalid weekday field {field:?}"));
    let number = |s: &str| -> Result<Option<u32>> {
        if !s.chars().all(|c| c.is_ascii_digit()) {
            return Ok(None);
        }
        match s.parse::<u32>() {
            Ok(n) if n <= 7 => Ok(Some(n % 7 + 1)),
            _ => Err(invalid()),
        }
    };

    let mut parts = Vec::new();
    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => (range, Some(step)),
            None => (part, None),
        };
        let suffix = step.map(|s| format!("/{s}")).unwrap_or_default();

        let mapped = match range.split_once('-') {
            Some((start, end)) => match (number(start)?, number(end)?) {
                (Some(1), Some(1)) if start == "0" && end == "7" => format!("1-7{suffix}"),
                (Some(a), Some(b)) if a <= b => format!("{a}-{b}{suffix}"),
                // `n-7` ends on Sunday, which sorts first after translation.
                (Some(a), Some(1)) if end == "7" && step.is_none() => format!("{a}-7,1"),
                (Some(_), Some(_)) => return Err(invalid()),
                _ => part.to_string(),
            },
            None => match number(range)? {
                Some(n) => format!("{n}{suffix}"),
                None => part.to_string(),
            },
        };
        parts.push(mapped);
    }
    Ok(parts.join(","))
}

/// What a job's schedule asks for between the last check and now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Firing {
    Idle,
    /// Run once for `at`, the latest firing in the grace window. `coalesced`
    /// counts the firings in that window merged into this run.
    Due { at: DateTime<Utc>, coalesced: usize },
    /// Every firing since the last check is older than the grace window.
    Expired { first_missed: DateTime<Utc> },
}

/// Evaluates `schedule` over `(since, now]` in timezone `tz`.
pub fn firing<Tz: TimeZone>(
    schedule: &Schedule,
    since: DateTime<Utc>,
    now: DateTime<Utc>,
    grace: chrono::Duration,
    tz: &Tz,
) -> Firing {
    let window_start = since.max(now - grace);
    let in_window: Vec<DateTime<Utc>> = schedule
        .after(&window_start.with_timezone(tz))
        .map(|t| t.with_timezone(&Utc))
        .take_while(|t| *t <= now)
        .collect();
    if let Some(&at) = in_window.last() {
        return Firing::Due {
            at,
            coalesced: in_window.len(),
        };
    }

    if since < window_start {
        let first = schedule
            .after(&since.with_timezone(tz))
            .next()
            .map(|t| t.with_timezone(&Utc));
        if let Some(first_missed) = first.filter(|t| *t <= now) {
            return Firing::Expired { first_missed };
        }
    }
    Firing::Idle
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Duration, Timelike, Weekday};

    fn at(d: u32, h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, d, h, m, 0).unwrap()
    }

    #[test]
    fn weekday_numbers_follow_crontab() -> anyhow::Result<()> {
        assert_eq!(translate_weekday("1-5")?, "2-6");
        assert_eq!(translate_weekday("0")?, "1");
        assert_eq!(translate_weekday("7")?, "1");
        assert_eq!(translate_weekday("0-6")?, "1-7");
        assert_eq!(translate_weekday("0-7")?, "1-7");
        assert_eq!(translate_weekday("5-7")?, "6-7,1");
        assert_eq!(translate_weekday("1,3")?, "2,4");
        assert_eq!(translate_weekday("MON-FRI")?, "MON-FRI");
        assert_eq!(translate_weekday("*/2")?, "*/2");
        assert!(translate_weekday("8").is_err());
        Ok(())
    }

    #[test]
    fn monday_means_monday() -> anyhow::Result<()> {
        let schedule = parse_cron("0 9 * * 1")?;
        // 2024-01-07 is a Sunday.
        let next = schedule.after(&at(7, 0, 0)).next().unwrap();
        assert_eq!(next.weekday(), Weekday::Mon);
        assert_eq!((next.day(), next.hour(), next.minute()), (8, 9, 0));
        Ok(())
    }

    #[test]
    fn field_count_is_checked() {
        assert!(parse_cron("0 2 * *").is_err());
        assert!(parse_cron("0 0 2 * * *").is_err());
        assert!(parse_cron("61 2 * * *").is_err());
    }

    #[test]
    fn nothing_due_between_firings() -> anyhow::Result<()> {
        let schedule = parse_cron("*/5 * * * *")?;
        let f = firing(&schedule, at(1, 0, 0), at(1, 0, 3), Duration::hours(1), &Utc);
        assert_eq!(f, Firing::Idle);
        Ok(())
    }

    #[test]
    fn missed_firings_coalesce_into_one() -> anyhow::Result<()> {
        let schedule = parse_cron("*/5 * * * *")?;
        let f = firing(&schedule, at(1, 0, 0), at(1, 0, 30), Duration::hours(1), &Utc);
        assert_eq!(
            f,
            Firing::Due {
                at: at(1, 0, 30),
                coalesced: 6
            }
        );
        Ok(())
    }

    #[test]
    fn five_missed_nights_produce_one_run_inside_grace() -> anyhow::Result<()> {
        let schedule = parse_cron("0 2 * * *")?;
        let f = firing(&schedule, at(1, 0, 0), at(6, 2, 20), Duration::hours(1), &Utc);
        assert_eq!(
            f,
            Firing::Due {
                at: at(6, 2, 0),
                coalesced: 1
            }
        );
        Ok(())
    }

    #[test]
    fn firings_past_grace_are_dropped() -> anyhow::Result<()> {
        let schedule = parse_cron("0 2 * * *")?;
        let f = firing(&schedule, at(1, 0, 0), at(6, 5, 0), Duration::hours(1), &Utc);
        assert_eq!(
            f,
            Firing::Expired {
                first_missed: at(1, 2, 0)
            }
        );
        Ok(())
    }
}
