//! Weekly trigger and the long-running scheduler loop.

use anyhow::{Result, anyhow};
use std::time::Duration as StdDuration;
use time::macros::format_description;
use time::{Duration, OffsetDateTime, Time, UtcOffset, Weekday};
use tracing::{info, warn};

const POLL_INTERVAL: StdDuration = StdDuration::from_secs(60);

/// Fires once a week at a wall-clock time in a fixed UTC offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeeklyTrigger {
    pub weekday: Weekday,
    pub time: Time,
    pub offset: UtcOffset,
}

impl WeeklyTrigger {
    pub fn parse(day: &str, time: &str, utc_offset: &str) -> Result<Self> {
        Ok(Self {
            weekday: parse_weekday(day)?,
            time: Time::parse(time.trim(), format_description!("[hour]:[minute]"))
                .map_err(|e| anyhow!("invalid schedule time {time:?}: {e}"))?,
            offset: parse_offset(utc_offset)?,
        })
    }

    /// First trigger instant strictly after `now`.
    pub fn next_run_after(&self, now: OffsetDateTime) -> OffsetDateTime {
        let local = now.to_offset(self.offset);
        let days_ahead = (i64::from(self.weekday.number_days_from_monday())
            - i64::from(local.weekday().number_days_from_monday()))
        .rem_euclid(7);
        let candidate = (local.date() + Duration::days(days_ahead))
            .with_time(self.time)
            .assume_offset(self.offset);
        if candidate > local {
            candidate
        } else {
            candidate + Duration::weeks(1)
        }
    }
}

fn parse_weekday(day: &str) -> Result<Weekday> {
    let weekday = match day.trim().to_ascii_lowercase().as_str() {
        "monday" | "mon" => Weekday::Monday,
        "tuesday" | "tue" => Weekday::Tuesday,
        "wednesday" | "wed" => Weekday::Wednesday,
        "thursday" | "thu" => Weekday::Thursday,
        "friday" | "fri" => Weekday::Friday,
        "saturday" | "sat" => Weekday::Saturday,
        "sunday" | "sun" => Weekday::Sunday,
        _ => return Err(anyhow!("invalid schedule day: {day}")),
    };
    Ok(weekday)
}

fn parse_offset(value: &str) -> Result<UtcOffset> {
    let trimmed = value.trim();
    if trimmed.eq_ignore_ascii_case("utc") || trimmed == "Z" {
        return Ok(UtcOffset::UTC);
    }
    UtcOffset::parse(
        trimmed,
        format_description!("[offset_hour sign:mandatory]:[offset_minute]"),
    )
    .map_err(|e| anyhow!("invalid UTC offset {value:?}: {e}"))
}

/// Bounded retry of a whole run with exponential backoff: the wait before
/// attempt `n + 1` is `delay * 2^(n - 1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunRetry {
    pub max_attempts: u32,
    pub delay: StdDuration,
}

impl RunRetry {
    pub fn backoff(&self, failed_attempt: u32) -> StdDuration {
        let factor = 2u32.saturating_pow(failed_attempt.saturating_sub(1));
        self.delay.saturating_mul(factor)
    }

    /// Calls `job` until it succeeds or `max_attempts` calls have failed,
    /// waiting through `sleep` between attempts. Returns the last error.
    pub fn run<T, J, S>(&self, mut job: J, mut sleep: S) -> Result<T>
    where
        J: FnMut() -> Result<T>,
        S: FnMut(StdDuration),
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match job() {
                Ok(value) => return Ok(value),
                Err(err) if attempt >= attempts => {
                    warn!(attempts, error = %err, "run failed on every attempt");
                    return Err(err);
                }
                Err(err) => {
                    let wait = self.backoff(attempt);
                    warn!(attempt, error = %err, retry_in = ?wait, "run failed, retrying");
                    sleep(wait);
                    attempt += 1;
                }
            }
        }
    }
}

/// Runs `job` at every trigger until the process is stopped.
///
/// A failing job is reported through `on_failure` and the loop keeps going.
pub fn run_forever<J, F>(trigger: WeeklyTrigger, mut job: J, mut on_failure: F) -> !
where
    J: FnMut() -> Result<()>,
    F: FnMut(&anyhow::Error),
{
    let mut next = trigger.next_run_after(OffsetDateTime::now_utc());
    info!(next_run = %next, "scheduler started");
    let mut last_heartbeat = OffsetDateTime::now_utc();

    loop {
        let now = OffsetDateTime::now_utc();
        if now >= next {
            info!("scheduled run starting");
            if let Err(err) = job() {
                warn!(error = %err, "scheduled run failed");
                on_failure(&err);
            }
            next = trigger.next_run_after(OffsetDateTime::now_utc());
            info!(next_run = %next, "next run scheduled");
            continue;
        }

        if now - last_heartbeat >= Duration::hours(1) {
            info!(next_run = %next, remaining = %(next - now), "scheduler heartbeat");
            last_heartbeat = now;
        }

        let until_next = (next - now).unsigned_abs();
        std::thread::sleep(until_next.min(POLL_INTERVAL));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::{datetime, offset, time};

    fn monday_nine() -> WeeklyTrigger {
        WeeklyTrigger::parse("Monday", "09:00", "-08:00").unwrap()
    }

    #[test]
    fn parses_day_time_and_offset() {
        let trigger = WeeklyTrigger::parse("fri", "07:30", "+05:30").unwrap();
        assert_eq!(trigger.weekday, Weekday::Friday);
        assert_eq!(trigger.time, time!(07:30));
        assert_eq!(trigger.offset, offset!(+5:30));
        assert_eq!(WeeklyTrigger::parse("sun", "18:00", "UTC").unwrap().offset, UtcOffset::UTC);
    }

    #[test]
    fn rejects_bad_schedule_values() {
        assert!(WeeklyTrigger::parse("someday", "09:00", "UTC").is_err());
        assert!(WeeklyTrigger::parse("monday", "25:00", "UTC").is_err());
        assert!(WeeklyTrigger::parse("monday", "09:00", "Pacific").is_err());
    }

    #[test]
    fn next_run_later_the_same_week() {
        // Wednesday 2025-07-16 10:00 local.
        let now = datetime!(2025-07-16 10:00 -8);
        let trigger = WeeklyTrigger::parse("friday", "09:00", "-08:00").unwrap();
        assert_eq!(trigger.next_run_after(now), datetime!(2025-07-18 09:00 -8));
    }

    #[test]
    fn next_run_rolls_over_when_time_has_passed() {
        // Monday 2025-07-14 09:00 local exactly: must be the following Monday.
        let now = datetime!(2025-07-14 17:00 UTC);
        assert_eq!(monday_nine().next_run_after(now), datetime!(2025-07-21 09:00 -8));
    }

    #[test]
    fn retry_backs_off_exponentially_until_success() {
        let retry = RunRetry {
            max_attempts: 3,
            delay: StdDuration::from_secs(120),
        };
        let mut calls = 0;
        let mut waits = Vec::new();
        let value = retry
            .run(
                || {
                    calls += 1;
                    if calls < 3 { Err(anyhow!("archive busy")) } else { Ok(calls) }
                },
                |wait| waits.push(wait),
            )
            .unwrap();
        assert_eq!(value, 3);
        assert_eq!(waits, vec![StdDuration::from_secs(120), StdDuration::from_secs(240)]);
    }

    #[test]
    fn retry_gives_up_after_max_attempts() {
        let retry = RunRetry {
            max_attempts: 2,
            delay: StdDuration::from_secs(1),
        };
        let mut calls = 0;
        let mut waits = 0;
        let err = retry
            .run::<(), _, _>(
                || {
                    calls += 1;
                    Err(anyhow!("attempt {calls}"))
                },
                |_| waits += 1,
            )
            .unwrap_err();
        assert_eq!(err.to_string(), "attempt 2");
        assert_eq!((calls, waits), (2, 1));
    }

    #[test]
    fn next_run_same_day_before_time() {
        let now = datetime!(2025-07-14 08:59 -8);
        assert_eq!(monday_nine().next_run_after(now), datetime!(2025-07-14 09:00 -8));
    }
}
