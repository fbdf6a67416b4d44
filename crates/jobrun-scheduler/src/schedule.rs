use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;

use crate::error::{Result, SchedulerError};

/// Parse a 5- or 6-field cron token into a [`cron::Schedule`].
///
/// Six fields mean the first is seconds. Five-field tokens get a literal
/// `0` seconds field prepended, so `*/5 * * * *` fires at second zero of
/// every fifth minute.
pub fn parse_schedule(token: &str) -> Result<Schedule> {
    let fields = token.split_whitespace().count();
    let normalized = match fields {
        5 => format!("0 {token}"),
        6 => token.to_string(),
        n => {
            return Err(SchedulerError::InvalidSchedule(format!(
                "'{token}' has {n} fields, expected 5 or 6"
            )))
        }
    };
    Schedule::from_str(&normalized)
        .map_err(|e| SchedulerError::InvalidSchedule(format!("'{token}': {e}")))
}

/// Next fire time strictly after `after`, or `None` for exhausted schedules.
pub fn next_fire(schedule: &Schedule, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule.after(&after).next()
}
