//! Cron helpers for the daily dispatch timer.

use std::str::FromStr;

use chrono::{DateTime, Local, Utc};

use crate::error::SchedulerError;

/// Six-field cron expression firing every day at `hour:minute`.
pub fn daily_expression(hour: u32, minute: u32) -> Result<String, SchedulerError> {
    if hour > 23 || minute > 59 {
        return Err(SchedulerError::InvalidTime { hour, minute });
    }
    Ok(format!("0 {minute} {hour} * * *"))
}

/// Next local-time occurrence of `hour:minute` strictly after `after`.
pub fn next_daily_fire(
    hour: u32,
    minute: u32,
    after: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, SchedulerError> {
    let expression = daily_expression(hour, minute)?;
    let schedule =
        cron::Schedule::from_str(&expression).map_err(|e| SchedulerError::InvalidSchedule {
            expression: expression.clone(),
            reason: e.to_string(),
        })?;
    Ok(schedule
        .after(&after.with_timezone(&Local))
        .next()
        .map(|fire| fire.with_timezone(&Utc)))
}
