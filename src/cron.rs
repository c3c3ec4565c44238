//! Cron expressions evaluated in an IANA timezone.
//!
//! Expressions use the six-field, seconds-resolution syntax understood by the
//! [`cron`] crate (`sec min hour day-of-month month day-of-week`).

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CronError {
    #[error("Invalid cron expression: {0}")]
    InvalidExpression(String),
    #[error("Invalid timezone: {0}")]
    InvalidTimezone(String),
    #[error("Cron schedule is not initialized: {0}")]
    NotInitialized(String),
}

/// A parsed cron expression bound to a timezone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronSchedule {
    pub expression: String,
    pub timezone: String,
    #[serde(skip)]
    schedule: Option<Schedule>,
    #[serde(skip)]
    tz: Option<Tz>,
}

impl CronSchedule {
    /// Parse an expression evaluated in UTC.
    pub fn new(expression: &str) -> Result<Self, CronError> {
        Self::with_timezone(expression, "UTC")
    }

    /// Parse an expression evaluated in `timezone`.
    pub fn with_timezone(expression: &str, timezone: &str) -> Result<Self, CronError> {
        let schedule = parse_expression(expression)?;
        let tz = parse_timezone(timezone)?;

        Ok(CronSchedule {
            expression: expression.to_string(),
            timezone: timezone.to_string(),
            schedule: Some(schedule),
            tz: Some(tz),
        })
    }

    /// The first trigger strictly after `after`, in UTC.
    pub fn next_execution(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let schedule = self.schedule.as_ref()?;
        let tz = self.tz.as_ref()?;

        let after_tz = after.with_timezone(tz);
        let next_tz = schedule.after(&after_tz).next()?;
        Some(next_tz.with_timezone(&Utc))
    }

    /// Up to `count` consecutive triggers after `after`. Fails on a schedule
    /// that was deserialized but not yet [reinitialized](Self::reinitialize).
    pub fn upcoming(
        &self,
        after: DateTime<Utc>,
        count: usize,
    ) -> Result<Vec<DateTime<Utc>>, CronError> {
        let (Some(schedule), Some(tz)) = (self.schedule.as_ref(), self.tz.as_ref()) else {
            return Err(CronError::NotInitialized(self.expression.clone()));
        };

        Ok(schedule
            .after(&after.with_timezone(tz))
            .take(count)
            .map(|next| next.with_timezone(&Utc))
            .collect())
    }

    pub fn tz(&self) -> Option<Tz> {
        self.tz
    }

    /// Check an expression without building a schedule.
    pub fn validate(expression: &str) -> Result<(), CronError> {
        parse_expression(expression).map(|_| ())
    }

    /// Rebuild the parsed schedule after deserialization.
    pub fn reinitialize(&mut self) -> Result<(), CronError> {
        self.schedule = Some(parse_expression(&self.expression)?);
        self.tz = Some(parse_timezone(&self.timezone)?);
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.schedule.is_some() && self.tz.is_some()
    }
}

impl FromStr for CronSchedule {
    type Err = CronError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl PartialEq for CronSchedule {
    fn eq(&self, other: &Self) -> bool {
        self.expression == other.expression && self.timezone == other.timezone
    }
}

fn parse_expression(expression: &str) -> Result<Schedule, CronError> {
    Schedule::from_str(expression)
        .map_err(|e| CronError::InvalidExpression(format!("{}: {}", expression, e)))
}

fn parse_timezone(timezone: &str) -> Result<Tz, CronError> {
    timezone
        .parse::<Tz>()
        .map_err(|_| CronError::InvalidTimezone(timezone.to_string()))
}
