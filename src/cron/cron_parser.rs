// src/cron/cron_parser.rs
use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;

use crate::error::{PantryError, Result};

/// Cron expressions with a seconds field.
///
/// Format: "sec min hour day month weekday [year]".
/// Example: "0 */5 * * * *" = every 5 minutes.
/// Classic five-field expressions are accepted and fire at second 0.
pub struct CronParser;

impl CronParser {
    pub fn parse(cron_expr: &str) -> Result<Schedule> {
        let fields = cron_expr.split_whitespace().count();
        let normalized = match fields {
            5 => format!("0 {}", cron_expr.trim()),
            6 | 7 => cron_expr.trim().to_string(),
            _ => {
                return Err(PantryError::validation(format!(
                    "invalid cron expression {cron_expr:?}: expected 5, 6 or 7 fields, got {fields}"
                )))
            }
        };
        Ok(Schedule::from_str(&normalized)?)
    }

    /// First firing strictly after `from`.
    pub fn next_execution(cron_expr: &str, from: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let schedule = Self::parse(cron_expr)?;
        next_after(&schedule, from)
            .ok_or_else(|| PantryError::validation(format!("cron expression {cron_expr:?} never fires")))
    }
}

pub(crate) fn next_after(schedule: &Schedule, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule.after(&from).next()
}
