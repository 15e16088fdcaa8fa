//! Schedule validation and fire-time computation.
//!
//! Cron expressions use the classic five fields
//! (`minute hour day-of-month month day-of-week`) and are evaluated by the
//! `cron` crate in UTC. That crate wants a leading seconds field and numbers
//! weekdays 1-7 from Sunday, so month and weekday fields are rewritten to
//! plain numbers first. Weekday `0` and `7` are both Sunday, and all fields
//! must match for a minute to fire.

use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{ForgeError, Result};

use super::model::ScheduleType;

/// How far ahead `next_after` searches before concluding the expression
/// never fires (e.g. `0 0 30 2 *`).
const CRON_LOOKAHEAD_DAYS: i64 = 366 * 5;

const MONTH_NAMES: [&str; 12] = [
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];
const WEEKDAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

// ═══════════════════════════════════════════════════════════════════════════════
// Cron
// ═══════════════════════════════════════════════════════════════════════════════

/// A parsed five-field cron expression.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expression: String,
    schedule: cron::Schedule,
}

impl CronSchedule {
    /// Parse an expression. Anything other than exactly five fields is rejected.
    pub fn parse(expression: &str) -> Result<Self> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(ForgeError::invalid_schedule(format!(
                "Cron expression '{}' must have exactly 5 fields \
                 (minute hour day month day_of_week), got {}",
                expression.trim(),
                fields.len()
            ))
            .with_context("cron_expression", expression));
        }

        let source = format!(
            "0 {} {} {} {} {}",
            check_steps(fields[0], "minute")?,
            check_steps(fields[1], "hour")?,
            check_steps(fields[2], "day")?,
            month_field(fields[3])?,
            weekday_field(fields[4])?,
        );
        let schedule = cron::Schedule::from_str(&source).map_err(|e| {
            ForgeError::invalid_schedule(format!("Invalid cron expression '{}': {}", expression.trim(), e))
                .with_context("cron_expression", expression)
        })?;

        Ok(Self {
            expression: fields.join(" "),
            schedule,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// First matching whole minute strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let limit = after + ChronoDuration::days(CRON_LOOKAHEAD_DAYS);
        self.schedule.after(&after).next().filter(|next| *next <= limit)
    }
}

impl PartialEq for CronSchedule {
    fn eq(&self, other: &Self) -> bool {
        self.expression == other.expression
    }
}

impl Eq for CronSchedule {}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}

fn invalid_field(name: &str, field: &str, detail: impl fmt::Display) -> ForgeError {
    ForgeError::invalid_schedule(format!("Invalid cron {} field '{}': {}", name, field, detail))
}

/// Split `a-b/s` into its range and a positive step.
fn split_step<'a>(part: &'a str, name: &str, field: &str) -> Result<(&'a str, Option<u32>)> {
    if part.is_empty() {
        return Err(invalid_field(name, field, "empty list element"));
    }
    match part.split_once('/') {
        Some((range, step)) => match step.parse::<u32>() {
            Ok(0) => Err(invalid_field(name, field, "step must be positive")),
            Ok(step) => Ok((range, Some(step))),
            Err(_) => Err(invalid_field(name, field, format!("bad step '{}'", step))),
        },
        None => Ok((part, None)),
    }
}

fn check_steps<'a>(field: &'a str, name: &str) -> Result<&'a str> {
    for part in field.split(',') {
        split_step(part, name, field)?;
    }
    Ok(field)
}

fn named_value(text: &str, names: &[&str], offset: u32) -> Option<u32> {
    if let Ok(v) = text.parse::<u32>() {
        return Some(v);
    }
    let upper = text.to_ascii_uppercase();
    names.iter().position(|n| *n == upper).map(|i| i as u32 + offset)
}

/// Month names become numbers; ranges and steps keep their shape.
fn month_field(field: &str) -> Result<String> {
    let mut parts = Vec::new();
    for part in field.split(',') {
        let (range, step) = split_step(part, "month", field)?;
        let value = |t: &str| {
            named_value(t, &MONTH_NAMES, 1).ok_or_else(|| invalid_field("month", field, format!("bad value '{}'", t)))
        };
        let mut out = match range.split_once('-') {
            _ if range == "*" => "*".to_string(),
            Some((a, b)) => format!("{}-{}", value(a)?, value(b)?),
            None => value(range)?.to_string(),
        };
        if let Some(step) = step {
            out.push_str(&format!("/{}", step));
        }
        parts.push(out);
    }
    Ok(parts.join(","))
}

/// Expand the weekday field (0-7, Sunday twice) into the `cron` crate's 1-7
/// numbering as an explicit list.
fn weekday_field(field: &str) -> Result<String> {
    let mut days = BTreeSet::new();
    for part in field.split(',') {
        let (range, step) = split_step(part, "day_of_week", field)?;
        let value = |t: &str| {
            named_value(t, &WEEKDAY_NAMES, 0)
                .filter(|v| *v <= 7)
                .ok_or_else(|| invalid_field("day_of_week", field, format!("bad value '{}'", t)))
        };
        let (start, end) = match range.split_once('-') {
            _ if range == "*" => (0, 6),
            Some((a, b)) => (value(a)?, value(b)?),
            // `n/s` runs from n to the end of the week
            None => {
                let v = value(range)?;
                (v, if step.is_some() { 7 } else { v })
            }
        };
        if start > end {
            return Err(invalid_field("day_of_week", field, format!("range {}-{} is reversed", start, end)));
        }
        for day in (start..=end).step_by(step.unwrap_or(1) as usize) {
            days.insert(day % 7 + 1);
        }
    }
    Ok(days.iter().map(u32::to_string).collect::<Vec<_>>().join(","))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Schedule Spec
// ═══════════════════════════════════════════════════════════════════════════════

/// A validated trigger configuration.
#[derive(Debug, Clone, PartialEq)]
pub enum ScheduleSpec {
    Manual,
    Once(DateTime<Utc>),
    Interval(Duration),
    Cron(CronSchedule),
}

impl ScheduleSpec {
    /// First fire time strictly after `now`, or `None` if the schedule will
    /// never fire again (manual, or a one-shot in the past).
    pub fn first_fire_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Manual => None,
            Self::Once(at) => (*at > now).then_some(*at),
            Self::Interval(every) => Some(now + to_chrono(*every)),
            Self::Cron(cron) => cron.next_after(now),
        }
    }

    /// Fire time following one that just happened at `fired_at`. Interval
    /// schedules skip forward past `now` rather than firing to catch up.
    pub fn next_fire_after(&self, fired_at: DateTime<Utc>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Manual | Self::Once(_) => None,
            Self::Interval(every) => {
                let step = to_chrono(*every);
                let mut next = fired_at + step;
                if next <= now {
                    let behind = (now - fired_at).num_milliseconds();
                    let step_ms = step.num_milliseconds().max(1);
                    next = fired_at + ChronoDuration::milliseconds((behind / step_ms + 1) * step_ms);
                }
                Some(next)
            }
            Self::Cron(cron) => cron.next_after(now.max(fired_at)),
        }
    }

    pub fn is_recurring(&self) -> bool {
        matches!(self, Self::Interval(_) | Self::Cron(_))
    }
}

fn to_chrono(d: Duration) -> ChronoDuration {
    ChronoDuration::from_std(d).unwrap_or_else(|_| ChronoDuration::days(365 * 100))
}

/// Check that `config` carries what `schedule_type` needs and build the
/// trigger from it. Runs before any job is registered with the trigger engine.
pub fn validate_schedule_config(schedule_type: ScheduleType, config: &Value) -> Result<ScheduleSpec> {
    match schedule_type {
        ScheduleType::Manual => Ok(ScheduleSpec::Manual),
        ScheduleType::Once => {
            let raw = config
                .get("run_date")
                .and_then(Value::as_str)
                .ok_or_else(|| ForgeError::invalid_schedule("schedule_config.run_date is required for 'once' jobs"))?;
            parse_run_date(raw).map(ScheduleSpec::Once)
        }
        ScheduleType::Interval => {
            let seconds = config
                .get("interval_seconds")
                .and_then(|v| v.as_u64().or_else(|| v.as_f64().filter(|f| *f >= 1.0).map(|f| f as u64)))
                .ok_or_else(|| {
                    ForgeError::invalid_schedule(
                        "schedule_config.interval_seconds (positive integer) is required for 'interval' jobs",
                    )
                })?;
            if seconds == 0 {
                return Err(ForgeError::invalid_schedule("interval_seconds must be greater than zero"));
            }
            Ok(ScheduleSpec::Interval(Duration::from_secs(seconds)))
        }
        ScheduleType::Cron => {
            let expression = config
                .get("cron_expression")
                .and_then(Value::as_str)
                .ok_or_else(|| ForgeError::invalid_schedule("schedule_config.cron_expression is required for 'cron' jobs"))?;
            CronSchedule::parse(expression).map(ScheduleSpec::Cron)
        }
    }
}

/// RFC 3339, or a naive timestamp taken as UTC.
fn parse_run_date(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }
    Err(ForgeError::invalid_schedule(format!("run_date '{}' is not a valid timestamp", raw)))
}
