//! Cron schedules.
//!
//! Workflows use 5-field POSIX cron expressions evaluated in UTC
//! (`minute hour day-of-month month day-of-week`, `0` and `7` both Sunday).
//! The `cron` crate wants a leading seconds field and numbers weekdays
//! `1..=7` from Sunday, so expressions are translated before parsing.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors from parsing a cron expression.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    /// Wrong number of fields.
    #[error("expected 5 fields (minute hour day month weekday), found {0}")]
    FieldCount(usize),

    /// A day-of-week value could not be understood.
    #[error("invalid day-of-week '{0}'")]
    Weekday(String),

    /// The cron parser rejected the expression.
    #[error("{0}")]
    Syntax(String),
}

/// How often a schedule fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    /// Once a day at a fixed UTC time.
    Daily { hour: u32, minute: u32 },
    /// Anything else.
    Other,
}

impl fmt::Display for Cadence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Daily { hour, minute } => write!(f, "daily at {hour:02}:{minute:02} UTC"),
            Self::Other => write!(f, "custom schedule"),
        }
    }
}

/// A parsed cron schedule.
#[derive(Debug, Clone)]
pub struct ScheduleSpec {
    expression: String,
    seconds: String,
    fields: [String; 5],
    /// Day-of-week field as handed to the cron crate
    weekday: String,
    schedule: cron::Schedule,
}

impl PartialEq for ScheduleSpec {
    fn eq(&self, other: &Self) -> bool {
        self.expression == other.expression
    }
}

impl ScheduleSpec {
    /// Parse a cron expression.
    ///
    /// Accepts 5 fields, or 6 with a leading seconds field.
    pub fn parse(expression: &str) -> Result<Self, ScheduleError> {
        let parts: Vec<&str> = expression.split_whitespace().collect();

        let (seconds, rest) = match parts.len() {
            5 => ("0", &parts[..]),
            6 => (parts[0], &parts[1..]),
            n => return Err(ScheduleError::FieldCount(n)),
        };

        let fields: [String; 5] = [
            rest[0].to_string(),
            rest[1].to_string(),
            rest[2].to_string(),
            rest[3].to_string(),
            rest[4].to_string(),
        ];

        let weekday = translate_weekdays(&fields[4])?;
        let translated =
            format!("{} {} {} {} {} {}", seconds, fields[0], fields[1], fields[2], fields[3], weekday);

        let schedule = cron::Schedule::from_str(&translated)
            .map_err(|e| ScheduleError::Syntax(e.to_string()))?;

        Ok(Self {
            expression: expression.trim().to_string(),
            seconds: seconds.to_string(),
            fields,
            weekday,
            schedule,
        })
    }

    /// The expression as written in the workflow.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Classify the schedule.
    pub fn cadence(&self) -> Cadence {
        let [minute, hour, dom, month, _] = &self.fields;

        let fixed = |field: &str| -> Option<u32> {
            if field.chars().all(|c| c.is_ascii_digit()) {
                field.parse().ok()
            } else {
                None
            }
        };

        match (fixed(self.seconds.as_str()), fixed(minute.as_str()), fixed(hour.as_str())) {
            (Some(_), Some(minute), Some(hour))
                if dom.as_str() == "*"
                    && month.as_str() == "*"
                    && matches!(self.weekday.as_str(), "*" | "?")
                    && minute < 60
                    && hour < 24 =>
            {
                Cadence::Daily { hour, minute }
            }
            _ => Cadence::Other,
        }
    }

    /// First fire time strictly after `after`.
    pub fn next_after(&self, after: &DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(after).next()
    }

    /// The next `count` fire times strictly after `after`.
    pub fn upcoming(&self, after: &DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
        self.schedule.after(after).take(count).collect()
    }
}

impl FromStr for ScheduleSpec {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ScheduleSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.expression)
    }
}

const DAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// Rewrite a POSIX day-of-week field (`0..=7`, Sunday first) for the cron crate.
///
/// `*` is kept as-is so day-of-month restrictions still apply on their own.
fn translate_weekdays(field: &str) -> Result<String, ScheduleError> {
    if field == "*" || field == "?" {
        return Ok(field.to_string());
    }

    let days = expand_weekdays(field)?;
    if days.len() == 7 {
        return Ok("*".to_string());
    }

    Ok(days.iter().map(|d| (d + 1).to_string()).collect::<Vec<_>>().join(","))
}

/// Expand a day-of-week field into the set of days it selects (0 = Sunday).
fn expand_weekdays(field: &str) -> Result<BTreeSet<u32>, ScheduleError> {
    let invalid = || ScheduleError::Weekday(field.to_string());
    let mut days = BTreeSet::new();

    for item in field.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => (range, step.parse::<u32>().map_err(|_| invalid())?),
            None => (item, 1),
        };
        if step == 0 {
            return Err(invalid());
        }

        let (start, end) = if range == "*" {
            (0, 6)
        } else if let Some((a, b)) = range.split_once('-') {
            (weekday_value(a).ok_or_else(invalid)?, weekday_value(b).ok_or_else(invalid)?)
        } else {
            let start = weekday_value(range).ok_or_else(invalid)?;
            // `5/2` means "from 5 to the end of the week, every 2nd day".
            (start, if item.contains('/') { 7 } else { start })
        };

        if start > end {
            return Err(invalid());
        }

        days.extend((start..=end).step_by(step as usize).map(|d| d % 7));
    }

    Ok(days)
}

fn weekday_value(token: &str) -> Option<u32> {
    if let Ok(n) = token.parse::<u32>() {
        return (n <= 7).then_some(n);
    }
    let upper = token.to_ascii_uppercase();
    DAY_NAMES.iter().position(|name| upper.starts_with(name)).map(|i| i as u32)
}

#[cfg(test)]
mod tests {
    use chrono::{Datelike, TimeZone, Timelike, Weekday};

    use super::*;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn test_midnight_is_daily() {
        let spec = ScheduleSpec::parse("0 0 * * *").unwrap();
        assert_eq!(spec.cadence(), Cadence::Daily { hour: 0, minute: 0 });
        assert_eq!(spec.cadence().to_string(), "daily at 00:00 UTC");
    }

    #[test]
    fn test_fixed_hour_is_daily() {
        let spec = ScheduleSpec::parse("30 6 * * *").unwrap();
        assert_eq!(spec.cadence(), Cadence::Daily { hour: 6, minute: 30 });
    }

    #[test]
    fn test_every_weekday_spelled_out_is_daily() {
        for expr in ["0 0 * * 0-6", "0 0 * * 0-7", "0 0 * * SUN-SAT", "15 4 * * */1"] {
            let spec = ScheduleSpec::parse(expr).unwrap();
            assert!(matches!(spec.cadence(), Cadence::Daily { .. }), "{expr}");
        }
    }

    #[test]
    fn test_non_daily_cadences() {
        for expr in ["*/15 * * * *", "0 */6 * * *", "0 9 * * 1-5", "0 0 1 * *", "0 8,20 * * *"] {
            let spec = ScheduleSpec::parse(expr).unwrap();
            assert_eq!(spec.cadence(), Cadence::Other, "{expr}");
        }
    }

    #[test]
    fn test_daily_fires_once_per_day() {
        let spec = ScheduleSpec::parse("0 0 * * *").unwrap();
        let fires = spec.upcoming(&at(2024, 3, 9, 12, 0), 3);

        assert_eq!(fires, vec![at(2024, 3, 10, 0, 0), at(2024, 3, 11, 0, 0), at(2024, 3, 12, 0, 0)]);
    }

    #[test]
    fn test_next_after_is_strict() {
        let spec = ScheduleSpec::parse("0 0 * * *").unwrap();
        let midnight = at(2024, 3, 10, 0, 0);
        assert_eq!(spec.next_after(&midnight), Some(at(2024, 3, 11, 0, 0)));
    }

    #[test]
    fn test_weekday_numbering_matches_posix() {
        // 1-5 is Monday through Friday.
        let spec = ScheduleSpec::parse("0 9 * * 1-5").unwrap();
        let fires = spec.upcoming(&at(2024, 3, 8, 10, 0), 5); // Friday after 09:00
        let days: Vec<Weekday> = fires.iter().map(|t| t.weekday()).collect();
        assert_eq!(
            days,
            vec![Weekday::Mon, Weekday::Tue, Weekday::Wed, Weekday::Thu, Weekday::Fri]
        );
        assert!(fires.iter().all(|t| t.hour() == 9));
    }

    #[test]
    fn test_sunday_as_zero_and_seven() {
        let zero = ScheduleSpec::parse("0 12 * * 0").unwrap();
        let seven = ScheduleSpec::parse("0 12 * * 7").unwrap();
        let after = at(2024, 3, 6, 0, 0);

        assert_eq!(zero.next_after(&after).unwrap().weekday(), Weekday::Sun);
        assert_eq!(zero.next_after(&after), seven.next_after(&after));
    }

    #[test]
    fn test_expand_weekdays() {
        assert_eq!(expand_weekdays("1-5").unwrap(), (1..=5).collect());
        assert_eq!(expand_weekdays("*/2").unwrap(), [0, 2, 4, 6].into_iter().collect());
        assert_eq!(expand_weekdays("5-7").unwrap(), [0, 5, 6].into_iter().collect());
        assert_eq!(expand_weekdays("MON,wed").unwrap(), [1, 3].into_iter().collect());
        assert!(expand_weekdays("8").is_err());
        assert!(expand_weekdays("5-1").is_err());
        assert!(expand_weekdays("*/0").is_err());
    }

    #[test]
    fn test_six_field_expression() {
        let spec = ScheduleSpec::parse("30 0 0 * * *").unwrap();
        assert_eq!(spec.cadence(), Cadence::Daily { hour: 0, minute: 0 });
        let next = spec.next_after(&at(2024, 1, 1, 12, 0)).unwrap();
        assert_eq!(next.second(), 30);
    }

    #[test]
    fn test_invalid_expressions() {
        assert_eq!(ScheduleSpec::parse("0 0 * *").unwrap_err(), ScheduleError::FieldCount(4));
        assert!(matches!(ScheduleSpec::parse("61 0 * * *"), Err(ScheduleError::Syntax(_))));
        assert!(matches!(ScheduleSpec::parse("0 0 * * funday"), Err(ScheduleError::Weekday(_))));
    }
}
