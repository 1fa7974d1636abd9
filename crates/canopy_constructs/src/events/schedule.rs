//! Rule schedules: `rate(...)` and `cron(...)` expressions.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ConstructError, ConstructResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Minute,
    Hour,
    Day,
}

impl TimeUnit {
    fn label(&self, amount: u32) -> &'static str {
        match (self, amount == 1) {
            (TimeUnit::Minute, true) => "minute",
            (TimeUnit::Minute, false) => "minutes",
            (TimeUnit::Hour, true) => "hour",
            (TimeUnit::Hour, false) => "hours",
            (TimeUnit::Day, true) => "day",
            (TimeUnit::Day, false) => "days",
        }
    }
}

/// Fields of a cron expression. Unset fields default to `*`, except that
/// day-of-month and day-of-week cannot both be set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronOptions {
    pub minute: Option<String>,
    pub hour: Option<String>,
    pub day: Option<String>,
    pub month: Option<String>,
    pub week_day: Option<String>,
    pub year: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Schedule {
    Rate { amount: u32, unit: TimeUnit },
    Cron {
        minute: String,
        hour: String,
        day: String,
        month: String,
        week_day: String,
        year: String,
    },
}

fn check_cron_days(day: &str, week_day: &str) -> ConstructResult<()> {
    if (day == "?") == (week_day == "?") {
        return Err(ConstructError::Schedule(format!(
            "exactly one of day-of-month ('{}') and day-of-week ('{}') must be '?'",
            day, week_day
        )));
    }
    Ok(())
}

impl Schedule {
    pub fn rate(amount: u32, unit: TimeUnit) -> ConstructResult<Self> {
        if amount == 0 {
            return Err(ConstructError::Schedule(
                "rate must be at least 1".to_string(),
            ));
        }
        Ok(Schedule::Rate { amount, unit })
    }

    pub fn cron(options: CronOptions) -> ConstructResult<Self> {
        if options.day.is_some() && options.week_day.is_some() {
            return Err(ConstructError::Schedule(
                "cannot supply both 'day' and 'weekDay'; use at most one".to_string(),
            ));
        }
        let star = || "*".to_string();
        let day = options
            .day
            .unwrap_or_else(|| if options.week_day.is_some() { "?".to_string() } else { star() });
        let week_day = options.week_day.unwrap_or_else(|| "?".to_string());
        check_cron_days(&day, &week_day)?;
        Ok(Schedule::Cron {
            minute: options.minute.unwrap_or_else(star),
            hour: options.hour.unwrap_or_else(star),
            day,
            month: options.month.unwrap_or_else(star),
            week_day,
            year: options.year.unwrap_or_else(star),
        })
    }

    /// The expression as written into the rule.
    pub fn expression(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Schedule::Rate { amount, unit } => write!(f, "rate({} {})", amount, unit.label(*amount)),
            Schedule::Cron {
                minute,
                hour,
                day,
                month,
                week_day,
                year,
            } => write!(
                f,
                "cron({} {} {} {} {} {})",
                minute, hour, day, month, week_day, year
            ),
        }
    }
}

fn parse_rate(body: &str) -> ConstructResult<Schedule> {
    let mut parts = body.split_whitespace();
    let (Some(amount), Some(unit), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(ConstructError::Schedule(format!(
            "'rate({})' must be 'rate(<amount> <unit>)'",
            body
        )));
    };
    let amount: u32 = amount.parse().map_err(|_| {
        ConstructError::Schedule(format!("'{}' is not a whole number", amount))
    })?;
    let (time_unit, singular) = match unit {
        "minute" => (TimeUnit::Minute, true),
        "minutes" => (TimeUnit::Minute, false),
        "hour" => (TimeUnit::Hour, true),
        "hours" => (TimeUnit::Hour, false),
        "day" => (TimeUnit::Day, true),
        "days" => (TimeUnit::Day, false),
        other => {
            return Err(ConstructError::Schedule(format!(
                "unknown rate unit '{}'",
                other
            )))
        }
    };
    let schedule = Schedule::rate(amount, time_unit)?;
    if singular != (amount == 1) {
        return Err(ConstructError::Schedule(format!(
            "rate unit must be '{}' for an amount of {}",
            time_unit.label(amount),
            amount
        )));
    }
    Ok(schedule)
}

fn parse_cron(body: &str) -> ConstructResult<Schedule> {
    let fields: Vec<&str> = body.split_whitespace().collect();
    let [minute, hour, day, month, week_day, year] = fields.as_slice() else {
        return Err(ConstructError::Schedule(format!(
            "cron expression '{}' must have 6 fields, got {}",
            body,
            fields.len()
        )));
    };
    check_cron_days(day, week_day)?;
    Ok(Schedule::Cron {
        minute: minute.to_string(),
        hour: hour.to_string(),
        day: day.to_string(),
        month: month.to_string(),
        week_day: week_day.to_string(),
        year: year.to_string(),
    })
}

impl FromStr for Schedule {
    type Err = ConstructError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(body) = s.strip_prefix("rate(").and_then(|b| b.strip_suffix(')')) {
            return parse_rate(body);
        }
        if let Some(body) = s.strip_prefix("cron(").and_then(|b| b.strip_suffix(')')) {
            return parse_cron(body);
        }
        Err(ConstructError::Schedule(format!(
            "'{}' is neither a rate nor a cron expression",
            s
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_units_follow_the_amount() {
        assert_eq!(Schedule::rate(1, TimeUnit::Hour).unwrap().expression(), "rate(1 hour)");
        assert_eq!(Schedule::rate(5, TimeUnit::Minute).unwrap().expression(), "rate(5 minutes)");
        assert!("rate(1 minutes)".parse::<Schedule>().is_err());
        assert!("rate(2 day)".parse::<Schedule>().is_err());
        assert!("rate(2 days)".parse::<Schedule>().is_ok());
    }

    #[test]
    fn test_rate_zero_is_rejected() {
        let err = "rate(0 minutes)".parse::<Schedule>().unwrap_err();
        assert_eq!(err.exit_code(), 1);
        assert!(err.to_string().contains("at least 1"));
        assert!(Schedule::rate(0, TimeUnit::Day).is_err());
    }

    #[test]
    fn test_cron_day_fields() {
        assert!("cron(0 12 * * ? *)".parse::<Schedule>().is_ok());
        assert!("cron(0 12 ? * MON *)".parse::<Schedule>().is_ok());
        assert!("cron(0 12 * * MON *)".parse::<Schedule>().is_err());
        assert!("cron(0 12 ? * ? *)".parse::<Schedule>().is_err());
        assert!("cron(0 12 * *)".parse::<Schedule>().is_err());
    }

    #[test]
    fn test_cron_options_defaults() {
        let schedule = Schedule::cron(CronOptions {
            minute: Some("0".to_string()),
            hour: Some("4".to_string()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(schedule.expression(), "cron(0 4 * * ? *)");

        let weekly = Schedule::cron(CronOptions {
            week_day: Some("MON".to_string()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(weekly.expression(), "cron(* * ? * MON *)");

        assert!(Schedule::cron(CronOptions {
            day: Some("1".to_string()),
            week_day: Some("MON".to_string()),
            ..Default::default()
        })
        .is_err());
    }

    #[test]
    fn test_display_round_trips_through_parse() {
        let schedule: Schedule = "cron(15 10 ? * 6L 2030)".parse().unwrap();
        assert_eq!(schedule.to_string(), "cron(15 10 ? * 6L 2030)");
    }
}
