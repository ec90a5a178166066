//! A full schedule: one rate spec per time field.

use std::fmt;

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::rate::{Field, RateInput, RateSpec};

/// When a cron entry fires. Fields are matched against UTC wall-clock time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    pub second: RateSpec,
    pub minute: RateSpec,
    pub hour: RateSpec,
    pub day: RateSpec,
    pub month: RateSpec,
    pub dow: RateSpec,
}

impl Schedule {
    /// Second 0 of every minute.
    pub fn every_minute() -> Self {
        Self {
            second: RateSpec::Single(0),
            minute: RateSpec::Any,
            hour: RateSpec::Any,
            day: RateSpec::Any,
            month: RateSpec::Any,
            dow: RateSpec::Any,
        }
    }

    /// Parse the five classic cron fields. The second defaults to 0.
    pub fn new(
        minute: impl Into<RateInput>,
        hour: impl Into<RateInput>,
        day: impl Into<RateInput>,
        month: impl Into<RateInput>,
        dow: impl Into<RateInput>,
    ) -> Result<Self> {
        Ok(Self {
            second: RateSpec::Single(0),
            minute: RateSpec::parse(Field::Minute, minute)?,
            hour: RateSpec::parse(Field::Hour, hour)?,
            day: RateSpec::parse(Field::Day, day)?,
            month: RateSpec::parse(Field::Month, month)?,
            dow: RateSpec::parse(Field::DayOfWeek, dow)?,
        })
    }

    pub fn with_second(mut self, second: impl Into<RateInput>) -> Result<Self> {
        self.second = RateSpec::parse(Field::Second, second)?;
        Ok(self)
    }

    /// Whether the minute containing `t` is one this schedule fires in.
    pub fn matches_minute(&self, t: &DateTime<Utc>) -> bool {
        self.minute.matches(Field::Minute.of(t))
            && self.hour.matches(Field::Hour.of(t))
            && self.day.matches(Field::Day.of(t))
            && self.month.matches(Field::Month.of(t))
            && self.dow.matches(Field::DayOfWeek.of(t))
    }

    /// Seconds within a matching minute at which to run, ascending.
    ///
    /// Any second means a single run as soon as the minute is swept.
    pub fn run_seconds(&self) -> Vec<u32> {
        match &self.second {
            RateSpec::Any => vec![0],
            spec => spec.values(Field::Second),
        }
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} {} {}",
            self.second, self.minute, self.hour, self.day, self.month, self.dow
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_matches_minute() {
        let schedule = Schedule::new("*/15", "9-17", "*", "*", "1-5").unwrap();
        // Monday 2024-01-08.
        let monday = Utc.with_ymd_and_hms(2024, 1, 8, 10, 30, 45).unwrap();
        let sunday = Utc.with_ymd_and_hms(2024, 1, 7, 10, 30, 0).unwrap();
        let off_minute = Utc.with_ymd_and_hms(2024, 1, 8, 10, 31, 0).unwrap();
        assert!(schedule.matches_minute(&monday));
        assert!(!schedule.matches_minute(&sunday));
        assert!(!schedule.matches_minute(&off_minute));
    }

    #[test]
    fn test_invalid_field_reported() {
        let err = Schedule::new("*", "24", "*", "*", "*").unwrap_err();
        assert!(err.to_string().contains("hour"));
        assert!(Schedule::every_minute().with_second("61").is_err());
    }

    #[test]
    fn test_run_seconds() {
        assert_eq!(Schedule::every_minute().run_seconds(), vec![0]);
        let twice = Schedule::every_minute().with_second("40,10").unwrap();
        assert_eq!(twice.run_seconds(), vec![10, 40]);
        let any = Schedule::every_minute().with_second("*").unwrap();
        assert_eq!(any.run_seconds(), vec![0]);
    }

    #[test]
    fn test_display() {
        let schedule = Schedule::new("5-11/2", 3, "*", "*", "*").unwrap();
        assert_eq!(schedule.to_string(), "0 5,7,9,11 3 * * *");
    }
}
