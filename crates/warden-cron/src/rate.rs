//! Rate specs: the `*`, `*/N`, `A-B/N`, `A,B,C` mini-language of cron fields.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Datelike, Timelike, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{CronError, Result};

static STEP_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\*\s*/\s*([0-9]+)$").unwrap());
static RANGE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([0-9]+)\s*-\s*([0-9]+)(?:\s*/\s*([0-9]+))?$").unwrap());
static VALUE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9]+$").unwrap());

/// A time field of a schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Second,
    Minute,
    Hour,
    Day,
    Month,
    /// 0 = Sunday.
    DayOfWeek,
}

impl Field {
    pub fn name(self) -> &'static str {
        match self {
            Field::Second => "second",
            Field::Minute => "minute",
            Field::Hour => "hour",
            Field::Day => "day",
            Field::Month => "month",
            Field::DayOfWeek => "day-of-week",
        }
    }

    /// Smallest valid value.
    pub fn min(self) -> u32 {
        match self {
            Field::Day | Field::Month => 1,
            _ => 0,
        }
    }

    /// Largest valid value.
    pub fn max(self) -> u32 {
        match self {
            Field::Second | Field::Minute => 59,
            Field::Hour => 23,
            Field::Day => 31,
            Field::Month => 12,
            Field::DayOfWeek => 6,
        }
    }

    /// Upper bound for `*/N` generation and step sizes.
    pub fn span(self) -> u32 {
        match self {
            Field::Second | Field::Minute => 60,
            Field::Hour => 24,
            Field::Day => 31,
            Field::Month => 12,
            Field::DayOfWeek => 7,
        }
    }

    /// The value of this field at `t` (UTC).
    pub fn of(self, t: &DateTime<Utc>) -> u32 {
        match self {
            Field::Second => t.second(),
            Field::Minute => t.minute(),
            Field::Hour => t.hour(),
            Field::Day => t.day(),
            Field::Month => t.month(),
            Field::DayOfWeek => t.weekday().num_days_from_sunday(),
        }
    }

    fn contains(self, value: u32) -> bool {
        (self.min()..=self.max()).contains(&value)
    }
}

/// Raw input for a rate spec.
#[derive(Debug, Clone, PartialEq)]
pub enum RateInput {
    Any,
    Int(i64),
    /// Truncated toward zero.
    Float(f64),
    Text(String),
}

impl From<&str> for RateInput {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for RateInput {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<u32> for RateInput {
    fn from(value: u32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<i32> for RateInput {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<i64> for RateInput {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for RateInput {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl fmt::Display for RateInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateInput::Any => f.write_str("*"),
            RateInput::Int(v) => write!(f, "{v}"),
            RateInput::Float(v) => write!(f, "{v}"),
            RateInput::Text(s) => f.write_str(s),
        }
    }
}

/// The resolved values one field matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateSpec {
    Any,
    Single(u32),
    Set(BTreeSet<u32>),
}

enum Fragment {
    Any,
    Values(Vec<u32>),
}

impl RateSpec {
    /// Parse `input` for `field`, validating every value against its domain.
    pub fn parse(field: Field, input: impl Into<RateInput>) -> Result<Self> {
        let input = input.into();
        let invalid = |reason: String| CronError::InvalidSpec {
            field: field.name(),
            spec: input.to_string(),
            reason,
        };

        let value = match &input {
            RateInput::Any => return Ok(RateSpec::Any),
            RateInput::Int(v) => *v,
            RateInput::Float(v) if v.is_finite() => v.trunc() as i64,
            RateInput::Float(_) => return Err(invalid("not a finite number".into())),
            RateInput::Text(text) => return parse_text(field, text).map_err(invalid),
        };

        match u32::try_from(value) {
            Ok(v) if field.contains(v) => Ok(RateSpec::Single(v)),
            _ => Err(invalid(out_of_range(field, value))),
        }
    }

    pub fn matches(&self, value: u32) -> bool {
        match self {
            RateSpec::Any => true,
            RateSpec::Single(v) => *v == value,
            RateSpec::Set(values) => values.contains(&value),
        }
    }

    /// Every value in `field`'s domain this spec matches, ascending.
    pub fn values(&self, field: Field) -> Vec<u32> {
        match self {
            RateSpec::Any => (field.min()..=field.max()).collect(),
            RateSpec::Single(v) => vec![*v],
            RateSpec::Set(values) => values.iter().copied().collect(),
        }
    }

    fn from_values(values: BTreeSet<u32>) -> std::result::Result<Self, String> {
        match values.len() {
            0 => Err("matches no value".into()),
            1 => Ok(RateSpec::Single(values.into_iter().next().unwrap_or_default())),
            _ => Ok(RateSpec::Set(values)),
        }
    }
}

impl fmt::Display for RateSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateSpec::Any => f.write_str("*"),
            RateSpec::Single(v) => write!(f, "{v}"),
            RateSpec::Set(values) => {
                let parts: Vec<String> = values.iter().map(u32::to_string).collect();
                f.write_str(&parts.join(","))
            }
        }
    }
}

fn out_of_range(field: Field, value: impl fmt::Display) -> String {
    format!("{value} is outside {}-{}", field.min(), field.max())
}

fn parse_text(field: Field, text: &str) -> std::result::Result<RateSpec, String> {
    let mut values = BTreeSet::new();
    for fragment in text.split(',') {
        match parse_fragment(field, fragment.trim())? {
            Fragment::Any => return Ok(RateSpec::Any),
            Fragment::Values(v) => values.extend(v),
        }
    }
    RateSpec::from_values(values)
}

fn parse_fragment(field: Field, fragment: &str) -> std::result::Result<Fragment, String> {
    if fragment == "*" {
        return Ok(Fragment::Any);
    }

    if let Some(caps) = STEP_RE.captures(fragment) {
        let step = number(&caps[1])?;
        check_step(field, step)?;
        let values = (0..field.span())
            .step_by(step as usize)
            .filter(|v| *v >= field.min())
            .collect();
        return Ok(Fragment::Values(values));
    }

    if let Some(caps) = RANGE_RE.captures(fragment) {
        let low = number(&caps[1])?;
        let high = number(&caps[2])?;
        let step = caps.get(3).map(|m| number(m.as_str())).transpose()?.unwrap_or(1);
        if low > high {
            return Err(format!("range start {low} is after its end {high}"));
        }
        if !field.contains(low) {
            return Err(out_of_range(field, low));
        }
        if !field.contains(high) {
            return Err(out_of_range(field, high));
        }
        check_step(field, step)?;
        return Ok(Fragment::Values((low..=high).step_by(step as usize).collect()));
    }

    if VALUE_RE.is_match(fragment) {
        let value = number(fragment)?;
        if !field.contains(value) {
            return Err(out_of_range(field, value));
        }
        return Ok(Fragment::Values(vec![value]));
    }

    Err(format!("{fragment:?} is not a known rate"))
}

fn number(digits: &str) -> std::result::Result<u32, String> {
    digits
        .parse()
        .map_err(|_| format!("{digits} is not a valid number"))
}

fn check_step(field: Field, step: u32) -> std::result::Result<(), String> {
    if step == 0 {
        return Err("step must be at least 1".into());
    }
    if step > field.span() {
        return Err(format!("step {step} cannot be over {}", field.span()));
    }
    Ok(())
}
