//! Five-field cron expressions (`minute hour day month weekday`) evaluated at
//! minute granularity.
//!
//! Each field accepts `*`, a number, `a-b` with an optional `/step`, `*/step`
//! and comma separated lists of those. Weekday counts from Sunday = 0, so
//! Monday..Saturday are 1..6 and `7` never matches.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, TimeDelta, Timelike, Utc};
use thiserror::Error;

const FIELD_NAMES: [&str; 5] = ["minute", "hour", "day", "month", "weekday"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CronError {
    #[error("cron expression {expr:?} has {found} fields, expected 5")]
    FieldCount { expr: String, found: usize },
    #[error("invalid {field} field {raw:?}: {value:?} is not a number")]
    InvalidNumber {
        field: &'static str,
        raw: String,
        value: String,
    },
    #[error("invalid {field} field {raw:?}: step must be positive")]
    ZeroStep { field: &'static str, raw: String },
    #[error("invalid {field} field {raw:?}: range start exceeds end")]
    ReversedRange { field: &'static str, raw: String },
    #[error("invalid {field} field {raw:?}: step needs `*` or a range")]
    StepWithoutRange { field: &'static str, raw: String },
}

/// Parsed form of a single cron field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Field {
    Any,
    Literal(u32),
    /// Inclusive `start-end`, matching every `step`th value from `start`.
    Range { start: u32, end: u32, step: u32 },
    /// `*/n`: values divisible by `n`.
    Step(u32),
    List(Vec<Field>),
}

impl Field {
    fn parse(field: &'static str, raw: &str) -> Result<Self, CronError> {
        if raw.contains(',') {
            let items = raw
                .split(',')
                .map(|item| Self::parse_item(field, raw, item))
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(Field::List(items));
        }
        Self::parse_item(field, raw, raw)
    }

    fn parse_item(field: &'static str, raw: &str, item: &str) -> Result<Self, CronError> {
        let number = |value: &str| {
            value
                .parse::<u32>()
                .map_err(|_| CronError::InvalidNumber {
                    field,
                    raw: raw.to_string(),
                    value: value.to_string(),
                })
        };

        let (base, step) = match item.split_once('/') {
            Some((base, step)) => {
                let step = number(step)?;
                if step == 0 {
                    return Err(CronError::ZeroStep {
                        field,
                        raw: raw.to_string(),
                    });
                }
                (base, Some(step))
            }
            None => (item, None),
        };

        if base == "*" {
            return Ok(match step {
                Some(step) => Field::Step(step),
                None => Field::Any,
            });
        }

        if let Some((start, end)) = base.split_once('-') {
            let start = number(start)?;
            let end = number(end)?;
            if start > end {
                return Err(CronError::ReversedRange {
                    field,
                    raw: raw.to_string(),
                });
            }
            return Ok(Field::Range {
                start,
                end,
                step: step.unwrap_or(1),
            });
        }

        if step.is_some() {
            return Err(CronError::StepWithoutRange {
                field,
                raw: raw.to_string(),
            });
        }
        Ok(Field::Literal(number(base)?))
    }

    pub fn matches(&self, value: u32) -> bool {
        match self {
            Field::Any => true,
            Field::Literal(expected) => *expected == value,
            Field::Range { start, end, step } => {
                (*start..=*end).contains(&value) && (value - start) % step == 0
            }
            Field::Step(step) => value % step == 0,
            Field::List(items) => items.iter().any(|item| item.matches(value)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    source: String,
    fields: [Field; 5],
}

impl CronExpr {
    pub fn parse(expr: &str) -> Result<Self, CronError> {
        let parts: Vec<&str> = expr.split_whitespace().collect();
        let parts: [&str; 5] = parts
            .as_slice()
            .try_into()
            .map_err(|_| CronError::FieldCount {
                expr: expr.to_string(),
                found: parts.len(),
            })?;
        let [minute, hour, day, month, weekday] = parts;
        Ok(Self {
            source: expr.trim().to_string(),
            fields: [
                Field::parse(FIELD_NAMES[0], minute)?,
                Field::parse(FIELD_NAMES[1], hour)?,
                Field::parse(FIELD_NAMES[2], day)?,
                Field::parse(FIELD_NAMES[3], month)?,
                Field::parse(FIELD_NAMES[4], weekday)?,
            ],
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn fields(&self) -> &[Field; 5] {
        &self.fields
    }

    /// Seconds and sub-second parts of `at` are ignored.
    pub fn matches<T: Datelike + Timelike>(&self, at: &T) -> bool {
        let values = [
            at.minute(),
            at.hour(),
            at.day(),
            at.month(),
            at.weekday().num_days_from_sunday(),
        ];
        self.fields
            .iter()
            .zip(values)
            .all(|(field, value)| field.matches(value))
    }

    /// First matching minute in `[start, end]`, scanning minute by minute from
    /// `start` truncated to the minute. `end` defaults to now.
    pub fn next(
        &self,
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
    ) -> Option<DateTime<Utc>> {
        let end = end.unwrap_or_else(Utc::now);
        let mut current = truncate_to_minute(start);
        while current <= end {
            if self.matches(&current) {
                return Some(current);
            }
            current += TimeDelta::minutes(1);
        }
        None
    }

    pub fn occurs_between(&self, start: DateTime<Utc>, end: Option<DateTime<Utc>>) -> bool {
        self.next(start, end).is_some()
    }
}

impl FromStr for CronExpr {
    type Err = CronError;

    fn from_str(expr: &str) -> Result<Self, Self::Err> {
        Self::parse(expr)
    }
}

impl fmt::Display for CronExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

pub fn truncate_to_minute(at: DateTime<Utc>) -> DateTime<Utc> {
    at.with_second(0)
        .and_then(|dt| dt.with_nanosecond(0))
        .unwrap_or(at)
}

pub fn matches(expr: &str, at: DateTime<Utc>) -> Result<bool, CronError> {
    Ok(CronExpr::parse(expr)?.matches(&at))
}

pub fn next(
    expr: &str,
    start: DateTime<Utc>,
    end: Option<DateTime<Utc>>,
) -> Result<Option<DateTime<Utc>>, CronError> {
    Ok(CronExpr::parse(expr)?.next(start, end))
}

pub fn occurs_between(
    expr: &str,
    start: DateTime<Utc>,
    end: Option<DateTime<Utc>>,
) -> Result<bool, CronError> {
    Ok(CronExpr::parse(expr)?.occurs_between(start, end))
}
