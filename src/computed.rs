//! Computed column definitions.
//!
//! A computed column names one transform from a closed set and the input
//! columns it reads. Definitions are plain data so they can cross the message
//! channel; the engine evaluates them while filling.

use chrono::{Datelike, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::value::{format_number, LogicalType, Scalar};

const DAY_NAMES: [&str; 7] = [
    "Sunday",
    "Monday",
    "Tuesday",
    "Wednesday",
    "Thursday",
    "Friday",
    "Saturday",
];

const MONTH_NAMES: [&str; 12] = [
    "January",
    "February",
    "March",
    "April",
    "May",
    "June",
    "July",
    "August",
    "September",
    "October",
    "November",
    "December",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputedColumn {
    pub column: String,
    pub func: Transform,
    pub inputs: Vec<String>,
    #[serde(rename = "type")]
    pub ty: LogicalType,
}

impl ComputedColumn {
    pub fn validate(&self) -> Result<()> {
        if self.func.accepts(self.inputs.len()) {
            Ok(())
        } else {
            Err(Error::malformed(format!(
                "computed column '{}' has {} input(s), which '{}' does not accept",
                self.column,
                self.inputs.len(),
                self.func.name()
            )))
        }
    }

    /// Evaluates the transform and casts the result to the declared type.
    pub fn evaluate(&self, args: &[Scalar]) -> Scalar {
        conform(self.func.apply(args), self.ty)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transform {
    Add,
    Subtract,
    Multiply,
    Divide,
    PercentOf,
    Pow2,
    Sqrt,
    Abs,
    Invert,
    Uppercase,
    Lowercase,
    Length,
    ConcatSpace,
    ConcatComma,
    HourOfDay,
    DayOfWeek,
    MonthOfYear,
    Bucket { size: f64 },
    DayBucket,
    MonthBucket,
    YearBucket,
}

impl Transform {
    pub fn name(&self) -> &'static str {
        match self {
            Transform::Add => "add",
            Transform::Subtract => "subtract",
            Transform::Multiply => "multiply",
            Transform::Divide => "divide",
            Transform::PercentOf => "percent_of",
            Transform::Pow2 => "pow2",
            Transform::Sqrt => "sqrt",
            Transform::Abs => "abs",
            Transform::Invert => "invert",
            Transform::Uppercase => "uppercase",
            Transform::Lowercase => "lowercase",
            Transform::Length => "length",
            Transform::ConcatSpace => "concat_space",
            Transform::ConcatComma => "concat_comma",
            Transform::HourOfDay => "hour_of_day",
            Transform::DayOfWeek => "day_of_week",
            Transform::MonthOfYear => "month_of_year",
            Transform::Bucket { .. } => "bucket",
            Transform::DayBucket => "day_bucket",
            Transform::MonthBucket => "month_bucket",
            Transform::YearBucket => "year_bucket",
        }
    }

    /// Whether the transform takes `inputs` arguments.
    pub fn accepts(&self, inputs: usize) -> bool {
        match self {
            Transform::Add
            | Transform::Subtract
            | Transform::Multiply
            | Transform::Divide
            | Transform::PercentOf => inputs == 2,
            Transform::ConcatSpace | Transform::ConcatComma => inputs >= 1,
            _ => inputs == 1,
        }
    }

    /// Null or missing arguments give null.
    pub fn apply(&self, args: &[Scalar]) -> Scalar {
        if args.is_empty() || args.iter().any(Scalar::is_null) || !self.accepts(args.len()) {
            return Scalar::Null;
        }

        match self {
            Transform::Add => binary(args, |a, b| a + b),
            Transform::Subtract => binary(args, |a, b| a - b),
            Transform::Multiply => binary(args, |a, b| a * b),
            Transform::Divide => binary(args, |a, b| a / b),
            Transform::PercentOf => binary(args, |a, b| a / b * 100.0),
            Transform::Pow2 => unary(args, |a| a * a),
            Transform::Sqrt => unary(args, f64::sqrt),
            Transform::Abs => unary(args, f64::abs),
            Transform::Invert => unary(args, |a| 1.0 / a),
            Transform::Uppercase => Scalar::String(args[0].to_text().to_uppercase()),
            Transform::Lowercase => Scalar::String(args[0].to_text().to_lowercase()),
            Transform::Length => Scalar::Integer(args[0].to_text().chars().count() as i32),
            Transform::ConcatSpace => concat(args, " "),
            Transform::ConcatComma => concat(args, ", "),
            Transform::HourOfDay => datetime(&args[0], |dt| Scalar::Integer(dt.hour() as i32)),
            Transform::DayOfWeek => datetime(&args[0], |dt| {
                let ix = dt.weekday().num_days_from_sunday() as usize;
                Scalar::String(format!("{} {}", ix + 1, DAY_NAMES[ix]))
            }),
            Transform::MonthOfYear => datetime(&args[0], |dt| {
                let ix = dt.month0() as usize;
                Scalar::String(format!("{:02} {}", ix + 1, MONTH_NAMES[ix]))
            }),
            Transform::Bucket { size } => {
                let size = *size;
                unary(args, move |a| (a / size).floor() * size)
            }
            Transform::DayBucket => datetime(&args[0], |dt| {
                truncated(dt.year(), dt.month(), dt.day())
            }),
            Transform::MonthBucket => datetime(&args[0], |dt| truncated(dt.year(), dt.month(), 1)),
            Transform::YearBucket => datetime(&args[0], |dt| truncated(dt.year(), 1, 1)),
        }
    }
}

fn unary(args: &[Scalar], f: impl Fn(f64) -> f64) -> Scalar {
    match args[0].as_f64() {
        Some(a) => Scalar::Float(f(a)),
        None => Scalar::Null,
    }
}

fn binary(args: &[Scalar], f: impl Fn(f64, f64) -> f64) -> Scalar {
    match (args[0].as_f64(), args[1].as_f64()) {
        (Some(a), Some(b)) => Scalar::Float(f(a, b)),
        _ => Scalar::Null,
    }
}

fn concat(args: &[Scalar], sep: &str) -> Scalar {
    Scalar::String(
        args.iter()
            .map(Scalar::to_text)
            .collect::<Vec<_>>()
            .join(sep),
    )
}

fn datetime(arg: &Scalar, f: impl Fn(chrono::DateTime<Utc>) -> Scalar) -> Scalar {
    match arg {
        Scalar::Date(ms) => Utc
            .timestamp_millis_opt(*ms)
            .single()
            .map(f)
            .unwrap_or(Scalar::Null),
        _ => Scalar::Null,
    }
}

fn truncated(year: i32, month: u32, day: u32) -> Scalar {
    Utc.with_ymd_and_hms(year, month, day, 0, 0, 0)
        .single()
        .map(|dt| Scalar::Date(dt.timestamp_millis()))
        .unwrap_or(Scalar::Null)
}

/// Casts a transform result to a column type; values that cannot be
/// represented become null.
pub fn conform(value: Scalar, ty: LogicalType) -> Scalar {
    if value.is_null() || value.logical_type() == Some(ty) {
        return value;
    }
    match ty {
        LogicalType::Float => value.as_f64().map(Scalar::Float).unwrap_or(Scalar::Null),
        LogicalType::Integer => match value.as_f64() {
            Some(v) if v.is_finite() && v.trunc() >= i32::MIN as f64 && v.trunc() <= i32::MAX as f64 => {
                Scalar::Integer(v.trunc() as i32)
            }
            _ => Scalar::Null,
        },
        LogicalType::String => Scalar::String(match &value {
            Scalar::Float(v) => format_number(*v),
            other => other.to_text(),
        }),
        LogicalType::Date => match value {
            Scalar::Integer(v) => Scalar::Date(v as i64),
            Scalar::Float(v) if v.is_finite() => Scalar::Date(v as i64),
            _ => Scalar::Null,
        },
        LogicalType::Boolean => match value.as_f64() {
            Some(v) => Scalar::Boolean(v != 0.0 && !v.is_nan()),
            None => Scalar::Boolean(!value.to_text().is_empty()),
        },
    }
}
