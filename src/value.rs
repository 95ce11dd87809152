/// Logical types and cell values
///
/// `LogicalType` is the schema-level type of a column. `Scalar` is a typed cell
/// as stored by the engine, and `RawValue` is an untyped cell of application
/// input before normalization.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::dates;
use crate::error::Error;

/// Ordered mapping from column name to logical type.
pub type Schema = indexmap::IndexMap<String, LogicalType>;

/// Column data types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogicalType {
    Integer,
    Float,
    String,
    Boolean,
    Date,
}

impl LogicalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogicalType::Integer => "integer",
            LogicalType::Float => "float",
            LogicalType::String => "string",
            LogicalType::Boolean => "boolean",
            LogicalType::Date => "date",
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, LogicalType::Integer | LogicalType::Float)
    }
}

impl fmt::Display for LogicalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogicalType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "integer" => Ok(LogicalType::Integer),
            "float" => Ok(LogicalType::Float),
            "string" => Ok(LogicalType::String),
            "boolean" => Ok(LogicalType::Boolean),
            "date" | "datetime" => Ok(LogicalType::Date),
            _ => Err(Error::UnknownType {
                name: s.to_string(),
            }),
        }
    }
}

/// A typed cell. Dates are milliseconds since the Unix epoch (UTC).
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Null,
    Boolean(bool),
    Integer(i32),
    Float(f64),
    String(String),
    Date(i64),
}

impl Scalar {
    pub fn is_null(&self) -> bool {
        matches!(self, Scalar::Null)
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Scalar::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Scalar::Integer(v) => Some(*v as f64),
            Scalar::Float(v) => Some(*v),
            Scalar::Date(v) => Some(*v as f64),
            Scalar::Boolean(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Scalar::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Scalar::Boolean(v) => Some(*v),
            _ => None,
        }
    }

    /// The logical type this value carries, `None` for null.
    pub fn logical_type(&self) -> Option<LogicalType> {
        match self {
            Scalar::Null => None,
            Scalar::Boolean(_) => Some(LogicalType::Boolean),
            Scalar::Integer(_) => Some(LogicalType::Integer),
            Scalar::Float(_) => Some(LogicalType::Float),
            Scalar::String(_) => Some(LogicalType::String),
            Scalar::Date(_) => Some(LogicalType::Date),
        }
    }

    /// Hashable identity used for grouping and primary keys.
    pub fn key(&self) -> ScalarKey {
        match self {
            Scalar::Null => ScalarKey::Null,
            Scalar::Boolean(b) => ScalarKey::Boolean(*b),
            Scalar::Integer(v) => ScalarKey::Integer(*v as i64),
            Scalar::Float(v) => ScalarKey::Float(v.to_bits()),
            Scalar::String(s) => ScalarKey::String(s.clone()),
            Scalar::Date(v) => ScalarKey::Date(*v),
        }
    }

    /// Total order: nulls first, then by value; mixed types order by type.
    pub fn total_cmp(&self, other: &Scalar) -> Ordering {
        match (self, other) {
            (Scalar::Null, Scalar::Null) => Ordering::Equal,
            (Scalar::Null, _) => Ordering::Less,
            (_, Scalar::Null) => Ordering::Greater,
            (Scalar::Boolean(a), Scalar::Boolean(b)) => a.cmp(b),
            (Scalar::Integer(a), Scalar::Integer(b)) => a.cmp(b),
            (Scalar::Date(a), Scalar::Date(b)) => a.cmp(b),
            (Scalar::String(a), Scalar::String(b)) => a.cmp(b),
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => x.total_cmp(&y),
                _ => a.rank().cmp(&b.rank()),
            },
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Scalar::Null => 0,
            Scalar::Boolean(_) => 1,
            Scalar::Integer(_) => 2,
            Scalar::Float(_) => 3,
            Scalar::Date(_) => 4,
            Scalar::String(_) => 5,
        }
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            Scalar::Null => JsonValue::Null,
            Scalar::Boolean(b) => JsonValue::Bool(*b),
            Scalar::Integer(v) => JsonValue::Number((*v).into()),
            Scalar::Float(v) => serde_json::Number::from_f64(*v)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            Scalar::String(s) => JsonValue::String(s.clone()),
            Scalar::Date(ms) => JsonValue::Number((*ms).into()),
        }
    }

    /// Text used by CSV output and string coercion.
    pub fn to_text(&self) -> String {
        match self {
            Scalar::Null => String::new(),
            Scalar::Boolean(b) => b.to_string(),
            Scalar::Integer(v) => v.to_string(),
            Scalar::Float(v) => format_number(*v),
            Scalar::String(s) => s.clone(),
            Scalar::Date(ms) => dates::format_epoch_ms(*ms),
        }
    }
}

/// Formats a float without a trailing `.0` when it is integral.
pub fn format_number(v: f64) -> String {
    if v.is_finite() && v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        v.to_string()
    }
}

/// Hashable, equality-comparable projection of a `Scalar`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ScalarKey {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(u64),
    String(String),
    Date(i64),
}

/// An untyped input cell.
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    DateTime(DateTime<Utc>),
}

impl RawValue {
    pub fn is_null(&self) -> bool {
        matches!(self, RawValue::Null)
    }

    /// Nested arrays and objects keep their JSON text.
    pub fn from_json(value: JsonValue) -> Self {
        match value {
            JsonValue::Null => RawValue::Null,
            JsonValue::Bool(b) => RawValue::Bool(b),
            JsonValue::Number(n) => n.as_f64().map(RawValue::Number).unwrap_or(RawValue::Null),
            JsonValue::String(s) => RawValue::String(s),
            other => RawValue::String(other.to_string()),
        }
    }
}

impl From<&str> for RawValue {
    fn from(s: &str) -> Self {
        RawValue::String(s.to_string())
    }
}

impl From<f64> for RawValue {
    fn from(v: f64) -> Self {
        RawValue::Number(v)
    }
}

impl From<i32> for RawValue {
    fn from(v: i32) -> Self {
        RawValue::Number(v as f64)
    }
}

impl From<bool> for RawValue {
    fn from(v: bool) -> Self {
        RawValue::Bool(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logical_type_parse() {
        assert_eq!("integer".parse::<LogicalType>().unwrap(), LogicalType::Integer);
        assert_eq!("DateTime".parse::<LogicalType>().unwrap(), LogicalType::Date);
        assert!(matches!(
            "decimal".parse::<LogicalType>(),
            Err(Error::UnknownType { .. })
        ));
    }

    #[test]
    fn test_scalar_ordering_nulls_first() {
        let mut values = vec![
            Scalar::Integer(3),
            Scalar::Null,
            Scalar::Float(1.5),
            Scalar::Integer(-2),
        ];
        values.sort_by(|a, b| a.total_cmp(b));
        assert_eq!(
            values,
            vec![
                Scalar::Null,
                Scalar::Integer(-2),
                Scalar::Float(1.5),
                Scalar::Integer(3)
            ]
        );
    }

    #[test]
    fn test_scalar_json_and_text() {
        assert_eq!(Scalar::Float(2.0).to_text(), "2");
        assert_eq!(Scalar::Float(2.5).to_text(), "2.5");
        assert_eq!(Scalar::Date(0).to_json(), serde_json::json!(0));
        assert_eq!(Scalar::Float(f64::NAN).to_json(), JsonValue::Null);
    }

    #[test]
    fn test_raw_value_from_nested_json() {
        let raw = RawValue::from_json(serde_json::json!([1, 2]));
        assert_eq!(raw, RawValue::String("[1,2]".to_string()));
    }
}
