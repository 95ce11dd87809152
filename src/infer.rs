//! Type inference for raw input values and columns.

use indexmap::{IndexMap, IndexSet};

use crate::dates::parse_date_literal;
use crate::value::{LogicalType, RawValue};

/// Infers the logical type of a single value. `None` carries no signal.
pub fn infer_value(value: &RawValue) -> Option<LogicalType> {
    match value {
        RawValue::Null => None,
        RawValue::Number(n) => {
            if n.fract() == 0.0 && n.abs() < 10000.0 && *n != 0.0 {
                Some(LogicalType::Integer)
            } else {
                Some(LogicalType::Float)
            }
        }
        RawValue::Bool(_) => Some(LogicalType::Boolean),
        RawValue::DateTime(_) => Some(LogicalType::Date),
        RawValue::String(s) => Some(infer_text(s)),
    }
}

fn infer_text(s: &str) -> LogicalType {
    let trimmed = s.trim();
    if !trimmed.is_empty() {
        if let Ok(n) = trimmed.parse::<f64>() {
            if n.is_finite() {
                return LogicalType::Float;
            }
        }
    }
    if parse_date_literal(trimmed).is_some() {
        return LogicalType::Date;
    }
    if trimmed.eq_ignore_ascii_case("true") || trimmed.eq_ignore_ascii_case("false") {
        return LogicalType::Boolean;
    }
    LogicalType::String
}

/// Infers a column type from at most `sample` leading values; the first value
/// with a signal decides. Columns with no signal default to string.
pub fn infer_column<'a, I>(values: I, sample: usize) -> LogicalType
where
    I: IntoIterator<Item = Option<&'a RawValue>>,
{
    values
        .into_iter()
        .take(sample)
        .flatten()
        .find_map(infer_value)
        .unwrap_or(LogicalType::String)
}

/// Discovers column names for row-oriented input.
///
/// Starts from the first row's keys and widens with keys from later rows. The
/// scan window starts at `window` rows and doubles every time a wider row is
/// found, so this is a heuristic and may miss keys that only appear late.
pub fn discover_names(rows: &[IndexMap<String, RawValue>], window: usize) -> Vec<String> {
    let Some(first) = rows.first() else {
        return Vec::new();
    };

    let mut names: IndexSet<String> = first.keys().cloned().collect();
    let mut limit = window.max(1);
    let mut ix = 1;
    while ix < rows.len().min(limit) {
        let row = &rows[ix];
        if row.len() > names.len() || row.keys().any(|k| !names.contains(k)) {
            let before = names.len();
            names.extend(row.keys().cloned());
            if names.len() > before {
                if limit == window {
                    log::warn!("Row-oriented input has inconsistent rows; widening schema");
                }
                limit = limit.saturating_mul(2);
            }
        }
        ix += 1;
    }

    names.into_iter().collect()
}
