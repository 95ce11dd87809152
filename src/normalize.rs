//! Input normalization
//!
//! Reconciles row-oriented, column-oriented, schema-only and Arrow inputs into
//! one canonical columnar form, inferring types when there is no schema yet
//! and coercing onto the schema when there is one.

use indexmap::IndexMap;
use serde_json::Value as JsonValue;

use crate::arrow_input;
use crate::dates::{self, format_epoch_ms, parse_date_literal};
use crate::error::{Error, Result};
use crate::infer::{discover_names, infer_column};
use crate::settings::Settings;
use crate::value::{format_number, LogicalType, RawValue, Scalar, Schema};

/// Application input, before normalization.
#[derive(Debug, Clone, PartialEq)]
pub enum TableData {
    Rows(Vec<IndexMap<String, RawValue>>),
    Columns(IndexMap<String, Vec<RawValue>>),
    Schema(IndexMap<String, String>),
    Binary(Vec<u8>),
}

impl TableData {
    /// Classifies a JSON document: an array of objects is row-oriented, an
    /// object of arrays column-oriented and an object of strings a schema.
    pub fn from_json(value: JsonValue) -> Result<TableData> {
        match value {
            JsonValue::Array(items) => {
                let mut rows = Vec::with_capacity(items.len());
                for item in items {
                    match item {
                        JsonValue::Object(map) => rows.push(
                            map.into_iter()
                                .map(|(k, v)| (k, RawValue::from_json(v)))
                                .collect(),
                        ),
                        other => {
                            return Err(Error::malformed(format!(
                                "row-oriented input must contain objects, found {}",
                                other
                            )))
                        }
                    }
                }
                Ok(TableData::Rows(rows))
            }
            JsonValue::Object(map) => {
                if map.values().all(JsonValue::is_array) {
                    let columns = map
                        .into_iter()
                        .map(|(k, v)| {
                            let values = match v {
                                JsonValue::Array(values) => {
                                    values.into_iter().map(RawValue::from_json).collect()
                                }
                                _ => Vec::new(),
                            };
                            (k, values)
                        })
                        .collect();
                    Ok(TableData::Columns(columns))
                } else if map.values().all(JsonValue::is_string) {
                    let schema = map
                        .into_iter()
                        .map(|(k, v)| (k, v.as_str().unwrap_or_default().to_string()))
                        .collect();
                    Ok(TableData::Schema(schema))
                } else {
                    Err(Error::malformed(
                        "object input must map every column to an array or to a type name",
                    ))
                }
            }
            other => Err(Error::malformed(format!(
                "cannot classify input of shape {}",
                json_kind(&other)
            ))),
        }
    }
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

/// Canonical columnar form. `None` cells are undefined and leave the stored
/// value untouched on update.
#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub row_count: usize,
    pub is_binary: bool,
    pub names: Vec<String>,
    pub types: Vec<LogicalType>,
    pub columns: Vec<Vec<Option<Scalar>>>,
}

impl Normalized {
    pub fn schema(&self) -> Schema {
        self.names
            .iter()
            .cloned()
            .zip(self.types.iter().copied())
            .collect()
    }

    pub fn column(&self, name: &str) -> Option<&[Option<Scalar>]> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|ix| self.columns[ix].as_slice())
    }

    /// Rows `[start, end)` as a standalone batch.
    pub fn page(&self, start: usize, end: usize) -> Normalized {
        let end = end.min(self.row_count);
        let start = start.min(end);
        Normalized {
            row_count: end - start,
            is_binary: self.is_binary,
            names: self.names.clone(),
            types: self.types.clone(),
            columns: self
                .columns
                .iter()
                .map(|c| c.get(start..end).map(<[_]>::to_vec).unwrap_or_default())
                .collect(),
        }
    }
}

/// Normalizes `data`, against `existing` when the table already has a schema.
pub fn normalize(data: TableData, existing: Option<&Schema>, settings: &Settings) -> Result<Normalized> {
    match data {
        TableData::Rows(rows) => normalize_rows(rows, existing, settings),
        TableData::Columns(columns) => normalize_columns(columns, existing),
        TableData::Schema(declared) => normalize_schema(declared),
        TableData::Binary(bytes) => {
            let decoded = arrow_input::decode(&bytes)?;
            match existing {
                Some(schema) => Ok(project_onto(decoded, schema)),
                None => Ok(decoded),
            }
        }
    }
}

fn normalize_rows(
    rows: Vec<IndexMap<String, RawValue>>,
    existing: Option<&Schema>,
    settings: &Settings,
) -> Result<Normalized> {
    let row_count = rows.len();

    let Some(schema) = existing else {
        if rows.is_empty() {
            return Err(Error::malformed("cannot infer a schema from zero rows"));
        }
        let names = discover_names(&rows, settings.schema_scan_window);
        let mut types = Vec::with_capacity(names.len());
        let mut columns = Vec::with_capacity(names.len());
        for name in &names {
            let values: Vec<Option<&RawValue>> = rows.iter().map(|r| r.get(name)).collect();
            let ty = infer_column(values.iter().copied(), settings.inference_sample);
            let (ty, column) = coerce_inferred(&values, ty);
            types.push(ty);
            columns.push(column);
        }
        return Ok(Normalized {
            row_count,
            is_binary: false,
            names,
            types,
            columns,
        });
    };

    let mut names = Vec::with_capacity(schema.len());
    let mut types = Vec::with_capacity(schema.len());
    let mut columns = Vec::with_capacity(schema.len());
    for (name, ty) in schema {
        let column = rows
            .iter()
            .map(|row| row.get(name).map(|raw| coerce(raw, *ty, name)))
            .collect();
        names.push(name.clone());
        types.push(*ty);
        columns.push(column);
    }

    Ok(Normalized {
        row_count,
        is_binary: false,
        names,
        types,
        columns,
    })
}

fn normalize_columns(
    input: IndexMap<String, Vec<RawValue>>,
    existing: Option<&Schema>,
) -> Result<Normalized> {
    let schema = existing.ok_or_else(|| {
        Error::malformed("column-oriented input requires a table with an existing schema")
    })?;

    for name in input.keys().filter(|n| !schema.contains_key(*n)) {
        log::debug!("Ignoring column '{}' which is not in the schema", name);
    }

    let row_count = input.values().map(Vec::len).max().unwrap_or(0);
    let mut names = Vec::with_capacity(schema.len());
    let mut types = Vec::with_capacity(schema.len());
    let mut columns = Vec::with_capacity(schema.len());
    for (name, ty) in schema {
        let column = match input.get(name) {
            Some(values) => (0..row_count)
                .map(|ix| values.get(ix).map(|raw| coerce(raw, *ty, name)))
                .collect(),
            None => vec![None; row_count],
        };
        names.push(name.clone());
        types.push(*ty);
        columns.push(column);
    }

    Ok(Normalized {
        row_count,
        is_binary: false,
        names,
        types,
        columns,
    })
}

fn normalize_schema(declared: IndexMap<String, String>) -> Result<Normalized> {
    let mut names = Vec::with_capacity(declared.len());
    let mut types = Vec::with_capacity(declared.len());
    for (name, type_name) in declared {
        types.push(type_name.parse::<LogicalType>()?);
        names.push(name);
    }
    let columns = vec![Vec::new(); names.len()];
    Ok(Normalized {
        row_count: 0,
        is_binary: false,
        names,
        types,
        columns,
    })
}

/// Casts decoded Arrow columns onto an existing schema. Columns the batch does
/// not carry stay undefined.
fn project_onto(decoded: Normalized, schema: &Schema) -> Normalized {
    let row_count = decoded.row_count;
    let mut by_name: IndexMap<String, (LogicalType, Vec<Option<Scalar>>)> = decoded
        .names
        .into_iter()
        .zip(decoded.types.into_iter().zip(decoded.columns))
        .collect();

    let mut names = Vec::with_capacity(schema.len());
    let mut types = Vec::with_capacity(schema.len());
    let mut columns = Vec::with_capacity(schema.len());
    for (name, ty) in schema {
        let column = match by_name.swap_remove(name) {
            Some((source, cells)) if source == *ty => cells,
            Some((_, cells)) => cells
                .into_iter()
                .map(|cell| cell.map(|s| coerce(&scalar_to_raw(s), *ty, name)))
                .collect(),
            None => vec![None; row_count],
        };
        names.push(name.clone());
        types.push(*ty);
        columns.push(column);
    }

    Normalized {
        row_count,
        is_binary: true,
        names,
        types,
        columns,
    }
}

fn scalar_to_raw(value: Scalar) -> RawValue {
    match value {
        Scalar::Null => RawValue::Null,
        Scalar::Boolean(b) => RawValue::Bool(b),
        Scalar::Integer(v) => RawValue::Number(v as f64),
        Scalar::Float(v) => RawValue::Number(v),
        Scalar::String(s) => RawValue::String(s),
        Scalar::Date(ms) => dates::to_datetime(ms)
            .map(RawValue::DateTime)
            .unwrap_or(RawValue::Number(ms as f64)),
    }
}

fn is_null_literal(raw: &RawValue) -> bool {
    match raw {
        RawValue::Null => true,
        RawValue::String(s) => s == "null",
        _ => false,
    }
}

fn raw_number(raw: &RawValue) -> Option<f64> {
    match raw {
        RawValue::Number(n) => Some(*n),
        RawValue::String(s) => s.trim().parse::<f64>().ok(),
        RawValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        RawValue::DateTime(dt) => Some(dt.timestamp_millis() as f64),
        RawValue::Null => None,
    }
}

fn fits_i32(v: f64) -> bool {
    v >= i32::MIN as f64 && v <= i32::MAX as f64
}

/// Coerces inferred cells. An integer column with any non-integral or
/// out-of-range value is widened to float as a whole.
fn coerce_inferred(values: &[Option<&RawValue>], ty: LogicalType) -> (LogicalType, Vec<Option<Scalar>>) {
    if ty != LogicalType::Integer {
        let column = values
            .iter()
            .map(|v| v.map(|raw| coerce(raw, ty, "")))
            .collect();
        return (ty, column);
    }

    let numbers: Vec<Option<Option<f64>>> = values
        .iter()
        .map(|v| {
            v.map(|raw| {
                if is_null_literal(raw) {
                    None
                } else {
                    raw_number(raw).filter(|n| !n.is_nan())
                }
            })
        })
        .collect();

    let widen = numbers
        .iter()
        .flatten()
        .flatten()
        .any(|n| n.fract() != 0.0 || !fits_i32(*n));

    let (ty, to_scalar): (LogicalType, fn(f64) -> Scalar) = if widen {
        (LogicalType::Float, Scalar::Float)
    } else {
        (LogicalType::Integer, |n| Scalar::Integer(n as i32))
    };
    let column = numbers
        .into_iter()
        .map(|cell| cell.map(|n| n.map(to_scalar).unwrap_or(Scalar::Null)))
        .collect();
    (ty, column)
}

/// Coerces one raw value onto a declared column type.
fn coerce(raw: &RawValue, ty: LogicalType, column: &str) -> Scalar {
    if is_null_literal(raw) {
        return Scalar::Null;
    }

    match ty {
        LogicalType::Integer => match raw_number(raw) {
            Some(n) if n.is_nan() => Scalar::Null,
            Some(n) => {
                let truncated = n.trunc();
                if fits_i32(truncated) {
                    Scalar::Integer(truncated as i32)
                } else {
                    log::warn!(
                        "Value {} does not fit integer column '{}', storing null",
                        n,
                        column
                    );
                    Scalar::Null
                }
            }
            None => Scalar::Null,
        },
        LogicalType::Float => raw_number(raw).map(Scalar::Float).unwrap_or(Scalar::Null),
        LogicalType::Boolean => Scalar::Boolean(match raw {
            RawValue::String(s) => s.trim().eq_ignore_ascii_case("true"),
            RawValue::Bool(b) => *b,
            RawValue::Number(n) => *n != 0.0 && !n.is_nan(),
            RawValue::DateTime(_) => true,
            RawValue::Null => false,
        }),
        LogicalType::Date => match raw {
            RawValue::Number(n) if n.is_finite() => Scalar::Date(*n as i64),
            RawValue::DateTime(dt) => Scalar::Date(dt.timestamp_millis()),
            RawValue::String(s) => parse_date_literal(s).map(Scalar::Date).unwrap_or(Scalar::Null),
            _ => Scalar::Null,
        },
        LogicalType::String => Scalar::String(match raw {
            RawValue::String(s) => s.clone(),
            RawValue::Number(n) => format_number(*n),
            RawValue::Bool(b) => b.to_string(),
            RawValue::DateTime(dt) => format_epoch_ms(dt.timestamp_millis()),
            RawValue::Null => String::new(),
        }),
    }
}
