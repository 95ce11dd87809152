//! Binary columnar input (Arrow IPC stream).
//!
//! Only primitive scalar columns survive decoding. Dictionary columns are
//! resolved to their value type; nested, list and unsigned columns are dropped.

use std::io::Cursor;

use arrow::array::{Array, ArrayRef, AsArray};
use arrow::compute::cast;
use arrow::datatypes::{
    DataType, Date32Type, Date64Type, Float32Type, Float64Type, Int16Type, Int32Type, Int64Type,
    Int8Type, TimeUnit, TimestampMicrosecondType, TimestampMillisecondType,
    TimestampNanosecondType, TimestampSecondType,
};
use arrow::ipc::reader::StreamReader;

use crate::error::{Error, Result};
use crate::normalize::Normalized;
use crate::value::{LogicalType, Scalar};

const MS_PER_DAY: i64 = 86_400_000;

/// Maps an Arrow type to the logical type it is kept as, `None` when dropped.
pub fn logical_type_of(data_type: &DataType) -> Option<LogicalType> {
    match data_type {
        DataType::Boolean => Some(LogicalType::Boolean),
        DataType::Int8 | DataType::Int16 | DataType::Int32 | DataType::Int64 => {
            Some(LogicalType::Integer)
        }
        DataType::Float32 | DataType::Float64 => Some(LogicalType::Float),
        DataType::Utf8 | DataType::LargeUtf8 | DataType::Binary | DataType::LargeBinary => {
            Some(LogicalType::String)
        }
        DataType::Timestamp(_, _) | DataType::Date32 | DataType::Date64 => Some(LogicalType::Date),
        DataType::Dictionary(_, value) => logical_type_of(value),
        _ => None,
    }
}

/// Decodes an Arrow IPC stream into canonical columns.
pub fn decode(bytes: &[u8]) -> Result<Normalized> {
    let reader = StreamReader::try_new(Cursor::new(bytes), None)
        .map_err(|e| Error::malformed(format!("failed to read Arrow stream: {}", e)))?;
    let schema = reader.schema();

    let kept: Vec<(usize, String)> = schema
        .fields()
        .iter()
        .enumerate()
        .filter_map(|(ix, field)| match logical_type_of(field.data_type()) {
            Some(_) => Some((ix, field.name().clone())),
            None => {
                log::debug!(
                    "Dropping column '{}' of unsupported type {:?}",
                    field.name(),
                    field.data_type()
                );
                None
            }
        })
        .collect();

    let mut builders: Vec<ColumnBuilder> = kept.iter().map(|_| ColumnBuilder::default()).collect();
    let mut row_count = 0;

    for batch in reader {
        let batch =
            batch.map_err(|e| Error::malformed(format!("failed to read Arrow batch: {}", e)))?;
        row_count += batch.num_rows();
        for (builder, (ix, _)) in builders.iter_mut().zip(kept.iter()) {
            builder.push_array(batch.column(*ix))?;
        }
    }

    let mut names = Vec::with_capacity(kept.len());
    let mut types = Vec::with_capacity(kept.len());
    let mut columns = Vec::with_capacity(kept.len());
    for ((_, name), builder) in kept.into_iter().zip(builders) {
        let field_type = schema.field_with_name(&name).map(|f| f.data_type().clone());
        let fallback = field_type
            .ok()
            .and_then(|t| logical_type_of(&t))
            .unwrap_or(LogicalType::String);
        let (ty, cells) = builder.finish(fallback);
        names.push(name);
        types.push(ty);
        columns.push(cells);
    }

    Ok(Normalized {
        row_count,
        is_binary: true,
        names,
        types,
        columns,
    })
}

#[derive(Default)]
struct ColumnBuilder {
    ints: Vec<Option<i64>>,
    cells: Vec<Option<Scalar>>,
    integral: bool,
}

impl ColumnBuilder {
    fn push_array(&mut self, array: &ArrayRef) -> Result<()> {
        let array = match array.data_type() {
            DataType::Dictionary(_, value) => cast(array.as_ref(), value)
                .map_err(|e| Error::malformed(format!("cannot resolve dictionary: {}", e)))?,
            _ => array.clone(),
        };

        match array.data_type() {
            DataType::Int8 => self.push_ints(array.as_primitive::<Int8Type>().iter().map(|v| v.map(i64::from))),
            DataType::Int16 => self.push_ints(array.as_primitive::<Int16Type>().iter().map(|v| v.map(i64::from))),
            DataType::Int32 => self.push_ints(array.as_primitive::<Int32Type>().iter().map(|v| v.map(i64::from))),
            DataType::Int64 => self.push_ints(array.as_primitive::<Int64Type>().iter()),
            DataType::Boolean => self.push_cells(array.as_boolean().iter().map(|v| v.map(Scalar::Boolean))),
            DataType::Float32 => self.push_cells(
                array
                    .as_primitive::<Float32Type>()
                    .iter()
                    .map(|v| v.map(|f| Scalar::Float(f as f64))),
            ),
            DataType::Float64 => self.push_cells(
                array.as_primitive::<Float64Type>().iter().map(|v| v.map(Scalar::Float)),
            ),
            DataType::Utf8 => self.push_cells(
                array.as_string::<i32>().iter().map(|v| v.map(|s| Scalar::String(s.to_string()))),
            ),
            DataType::LargeUtf8 => self.push_cells(
                array.as_string::<i64>().iter().map(|v| v.map(|s| Scalar::String(s.to_string()))),
            ),
            DataType::Binary => self.push_cells(
                array
                    .as_binary::<i32>()
                    .iter()
                    .map(|v| v.map(|b| Scalar::String(String::from_utf8_lossy(b).into_owned()))),
            ),
            DataType::LargeBinary => self.push_cells(
                array
                    .as_binary::<i64>()
                    .iter()
                    .map(|v| v.map(|b| Scalar::String(String::from_utf8_lossy(b).into_owned()))),
            ),
            DataType::Timestamp(TimeUnit::Second, _) => self.push_dates(
                array.as_primitive::<TimestampSecondType>().iter().map(|v| v.map(|s| s * 1000)),
            ),
            DataType::Timestamp(TimeUnit::Millisecond, _) => {
                self.push_dates(array.as_primitive::<TimestampMillisecondType>().iter())
            }
            DataType::Timestamp(TimeUnit::Microsecond, _) => self.push_dates(
                array
                    .as_primitive::<TimestampMicrosecondType>()
                    .iter()
                    .map(|v| v.map(|us| us / 1000)),
            ),
            DataType::Timestamp(TimeUnit::Nanosecond, _) => self.push_dates(
                array
                    .as_primitive::<TimestampNanosecondType>()
                    .iter()
                    .map(|v| v.map(|ns| ns / 1_000_000)),
            ),
            DataType::Date32 => self.push_dates(
                array
                    .as_primitive::<Date32Type>()
                    .iter()
                    .map(|v| v.map(|d| i64::from(d) * MS_PER_DAY)),
            ),
            DataType::Date64 => self.push_dates(array.as_primitive::<Date64Type>().iter()),
            other => {
                return Err(Error::malformed(format!(
                    "unexpected Arrow type {:?} in a kept column",
                    other
                )))
            }
        }
        Ok(())
    }

    fn push_ints<I: Iterator<Item = Option<i64>>>(&mut self, values: I) {
        self.integral = true;
        self.ints.extend(values);
    }

    fn push_cells<I: Iterator<Item = Option<Scalar>>>(&mut self, values: I) {
        self.cells
            .extend(values.map(|v| Some(v.unwrap_or(Scalar::Null))));
    }

    fn push_dates<I: Iterator<Item = Option<i64>>>(&mut self, values: I) {
        self.push_cells(values.map(|v| v.map(Scalar::Date)));
    }

    /// Integer columns widen to float when any value leaves the i32 range.
    fn finish(self, fallback: LogicalType) -> (LogicalType, Vec<Option<Scalar>>) {
        if !self.integral {
            return (fallback, self.cells);
        }

        let fits = self
            .ints
            .iter()
            .flatten()
            .all(|v| i32::try_from(*v).is_ok());
        let (ty, to_scalar): (LogicalType, fn(i64) -> Scalar) = if fits {
            (LogicalType::Integer, |v| Scalar::Integer(v as i32))
        } else {
            (LogicalType::Float, |v| Scalar::Float(v as f64))
        };
        let cells = self
            .ints
            .into_iter()
            .map(|v| Some(v.map(to_scalar).unwrap_or(Scalar::Null)))
            .collect();
        (ty, cells)
    }
}
