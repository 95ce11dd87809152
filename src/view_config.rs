//! View configuration and its translation into engine context calls.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::dates::parse_date_literal;
use crate::engine::{
    AggOp, AggregateSpec, ContextSpec, FilterOp, FilterOperator, FilterSpec, Sides, SortOrder,
    SortSpec, ORDER_KEY,
};
use crate::error::{Error, Result};
use crate::value::{LogicalType, Scalar, Schema};

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewConfig {
    pub row_pivot: Vec<String>,
    pub column_pivot: Vec<String>,
    /// `[column, operator, operand?]` triples.
    pub filter: Vec<Vec<JsonValue>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter_op: Option<String>,
    pub sort: Vec<SortEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregate: Option<Vec<AggregateEntry>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row_pivot_depth: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column_pivot_depth: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub viewport: Option<Viewport>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SortEntry {
    Bare(String),
    Pair(String, String),
}

impl SortEntry {
    fn parts(&self) -> (&str, &str) {
        match self {
            SortEntry::Bare(name) => (name.as_str(), "asc"),
            SortEntry::Pair(name, order) => (name.as_str(), order.as_str()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AggregateColumns {
    One(String),
    Many(Vec<String>),
}

impl AggregateColumns {
    fn to_vec(&self) -> Vec<String> {
        match self {
            AggregateColumns::One(c) => vec![c.clone()],
            AggregateColumns::Many(cs) => cs.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateEntry {
    pub op: String,
    pub column: AggregateColumns,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Viewport {
    pub top: Option<usize>,
    pub left: Option<usize>,
    pub height: Option<usize>,
    pub width: Option<usize>,
}

impl ViewConfig {
    pub fn sides(&self) -> Sides {
        if !self.column_pivot.is_empty() {
            Sides::Two
        } else if !self.row_pivot.is_empty() {
            Sides::One
        } else {
            Sides::Zero
        }
    }

    /// Only column pivots were given.
    pub fn is_column_only(&self) -> bool {
        self.row_pivot.is_empty() && !self.column_pivot.is_empty()
    }
}

fn unknown(category: &str, name: &str) -> Error {
    Error::UnknownOperator {
        category: category.to_string(),
        name: name.to_string(),
    }
}

pub fn filter_operator(name: &str) -> Result<FilterOperator> {
    Ok(match name {
        "==" => FilterOperator::Eq,
        "!=" => FilterOperator::Ne,
        "<" => FilterOperator::Lt,
        ">" => FilterOperator::Gt,
        "<=" => FilterOperator::Le,
        ">=" => FilterOperator::Ge,
        "contains" => FilterOperator::Contains,
        "begins with" => FilterOperator::BeginsWith,
        "ends with" => FilterOperator::EndsWith,
        "in" => FilterOperator::In,
        "not in" => FilterOperator::NotIn,
        "between" => FilterOperator::Between,
        "is null" => FilterOperator::IsNull,
        "is not null" => FilterOperator::IsNotNull,
        "is nan" => FilterOperator::IsNan,
        "is not nan" => FilterOperator::IsNotNan,
        other => return Err(unknown("filter", other)),
    })
}

pub fn filter_op(name: &str) -> Result<FilterOp> {
    match name {
        "and" => Ok(FilterOp::And),
        "or" => Ok(FilterOp::Or),
        other => Err(unknown("filter_op", other)),
    }
}

pub fn aggregate_op(name: &str) -> Result<AggOp> {
    Ok(match name {
        "sum" => AggOp::Sum,
        "abs sum" => AggOp::AbsSum,
        "sum not null" => AggOp::SumNotNull,
        "count" => AggOp::Count,
        "distinct count" => AggOp::DistinctCount,
        "avg" | "mean" => AggOp::Mean,
        "mean by count" => AggOp::MeanByCount,
        "weighted mean" => AggOp::WeightedMean,
        "median" => AggOp::Median,
        "high" => AggOp::High,
        "low" => AggOp::Low,
        "first by index" => AggOp::FirstByIndex,
        "last by index" => AggOp::LastByIndex,
        "last" => AggOp::Last,
        "last minus first" => AggOp::LastMinusFirst,
        "dominant" => AggOp::Dominant,
        "any" => AggOp::Any,
        "unique" => AggOp::Unique,
        "join" => AggOp::Join,
        "and" => AggOp::And,
        "or" => AggOp::Or,
        "scaled add" => AggOp::ScaledAdd,
        "scaled div" => AggOp::ScaledDiv,
        "pct sum parent" => AggOp::PctSumParent,
        "pct sum grand total" => AggOp::PctSumGrandTotal,
        other => return Err(unknown("aggregate", other)),
    })
}

pub fn aggregate_arity(op: AggOp) -> usize {
    match op {
        AggOp::WeightedMean => 2,
        _ => 1,
    }
}

pub fn sort_order(name: &str) -> Result<SortOrder> {
    Ok(match name {
        "asc" => SortOrder::Asc,
        "desc" => SortOrder::Desc,
        "asc abs" => SortOrder::AscAbs,
        "desc abs" => SortOrder::DescAbs,
        "none" => SortOrder::None,
        other => return Err(unknown("sort", other)),
    })
}

/// Replicates each sort entry across every column group of a two-sided
/// context: `[i, order]` becomes `[i + k * aggregates, order]` for each group.
pub fn remap_sort_two_sided(sort: &[SortSpec], aggregates: usize, unity: usize) -> Vec<SortSpec> {
    if aggregates == 0 {
        return sort.to_vec();
    }
    let groups = unity / aggregates;
    sort.iter()
        .flat_map(|spec| {
            (0..groups).map(move |k| SortSpec {
                index: spec.index + k * aggregates,
                order: spec.order,
            })
        })
        .collect()
}

/// A configuration resolved against a table schema.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Translated {
    pub spec: ContextSpec,
    pub sort: Vec<SortSpec>,
    pub column_only: bool,
    /// The configuration with defaults filled in.
    pub config: ViewConfig,
}

pub(crate) fn translate(config: &ViewConfig, schema: &Schema) -> Result<Translated> {
    let column_only = config.is_column_only();
    let sides = config.sides();

    let column_type = |name: &str| -> Result<LogicalType> {
        if name == ORDER_KEY {
            return Ok(LogicalType::Integer);
        }
        schema.get(name).copied().ok_or_else(|| Error::UnknownColumn {
            column: name.to_string(),
        })
    };

    let row_pivots = if column_only {
        vec![ORDER_KEY.to_string()]
    } else {
        config.row_pivot.clone()
    };
    for name in row_pivots.iter().chain(&config.column_pivot) {
        column_type(name)?;
    }

    let filters = config
        .filter
        .iter()
        .map(|entry| translate_filter(entry, &column_type))
        .collect::<Result<Vec<_>>>()?;
    let combine = match &config.filter_op {
        Some(name) => filter_op(name)?,
        None => FilterOp::And,
    };

    let entries = match &config.aggregate {
        Some(entries) => entries.clone(),
        None => schema
            .keys()
            .filter(|name| name.as_str() != ORDER_KEY)
            .map(|name| AggregateEntry {
                op: "distinct count".to_string(),
                column: AggregateColumns::One(name.clone()),
                name: None,
            })
            .collect(),
    };
    let mut aggregates = Vec::with_capacity(entries.len());
    for entry in &entries {
        let op = aggregate_op(&entry.op)?;
        let columns = entry.column.to_vec();
        let expected = aggregate_arity(op);
        if columns.len() != expected {
            return Err(Error::InvalidAggregateArity {
                op: entry.op.clone(),
                expected,
                got: columns.len(),
            });
        }
        for column in &columns {
            column_type(column)?;
        }
        aggregates.push(AggregateSpec {
            name: entry.name.clone().unwrap_or_else(|| columns[0].clone()),
            op: if column_only { AggOp::Any } else { op },
            columns,
        });
    }

    let mut sort = Vec::with_capacity(config.sort.len());
    for entry in &config.sort {
        let (name, order) = entry.parts();
        let order = sort_order(order)?;
        let index = aggregates
            .iter()
            .position(|a| a.name == name)
            .ok_or_else(|| Error::UnknownColumn {
                column: name.to_string(),
            })?;
        sort.push(SortSpec { index, order });
    }

    let mut resolved = config.clone();
    resolved.aggregate = Some(entries);

    Ok(Translated {
        spec: ContextSpec {
            sides,
            row_pivots,
            column_pivots: config.column_pivot.clone(),
            filter_op: combine,
            filters,
            aggregates,
        },
        sort,
        column_only,
        config: resolved,
    })
}

fn translate_filter(
    entry: &[JsonValue],
    column_type: &dyn Fn(&str) -> Result<LogicalType>,
) -> Result<FilterSpec> {
    let (Some(JsonValue::String(column)), Some(JsonValue::String(op))) = (entry.first(), entry.get(1)) else {
        return Err(Error::malformed(format!(
            "filter entries are [column, operator, value], got {}",
            JsonValue::Array(entry.to_vec())
        )));
    };
    let ty = column_type(column)?;
    let operator = filter_operator(op)?;

    let operands = match (operator, entry.get(2)) {
        (FilterOperator::IsNull
        | FilterOperator::IsNotNull
        | FilterOperator::IsNan
        | FilterOperator::IsNotNan, _)
        | (_, None) => Vec::new(),
        (_, Some(JsonValue::Array(values))) => values.iter().map(|v| operand(v, ty)).collect(),
        (_, Some(value)) => vec![operand(value, ty)],
    };

    Ok(FilterSpec {
        column: column.clone(),
        operator,
        operands,
    })
}

/// Converts a filter operand to the column's type.
fn operand(value: &JsonValue, ty: LogicalType) -> Scalar {
    match (ty, value) {
        (_, JsonValue::Null) => Scalar::Null,
        (LogicalType::Date, JsonValue::String(s)) => {
            parse_date_literal(s).map(Scalar::Date).unwrap_or(Scalar::Null)
        }
        (LogicalType::Date, JsonValue::Number(n)) => {
            n.as_f64().map(|v| Scalar::Date(v as i64)).unwrap_or(Scalar::Null)
        }
        (LogicalType::Integer | LogicalType::Float, JsonValue::Number(n)) => {
            n.as_f64().map(Scalar::Float).unwrap_or(Scalar::Null)
        }
        (LogicalType::Integer | LogicalType::Float, JsonValue::String(s)) => s
            .trim()
            .parse::<f64>()
            .map(Scalar::Float)
            .unwrap_or_else(|_| Scalar::String(s.clone())),
        (LogicalType::Boolean, JsonValue::Bool(b)) => Scalar::Boolean(*b),
        (LogicalType::Boolean, JsonValue::String(s)) => Scalar::Boolean(s.eq_ignore_ascii_case("true")),
        (_, JsonValue::String(s)) => Scalar::String(s.clone()),
        (_, JsonValue::Bool(b)) => Scalar::Boolean(*b),
        (_, JsonValue::Number(n)) => n.as_f64().map(Scalar::Float).unwrap_or(Scalar::Null),
        (_, other) => Scalar::String(other.to_string()),
    }
}
