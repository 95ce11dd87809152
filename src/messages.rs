/// Message types for the host protocol
///
/// Requests are JSON objects tagged by `cmd`; replies carry the request id
/// and either `data` or a structured `error`.
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::computed::ComputedColumn;
use crate::error::{Error, Result};
use crate::normalize::TableData;
use crate::table::TableOptions;
use crate::value::RawValue;
use crate::view_config::ViewConfig;

/// A request from a client.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Request {
    pub id: u64,
    #[serde(flatten)]
    pub command: Command,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Command {
    /// Loads the engine, optionally from a binary payload.
    Init {
        #[serde(default)]
        payload: Option<Vec<u8>>,
    },

    /// Create a table from JSON data or an Arrow IPC stream
    Table {
        name: String,
        #[serde(default)]
        data: Option<JsonValue>,
        #[serde(default)]
        binary: Option<Vec<u8>>,
        #[serde(default)]
        options: TableOptions,
    },

    /// Derive `name` from `original` with extra computed columns
    AddComputed {
        original: String,
        name: String,
        computed: Vec<ComputedColumn>,
    },

    /// Create a table from generated rows
    TableGenerate {
        name: String,
        generator: Generator,
        #[serde(default)]
        options: TableOptions,
    },

    /// Apply a sequence of updates and removals to a table
    TableExecute { name: String, steps: Vec<TableStep> },

    /// Create a view on a table
    View {
        table_name: String,
        view_name: String,
        #[serde(default)]
        config: ViewConfig,
    },

    TableMethod {
        name: String,
        method: TableMethod,
        #[serde(default)]
        args: JsonValue,
        #[serde(default)]
        subscribe: bool,
    },

    ViewMethod {
        name: String,
        method: ViewMethod,
        #[serde(default)]
        args: JsonValue,
        #[serde(default)]
        subscribe: bool,
    },

    /// Delete every view created by the sending client
    ClearViews,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableMethod {
    Schema,
    ComputedSchema,
    Columns,
    ColumnMetadata,
    Size,
    Update,
    Remove,
    Delete,
    OnDelete,
}

impl TableMethod {
    pub fn is_callback(&self) -> bool {
        matches!(self, TableMethod::OnDelete)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewMethod {
    Schema,
    ToColumns,
    ToJson,
    ToCsv,
    NumRows,
    NumColumns,
    Sides,
    GetConfig,
    Expand,
    Collapse,
    ExpandToDepth,
    CollapseToDepth,
    Delete,
    OnUpdate,
    OnDelete,
}

impl ViewMethod {
    pub fn is_callback(&self) -> bool {
        matches!(self, ViewMethod::OnUpdate | ViewMethod::OnDelete)
    }
}

/// Row generators for `table_generate`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Generator {
    /// `count` rows of `start + i * step` in `column`
    Sequence {
        column: String,
        #[serde(default)]
        start: f64,
        #[serde(default = "one")]
        step: f64,
        count: usize,
    },
    /// `count` copies of `row`
    Repeat {
        row: IndexMap<String, JsonValue>,
        count: usize,
    },
}

fn one() -> f64 {
    1.0
}

impl Generator {
    pub fn to_data(&self) -> Result<TableData> {
        match self {
            Generator::Sequence {
                column,
                start,
                step,
                count,
            } => {
                if *count == 0 {
                    return Err(Error::malformed("sequence generator needs at least one row"));
                }
                Ok(TableData::Rows(
                    (0..*count)
                        .map(|i| {
                            let mut row = IndexMap::new();
                            row.insert(column.clone(), RawValue::Number(start + step * i as f64));
                            row
                        })
                        .collect(),
                ))
            }
            Generator::Repeat { row, count } => {
                if *count == 0 || row.is_empty() {
                    return Err(Error::malformed("repeat generator needs a row and a count"));
                }
                let template: IndexMap<String, RawValue> = row
                    .iter()
                    .map(|(k, v)| (k.clone(), RawValue::from_json(v.clone())))
                    .collect();
                Ok(TableData::Rows(vec![template; *count]))
            }
        }
    }
}

/// One step of `table_execute`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TableStep {
    Update { data: JsonValue },
    Remove { keys: Vec<JsonValue> },
}

/// A reply to one request, or one event of a subscription.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reply {
    pub id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonValue>,
}

impl Reply {
    pub fn data(id: u64, data: JsonValue) -> Self {
        Reply {
            id: Some(id),
            data: Some(data),
            error: None,
        }
    }

    pub fn error(id: Option<u64>, error: &Error) -> Self {
        Reply {
            id,
            data: None,
            error: Some(error.to_wire()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(value: JsonValue) -> Request {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_parse_view_method() {
        let req = request(json!({
            "id": 7,
            "cmd": "view_method",
            "name": "v1",
            "method": "to_columns",
            "args": {"start_row": 0, "end_row": 5}
        }));
        assert_eq!(req.id, 7);
        match req.command {
            Command::ViewMethod {
                name,
                method,
                args,
                subscribe,
            } => {
                assert_eq!(name, "v1");
                assert_eq!(method, ViewMethod::ToColumns);
                assert_eq!(args["end_row"], 5);
                assert!(!subscribe);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_unknown_method_rejected() {
        let parsed = serde_json::from_value::<Request>(json!({
            "id": 1,
            "cmd": "table_method",
            "name": "t",
            "method": "drop_everything"
        }));
        assert!(parsed.is_err());
    }

    #[test]
    fn test_parse_clear_views_and_init() {
        assert_eq!(
            request(json!({"id": 2, "cmd": "clear_views"})).command,
            Command::ClearViews
        );
        assert_eq!(
            request(json!({"id": 3, "cmd": "init"})).command,
            Command::Init { payload: None }
        );
    }

    #[test]
    fn test_sequence_generator() {
        let generator: Generator = serde_json::from_value(json!({
            "kind": "sequence",
            "column": "n",
            "start": 10,
            "count": 3
        }))
        .unwrap();
        let TableData::Rows(rows) = generator.to_data().unwrap() else {
            panic!("expected rows");
        };
        let values: Vec<&RawValue> = rows.iter().map(|r| &r["n"]).collect();
        assert_eq!(
            values,
            vec![
                &RawValue::Number(10.0),
                &RawValue::Number(11.0),
                &RawValue::Number(12.0)
            ]
        );
    }

    #[test]
    fn test_repeat_generator_requires_rows() {
        let generator = Generator::Repeat {
            row: IndexMap::new(),
            count: 2,
        };
        assert!(matches!(
            generator.to_data(),
            Err(Error::MalformedInput { .. })
        ));
    }

    #[test]
    fn test_reply_shapes() {
        let ok = serde_json::to_value(Reply::data(4, json!(3))).unwrap();
        assert_eq!(ok, json!({"id": 4, "data": 3}));

        let err = Reply::error(
            Some(5),
            &Error::ViewNotInitialized {
                name: "v".to_string(),
            },
        );
        let wire = serde_json::to_value(err).unwrap();
        assert_eq!(wire["error"]["message"], "View is not initialized");
        assert!(wire.get("data").is_none());
    }
}
