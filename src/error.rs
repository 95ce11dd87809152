//! Error taxonomy shared by normalization, the table/view model and the host.
//!
//! Every variant serializes with a `kind` tag and its own fields, so an error
//! posted over the wire keeps everything a client needs for diagnostics.

use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::engine::EngineError;

#[derive(Error, Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Error {
    #[error("Malformed input: {reason}")]
    MalformedInput { reason: String },

    #[error("Unknown type '{name}'")]
    UnknownType { name: String },

    #[error("Cannot specify both index and limit")]
    ConflictingOptions { index: String, limit: usize },

    #[error("Index column '{column}' does not exist in the schema")]
    UnknownIndexColumn { column: String },

    #[error("Aggregate '{op}' expects {expected} input column(s), got {got}")]
    InvalidAggregateArity { op: String, expected: usize, got: usize },

    #[error("Cannot delete table '{table}' while it has {views} view(s)")]
    TableHasViews { table: String, views: usize },

    #[error("View is not initialized")]
    ViewNotInitialized { name: String },

    #[error("Column '{column}' does not exist")]
    UnknownColumn { column: String },

    #[error("Unknown {category} operator '{name}'")]
    UnknownOperator { category: String, name: String },

    #[error("View '{name}' already exists on this table")]
    DuplicateView { name: String },

    #[error("table '{name}' is undefined")]
    UnknownTable { name: String },

    #[error("Host is not initialized")]
    NotReady,

    #[error("Invalid message: {reason}")]
    Protocol { reason: String },

    #[error("{source}")]
    Engine {
        #[from]
        source: EngineError,
    },
}

impl Error {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Error::MalformedInput {
            reason: reason.into(),
        }
    }

    pub(crate) fn protocol(reason: impl Into<String>) -> Self {
        Error::Protocol {
            reason: reason.into(),
        }
    }

    /// Wire form: `{message, kind, ...fields}`.
    pub fn to_wire(&self) -> JsonValue {
        let mut body = match serde_json::to_value(self) {
            Ok(JsonValue::Object(map)) => map,
            _ => serde_json::Map::new(),
        };
        body.insert("message".to_string(), JsonValue::String(self.to_string()));
        JsonValue::Object(body)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_form_keeps_fields() {
        let err = Error::TableHasViews {
            table: "t1".to_string(),
            views: 2,
        };
        let wire = err.to_wire();
        assert_eq!(wire["kind"], "table_has_views");
        assert_eq!(wire["table"], "t1");
        assert_eq!(wire["views"], 2);
        assert_eq!(wire["message"], "Cannot delete table 't1' while it has 2 view(s)");
    }

    #[test]
    fn test_view_not_initialized_message() {
        let err = Error::ViewNotInitialized {
            name: "v".to_string(),
        };
        assert_eq!(err.to_wire()["message"], "View is not initialized");
    }

    #[test]
    fn test_engine_error_nests() {
        let err: Error = EngineError::UnknownColumn {
            column: "z".to_string(),
        }
        .into();
        let wire = err.to_wire();
        assert_eq!(wire["kind"], "engine");
        assert_eq!(wire["source"]["kind"], "unknown_column");
    }
}
