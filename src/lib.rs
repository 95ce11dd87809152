/// LivePivot - orchestration layer for columnar pivot engines
///
/// Normalizes row, column, schema and Arrow input into one canonical form,
/// models tables and pivot views over an engine reached through the
/// handle-based [`Engine`] trait, and exposes both through a request and
/// subscription protocol driven on a worker thread.

pub mod value;
pub mod dates;
pub mod error;
pub mod settings;
pub mod infer;
pub mod arrow_input;
pub mod normalize;
pub mod computed;
pub mod engine;
pub mod callbacks;
pub mod table;
pub mod view_config;
pub mod view;
pub mod messages;
pub mod host;
pub mod worker;

pub use callbacks::CallbackRegistry;
pub use computed::{ComputedColumn, Transform};
pub use engine::{Engine, EngineError, MemoryEngine, Sides};
pub use error::{Error, Result};
pub use host::{EngineFactory, EngineState, Host, Sink};
pub use messages::{Command, Generator, Reply, Request, TableMethod, TableStep, ViewMethod};
pub use normalize::{normalize, Normalized, TableData};
pub use settings::Settings;
pub use table::{ColumnMetadata, Table, TableOptions};
pub use value::{LogicalType, RawValue, Scalar, Schema};
pub use view::{View, ViewportOptions, COLUMN_SEPARATOR, ROW_PATH};
pub use view_config::ViewConfig;
pub use worker::{Worker, WorkerHandle};

// WebSocket server modules - only when server feature is enabled
#[cfg(feature = "server")]
pub mod websocket;
#[cfg(feature = "server")]
pub mod server;
