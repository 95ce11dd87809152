//! Engine binding
//!
//! The pivot engine is reached only through the [`Engine`] trait: opaque
//! handles in, handles or plain data out. Every handle the caller acquires
//! must be released exactly once; [`Scoped`] ties that release to a scope.

pub mod memory;
mod pivot;

use serde::Serialize;
use thiserror::Error;

use crate::computed::ComputedColumn;
use crate::value::{LogicalType, Scalar, Schema};

pub use memory::MemoryEngine;

/// Internal primary-order column every graph node carries. Grouping by it
/// yields one row per record, which is how column-only views are built.
pub const ORDER_KEY: &str = "psp_okey";

#[derive(Error, Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EngineError {
    #[error("Invalid {handle} handle {id}")]
    InvalidHandle { handle: String, id: u32 },

    #[error("Column '{column}' does not exist")]
    UnknownColumn { column: String },

    #[error("Context '{name}' is already registered")]
    DuplicateContext { name: String },

    #[error("Invalid batch: {reason}")]
    InvalidBatch { reason: String },

    #[error("Unsupported operation: {reason}")]
    Unsupported { reason: String },

    #[error("Index {index} is out of range for {len} entries")]
    OutOfRange { index: usize, len: usize },

    #[error("Engine failed to initialize: {reason}")]
    InitFailed { reason: String },
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

macro_rules! handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(pub u32);
    };
}

handle!(
    /// Memory pool owning graph nodes and their registered contexts.
    PoolHandle
);
handle!(
    /// A standalone batch of rows, consumed by `fill` or `create_gnode`.
    TableHandle
);
handle!(
    /// Incremental graph node: the live dataset of one Table.
    GNodeHandle
);
handle!(
    /// Pivot context over a graph node.
    ContextHandle
);

/// Handles that can be handed back to the engine.
pub trait Release: Copy + std::fmt::Debug {
    fn release(self, engine: &dyn Engine);
}

impl Release for PoolHandle {
    fn release(self, engine: &dyn Engine) {
        engine.release_pool(self)
    }
}

impl Release for TableHandle {
    fn release(self, engine: &dyn Engine) {
        engine.release_table(self)
    }
}

impl Release for GNodeHandle {
    fn release(self, engine: &dyn Engine) {
        engine.release_gnode(self)
    }
}

impl Release for ContextHandle {
    fn release(self, engine: &dyn Engine) {
        engine.release_context(self)
    }
}

/// Releases its handle when dropped unless `keep` hands ownership on.
pub struct Scoped<'e, H: Release> {
    engine: &'e dyn Engine,
    handle: H,
    armed: bool,
}

impl<'e, H: Release> Scoped<'e, H> {
    pub fn new(engine: &'e dyn Engine, handle: H) -> Self {
        Scoped {
            engine,
            handle,
            armed: true,
        }
    }

    pub fn get(&self) -> H {
        self.handle
    }

    pub fn keep(mut self) -> H {
        self.armed = false;
        self.handle
    }
}

impl<H: Release> Drop for Scoped<'_, H> {
    fn drop(&mut self) {
        if self.armed {
            log::trace!("Releasing {:?}", self.handle);
            self.handle.release(self.engine);
        }
    }
}

/// One page of canonical columns bound for the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct TableBatch {
    pub row_count: usize,
    pub names: Vec<String>,
    pub types: Vec<LogicalType>,
    pub columns: Vec<Vec<Option<Scalar>>>,
    /// Circular-buffer position of the first row when `limit` is set.
    pub start_index: usize,
    pub limit: Option<usize>,
    pub index: Option<String>,
    pub is_binary: bool,
    /// Rows identify records to remove by their `index` value.
    pub is_delete: bool,
}

impl TableBatch {
    pub fn schema(&self) -> Schema {
        self.names
            .iter()
            .cloned()
            .zip(self.types.iter().copied())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Sides {
    Zero,
    One,
    Two,
}

impl Sides {
    pub fn count(&self) -> u8 {
        match self {
            Sides::Zero => 0,
            Sides::One => 1,
            Sides::Two => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Header {
    Row,
    Column,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilterOp {
    #[default]
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOperator {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    Contains,
    BeginsWith,
    EndsWith,
    In,
    NotIn,
    Between,
    IsNull,
    IsNotNull,
    IsNan,
    IsNotNan,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FilterSpec {
    pub column: String,
    pub operator: FilterOperator,
    pub operands: Vec<Scalar>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggOp {
    Sum,
    AbsSum,
    SumNotNull,
    Count,
    DistinctCount,
    Mean,
    MeanByCount,
    WeightedMean,
    Median,
    High,
    Low,
    FirstByIndex,
    LastByIndex,
    Last,
    LastMinusFirst,
    Dominant,
    Any,
    Unique,
    Join,
    And,
    Or,
    ScaledAdd,
    ScaledDiv,
    PctSumParent,
    PctSumGrandTotal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregateSpec {
    pub name: String,
    pub op: AggOp,
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
    AscAbs,
    DescAbs,
    None,
}

/// Sort on the data column at `index` (aggregate position, or unity column
/// position for two-sided contexts).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortSpec {
    pub index: usize,
    pub order: SortOrder,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContextSpec {
    pub sides: Sides,
    pub row_pivots: Vec<String>,
    pub column_pivots: Vec<String>,
    pub filter_op: FilterOp,
    pub filters: Vec<FilterSpec>,
    pub aggregates: Vec<AggregateSpec>,
}

impl ContextSpec {
    /// Column-pivoted context whose only row pivot is the order key. It leads
    /// with one header row per column pivot instead of a total row.
    pub fn is_column_only(&self) -> bool {
        self.sides == Sides::Two && matches!(self.row_pivots.as_slice(), [only] if only == ORDER_KEY)
    }
}

/// A rectangular, row-major block of context cells.
#[derive(Debug, Clone, PartialEq)]
pub struct DataSlice {
    pub rows: usize,
    pub cols: usize,
    pub values: Vec<Scalar>,
}

impl DataSlice {
    pub fn get(&self, row: usize, col: usize) -> Option<&Scalar> {
        if row < self.rows && col < self.cols {
            self.values.get(row * self.cols + col)
        } else {
            None
        }
    }
}

/// Handle-based contract of the pivot engine.
///
/// For one- and two-sided contexts column 0 of every slice is the row header;
/// data columns follow, `unity_column_count` of them.
pub trait Engine {
    fn create_pool(&self) -> PoolHandle;
    fn create_table(&self, batch: TableBatch) -> EngineResult<TableHandle>;
    fn add_computed_column(&self, table: TableHandle, column: &ComputedColumn) -> EngineResult<()>;
    fn create_gnode(&self, table: TableHandle) -> EngineResult<GNodeHandle>;
    fn register_gnode(&self, pool: PoolHandle, gnode: GNodeHandle) -> EngineResult<u32>;
    fn unregister_gnode(&self, pool: PoolHandle, gnode_id: u32) -> EngineResult<()>;
    fn fill(&self, pool: PoolHandle, gnode_id: u32, table: TableHandle) -> EngineResult<()>;
    /// Copies the stored, non-computed columns into a fresh table.
    fn clone_table_snapshot(&self, gnode: GNodeHandle) -> EngineResult<TableHandle>;
    fn gnode_schema(&self, gnode: GNodeHandle) -> EngineResult<Schema>;
    fn gnode_size(&self, gnode: GNodeHandle) -> EngineResult<usize>;

    fn create_context(&self, gnode: GNodeHandle, spec: &ContextSpec) -> EngineResult<ContextHandle>;
    fn register_context(
        &self,
        pool: PoolHandle,
        gnode_id: u32,
        name: &str,
        sides: Sides,
        context: ContextHandle,
    ) -> EngineResult<()>;
    fn unregister_context(&self, gnode_id: u32, name: &str) -> EngineResult<()>;

    fn sort(&self, context: ContextHandle, sort: &[SortSpec]) -> EngineResult<()>;
    fn open(&self, context: ContextHandle, header: Header, row: usize) -> EngineResult<()>;
    fn close(&self, context: ContextHandle, header: Header, row: usize) -> EngineResult<()>;
    fn expand_to_depth(&self, context: ContextHandle, header: Header, depth: usize) -> EngineResult<()>;
    fn collapse_to_depth(&self, context: ContextHandle, header: Header, depth: usize) -> EngineResult<()>;

    fn unity_column_count(&self, context: ContextHandle) -> EngineResult<usize>;
    fn row_count(&self, context: ContextHandle) -> EngineResult<usize>;
    fn column_count(&self, context: ContextHandle) -> EngineResult<usize>;
    /// Rows in `[start, end)` changed since the previous call, or `None` when
    /// the context cannot report them.
    fn step_delta(&self, context: ContextHandle, start: usize, end: usize) -> EngineResult<Option<Vec<usize>>>;
    fn data_slice(
        &self,
        context: ContextHandle,
        start_row: usize,
        end_row: usize,
        start_col: usize,
        end_col: usize,
    ) -> EngineResult<DataSlice>;
    fn row_path(&self, context: ContextHandle, row: usize) -> EngineResult<Vec<Scalar>>;
    /// Column-pivot values of a data column, leaf first.
    fn column_path(&self, context: ContextHandle, col: usize) -> EngineResult<Vec<Scalar>>;

    fn release_pool(&self, pool: PoolHandle);
    fn release_table(&self, table: TableHandle);
    fn release_gnode(&self, gnode: GNodeHandle);
    fn release_context(&self, context: ContextHandle);
}
