//! Views
//!
//! A View is one pivot configuration bound to one registered engine context
//! over its table's graph node. Reads slice the context and reshape the cells
//! into columns, row objects or CSV; pivoted views prepend each row's path as
//! `__ROW_PATH__`.

use std::cell::Cell;
use std::rc::{Rc, Weak};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};

use crate::callbacks::CallbackRegistry;
use crate::engine::{AggOp, AggregateSpec, ContextHandle, Engine, Header, Scoped, Sides};
use crate::error::{Error, Result};
use crate::table::Table;
use crate::value::{LogicalType, Scalar, Schema};
use crate::view_config::{remap_sort_two_sided, translate, ViewConfig};

/// Synthetic column holding the row-pivot path of each row.
pub const ROW_PATH: &str = "__ROW_PATH__";

/// Joins column-pivot values and the aggregate name in two-sided column names.
pub const COLUMN_SEPARATOR: &str = "|";

/// Window of a read. Unset bounds come from the view's configured viewport,
/// then from the full extent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewportOptions {
    pub start_row: Option<usize>,
    pub end_row: Option<usize>,
    pub start_col: Option<usize>,
    pub end_col: Option<usize>,
}

impl ViewportOptions {
    pub fn rows(start: usize, end: usize) -> Self {
        ViewportOptions {
            start_row: Some(start),
            end_row: Some(end),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Window {
    start_row: usize,
    end_row: usize,
    start_col: usize,
    end_col: usize,
}

/// One read: column names, row paths when pivoted, and row-major cells.
struct Block {
    names: Vec<String>,
    paths: Option<Vec<Vec<Scalar>>>,
    rows: Vec<Vec<Scalar>>,
}

struct ViewInner {
    name: String,
    table: Table,
    context: ContextHandle,
    config: ViewConfig,
    sides: Sides,
    column_only: bool,
    aggregates: Vec<AggregateSpec>,
    input_types: Vec<LogicalType>,
    deleted: Cell<bool>,
    update_callbacks: CallbackRegistry<Option<JsonValue>>,
    delete_callbacks: CallbackRegistry<()>,
}

impl ViewInner {
    fn engine(&self) -> &dyn Engine {
        &**self.table.engine()
    }

    /// Unregisters and releases the context and detaches from the table.
    fn teardown(&self) {
        let engine = self.engine();
        if let Err(e) = engine.unregister_context(self.table.gnode_id(), &self.name) {
            log::error!("Failed to unregister view {}: {}", self.name, e);
        }
        engine.release_context(self.context);
        self.table.detach_view(&self.name);
    }
}

impl Drop for ViewInner {
    fn drop(&mut self) {
        if !self.deleted.get() {
            self.teardown();
        }
    }
}

#[derive(Clone)]
pub struct View {
    inner: Rc<ViewInner>,
}

impl std::fmt::Debug for View {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("View")
            .field("name", &self.inner.name)
            .field("table", &self.inner.table.id())
            .field("sides", &self.inner.sides)
            .field("column_only", &self.inner.column_only)
            .finish()
    }
}

impl View {
    pub(crate) fn create(table: Table, name: &str, config: ViewConfig) -> Result<View> {
        if table.has_view(name) {
            return Err(Error::DuplicateView {
                name: name.to_string(),
            });
        }
        let schema = table.schema()?;
        let translated = translate(&config, &schema)?;
        let sides = translated.spec.sides;

        let engine = table.engine().clone();
        let e: &dyn Engine = &*engine;
        let context = Scoped::new(e, e.create_context(table.gnode(), &translated.spec)?);

        let sort = if sides == Sides::Two {
            let unity = e.unity_column_count(context.get())?;
            remap_sort_two_sided(&translated.sort, translated.spec.aggregates.len(), unity)
        } else {
            translated.sort.clone()
        };
        if !sort.is_empty() {
            e.sort(context.get(), &sort)?;
        }

        if sides != Sides::Zero {
            if let Some(depth) = config.row_pivot_depth {
                e.collapse_to_depth(context.get(), Header::Row, depth)?;
            }
        }
        if sides == Sides::Two {
            if let Some(depth) = config.column_pivot_depth {
                e.collapse_to_depth(context.get(), Header::Column, depth)?;
            }
        }

        e.register_context(table.pool(), table.gnode_id(), name, sides, context.get())?;
        if let Err(err) = table.attach_view(name) {
            if let Err(e2) = e.unregister_context(table.gnode_id(), name) {
                log::error!("Failed to unregister view {}: {}", name, e2);
            }
            return Err(err);
        }

        let input_types = translated
            .spec
            .aggregates
            .iter()
            .map(|a| {
                a.columns
                    .first()
                    .and_then(|c| schema.get(c))
                    .copied()
                    .unwrap_or(LogicalType::Integer)
            })
            .collect();

        let view = View {
            inner: Rc::new(ViewInner {
                name: name.to_string(),
                context: context.keep(),
                config: translated.config,
                sides,
                column_only: translated.column_only,
                aggregates: translated.spec.aggregates,
                input_types,
                deleted: Cell::new(false),
                update_callbacks: CallbackRegistry::new(),
                delete_callbacks: CallbackRegistry::new(),
                table,
            }),
        };

        let weak: Weak<ViewInner> = Rc::downgrade(&view.inner);
        view.inner.table.on_update(Some(name), move || {
            if let Some(inner) = weak.upgrade() {
                View { inner }.table_updated();
            }
        });

        log::debug!(
            "Created {:?} view {} on table {}",
            sides,
            name,
            view.inner.table.id()
        );
        Ok(view)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn table(&self) -> &Table {
        &self.inner.table
    }

    pub fn sides(&self) -> Sides {
        self.inner.sides
    }

    pub fn column_only(&self) -> bool {
        self.inner.column_only
    }

    /// The configuration with defaults filled in.
    pub fn config(&self) -> &ViewConfig {
        &self.inner.config
    }

    pub fn is_deleted(&self) -> bool {
        self.inner.deleted.get()
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_deleted() {
            Err(Error::ViewNotInitialized {
                name: self.inner.name.clone(),
            })
        } else {
            Ok(())
        }
    }

    fn header(&self) -> usize {
        usize::from(self.inner.sides != Sides::Zero)
    }

    /// Engine rows hidden from readers: one header row per column pivot of a
    /// column-only view.
    fn trimmed(&self) -> usize {
        if self.inner.column_only {
            self.inner.config.column_pivot.len()
        } else {
            0
        }
    }

    pub fn num_rows(&self) -> Result<usize> {
        self.ensure_live()?;
        let rows = self.inner.engine().row_count(self.inner.context)?;
        Ok(rows.saturating_sub(self.trimmed()))
    }

    /// Data columns, the row header excluded.
    pub fn num_columns(&self) -> Result<usize> {
        self.ensure_live()?;
        Ok(self.inner.engine().unity_column_count(self.inner.context)?)
    }

    /// Output type of each aggregate, keyed by display name.
    pub fn schema(&self) -> Result<Schema> {
        self.ensure_live()?;
        let pivoted = self.inner.sides != Sides::Zero;
        Ok(self
            .inner
            .aggregates
            .iter()
            .zip(&self.inner.input_types)
            .map(|(agg, input)| {
                let ty = if pivoted {
                    aggregate_type(agg.op, *input)
                } else {
                    *input
                };
                (agg.name.clone(), ty)
            })
            .collect())
    }

    fn window(&self, options: &ViewportOptions) -> Result<Window> {
        let rows = self.num_rows()?;
        let cols = self.num_columns()?;
        let viewport = self.inner.config.viewport.unwrap_or_default();

        let start_row = options.start_row.or(viewport.top).unwrap_or(0);
        let end_row = options
            .end_row
            .or_else(|| viewport.height.map(|h| viewport.top.unwrap_or(0) + h))
            .unwrap_or(rows)
            .min(rows);
        let start_col = options.start_col.or(viewport.left).unwrap_or(0);
        let end_col = options
            .end_col
            .or_else(|| viewport.width.map(|w| viewport.left.unwrap_or(0) + w))
            .unwrap_or(cols)
            .min(cols);

        Ok(Window {
            start_row: start_row.min(end_row),
            end_row,
            start_col: start_col.min(end_col),
            end_col,
        })
    }

    fn column_name(&self, col: usize) -> Result<String> {
        let width = self.inner.aggregates.len().max(1);
        let aggregate = self
            .inner
            .aggregates
            .get(col % width)
            .map(|a| a.name.clone())
            .unwrap_or_default();
        if self.inner.sides != Sides::Two {
            return Ok(aggregate);
        }
        let path = self
            .inner
            .engine()
            .column_path(self.inner.context, col + self.header())?;
        let mut parts: Vec<String> = path.iter().rev().map(Scalar::to_text).collect();
        parts.push(aggregate);
        Ok(parts.join(COLUMN_SEPARATOR))
    }

    fn read(&self, options: &ViewportOptions) -> Result<Block> {
        let w = self.window(options)?;
        let engine = self.inner.engine();
        let ctx = self.inner.context;
        let header = self.header();
        let trim = self.trimmed();

        let names = (w.start_col..w.end_col)
            .map(|c| self.column_name(c))
            .collect::<Result<Vec<_>>>()?;

        let slice = engine.data_slice(
            ctx,
            w.start_row + trim,
            w.end_row + trim,
            w.start_col + header,
            w.end_col + header,
        )?;
        let rows = (0..slice.rows)
            .map(|r| {
                (0..slice.cols)
                    .map(|c| slice.get(r, c).cloned().unwrap_or(Scalar::Null))
                    .collect()
            })
            .collect();

        let paths = if header == 1 && !self.inner.column_only {
            Some(
                (w.start_row..w.start_row + slice.rows)
                    .map(|r| engine.row_path(ctx, r))
                    .collect::<std::result::Result<Vec<_>, _>>()?,
            )
        } else {
            None
        };

        Ok(Block { names, paths, rows })
    }

    pub fn to_columns(&self, options: &ViewportOptions) -> Result<IndexMap<String, Vec<JsonValue>>> {
        let block = self.read(options)?;
        let mut out = IndexMap::new();
        if let Some(paths) = &block.paths {
            out.insert(ROW_PATH.to_string(), paths.iter().map(|p| path_json(p)).collect());
        }
        for (ix, name) in block.names.iter().enumerate() {
            out.insert(
                name.clone(),
                block.rows.iter().map(|row| row[ix].to_json()).collect(),
            );
        }
        Ok(out)
    }

    pub fn to_json(&self, options: &ViewportOptions) -> Result<Vec<JsonMap<String, JsonValue>>> {
        let block = self.read(options)?;
        Ok(block
            .rows
            .iter()
            .enumerate()
            .map(|(r, row)| {
                let mut object = JsonMap::new();
                if let Some(paths) = &block.paths {
                    object.insert(ROW_PATH.to_string(), path_json(&paths[r]));
                }
                for (name, cell) in block.names.iter().zip(row) {
                    object.insert(name.clone(), cell.to_json());
                }
                object
            })
            .collect())
    }

    /// CSV with a header line; row paths are joined with the column separator.
    pub fn to_csv(&self, options: &ViewportOptions) -> Result<String> {
        let block = self.read(options)?;
        let mut out = String::new();

        let mut header: Vec<String> = Vec::with_capacity(block.names.len() + 1);
        if block.paths.is_some() {
            header.push(csv_field(ROW_PATH));
        }
        header.extend(block.names.iter().map(|n| csv_field(n)));
        out.push_str(&header.join(","));
        out.push('\n');

        for (r, row) in block.rows.iter().enumerate() {
            let mut fields = Vec::with_capacity(row.len() + 1);
            if let Some(paths) = &block.paths {
                let joined: Vec<String> = paths[r].iter().map(Scalar::to_text).collect();
                fields.push(csv_field(&joined.join(COLUMN_SEPARATOR)));
            }
            fields.extend(row.iter().map(|cell| csv_field(&cell.to_text())));
            out.push_str(&fields.join(","));
            out.push('\n');
        }
        Ok(out)
    }

    fn toggle(&self, row: usize, open: bool) -> Result<()> {
        self.ensure_live()?;
        if self.inner.sides == Sides::Zero {
            log::warn!("View {} has no row pivots; expand/collapse ignored", self.inner.name);
            return Ok(());
        }
        let engine = self.inner.engine();
        let row = row + self.trimmed();
        if open {
            engine.open(self.inner.context, Header::Row, row)?;
        } else {
            engine.close(self.inner.context, Header::Row, row)?;
        }
        Ok(())
    }

    pub fn expand(&self, row: usize) -> Result<()> {
        self.toggle(row, true)
    }

    pub fn collapse(&self, row: usize) -> Result<()> {
        self.toggle(row, false)
    }

    fn set_depth(&self, depth: usize, expand: bool) -> Result<()> {
        self.ensure_live()?;
        let max = self.inner.config.row_pivot.len();
        if depth > max {
            log::warn!(
                "View {}: depth {} exceeds row pivot depth {}; ignored",
                self.inner.name,
                depth,
                max
            );
            return Ok(());
        }
        let engine = self.inner.engine();
        if expand {
            engine.expand_to_depth(self.inner.context, Header::Row, depth)?;
        } else {
            engine.collapse_to_depth(self.inner.context, Header::Row, depth)?;
        }
        Ok(())
    }

    pub fn expand_to_depth(&self, depth: usize) -> Result<()> {
        self.set_depth(depth, true)
    }

    pub fn collapse_to_depth(&self, depth: usize) -> Result<()> {
        self.set_depth(depth, false)
    }

    /// Registers a callback run after each table update. It receives the
    /// `to_json` of each changed row when the engine reports step deltas, and
    /// `None` otherwise.
    pub fn on_update<F>(&self, callback: F) -> u64
    where
        F: Fn(Option<&JsonValue>) + 'static,
    {
        self.inner
            .update_callbacks
            .add(None, move |delta: &Option<JsonValue>| callback(delta.as_ref()))
    }

    pub fn remove_update(&self, id: u64) -> bool {
        self.inner.update_callbacks.remove(id)
    }

    /// Registers a callback run once when the view is deleted.
    pub fn on_delete<F>(&self, callback: F) -> u64
    where
        F: Fn() + 'static,
    {
        self.inner.delete_callbacks.add(None, move |_| callback())
    }

    pub fn remove_delete(&self, id: u64) -> bool {
        self.inner.delete_callbacks.remove(id)
    }

    fn table_updated(&self) {
        if self.is_deleted() {
            return;
        }
        let engine = self.inner.engine();
        let total = match engine.row_count(self.inner.context) {
            Ok(total) => total,
            Err(e) => {
                log::error!("View {} failed to read row count: {}", self.inner.name, e);
                return;
            }
        };
        let delta = match engine.step_delta(self.inner.context, 0, total) {
            Ok(delta) => delta,
            Err(e) => {
                log::error!("View {} failed to read step delta: {}", self.inner.name, e);
                return;
            }
        };
        if self.inner.update_callbacks.is_empty() {
            return;
        }

        match delta {
            None => self.inner.update_callbacks.notify(&None),
            Some(rows) => {
                let trim = self.trimmed();
                for row in rows.into_iter().filter_map(|r| r.checked_sub(trim)) {
                    match self.to_json(&ViewportOptions::rows(row, row + 1)) {
                        Ok(objects) => {
                            let payload = JsonValue::Array(objects.into_iter().map(JsonValue::Object).collect());
                            self.inner.update_callbacks.notify(&Some(payload));
                        }
                        Err(e) => log::error!("View {} failed to serialize row {}: {}", self.inner.name, row, e),
                    }
                }
            }
        }
    }

    /// Unregisters the context, detaches from the table and fires delete
    /// callbacks once.
    pub fn delete(&self) -> Result<()> {
        if self.inner.deleted.replace(true) {
            return Ok(());
        }
        self.inner.teardown();
        self.inner.update_callbacks.clear();
        self.inner.delete_callbacks.notify(&());
        self.inner.delete_callbacks.clear();
        log::debug!("Deleted view {}", self.inner.name);
        Ok(())
    }
}

/// Output type of an aggregate over a column of type `input`.
pub fn aggregate_type(op: AggOp, input: LogicalType) -> LogicalType {
    match op {
        AggOp::Count | AggOp::DistinctCount => LogicalType::Integer,
        AggOp::Sum | AggOp::AbsSum | AggOp::SumNotNull | AggOp::LastMinusFirst => {
            if input == LogicalType::Integer {
                LogicalType::Integer
            } else {
                LogicalType::Float
            }
        }
        AggOp::Mean
        | AggOp::MeanByCount
        | AggOp::WeightedMean
        | AggOp::ScaledAdd
        | AggOp::ScaledDiv
        | AggOp::PctSumParent
        | AggOp::PctSumGrandTotal => LogicalType::Float,
        AggOp::And | AggOp::Or => LogicalType::Boolean,
        AggOp::Join => LogicalType::String,
        AggOp::Median
        | AggOp::High
        | AggOp::Low
        | AggOp::FirstByIndex
        | AggOp::LastByIndex
        | AggOp::Last
        | AggOp::Dominant
        | AggOp::Any
        | AggOp::Unique => input,
    }
}

fn path_json(path: &[Scalar]) -> JsonValue {
    JsonValue::Array(path.iter().map(Scalar::to_json).collect())
}

fn csv_field(value: &str) -> String {
    if value.contains(|c| matches!(c, ',' | '"' | '\n' | '\r')) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MemoryEngine;
    use crate::normalize::TableData;
    use crate::settings::Settings;
    use crate::table::TableOptions;
    use serde_json::json;
    use std::cell::RefCell;

    fn table(engine: &Rc<MemoryEngine>, value: JsonValue) -> Table {
        Table::create(
            engine.clone(),
            TableData::from_json(value).unwrap(),
            TableOptions::default(),
            &Settings::default(),
        )
        .unwrap()
    }

    fn sales(engine: &Rc<MemoryEngine>) -> Table {
        table(
            engine,
            json!([
                {"region": "east", "kind": "a", "units": 1},
                {"region": "east", "kind": "b", "units": 2},
                {"region": "west", "kind": "a", "units": 3},
                {"region": "west", "kind": "a", "units": 4}
            ]),
        )
    }

    fn config(value: JsonValue) -> ViewConfig {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_flat_view_reads() {
        let e = Rc::new(MemoryEngine::new());
        let t = sales(&e);
        let v = t.view(ViewConfig::default()).unwrap();
        assert_eq!(v.sides(), Sides::Zero);
        assert_eq!(v.num_rows().unwrap(), 4);
        assert_eq!(v.num_columns().unwrap(), 3);

        let columns = v.to_columns(&ViewportOptions::default()).unwrap();
        assert_eq!(
            columns.keys().collect::<Vec<_>>(),
            vec!["region", "kind", "units"]
        );
        assert_eq!(columns["units"], vec![json!(1), json!(2), json!(3), json!(4)]);
        assert!(!columns.contains_key(ROW_PATH));
    }

    #[test]
    fn test_one_sided_row_paths() {
        let e = Rc::new(MemoryEngine::new());
        let t = sales(&e);
        let v = t
            .view(config(json!({
                "row_pivot": ["region"],
                "aggregate": [{"op": "sum", "column": "units"}]
            })))
            .unwrap();
        assert_eq!(v.sides(), Sides::One);

        let rows = v.to_json(&ViewportOptions::default()).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0][ROW_PATH], json!([]));
        assert_eq!(rows[0]["units"], json!(10));
        assert_eq!(rows[1][ROW_PATH], json!(["east"]));
        assert_eq!(rows[1]["units"], json!(3));
        assert_eq!(rows[2]["units"], json!(7));
        assert_eq!(v.schema().unwrap().get("units"), Some(&LogicalType::Integer));
    }

    #[test]
    fn test_two_sided_column_names() {
        let e = Rc::new(MemoryEngine::new());
        let t = sales(&e);
        let v = t
            .view(config(json!({
                "row_pivot": ["region"],
                "column_pivot": ["kind"],
                "aggregate": [{"op": "sum", "column": "units"}]
            })))
            .unwrap();
        assert_eq!(v.sides(), Sides::Two);
        let columns = v.to_columns(&ViewportOptions::default()).unwrap();
        assert_eq!(
            columns.keys().collect::<Vec<_>>(),
            vec![ROW_PATH, "a|units", "b|units"]
        );
        assert_eq!(columns["a|units"], vec![json!(8), json!(1), json!(7)]);
    }

    #[test]
    fn test_column_only_hides_paths_and_headers() {
        let e = Rc::new(MemoryEngine::new());
        let t = sales(&e);
        let v = t
            .view(config(json!({
                "column_pivot": ["kind"],
                "aggregate": [{"op": "sum", "column": "units"}]
            })))
            .unwrap();
        assert!(v.column_only());
        assert_eq!(v.num_rows().unwrap(), 4);
        let rows = v.to_json(&ViewportOptions::default()).unwrap();
        assert!(!rows[0].contains_key(ROW_PATH));
        assert_eq!(rows[0]["a|units"], json!(1));
        assert_eq!(rows[1]["b|units"], json!(2));

        let nested = t
            .view(config(json!({
                "column_pivot": ["kind", "region"],
                "aggregate": [{"op": "sum", "column": "units"}]
            })))
            .unwrap();
        assert_eq!(nested.num_rows().unwrap(), 4);
        let columns = nested.to_columns(&ViewportOptions::default()).unwrap();
        assert_eq!(
            columns.keys().collect::<Vec<_>>(),
            vec!["a|east|units", "a|west|units", "b|east|units"]
        );
        assert_eq!(
            columns["a|west|units"],
            vec![JsonValue::Null, JsonValue::Null, json!(3), json!(4)]
        );
        assert_eq!(columns["b|east|units"][1], json!(2));
    }

    #[test]
    fn test_viewport_defaults_from_config() {
        let e = Rc::new(MemoryEngine::new());
        let t = sales(&e);
        let v = t
            .view(config(json!({
                "viewport": {"top": 1, "height": 2, "left": 2, "width": 1}
            })))
            .unwrap();
        let columns = v.to_columns(&ViewportOptions::default()).unwrap();
        assert_eq!(columns.len(), 1);
        assert_eq!(columns["units"], vec![json!(2), json!(3)]);

        let all = v
            .to_columns(&ViewportOptions {
                start_row: Some(0),
                end_row: Some(100),
                start_col: Some(0),
                end_col: Some(100),
            })
            .unwrap();
        assert_eq!(all["region"].len(), 4);
    }

    #[test]
    fn test_csv_escaping() {
        let e = Rc::new(MemoryEngine::new());
        let t = table(&e, json!([{"name": "a,b", "note": "say \"hi\""}]));
        let v = t.view(ViewConfig::default()).unwrap();
        let csv = v.to_csv(&ViewportOptions::default()).unwrap();
        assert_eq!(csv, "name,note\n\"a,b\",\"say \"\"hi\"\"\"\n");
    }

    #[test]
    fn test_sort_desc() {
        let e = Rc::new(MemoryEngine::new());
        let t = sales(&e);
        let v = t
            .view(config(json!({
                "row_pivot": ["region"],
                "aggregate": [{"op": "sum", "column": "units"}],
                "sort": [["units", "desc"]]
            })))
            .unwrap();
        let columns = v.to_columns(&ViewportOptions::default()).unwrap();
        assert_eq!(columns[ROW_PATH][1], json!(["west"]));
    }

    #[test]
    fn test_expand_collapse() {
        let e = Rc::new(MemoryEngine::new());
        let t = sales(&e);
        let v = t
            .view(config(json!({
                "row_pivot": ["region", "kind"],
                "aggregate": [{"op": "count", "column": "units"}],
                "row_pivot_depth": 1
            })))
            .unwrap();
        assert_eq!(v.num_rows().unwrap(), 3);
        v.expand(1).unwrap();
        assert_eq!(v.num_rows().unwrap(), 5);
        v.collapse(1).unwrap();
        assert_eq!(v.num_rows().unwrap(), 3);
        v.expand_to_depth(2).unwrap();
        assert_eq!(v.num_rows().unwrap(), 6);
        v.collapse_to_depth(5).unwrap();
        assert_eq!(v.num_rows().unwrap(), 6);
        v.collapse_to_depth(0).unwrap();
        assert_eq!(v.num_rows().unwrap(), 1);
    }

    #[test]
    fn test_on_update_per_changed_row() {
        let e = Rc::new(MemoryEngine::new());
        let t = sales(&e);
        let v = t.view(ViewConfig::default()).unwrap();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let s = seen.clone();
        v.on_update(move |delta| s.borrow_mut().push(delta.cloned()));

        t.update(TableData::from_json(json!([{"region": "north", "kind": "c", "units": 9}])).unwrap())
            .unwrap();
        let seen = seen.borrow();
        assert_eq!(seen.len(), 1);
        let payload = seen[0].clone().unwrap();
        assert_eq!(payload[0]["region"], json!("north"));
    }

    #[test]
    fn test_on_update_without_deltas_fires_empty() {
        let e = Rc::new(MemoryEngine::without_deltas());
        let t = sales(&e);
        let v = t.view(config(json!({"row_pivot": ["region"]}))).unwrap();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let s = seen.clone();
        v.on_update(move |delta| s.borrow_mut().push(delta.cloned()));

        t.update(TableData::from_json(json!([{"region": "north", "kind": "c", "units": 9}])).unwrap())
            .unwrap();
        t.update(TableData::from_json(json!([{"region": "east", "kind": "a", "units": 1}])).unwrap())
            .unwrap();
        assert_eq!(*seen.borrow(), vec![None, None]);
        assert_eq!(v.num_rows().unwrap(), 4);
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let e = Rc::new(MemoryEngine::new());
        let t = sales(&e);
        let _v = t.view_named("v", ViewConfig::default()).unwrap();
        let before = e.live_handles();
        assert!(matches!(
            t.view_named("v", ViewConfig::default()),
            Err(Error::DuplicateView { .. })
        ));
        assert_eq!(e.live_handles(), before);
    }

    #[test]
    fn test_failed_create_leaves_nothing_live() {
        let e = Rc::new(MemoryEngine::new());
        let t = sales(&e);
        let before = e.live_handles();
        assert!(t
            .view(config(json!({"row_pivot": ["missing"]})))
            .is_err());
        assert!(t
            .view(config(json!({"aggregate": [{"op": "weighted mean", "column": "units"}]})))
            .is_err());
        assert_eq!(e.live_handles(), before);
        assert_eq!(t.num_views(), 0);
    }

    #[test]
    fn test_delete_view_then_table() {
        let e = Rc::new(MemoryEngine::new());
        let t = sales(&e);
        let v = t.view(ViewConfig::default()).unwrap();
        let fired = Rc::new(Cell::new(0));
        let f = fired.clone();
        v.on_delete(move || f.set(f.get() + 1));

        assert!(matches!(t.delete(), Err(Error::TableHasViews { views: 1, .. })));
        v.delete().unwrap();
        v.delete().unwrap();
        assert_eq!(fired.get(), 1);
        assert!(matches!(v.num_rows(), Err(Error::ViewNotInitialized { .. })));
        t.delete().unwrap();
        assert_eq!(e.live_handles(), 0);
    }

    #[test]
    fn test_aggregate_types() {
        assert_eq!(aggregate_type(AggOp::Mean, LogicalType::Integer), LogicalType::Float);
        assert_eq!(aggregate_type(AggOp::Sum, LogicalType::Float), LogicalType::Float);
        assert_eq!(aggregate_type(AggOp::Any, LogicalType::Date), LogicalType::Date);
        assert_eq!(aggregate_type(AggOp::DistinctCount, LogicalType::String), LogicalType::Integer);
    }
}
