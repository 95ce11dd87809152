//! Tables
//!
//! A Table owns one engine graph node inside its own pool. Its schema is fixed
//! at creation; updates are normalized against it and filled into the node.
//! Views hang off a Table and must be deleted before it.

use std::cell::RefCell;
use std::rc::Rc;

use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::callbacks::CallbackRegistry;
use crate::computed::ComputedColumn;
use crate::engine::{
    Engine, EngineResult, GNodeHandle, PoolHandle, Scoped, TableBatch, ORDER_KEY,
};
use crate::error::{Error, Result};
use crate::normalize::{normalize, Normalized, TableData};
use crate::settings::Settings;
use crate::value::{LogicalType, RawValue, Schema};
use crate::view::View;
use crate::view_config::ViewConfig;

/// Creation options. `index` and `limit` are mutually exclusive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableOptions {
    pub index: Option<String>,
    pub limit: Option<usize>,
}

/// Per-column description returned by `column_metadata`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnMetadata {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: LogicalType,
    pub is_index: bool,
    pub is_computed: bool,
}

struct TableState {
    schema: Schema,
    index: Option<String>,
    limit: Option<usize>,
    limit_index: usize,
    computed: Vec<ComputedColumn>,
    views: IndexSet<String>,
    deleted: bool,
}

struct TableInner {
    id: String,
    engine: Rc<dyn Engine>,
    pool: PoolHandle,
    gnode: GNodeHandle,
    gnode_id: u32,
    settings: Settings,
    state: RefCell<TableState>,
    update_callbacks: CallbackRegistry<()>,
    delete_callbacks: CallbackRegistry<()>,
}

impl Drop for TableInner {
    fn drop(&mut self) {
        if !self.state.get_mut().deleted {
            release_node(&*self.engine, self.pool, self.gnode, self.gnode_id);
        }
    }
}

fn release_node(engine: &dyn Engine, pool: PoolHandle, gnode: GNodeHandle, gnode_id: u32) {
    if let Err(e) = engine.unregister_gnode(pool, gnode_id) {
        log::error!("Failed to unregister gnode {}: {}", gnode_id, e);
    }
    engine.release_gnode(gnode);
    engine.release_pool(pool);
}

fn advance(limit_index: usize, rows: usize, limit: Option<usize>) -> usize {
    match limit {
        Some(limit) if limit > 0 => (limit_index + rows) % limit,
        _ => limit_index + rows,
    }
}

/// Shared handle to a table; clones refer to the same table.
#[derive(Clone)]
pub struct Table {
    inner: Rc<TableInner>,
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.borrow();
        f.debug_struct("Table")
            .field("id", &self.inner.id)
            .field("columns", &state.schema.len())
            .field("index", &state.index)
            .field("limit", &state.limit)
            .field("views", &state.views.len())
            .finish()
    }
}

impl Table {
    /// Normalizes `data` and ingests it page by page into a new graph node.
    pub fn create(
        engine: Rc<dyn Engine>,
        data: TableData,
        options: TableOptions,
        settings: &Settings,
    ) -> Result<Table> {
        if let (Some(index), Some(limit)) = (&options.index, options.limit) {
            return Err(Error::ConflictingOptions {
                index: index.clone(),
                limit,
            });
        }

        let normalized = normalize(data, None, settings)?;
        if let Some(index) = &options.index {
            if !normalized.names.contains(index) {
                return Err(Error::UnknownIndexColumn {
                    column: index.clone(),
                });
            }
        }

        let e: &dyn Engine = &*engine;
        let pool = Scoped::new(e, e.create_pool());
        let shape = Scoped::new(
            e,
            e.create_table(batch_of(normalized.page(0, 0), &options, 0, false))?,
        );
        let gnode = Scoped::new(e, e.create_gnode(shape.get())?);
        drop(shape);
        let gnode_id = e.register_gnode(pool.get(), gnode.get())?;

        let limit_index = match ingest(e, pool.get(), gnode_id, &normalized, &options, settings.page_size) {
            Ok(limit_index) => limit_index,
            Err(err) => {
                if let Err(e2) = e.unregister_gnode(pool.get(), gnode_id) {
                    log::error!("Failed to unregister gnode {}: {}", gnode_id, e2);
                }
                return Err(err.into());
            }
        };

        let state = TableState {
            schema: normalized.schema(),
            index: options.index,
            limit: options.limit,
            limit_index,
            computed: Vec::new(),
            views: IndexSet::new(),
            deleted: false,
        };
        let table = Table {
            inner: Rc::new(TableInner {
                id: Uuid::new_v4().to_string(),
                pool: pool.keep(),
                gnode: gnode.keep(),
                gnode_id,
                engine,
                settings: settings.clone(),
                state: RefCell::new(state),
                update_callbacks: CallbackRegistry::new(),
                delete_callbacks: CallbackRegistry::new(),
            }),
        };
        log::debug!(
            "Created table {} with {} row(s)",
            table.inner.id,
            normalized.row_count
        );
        Ok(table)
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn index(&self) -> Option<String> {
        self.inner.state.borrow().index.clone()
    }

    pub fn limit(&self) -> Option<usize> {
        self.inner.state.borrow().limit
    }

    pub fn limit_index(&self) -> usize {
        self.inner.state.borrow().limit_index
    }

    /// Applies `data` on top of the current rows.
    ///
    /// Input that does not normalize is an error; an engine failure is logged
    /// and the update skipped.
    pub fn update(&self, data: TableData) -> Result<()> {
        self.ensure_live()?;
        let schema = self.inner.state.borrow().schema.clone();
        let normalized = normalize(data, Some(&schema), &self.inner.settings)?;
        self.submit(normalized, false);
        Ok(())
    }

    /// Removes rows by primary key. Without an index this does nothing.
    pub fn remove(&self, keys: Vec<RawValue>) -> Result<()> {
        self.ensure_live()?;
        let Some(index) = self.index() else {
            log::warn!(
                "Table {} has no index; remove() ignored",
                self.inner.id
            );
            return Ok(());
        };

        let rows = keys
            .into_iter()
            .map(|key| {
                let mut row = IndexMap::new();
                row.insert(index.clone(), key);
                row
            })
            .collect();
        let schema = self.inner.state.borrow().schema.clone();
        let normalized = normalize(TableData::Rows(rows), Some(&schema), &self.inner.settings)?;
        self.submit(normalized, true);
        Ok(())
    }

    fn submit(&self, normalized: Normalized, is_delete: bool) {
        let rows = normalized.row_count;
        let (options, computed, start) = {
            let state = self.inner.state.borrow();
            (
                TableOptions {
                    index: state.index.clone(),
                    limit: state.limit,
                },
                state.computed.clone(),
                state.limit_index,
            )
        };

        let e: &dyn Engine = &*self.inner.engine;
        let result = (|| -> EngineResult<()> {
            let table = Scoped::new(e, e.create_table(batch_of(normalized, &options, start, is_delete))?);
            for def in &computed {
                e.add_computed_column(table.get(), def)?;
            }
            e.fill(self.inner.pool, self.inner.gnode_id, table.get())
        })();

        match result {
            Ok(()) => {
                {
                    let mut state = self.inner.state.borrow_mut();
                    state.limit_index = advance(state.limit_index, rows, state.limit);
                }
                self.inner.update_callbacks.notify(&());
            }
            Err(e) => log::error!("Skipping update of table {}: {}", self.inner.id, e),
        }
    }

    /// Derives a new table carrying every existing computed column plus `defs`.
    pub fn add_computed(&self, defs: Vec<ComputedColumn>) -> Result<Table> {
        self.ensure_live()?;
        for def in &defs {
            def.validate()?;
        }

        let (all, options, limit_index, schema) = {
            let state = self.inner.state.borrow();
            let mut all = state.computed.clone();
            all.extend(defs);
            (
                all,
                TableOptions {
                    index: state.index.clone(),
                    limit: state.limit,
                },
                state.limit_index,
                state.schema.clone(),
            )
        };

        let e: &dyn Engine = &*self.inner.engine;
        let snapshot = Scoped::new(e, e.clone_table_snapshot(self.inner.gnode)?);
        for def in &all {
            e.add_computed_column(snapshot.get(), def)?;
        }
        let pool = Scoped::new(e, e.create_pool());
        let gnode = Scoped::new(e, e.create_gnode(snapshot.get())?);
        let gnode_id = e.register_gnode(pool.get(), gnode.get())?;
        if let Err(err) = e.fill(pool.get(), gnode_id, snapshot.get()) {
            if let Err(e2) = e.unregister_gnode(pool.get(), gnode_id) {
                log::error!("Failed to unregister gnode {}: {}", gnode_id, e2);
            }
            return Err(err.into());
        }

        let table = Table {
            inner: Rc::new(TableInner {
                id: Uuid::new_v4().to_string(),
                engine: self.inner.engine.clone(),
                pool: pool.keep(),
                gnode: gnode.keep(),
                gnode_id,
                settings: self.inner.settings.clone(),
                state: RefCell::new(TableState {
                    schema,
                    index: options.index,
                    limit: options.limit,
                    limit_index,
                    computed: all,
                    views: IndexSet::new(),
                    deleted: false,
                }),
                update_callbacks: CallbackRegistry::new(),
                delete_callbacks: CallbackRegistry::new(),
            }),
        };
        Ok(table)
    }

    /// Deletes the table. Fails while any view is still attached.
    pub fn delete(&self) -> Result<()> {
        {
            let mut state = self.inner.state.borrow_mut();
            if !state.views.is_empty() {
                return Err(Error::TableHasViews {
                    table: self.inner.id.clone(),
                    views: state.views.len(),
                });
            }
            if state.deleted {
                return Ok(());
            }
            state.deleted = true;
        }

        release_node(
            &*self.inner.engine,
            self.inner.pool,
            self.inner.gnode,
            self.inner.gnode_id,
        );
        self.inner.update_callbacks.clear();
        self.inner.delete_callbacks.notify(&());
        self.inner.delete_callbacks.clear();
        log::debug!("Deleted table {}", self.inner.id);
        Ok(())
    }

    pub fn is_deleted(&self) -> bool {
        self.inner.state.borrow().deleted
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_deleted() {
            Err(Error::UnknownTable {
                name: self.inner.id.clone(),
            })
        } else {
            Ok(())
        }
    }

    /// Full schema, computed columns included.
    pub fn schema(&self) -> Result<Schema> {
        self.ensure_live()?;
        let mut schema = self.inner.engine.gnode_schema(self.inner.gnode)?;
        schema.shift_remove(ORDER_KEY);
        Ok(schema)
    }

    pub fn computed_schema(&self) -> Schema {
        self.inner
            .state
            .borrow()
            .computed
            .iter()
            .map(|c| (c.column.clone(), c.ty))
            .collect()
    }

    pub fn columns(&self) -> Result<Vec<String>> {
        Ok(self.schema()?.into_keys().collect())
    }

    pub fn column_metadata(&self) -> Result<Vec<ColumnMetadata>> {
        let schema = self.schema()?;
        let state = self.inner.state.borrow();
        Ok(schema
            .into_iter()
            .map(|(name, ty)| ColumnMetadata {
                is_index: state.index.as_deref() == Some(name.as_str()),
                is_computed: state.computed.iter().any(|c| c.column == name),
                name,
                ty,
            })
            .collect())
    }

    pub fn size(&self) -> Result<usize> {
        self.ensure_live()?;
        Ok(self.inner.engine.gnode_size(self.inner.gnode)?)
    }

    pub fn computed(&self) -> Vec<ComputedColumn> {
        self.inner.state.borrow().computed.clone()
    }

    /// Creates a view with a generated name.
    pub fn view(&self, config: ViewConfig) -> Result<View> {
        self.view_named(&Uuid::new_v4().to_string(), config)
    }

    pub fn view_named(&self, name: &str, config: ViewConfig) -> Result<View> {
        self.ensure_live()?;
        View::create(self.clone(), name, config)
    }

    pub fn view_names(&self) -> Vec<String> {
        self.inner.state.borrow().views.iter().cloned().collect()
    }

    pub fn num_views(&self) -> usize {
        self.inner.state.borrow().views.len()
    }

    /// Registers a callback fired after each successful update or removal.
    pub fn on_update<F>(&self, owner: Option<&str>, callback: F) -> u64
    where
        F: Fn() + 'static,
    {
        self.inner.update_callbacks.add(owner, move |_| callback())
    }

    pub fn remove_update(&self, id: u64) -> bool {
        self.inner.update_callbacks.remove(id)
    }

    /// Registers a callback fired once when the table is deleted.
    pub fn on_delete<F>(&self, callback: F) -> u64
    where
        F: Fn() + 'static,
    {
        self.inner.delete_callbacks.add(None, move |_| callback())
    }

    pub fn remove_delete(&self, id: u64) -> bool {
        self.inner.delete_callbacks.remove(id)
    }

    pub(crate) fn engine(&self) -> &Rc<dyn Engine> {
        &self.inner.engine
    }

    pub(crate) fn pool(&self) -> PoolHandle {
        self.inner.pool
    }

    pub(crate) fn gnode(&self) -> GNodeHandle {
        self.inner.gnode
    }

    pub(crate) fn gnode_id(&self) -> u32 {
        self.inner.gnode_id
    }

    pub(crate) fn attach_view(&self, name: &str) -> Result<()> {
        let mut state = self.inner.state.borrow_mut();
        if !state.views.insert(name.to_string()) {
            return Err(Error::DuplicateView {
                name: name.to_string(),
            });
        }
        Ok(())
    }

    pub(crate) fn has_view(&self, name: &str) -> bool {
        self.inner.state.borrow().views.contains(name)
    }

    /// Forgets a view and drops every update callback it owns.
    pub(crate) fn detach_view(&self, name: &str) {
        self.inner.state.borrow_mut().views.shift_remove(name);
        self.inner.update_callbacks.remove_owner(name);
    }
}

fn batch_of(normalized: Normalized, options: &TableOptions, start_index: usize, is_delete: bool) -> TableBatch {
    TableBatch {
        row_count: normalized.row_count,
        names: normalized.names,
        types: normalized.types,
        columns: normalized.columns,
        start_index,
        limit: options.limit,
        index: options.index.clone(),
        is_binary: normalized.is_binary,
        is_delete,
    }
}

/// Fills `normalized` in pages, each its own engine table. Returns the
/// resulting `limit_index`.
fn ingest(
    e: &dyn Engine,
    pool: PoolHandle,
    gnode_id: u32,
    normalized: &Normalized,
    options: &TableOptions,
    page_size: usize,
) -> EngineResult<usize> {
    let page_size = page_size.max(1);
    let mut limit_index = 0;
    let mut start = 0;
    while start < normalized.row_count {
        let end = (start + page_size).min(normalized.row_count);
        log::debug!("Ingesting rows {}..{} of {}", start, end, normalized.row_count);
        let page = Scoped::new(
            e,
            e.create_table(batch_of(normalized.page(start, end), options, limit_index, false))?,
        );
        e.fill(pool, gnode_id, page.get())?;
        limit_index = advance(limit_index, end - start, options.limit);
        start = end;
    }
    Ok(limit_index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::computed::Transform;
    use crate::engine::MemoryEngine;
    use serde_json::json;

    fn engine() -> Rc<MemoryEngine> {
        Rc::new(MemoryEngine::new())
    }

    fn data(value: serde_json::Value) -> TableData {
        TableData::from_json(value).unwrap()
    }

    fn create(engine: &Rc<MemoryEngine>, value: serde_json::Value, options: TableOptions) -> Result<Table> {
        Table::create(engine.clone(), data(value), options, &Settings::default())
    }

    #[test]
    fn test_create_infers_schema() {
        let e = engine();
        let table = create(&e, json!([{"x": 1, "y": "a"}, {"x": 2, "y": "b"}]), TableOptions::default()).unwrap();
        let schema = table.schema().unwrap();
        assert_eq!(schema.get("x"), Some(&LogicalType::Integer));
        assert_eq!(schema.get("y"), Some(&LogicalType::String));
        assert_eq!(table.columns().unwrap(), vec!["x", "y"]);
        assert_eq!(table.size().unwrap(), 2);
    }

    #[test]
    fn test_conflicting_options() {
        let e = engine();
        let err = create(
            &e,
            json!([{"x": 1}]),
            TableOptions {
                index: Some("x".to_string()),
                limit: Some(5),
            },
        )
        .unwrap_err();
        assert!(matches!(err, Error::ConflictingOptions { .. }));
        assert_eq!(e.live_handles(), 0);
    }

    #[test]
    fn test_unknown_index_column() {
        let e = engine();
        let err = create(
            &e,
            json!([{"x": 1}]),
            TableOptions {
                index: Some("nope".to_string()),
                limit: None,
            },
        )
        .unwrap_err();
        assert_eq!(
            err,
            Error::UnknownIndexColumn {
                column: "nope".to_string()
            }
        );
        assert_eq!(e.live_handles(), 0);
    }

    #[test]
    fn test_limit_index_wraps() {
        let e = engine();
        let table = create(
            &e,
            json!([{"x": 1}]),
            TableOptions {
                index: None,
                limit: Some(2),
            },
        )
        .unwrap();
        assert_eq!(table.limit_index(), 1);
        table.update(data(json!([{"x": 2}]))).unwrap();
        assert_eq!(table.limit_index(), 0);
        table.update(data(json!([{"x": 3}]))).unwrap();
        assert_eq!(table.limit_index(), 1);
        assert_eq!(table.size().unwrap(), 2);
    }

    #[test]
    fn test_paged_ingest() {
        let e = engine();
        let settings = Settings {
            page_size: 2,
            ..Settings::default()
        };
        let table = Table::create(
            e.clone(),
            data(json!([{"x": 1}, {"x": 2}, {"x": 3}, {"x": 4}, {"x": 5}])),
            TableOptions {
                index: None,
                limit: Some(3),
            },
            &settings,
        )
        .unwrap();
        assert_eq!(table.size().unwrap(), 3);
        assert_eq!(table.limit_index(), 2);
        // pool and graph node only
        assert_eq!(e.live_handles(), 2);
    }

    #[test]
    fn test_indexed_update_and_remove() {
        let e = engine();
        let table = create(
            &e,
            json!([{"k": 1, "v": "a"}, {"k": 2, "v": "b"}]),
            TableOptions {
                index: Some("k".to_string()),
                limit: None,
            },
        )
        .unwrap();
        table.update(data(json!([{"k": 2, "v": "B"}, {"k": 3, "v": "c"}]))).unwrap();
        assert_eq!(table.size().unwrap(), 3);
        table.remove(vec![RawValue::Number(1.0)]).unwrap();
        assert_eq!(table.size().unwrap(), 2);
    }

    #[test]
    fn test_remove_without_index_is_noop() {
        let e = engine();
        let table = create(&e, json!([{"x": 1}]), TableOptions::default()).unwrap();
        table.remove(vec![RawValue::Number(1.0)]).unwrap();
        assert_eq!(table.size().unwrap(), 1);
    }

    #[test]
    fn test_update_rejects_malformed_input() {
        let e = engine();
        let table = create(&e, json!([{"x": 1}]), TableOptions::default()).unwrap();
        assert!(matches!(
            table.update(data(json!({"x": "decimal"}))),
            Err(Error::UnknownType { .. })
        ));
    }

    #[test]
    fn test_update_callbacks_fire() {
        let e = engine();
        let table = create(&e, json!([{"x": 1}]), TableOptions::default()).unwrap();
        let count = Rc::new(std::cell::Cell::new(0));
        let c = count.clone();
        table.on_update(None, move || c.set(c.get() + 1));
        table.update(data(json!({"x": [2, 3]}))).unwrap();
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn test_add_computed_derives_table() {
        let e = engine();
        let table = create(
            &e,
            json!([{"a": 2, "b": 3}]),
            TableOptions {
                index: Some("a".to_string()),
                limit: None,
            },
        )
        .unwrap();
        let derived = table
            .add_computed(vec![ComputedColumn {
                column: "ab".to_string(),
                func: Transform::Multiply,
                inputs: vec!["a".to_string(), "b".to_string()],
                ty: LogicalType::Float,
            }])
            .unwrap();
        assert_ne!(derived.id(), table.id());
        assert_eq!(derived.index(), Some("a".to_string()));
        assert_eq!(derived.columns().unwrap(), vec!["a", "b", "ab"]);
        assert_eq!(
            derived.computed_schema().get("ab"),
            Some(&LogicalType::Float)
        );
        let meta = derived.column_metadata().unwrap();
        assert!(meta[0].is_index);
        assert!(meta[2].is_computed);

        derived.update(data(json!([{"a": 2, "b": 10}]))).unwrap();
        assert_eq!(derived.size().unwrap(), 1);
    }

    #[test]
    fn test_failed_add_computed_releases_handles() {
        let e = engine();
        let table = create(&e, json!([{"a": 2}]), TableOptions::default()).unwrap();
        let before = e.live_handles();
        let err = table
            .add_computed(vec![ComputedColumn {
                column: "bad".to_string(),
                func: Transform::Abs,
                inputs: vec!["missing".to_string()],
                ty: LogicalType::Float,
            }])
            .unwrap_err();
        assert!(matches!(err, Error::Engine { .. }));
        assert_eq!(e.live_handles(), before);
    }

    #[test]
    fn test_delete_releases_and_notifies_once() {
        let e = engine();
        let table = create(&e, json!([{"x": 1}]), TableOptions::default()).unwrap();
        let count = Rc::new(std::cell::Cell::new(0));
        let c = count.clone();
        table.on_delete(move || c.set(c.get() + 1));
        table.delete().unwrap();
        table.delete().unwrap();
        assert_eq!(count.get(), 1);
        assert_eq!(e.live_handles(), 0);
        assert!(matches!(table.size(), Err(Error::UnknownTable { .. })));
    }

    #[test]
    fn test_drop_releases_handles() {
        let e = engine();
        {
            let _table = create(&e, json!([{"x": 1}]), TableOptions::default()).unwrap();
            assert_eq!(e.live_handles(), 2);
        }
        assert_eq!(e.live_handles(), 0);
    }
}
