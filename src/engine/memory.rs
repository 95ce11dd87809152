//! Reference in-memory engine.
//!
//! Graph nodes keep rows columnar by slot; contexts are rendered from the live
//! slots on demand and cached until the next mutation. Step deltas come from
//! diffing each registered context before and after a fill.

use std::cell::RefCell;
use std::collections::HashMap;

use indexmap::IndexMap;

use super::pivot::{self, Expansion, Frame, Rendered};
use super::{
    ContextHandle, ContextSpec, DataSlice, Engine, EngineError, EngineResult, GNodeHandle, Header,
    PoolHandle, Sides, SortSpec, TableBatch, TableHandle, ORDER_KEY,
};
use crate::computed::ComputedColumn;
use crate::value::{LogicalType, Scalar, ScalarKey, Schema};

fn invalid(handle: &str, id: u32) -> EngineError {
    EngineError::InvalidHandle {
        handle: handle.to_string(),
        id,
    }
}

#[derive(Default)]
struct PoolState {
    /// gnode id -> gnode handle id
    gnodes: HashMap<u32, u32>,
}

struct TableState {
    batch: TableBatch,
    computed: Vec<ComputedColumn>,
}

struct GNodeState {
    names: Vec<String>,
    types: Vec<LogicalType>,
    /// Leading columns that hold input data; computed columns and the order
    /// key follow.
    stored: usize,
    computed: Vec<ComputedColumn>,
    columns: Vec<Vec<Scalar>>,
    live: Vec<bool>,
    keys: HashMap<ScalarKey, usize>,
    index: Option<String>,
    limit: Option<usize>,
    contexts: IndexMap<String, u32>,
}

impl GNodeState {
    fn live_slots(&self) -> Vec<usize> {
        self.live
            .iter()
            .enumerate()
            .filter(|(_, live)| **live)
            .map(|(slot, _)| slot)
            .collect()
    }

    fn allocate(&mut self) -> usize {
        for column in &mut self.columns {
            column.push(Scalar::Null);
        }
        self.live.push(true);
        self.live.len() - 1
    }

    fn reset(&mut self, slot: usize) {
        while self.live.len() <= slot {
            self.allocate();
        }
        for column in &mut self.columns {
            column[slot] = Scalar::Null;
        }
        self.live[slot] = true;
    }

    fn apply(&mut self, batch: &TableBatch) -> EngineResult<()> {
        if batch.index.is_some() {
            self.index = batch.index.clone();
        }
        if batch.limit.is_some() {
            self.limit = batch.limit;
        }

        let key_column = match &batch.index {
            Some(name) => Some(batch.names.iter().position(|n| n == name).ok_or_else(|| {
                EngineError::UnknownColumn {
                    column: name.clone(),
                }
            })?),
            None => None,
        };

        if batch.is_delete {
            let key_column = key_column.ok_or_else(|| EngineError::InvalidBatch {
                reason: "delete batches need an index column".to_string(),
            })?;
            for key in batch.columns[key_column].iter().flatten() {
                if let Some(slot) = self.keys.remove(&key.key()) {
                    self.live[slot] = false;
                }
            }
            return Ok(());
        }

        let targets: Vec<Option<usize>> = batch
            .names
            .iter()
            .map(|name| self.names[..self.stored].iter().position(|n| n == name))
            .collect();
        let okey = self.names.len() - 1;

        let mut touched = Vec::with_capacity(batch.row_count);
        for row in 0..batch.row_count {
            let slot = match (key_column, batch.limit) {
                (Some(k), _) => {
                    let Some(key) = batch.columns[k].get(row).cloned().flatten() else {
                        log::warn!("Skipping row {} without an index value", row);
                        continue;
                    };
                    match self.keys.get(&key.key()) {
                        Some(&slot) => slot,
                        None => {
                            let slot = self.allocate();
                            self.keys.insert(key.key(), slot);
                            slot
                        }
                    }
                }
                (None, Some(limit)) if limit > 0 => {
                    let slot = (batch.start_index + row) % limit;
                    self.reset(slot);
                    slot
                }
                _ => self.allocate(),
            };

            for (column, target) in targets.iter().enumerate() {
                if let (Some(target), Some(Some(value))) = (target, batch.columns[column].get(row)) {
                    self.columns[*target][slot] = value.clone();
                }
            }
            self.columns[okey][slot] = Scalar::Integer(slot as i32);
            touched.push(slot);
        }

        self.evaluate_computed(&touched);
        Ok(())
    }

    fn evaluate_computed(&mut self, slots: &[usize]) {
        for (offset, def) in self.computed.iter().enumerate() {
            let target = self.stored + offset;
            let inputs: Vec<usize> = def
                .inputs
                .iter()
                .filter_map(|name| self.names.iter().position(|n| n == name))
                .collect();
            for &slot in slots {
                let args: Vec<Scalar> = inputs
                    .iter()
                    .map(|&ix| self.columns[ix][slot].clone())
                    .collect();
                self.columns[target][slot] = def.evaluate(&args);
            }
        }
    }
}

struct ContextState {
    gnode: u32,
    spec: ContextSpec,
    sort: Vec<SortSpec>,
    rows: Expansion,
    columns: Expansion,
    cache: Option<Rendered>,
    registered: Option<String>,
    pending: Vec<usize>,
}

fn render_context(gnode: &GNodeState, ctx: &ContextState) -> EngineResult<Rendered> {
    let frame = Frame {
        names: &gnode.names,
        columns: &gnode.columns,
        rows: gnode.live_slots(),
    };
    pivot::render(&frame, &ctx.spec, &ctx.sort, &ctx.rows, &ctx.columns)
}

#[derive(Default)]
struct Registry {
    next_id: u32,
    pools: HashMap<u32, PoolState>,
    tables: HashMap<u32, TableState>,
    gnodes: HashMap<u32, GNodeState>,
    contexts: HashMap<u32, ContextState>,
}

impl Registry {
    fn next(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    fn gnode_for(&self, pool: PoolHandle, gnode_id: u32) -> EngineResult<u32> {
        self.pools
            .get(&pool.0)
            .ok_or_else(|| invalid("pool", pool.0))?
            .gnodes
            .get(&gnode_id)
            .copied()
            .ok_or_else(|| invalid("gnode id", gnode_id))
    }

    fn gnode_by_id(&self, gnode_id: u32) -> EngineResult<u32> {
        self.pools
            .values()
            .find_map(|pool| pool.gnodes.get(&gnode_id).copied())
            .ok_or_else(|| invalid("gnode id", gnode_id))
    }

    fn context_mut(&mut self, ctx: ContextHandle) -> EngineResult<&mut ContextState> {
        self.contexts
            .get_mut(&ctx.0)
            .ok_or_else(|| invalid("context", ctx.0))
    }

    fn rendered(&mut self, ctx: ContextHandle) -> EngineResult<&Rendered> {
        let Registry {
            gnodes, contexts, ..
        } = self;
        let state = contexts
            .get_mut(&ctx.0)
            .ok_or_else(|| invalid("context", ctx.0))?;
        let rendered = match state.cache.take() {
            Some(rendered) => rendered,
            None => {
                let gnode = gnodes
                    .get(&state.gnode)
                    .ok_or_else(|| invalid("gnode", state.gnode))?;
                render_context(gnode, state)?
            }
        };
        Ok(state.cache.insert(rendered))
    }
}

/// Single-threaded reference implementation of [`Engine`].
#[derive(Default)]
pub struct MemoryEngine {
    registry: RefCell<Registry>,
    no_deltas: bool,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// An engine whose `step_delta` never reports changed rows.
    pub fn without_deltas() -> Self {
        MemoryEngine {
            no_deltas: true,
            ..Self::default()
        }
    }

    /// Number of handles not yet released.
    pub fn live_handles(&self) -> usize {
        let reg = self.registry.borrow();
        reg.pools.len() + reg.tables.len() + reg.gnodes.len() + reg.contexts.len()
    }
}

impl Engine for MemoryEngine {
    fn create_pool(&self) -> PoolHandle {
        let mut reg = self.registry.borrow_mut();
        let id = reg.next();
        reg.pools.insert(id, PoolState::default());
        PoolHandle(id)
    }

    fn create_table(&self, batch: TableBatch) -> EngineResult<TableHandle> {
        if batch.names.len() != batch.types.len() || batch.names.len() != batch.columns.len() {
            return Err(EngineError::InvalidBatch {
                reason: "names, types and columns differ in length".to_string(),
            });
        }
        if let Some(ix) = batch.columns.iter().position(|c| c.len() != batch.row_count) {
            return Err(EngineError::InvalidBatch {
                reason: format!(
                    "column '{}' has {} rows, expected {}",
                    batch.names[ix],
                    batch.columns[ix].len(),
                    batch.row_count
                ),
            });
        }

        let mut reg = self.registry.borrow_mut();
        let id = reg.next();
        reg.tables.insert(
            id,
            TableState {
                batch,
                computed: Vec::new(),
            },
        );
        Ok(TableHandle(id))
    }

    fn add_computed_column(&self, table: TableHandle, column: &ComputedColumn) -> EngineResult<()> {
        let mut reg = self.registry.borrow_mut();
        let state = reg
            .tables
            .get_mut(&table.0)
            .ok_or_else(|| invalid("table", table.0))?;
        state.computed.retain(|c| c.column != column.column);
        state.computed.push(column.clone());
        Ok(())
    }

    fn create_gnode(&self, table: TableHandle) -> EngineResult<GNodeHandle> {
        let mut reg = self.registry.borrow_mut();
        let state = reg.tables.get(&table.0).ok_or_else(|| invalid("table", table.0))?;

        let mut names: Vec<String> = state
            .batch
            .names
            .iter()
            .filter(|n| n.as_str() != ORDER_KEY)
            .cloned()
            .collect();
        let mut types: Vec<LogicalType> = state
            .batch
            .names
            .iter()
            .zip(&state.batch.types)
            .filter(|(n, _)| n.as_str() != ORDER_KEY)
            .map(|(_, t)| *t)
            .collect();
        let stored = names.len();

        for def in &state.computed {
            if let Some(missing) = def.inputs.iter().find(|i| !names.contains(i)) {
                return Err(EngineError::UnknownColumn {
                    column: missing.clone(),
                });
            }
            if names.contains(&def.column) || def.column == ORDER_KEY {
                return Err(EngineError::InvalidBatch {
                    reason: format!("computed column '{}' already exists", def.column),
                });
            }
            names.push(def.column.clone());
            types.push(def.ty);
        }
        names.push(ORDER_KEY.to_string());
        types.push(LogicalType::Integer);

        let gnode = GNodeState {
            columns: vec![Vec::new(); names.len()],
            names,
            types,
            stored,
            computed: state.computed.clone(),
            live: Vec::new(),
            keys: HashMap::new(),
            index: state.batch.index.clone(),
            limit: state.batch.limit,
            contexts: IndexMap::new(),
        };
        let id = reg.next();
        reg.gnodes.insert(id, gnode);
        Ok(GNodeHandle(id))
    }

    fn register_gnode(&self, pool: PoolHandle, gnode: GNodeHandle) -> EngineResult<u32> {
        let mut reg = self.registry.borrow_mut();
        if !reg.gnodes.contains_key(&gnode.0) {
            return Err(invalid("gnode", gnode.0));
        }
        let gnode_id = reg.next();
        reg.pools
            .get_mut(&pool.0)
            .ok_or_else(|| invalid("pool", pool.0))?
            .gnodes
            .insert(gnode_id, gnode.0);
        Ok(gnode_id)
    }

    fn unregister_gnode(&self, pool: PoolHandle, gnode_id: u32) -> EngineResult<()> {
        let mut reg = self.registry.borrow_mut();
        reg.pools
            .get_mut(&pool.0)
            .ok_or_else(|| invalid("pool", pool.0))?
            .gnodes
            .remove(&gnode_id)
            .map(|_| ())
            .ok_or_else(|| invalid("gnode id", gnode_id))
    }

    fn fill(&self, pool: PoolHandle, gnode_id: u32, table: TableHandle) -> EngineResult<()> {
        let mut reg = self.registry.borrow_mut();
        let gnode_key = reg.gnode_for(pool, gnode_id)?;
        let Registry {
            tables,
            gnodes,
            contexts,
            ..
        } = &mut *reg;

        let batch = &tables.get(&table.0).ok_or_else(|| invalid("table", table.0))?.batch;
        let gnode = gnodes
            .get_mut(&gnode_key)
            .ok_or_else(|| invalid("gnode", gnode_key))?;

        let registered: Vec<u32> = gnode.contexts.values().copied().collect();
        let mut before = Vec::with_capacity(registered.len());
        for ctx_id in &registered {
            if let Some(ctx) = contexts.get(ctx_id) {
                before.push((*ctx_id, render_context(gnode, ctx)));
            }
        }

        gnode.apply(batch)?;
        log::debug!(
            "Filled gnode {} with {} row(s), {} live",
            gnode_id,
            batch.row_count,
            gnode.live.iter().filter(|l| **l).count()
        );

        for (ctx_id, previous) in before {
            let Some(ctx) = contexts.get_mut(&ctx_id) else {
                continue;
            };
            ctx.cache = None;
            match (previous, render_context(gnode, ctx)) {
                (Ok(previous), Ok(current)) => {
                    ctx.pending.extend(current.changed_since(&previous));
                    ctx.cache = Some(current);
                }
                (_, Err(e)) | (Err(e), _) => {
                    log::error!("Context {} failed to render after fill: {}", ctx_id, e);
                }
            }
        }
        Ok(())
    }

    fn clone_table_snapshot(&self, gnode: GNodeHandle) -> EngineResult<TableHandle> {
        let mut reg = self.registry.borrow_mut();
        let state = reg.gnodes.get(&gnode.0).ok_or_else(|| invalid("gnode", gnode.0))?;
        let slots = state.live_slots();
        let batch = TableBatch {
            row_count: slots.len(),
            names: state.names[..state.stored].to_vec(),
            types: state.types[..state.stored].to_vec(),
            columns: state.columns[..state.stored]
                .iter()
                .map(|column| slots.iter().map(|&s| Some(column[s].clone())).collect())
                .collect(),
            start_index: 0,
            limit: state.limit,
            index: state.index.clone(),
            is_binary: false,
            is_delete: false,
        };
        let id = reg.next();
        reg.tables.insert(
            id,
            TableState {
                batch,
                computed: Vec::new(),
            },
        );
        Ok(TableHandle(id))
    }

    fn gnode_schema(&self, gnode: GNodeHandle) -> EngineResult<Schema> {
        let reg = self.registry.borrow();
        let state = reg.gnodes.get(&gnode.0).ok_or_else(|| invalid("gnode", gnode.0))?;
        Ok(state
            .names
            .iter()
            .cloned()
            .zip(state.types.iter().copied())
            .collect())
    }

    fn gnode_size(&self, gnode: GNodeHandle) -> EngineResult<usize> {
        let reg = self.registry.borrow();
        let state = reg.gnodes.get(&gnode.0).ok_or_else(|| invalid("gnode", gnode.0))?;
        Ok(state.live.iter().filter(|l| **l).count())
    }

    fn create_context(&self, gnode: GNodeHandle, spec: &ContextSpec) -> EngineResult<ContextHandle> {
        let mut reg = self.registry.borrow_mut();
        let state = reg.gnodes.get(&gnode.0).ok_or_else(|| invalid("gnode", gnode.0))?;
        let mut ctx = ContextState {
            gnode: gnode.0,
            spec: spec.clone(),
            sort: Vec::new(),
            rows: Expansion::default(),
            columns: Expansion::default(),
            cache: None,
            registered: None,
            pending: Vec::new(),
        };
        ctx.cache = Some(render_context(state, &ctx)?);
        let id = reg.next();
        reg.contexts.insert(id, ctx);
        Ok(ContextHandle(id))
    }

    fn register_context(
        &self,
        pool: PoolHandle,
        gnode_id: u32,
        name: &str,
        sides: Sides,
        context: ContextHandle,
    ) -> EngineResult<()> {
        let mut reg = self.registry.borrow_mut();
        let gnode_key = reg.gnode_for(pool, gnode_id)?;
        let ctx = reg
            .contexts
            .get(&context.0)
            .ok_or_else(|| invalid("context", context.0))?;
        if ctx.spec.sides != sides {
            return Err(EngineError::Unsupported {
                reason: format!("context was built {:?}-sided, registered as {:?}", ctx.spec.sides, sides),
            });
        }
        let gnode = reg
            .gnodes
            .get_mut(&gnode_key)
            .ok_or_else(|| invalid("gnode", gnode_key))?;
        if gnode.contexts.contains_key(name) {
            return Err(EngineError::DuplicateContext {
                name: name.to_string(),
            });
        }
        gnode.contexts.insert(name.to_string(), context.0);
        reg.context_mut(context)?.registered = Some(name.to_string());
        Ok(())
    }

    fn unregister_context(&self, gnode_id: u32, name: &str) -> EngineResult<()> {
        let mut reg = self.registry.borrow_mut();
        let gnode_key = reg.gnode_by_id(gnode_id)?;
        let ctx_id = reg
            .gnodes
            .get_mut(&gnode_key)
            .ok_or_else(|| invalid("gnode", gnode_key))?
            .contexts
            .shift_remove(name)
            .ok_or_else(|| EngineError::Unsupported {
                reason: format!("no context named '{}'", name),
            })?;
        if let Some(ctx) = reg.contexts.get_mut(&ctx_id) {
            ctx.registered = None;
            ctx.pending.clear();
        }
        Ok(())
    }

    fn sort(&self, context: ContextHandle, sort: &[SortSpec]) -> EngineResult<()> {
        let mut reg = self.registry.borrow_mut();
        let ctx = reg.context_mut(context)?;
        ctx.sort = sort.to_vec();
        ctx.cache = None;
        Ok(())
    }

    fn open(&self, context: ContextHandle, header: Header, row: usize) -> EngineResult<()> {
        set_open(self, context, header, row, true)
    }

    fn close(&self, context: ContextHandle, header: Header, row: usize) -> EngineResult<()> {
        set_open(self, context, header, row, false)
    }

    fn expand_to_depth(&self, context: ContextHandle, header: Header, depth: usize) -> EngineResult<()> {
        set_depth(self, context, header, depth)
    }

    fn collapse_to_depth(&self, context: ContextHandle, header: Header, depth: usize) -> EngineResult<()> {
        set_depth(self, context, header, depth)
    }

    fn unity_column_count(&self, context: ContextHandle) -> EngineResult<usize> {
        Ok(self.registry.borrow_mut().rendered(context)?.unity)
    }

    fn row_count(&self, context: ContextHandle) -> EngineResult<usize> {
        Ok(self.registry.borrow_mut().rendered(context)?.rows.len())
    }

    fn column_count(&self, context: ContextHandle) -> EngineResult<usize> {
        Ok(self.registry.borrow_mut().rendered(context)?.column_count())
    }

    fn step_delta(&self, context: ContextHandle, start: usize, end: usize) -> EngineResult<Option<Vec<usize>>> {
        let mut reg = self.registry.borrow_mut();
        let ctx = reg.context_mut(context)?;
        if ctx.registered.is_none() || self.no_deltas {
            ctx.pending.clear();
            return Ok(None);
        }
        let mut rows: Vec<usize> = std::mem::take(&mut ctx.pending)
            .into_iter()
            .filter(|r| (start..end).contains(r))
            .collect();
        rows.sort_unstable();
        rows.dedup();
        Ok(Some(rows))
    }

    fn data_slice(
        &self,
        context: ContextHandle,
        start_row: usize,
        end_row: usize,
        start_col: usize,
        end_col: usize,
    ) -> EngineResult<DataSlice> {
        let mut reg = self.registry.borrow_mut();
        let rendered = reg.rendered(context)?;
        let end_row = end_row.min(rendered.rows.len());
        let end_col = end_col.min(rendered.column_count());
        let start_row = start_row.min(end_row);
        let start_col = start_col.min(end_col);

        let mut values = Vec::with_capacity((end_row - start_row) * (end_col - start_col));
        for row in &rendered.rows[start_row..end_row] {
            values.extend(row.cells[start_col..end_col].iter().cloned());
        }
        Ok(DataSlice {
            rows: end_row - start_row,
            cols: end_col - start_col,
            values,
        })
    }

    fn row_path(&self, context: ContextHandle, row: usize) -> EngineResult<Vec<Scalar>> {
        let mut reg = self.registry.borrow_mut();
        let rendered = reg.rendered(context)?;
        rendered
            .rows
            .get(row)
            .map(|r| r.path.clone())
            .ok_or(EngineError::OutOfRange {
                index: row,
                len: rendered.rows.len(),
            })
    }

    fn column_path(&self, context: ContextHandle, col: usize) -> EngineResult<Vec<Scalar>> {
        let mut reg = self.registry.borrow_mut();
        let rendered = reg.rendered(context)?;
        let data_col = if rendered.header {
            match col.checked_sub(1) {
                Some(c) => c,
                None => return Ok(Vec::new()),
            }
        } else {
            col
        };
        rendered
            .column_paths
            .get(data_col)
            .cloned()
            .ok_or(EngineError::OutOfRange {
                index: col,
                len: rendered.column_count(),
            })
    }

    fn release_pool(&self, pool: PoolHandle) {
        if self.registry.borrow_mut().pools.remove(&pool.0).is_none() {
            log::debug!("Release of unknown pool {}", pool.0);
        }
    }

    fn release_table(&self, table: TableHandle) {
        if self.registry.borrow_mut().tables.remove(&table.0).is_none() {
            log::debug!("Release of unknown table {}", table.0);
        }
    }

    fn release_gnode(&self, gnode: GNodeHandle) {
        if self.registry.borrow_mut().gnodes.remove(&gnode.0).is_none() {
            log::debug!("Release of unknown gnode {}", gnode.0);
        }
    }

    fn release_context(&self, context: ContextHandle) {
        let mut reg = self.registry.borrow_mut();
        let Some(ctx) = reg.contexts.remove(&context.0) else {
            log::debug!("Release of unknown context {}", context.0);
            return;
        };
        if let (Some(name), Some(gnode)) = (ctx.registered, reg.gnodes.get_mut(&ctx.gnode)) {
            gnode.contexts.shift_remove(&name);
        }
    }
}

fn set_open(engine: &MemoryEngine, context: ContextHandle, header: Header, row: usize, open: bool) -> EngineResult<()> {
    if header == Header::Column {
        return Err(EngineError::Unsupported {
            reason: "column headers expand by depth only".to_string(),
        });
    }
    let mut reg = engine.registry.borrow_mut();
    let rendered = reg.rendered(context)?;
    let path = rendered
        .rows
        .get(row)
        .map(|r| r.path.clone())
        .ok_or(EngineError::OutOfRange {
            index: row,
            len: rendered.rows.len(),
        })?;
    let ctx = reg.context_mut(context)?;
    ctx.rows.set_open(&path, open);
    ctx.cache = None;
    Ok(())
}

fn set_depth(engine: &MemoryEngine, context: ContextHandle, header: Header, depth: usize) -> EngineResult<()> {
    let mut reg = engine.registry.borrow_mut();
    let ctx = reg.context_mut(context)?;
    match header {
        Header::Row => ctx.rows.set_depth(depth),
        Header::Column => ctx.columns.set_depth(depth),
    }
    ctx.cache = None;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::computed::Transform;
    use crate::engine::{AggOp, AggregateSpec, FilterOp};

    fn batch(keys: &[i32], values: &[&str]) -> TableBatch {
        TableBatch {
            row_count: keys.len(),
            names: vec!["k".to_string(), "v".to_string()],
            types: vec![LogicalType::Integer, LogicalType::String],
            columns: vec![
                keys.iter().map(|k| Some(Scalar::Integer(*k))).collect(),
                values.iter().map(|v| Some(Scalar::String(v.to_string()))).collect(),
            ],
            start_index: 0,
            limit: None,
            index: None,
            is_binary: false,
            is_delete: false,
        }
    }

    fn flat_spec() -> ContextSpec {
        ContextSpec {
            sides: Sides::Zero,
            row_pivots: Vec::new(),
            column_pivots: Vec::new(),
            filter_op: FilterOp::And,
            filters: Vec::new(),
            aggregates: vec![
                AggregateSpec {
                    name: "k".to_string(),
                    op: AggOp::Any,
                    columns: vec!["k".to_string()],
                },
                AggregateSpec {
                    name: "v".to_string(),
                    op: AggOp::Any,
                    columns: vec!["v".to_string()],
                },
            ],
        }
    }

    struct Fixture {
        engine: MemoryEngine,
        pool: PoolHandle,
        gnode: GNodeHandle,
        gnode_id: u32,
    }

    fn fixture(first: TableBatch) -> Fixture {
        let engine = MemoryEngine::new();
        let pool = engine.create_pool();
        let table = engine.create_table(first).unwrap();
        let gnode = engine.create_gnode(table).unwrap();
        let gnode_id = engine.register_gnode(pool, gnode).unwrap();
        engine.fill(pool, gnode_id, table).unwrap();
        engine.release_table(table);
        Fixture {
            engine,
            pool,
            gnode,
            gnode_id,
        }
    }

    impl Fixture {
        fn fill(&self, batch: TableBatch) {
            let table = self.engine.create_table(batch).unwrap();
            self.engine.fill(self.pool, self.gnode_id, table).unwrap();
            self.engine.release_table(table);
        }
    }

    #[test]
    fn test_schema_carries_order_key() {
        let f = fixture(batch(&[1], &["a"]));
        let schema = f.engine.gnode_schema(f.gnode).unwrap();
        assert_eq!(
            schema.keys().collect::<Vec<_>>(),
            vec!["k", "v", ORDER_KEY]
        );
    }

    #[test]
    fn test_indexed_upsert_and_delete() {
        let mut first = batch(&[1, 2], &["a", "b"]);
        first.index = Some("k".to_string());
        let f = fixture(first);

        let mut update = batch(&[2, 3], &["B", "c"]);
        update.index = Some("k".to_string());
        f.fill(update);
        assert_eq!(f.engine.gnode_size(f.gnode).unwrap(), 3);

        let mut remove = batch(&[1], &[""]);
        remove.index = Some("k".to_string());
        remove.is_delete = true;
        f.fill(remove);
        assert_eq!(f.engine.gnode_size(f.gnode).unwrap(), 2);

        let ctx = f.engine.create_context(f.gnode, &flat_spec()).unwrap();
        let slice = f.engine.data_slice(ctx, 0, 10, 0, 10).unwrap();
        assert_eq!(slice.rows, 2);
        assert_eq!(slice.get(0, 1), Some(&Scalar::String("B".into())));
        f.engine.release_context(ctx);
    }

    #[test]
    fn test_limit_wraps_around() {
        let mut first = batch(&[1, 2], &["a", "b"]);
        first.limit = Some(2);
        let f = fixture(first);

        let mut next = batch(&[3], &["c"]);
        next.limit = Some(2);
        next.start_index = 0;
        f.fill(next);
        assert_eq!(f.engine.gnode_size(f.gnode).unwrap(), 2);

        let ctx = f.engine.create_context(f.gnode, &flat_spec()).unwrap();
        let slice = f.engine.data_slice(ctx, 0, 2, 0, 1).unwrap();
        assert_eq!(slice.values, vec![Scalar::Integer(3), Scalar::Integer(2)]);
        f.engine.release_context(ctx);
    }

    #[test]
    fn test_undefined_cells_keep_values() {
        let mut first = batch(&[1], &["a"]);
        first.index = Some("k".to_string());
        let f = fixture(first);

        let mut partial = batch(&[1], &["ignored"]);
        partial.index = Some("k".to_string());
        partial.columns[1] = vec![None];
        f.fill(partial);

        let ctx = f.engine.create_context(f.gnode, &flat_spec()).unwrap();
        let slice = f.engine.data_slice(ctx, 0, 1, 1, 2).unwrap();
        assert_eq!(slice.values, vec![Scalar::String("a".into())]);
        f.engine.release_context(ctx);
    }

    #[test]
    fn test_computed_columns_from_snapshot() {
        let f = fixture(batch(&[2, 3], &["a", "b"]));
        let snapshot = f.engine.clone_table_snapshot(f.gnode).unwrap();
        f.engine
            .add_computed_column(
                snapshot,
                &ComputedColumn {
                    column: "sq".to_string(),
                    func: Transform::Pow2,
                    inputs: vec!["k".to_string()],
                    ty: LogicalType::Float,
                },
            )
            .unwrap();
        let derived = f.engine.create_gnode(snapshot).unwrap();
        let derived_id = f.engine.register_gnode(f.pool, derived).unwrap();
        f.engine.fill(f.pool, derived_id, snapshot).unwrap();
        f.engine.release_table(snapshot);

        let mut spec = flat_spec();
        spec.aggregates[1].columns = vec!["sq".to_string()];
        let ctx = f.engine.create_context(derived, &spec).unwrap();
        let slice = f.engine.data_slice(ctx, 0, 2, 1, 2).unwrap();
        assert_eq!(slice.values, vec![Scalar::Float(4.0), Scalar::Float(9.0)]);
        f.engine.release_context(ctx);
    }

    #[test]
    fn test_step_delta_tracks_registered_contexts() {
        let mut first = batch(&[1, 2], &["a", "b"]);
        first.index = Some("k".to_string());
        let f = fixture(first);
        let ctx = f.engine.create_context(f.gnode, &flat_spec()).unwrap();
        assert_eq!(f.engine.step_delta(ctx, 0, 10).unwrap(), None);

        f.engine
            .register_context(f.pool, f.gnode_id, "v1", Sides::Zero, ctx)
            .unwrap();
        assert!(matches!(
            f.engine.register_context(f.pool, f.gnode_id, "v1", Sides::Zero, ctx),
            Err(EngineError::DuplicateContext { .. })
        ));

        let mut update = batch(&[2], &["changed"]);
        update.index = Some("k".to_string());
        f.fill(update);
        assert_eq!(f.engine.step_delta(ctx, 0, 10).unwrap(), Some(vec![1]));
        assert_eq!(f.engine.step_delta(ctx, 0, 10).unwrap(), Some(vec![]));

        f.engine.unregister_context(f.gnode_id, "v1").unwrap();
        f.engine.release_context(ctx);
    }

    #[test]
    fn test_release_everything() {
        let f = fixture(batch(&[1], &["a"]));
        let ctx = f.engine.create_context(f.gnode, &flat_spec()).unwrap();
        f.engine.release_context(ctx);
        f.engine.unregister_gnode(f.pool, f.gnode_id).unwrap();
        f.engine.release_gnode(f.gnode);
        f.engine.release_pool(f.pool);
        assert_eq!(f.engine.live_handles(), 0);
    }

    #[test]
    fn test_invalid_handles() {
        let engine = MemoryEngine::new();
        assert!(matches!(
            engine.gnode_size(GNodeHandle(42)),
            Err(EngineError::InvalidHandle { .. })
        ));
        let mut bad = batch(&[1, 2], &["a", "b"]);
        bad.columns[1].pop();
        assert!(matches!(
            engine.create_table(bad),
            Err(EngineError::InvalidBatch { .. })
        ));
    }
}
