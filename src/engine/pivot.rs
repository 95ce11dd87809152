//! Context rendering for the in-memory engine.
//!
//! A context is recomputed from the live rows of its graph node on every read:
//! filter, group into a row tree (and column groups for two-sided contexts),
//! aggregate, sort siblings and flatten the expanded part of the tree.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use indexmap::IndexMap;

use super::{
    AggOp, AggregateSpec, ContextSpec, EngineError, EngineResult, FilterOp, FilterOperator,
    FilterSpec, Sides, SortOrder, SortSpec,
};
use crate::value::{Scalar, ScalarKey};

/// Live rows of a graph node, columnar by slot.
pub(crate) struct Frame<'a> {
    pub names: &'a [String],
    pub columns: &'a [Vec<Scalar>],
    pub rows: Vec<usize>,
}

impl<'a> Frame<'a> {
    fn column(&self, name: &str) -> EngineResult<&'a [Scalar]> {
        let columns: &'a [Vec<Scalar>] = self.columns;
        self.names
            .iter()
            .position(|n| n == name)
            .map(|ix| columns[ix].as_slice())
            .ok_or_else(|| EngineError::UnknownColumn {
                column: name.to_string(),
            })
    }
}

/// Expansion state of one header axis.
#[derive(Debug, Clone, Default)]
pub(crate) struct Expansion {
    pub depth: Option<usize>,
    pub overrides: HashMap<Vec<ScalarKey>, bool>,
}

impl Expansion {
    pub fn set_depth(&mut self, depth: usize) {
        self.depth = Some(depth);
        self.overrides.clear();
    }

    pub fn set_open(&mut self, path: &[Scalar], open: bool) {
        self.overrides
            .insert(path.iter().map(Scalar::key).collect(), open);
    }

    fn is_expanded(&self, path: &[Scalar], levels: usize) -> bool {
        if path.len() >= levels {
            return false;
        }
        let key: Vec<ScalarKey> = path.iter().map(Scalar::key).collect();
        self.overrides
            .get(&key)
            .copied()
            .unwrap_or_else(|| path.len() < self.depth.unwrap_or(levels))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RenderedRow {
    pub path: Vec<Scalar>,
    pub cells: Vec<Scalar>,
}

/// Flattened, viewport-independent result of a context.
#[derive(Debug, Clone, PartialEq, Default)]
pub(crate) struct Rendered {
    pub header: bool,
    pub unity: usize,
    pub rows: Vec<RenderedRow>,
    /// Leaf-first column-pivot path per data column.
    pub column_paths: Vec<Vec<Scalar>>,
}

impl Rendered {
    pub fn column_count(&self) -> usize {
        self.unity + usize::from(self.header)
    }

    /// Indices of rows that differ from `before`.
    pub fn changed_since(&self, before: &Rendered) -> Vec<usize> {
        self.rows
            .iter()
            .enumerate()
            .filter(|(ix, row)| before.rows.get(*ix) != Some(*row))
            .map(|(ix, _)| ix)
            .collect()
    }
}

pub(crate) fn render(
    frame: &Frame<'_>,
    spec: &ContextSpec,
    sort: &[SortSpec],
    rows_expansion: &Expansion,
    columns_expansion: &Expansion,
) -> EngineResult<Rendered> {
    let filtered = apply_filters(frame, spec.filter_op, &spec.filters)?;
    let aggregates = resolve_aggregates(frame, &spec.aggregates)?;

    match spec.sides {
        Sides::Zero => render_flat(&filtered, &aggregates, sort),
        Sides::One | Sides::Two => {
            let row_pivots = spec
                .row_pivots
                .iter()
                .map(|name| frame.column(name))
                .collect::<EngineResult<Vec<_>>>()?;
            let column_pivots = spec
                .column_pivots
                .iter()
                .map(|name| frame.column(name))
                .collect::<EngineResult<Vec<_>>>()?;
            let groups = if spec.sides == Sides::Two {
                column_groups(&filtered, &column_pivots, columns_expansion)
            } else {
                ColumnGroups::single(&filtered)
            };
            let header_rows = spec.is_column_only().then_some(spec.column_pivots.len());
            Ok(render_tree(
                &filtered,
                &row_pivots,
                &groups,
                &aggregates,
                sort,
                rows_expansion,
                header_rows,
            ))
        }
    }
}

struct ResolvedAggregate<'a> {
    op: AggOp,
    values: &'a [Scalar],
    weights: Option<&'a [Scalar]>,
}

fn resolve_aggregates<'a>(
    frame: &Frame<'a>,
    aggregates: &[AggregateSpec],
) -> EngineResult<Vec<ResolvedAggregate<'a>>> {
    aggregates
        .iter()
        .map(|agg| {
            let first = agg.columns.first().ok_or_else(|| EngineError::Unsupported {
                reason: format!("aggregate '{}' has no input column", agg.name),
            })?;
            let weights = match agg.columns.get(1) {
                Some(name) => Some(frame.column(name)?),
                None => None,
            };
            Ok(ResolvedAggregate {
                op: agg.op,
                values: frame.column(first)?,
                weights,
            })
        })
        .collect()
}

fn apply_filters(frame: &Frame<'_>, op: FilterOp, filters: &[FilterSpec]) -> EngineResult<Vec<usize>> {
    if filters.is_empty() {
        return Ok(frame.rows.clone());
    }
    let columns = filters
        .iter()
        .map(|f| frame.column(&f.column))
        .collect::<EngineResult<Vec<_>>>()?;

    Ok(frame
        .rows
        .iter()
        .copied()
        .filter(|&slot| {
            let mut results = filters
                .iter()
                .zip(&columns)
                .map(|(f, column)| matches(f, &column[slot]));
            match op {
                FilterOp::And => results.all(|r| r),
                FilterOp::Or => results.any(|r| r),
            }
        })
        .collect())
}

fn equal(a: &Scalar, b: &Scalar) -> bool {
    a.total_cmp(b) == Ordering::Equal
}

pub(crate) fn matches(filter: &FilterSpec, value: &Scalar) -> bool {
    use FilterOperator::*;

    let first = filter.operands.first();
    match filter.operator {
        IsNull => value.is_null(),
        IsNotNull => !value.is_null(),
        IsNan => matches!(value, Scalar::Float(v) if v.is_nan()),
        IsNotNan => match value {
            Scalar::Null => false,
            Scalar::Float(v) => !v.is_nan(),
            _ => true,
        },
        _ if value.is_null() => false,
        Eq => first.is_some_and(|o| equal(value, o)),
        Ne => first.is_some_and(|o| !equal(value, o)),
        Lt => first.is_some_and(|o| value.total_cmp(o) == Ordering::Less),
        Gt => first.is_some_and(|o| value.total_cmp(o) == Ordering::Greater),
        Le => first.is_some_and(|o| value.total_cmp(o) != Ordering::Greater),
        Ge => first.is_some_and(|o| value.total_cmp(o) != Ordering::Less),
        Contains => first.is_some_and(|o| value.to_text().contains(&o.to_text())),
        BeginsWith => first.is_some_and(|o| value.to_text().starts_with(&o.to_text())),
        EndsWith => first.is_some_and(|o| value.to_text().ends_with(&o.to_text())),
        In => filter.operands.iter().any(|o| equal(value, o)),
        NotIn => !filter.operands.iter().any(|o| equal(value, o)),
        Between => match filter.operands.as_slice() {
            [lo, hi, ..] => {
                value.total_cmp(lo) != Ordering::Less && value.total_cmp(hi) != Ordering::Greater
            }
            _ => false,
        },
    }
}

fn compare_for(order: SortOrder, a: &Scalar, b: &Scalar) -> Ordering {
    let abs = |s: &Scalar| s.as_f64().map(|v| Scalar::Float(v.abs())).unwrap_or_else(|| s.clone());
    match order {
        SortOrder::Asc => a.total_cmp(b),
        SortOrder::Desc => b.total_cmp(a),
        SortOrder::AscAbs => abs(a).total_cmp(&abs(b)),
        SortOrder::DescAbs => abs(b).total_cmp(&abs(a)),
        SortOrder::None => Ordering::Equal,
    }
}

fn compare_cells(sort: &[SortSpec], a: &[Scalar], b: &[Scalar]) -> Ordering {
    for spec in sort {
        let (Some(x), Some(y)) = (a.get(spec.index), b.get(spec.index)) else {
            continue;
        };
        let cmp = compare_for(spec.order, x, y);
        if cmp != Ordering::Equal {
            return cmp;
        }
    }
    Ordering::Equal
}

fn render_flat(rows: &[usize], aggregates: &[ResolvedAggregate<'_>], sort: &[SortSpec]) -> EngineResult<Rendered> {
    let mut rendered: Vec<RenderedRow> = rows
        .iter()
        .map(|&slot| RenderedRow {
            path: Vec::new(),
            cells: aggregates.iter().map(|a| a.values[slot].clone()).collect(),
        })
        .collect();
    if !sort.is_empty() {
        rendered.sort_by(|a, b| compare_cells(sort, &a.cells, &b.cells));
    }
    Ok(Rendered {
        header: false,
        unity: aggregates.len(),
        rows: rendered,
        column_paths: vec![Vec::new(); aggregates.len()],
    })
}

/// Column-pivot groups of a two-sided context; one-sided contexts use a single
/// group holding every row.
struct ColumnGroups {
    paths: Vec<Vec<Scalar>>,
    membership: HashMap<usize, usize>,
}

impl ColumnGroups {
    fn single(rows: &[usize]) -> Self {
        ColumnGroups {
            paths: vec![Vec::new()],
            membership: rows.iter().map(|&slot| (slot, 0)).collect(),
        }
    }
}

fn column_groups(rows: &[usize], pivots: &[&[Scalar]], expansion: &Expansion) -> ColumnGroups {
    let depth = expansion.depth.unwrap_or(pivots.len()).min(pivots.len());
    let mut distinct: IndexMap<Vec<ScalarKey>, Vec<Scalar>> = IndexMap::new();
    let mut row_keys = Vec::with_capacity(rows.len());
    for &slot in rows {
        let path: Vec<Scalar> = pivots[..depth].iter().map(|c| c[slot].clone()).collect();
        let key: Vec<ScalarKey> = path.iter().map(Scalar::key).collect();
        distinct.entry(key.clone()).or_insert(path);
        row_keys.push((slot, key));
    }

    let mut ordered: Vec<(Vec<ScalarKey>, Vec<Scalar>)> = distinct.into_iter().collect();
    ordered.sort_by(|(_, a), (_, b)| {
        a.iter()
            .zip(b)
            .map(|(x, y)| x.total_cmp(y))
            .find(|o| *o != Ordering::Equal)
            .unwrap_or(Ordering::Equal)
    });
    let position: HashMap<Vec<ScalarKey>, usize> = ordered
        .iter()
        .enumerate()
        .map(|(ix, (key, _))| (key.clone(), ix))
        .collect();

    ColumnGroups {
        membership: row_keys
            .into_iter()
            .filter_map(|(slot, key)| position.get(&key).map(|ix| (slot, *ix)))
            .collect(),
        paths: ordered.into_iter().map(|(_, path)| path).collect(),
    }
}

struct Node {
    path: Vec<Scalar>,
    rows: Vec<usize>,
    children: Vec<Node>,
    values: Vec<Scalar>,
    sums: Vec<Option<f64>>,
}

fn build_node(path: Vec<Scalar>, rows: Vec<usize>, pivots: &[&[Scalar]]) -> Node {
    let level = path.len();
    let mut children = Vec::new();
    if level < pivots.len() {
        let column = pivots[level];
        let mut buckets: IndexMap<ScalarKey, (Scalar, Vec<usize>)> = IndexMap::new();
        for &slot in &rows {
            let value = &column[slot];
            buckets
                .entry(value.key())
                .or_insert_with(|| (value.clone(), Vec::new()))
                .1
                .push(slot);
        }
        let mut entries: Vec<(Scalar, Vec<usize>)> = buckets.into_values().collect();
        entries.sort_by(|(a, _), (b, _)| a.total_cmp(b));
        children = entries
            .into_iter()
            .map(|(value, slots)| {
                let mut child_path = path.clone();
                child_path.push(value);
                build_node(child_path, slots, pivots)
            })
            .collect();
    }
    Node {
        path,
        rows,
        children,
        values: Vec::new(),
        sums: Vec::new(),
    }
}

fn aggregate_node(node: &mut Node, groups: &ColumnGroups, aggregates: &[ResolvedAggregate<'_>]) {
    let mut per_group: Vec<Vec<usize>> = vec![Vec::new(); groups.paths.len()];
    for &slot in &node.rows {
        if let Some(&g) = groups.membership.get(&slot) {
            per_group[g].push(slot);
        }
    }
    for rows in &per_group {
        for agg in aggregates {
            node.values.push(aggregate(agg, rows));
            node.sums.push(sum_of(agg.values, rows));
        }
    }
    for child in &mut node.children {
        aggregate_node(child, groups, aggregates);
    }
}

/// Rewrites percentage aggregates against the parent and grand-total sums.
fn apply_percentages(
    node: &mut Node,
    parent: &[Option<f64>],
    total: &[Option<f64>],
    aggregates: &[ResolvedAggregate<'_>],
) {
    let width = aggregates.len();
    for (ix, value) in node.values.iter_mut().enumerate() {
        let denominator = match aggregates[ix % width].op {
            AggOp::PctSumParent => parent[ix],
            AggOp::PctSumGrandTotal => total[ix],
            _ => continue,
        };
        *value = match (node.sums[ix], denominator) {
            (Some(n), Some(d)) if d != 0.0 => Scalar::Float(n / d * 100.0),
            _ => Scalar::Null,
        };
    }
    let sums = node.sums.clone();
    for child in &mut node.children {
        apply_percentages(child, &sums, total, aggregates);
    }
}

fn sort_children(node: &mut Node, sort: &[SortSpec]) {
    if !sort.is_empty() {
        node.children
            .sort_by(|a, b| compare_cells(sort, &a.values, &b.values));
    }
    for child in &mut node.children {
        sort_children(child, sort);
    }
}

fn flatten(node: &Node, levels: usize, expansion: &Expansion, out: &mut Vec<RenderedRow>) {
    let header = node.path.last().cloned().unwrap_or(Scalar::Null);
    let mut cells = Vec::with_capacity(node.values.len() + 1);
    cells.push(header);
    cells.extend(node.values.iter().cloned());
    out.push(RenderedRow {
        path: node.path.clone(),
        cells,
    });
    if expansion.is_expanded(&node.path, levels) {
        for child in &node.children {
            flatten(child, levels, expansion, out);
        }
    }
}

/// Row `level` holds each column group's path value at that level.
fn column_header_rows(paths: &[Vec<Scalar>], width: usize, depth: usize) -> Vec<RenderedRow> {
    (0..depth)
        .map(|level| {
            let mut cells = Vec::with_capacity(paths.len() * width + 1);
            cells.push(Scalar::Null);
            for path in paths {
                let label = path.get(level).cloned().unwrap_or(Scalar::Null);
                cells.extend(std::iter::repeat(label).take(width));
            }
            RenderedRow {
                path: Vec::new(),
                cells,
            }
        })
        .collect()
}

fn render_tree(
    rows: &[usize],
    row_pivots: &[&[Scalar]],
    groups: &ColumnGroups,
    aggregates: &[ResolvedAggregate<'_>],
    sort: &[SortSpec],
    expansion: &Expansion,
    header_rows: Option<usize>,
) -> Rendered {
    let mut root = build_node(Vec::new(), rows.to_vec(), row_pivots);
    aggregate_node(&mut root, groups, aggregates);
    let total = root.sums.clone();
    apply_percentages(&mut root, &total, &total, aggregates);
    sort_children(&mut root, sort);

    let mut out = Vec::new();
    match header_rows {
        Some(depth) => {
            out.extend(column_header_rows(&groups.paths, aggregates.len(), depth));
            for child in &root.children {
                flatten(child, row_pivots.len(), expansion, &mut out);
            }
        }
        None => flatten(&root, row_pivots.len(), expansion, &mut out),
    }

    let column_paths = groups
        .paths
        .iter()
        .flat_map(|path| {
            let leaf_first: Vec<Scalar> = path.iter().rev().cloned().collect();
            std::iter::repeat(leaf_first).take(aggregates.len())
        })
        .collect();

    Rendered {
        header: true,
        unity: groups.paths.len() * aggregates.len(),
        rows: out,
        column_paths,
    }
}

fn sum_of(values: &[Scalar], rows: &[usize]) -> Option<f64> {
    let mut seen = false;
    let mut total = 0.0;
    for v in rows.iter().filter_map(|&slot| values[slot].as_f64()) {
        seen = true;
        total += v;
    }
    seen.then_some(total)
}

fn sum_scalar(values: &[&Scalar], abs: bool) -> Scalar {
    if values.is_empty() {
        return Scalar::Null;
    }
    let all_integer = values.iter().all(|v| matches!(v, Scalar::Integer(_)));
    let total: f64 = values
        .iter()
        .filter_map(|v| v.as_f64())
        .map(|v| if abs { v.abs() } else { v })
        .sum();
    if all_integer && total.abs() <= i32::MAX as f64 {
        Scalar::Integer(total as i32)
    } else {
        Scalar::Float(total)
    }
}

fn truthy(value: &Scalar) -> bool {
    match value {
        Scalar::Null => false,
        Scalar::Boolean(b) => *b,
        Scalar::String(s) => !s.is_empty(),
        other => other.as_f64().is_some_and(|v| v != 0.0 && !v.is_nan()),
    }
}

fn aggregate(agg: &ResolvedAggregate<'_>, rows: &[usize]) -> Scalar {
    let all: Vec<&Scalar> = rows.iter().map(|&slot| &agg.values[slot]).collect();
    let present: Vec<&Scalar> = all.iter().copied().filter(|v| !v.is_null()).collect();
    let numbers: Vec<f64> = present.iter().filter_map(|v| v.as_f64()).collect();

    match agg.op {
        AggOp::Sum | AggOp::SumNotNull | AggOp::ScaledAdd => sum_scalar(&present, false),
        AggOp::AbsSum => sum_scalar(&present, true),
        AggOp::PctSumParent | AggOp::PctSumGrandTotal => Scalar::Null,
        AggOp::Count => Scalar::Integer(present.len() as i32),
        AggOp::DistinctCount => {
            let distinct: HashSet<ScalarKey> = present.iter().map(|v| v.key()).collect();
            Scalar::Integer(distinct.len() as i32)
        }
        AggOp::Mean | AggOp::ScaledDiv => {
            if numbers.is_empty() {
                Scalar::Null
            } else {
                Scalar::Float(numbers.iter().sum::<f64>() / numbers.len() as f64)
            }
        }
        AggOp::MeanByCount => {
            if all.is_empty() {
                Scalar::Null
            } else {
                Scalar::Float(numbers.iter().sum::<f64>() / all.len() as f64)
            }
        }
        AggOp::WeightedMean => {
            let Some(weights) = agg.weights else {
                return Scalar::Null;
            };
            let (mut num, mut den) = (0.0, 0.0);
            for &slot in rows {
                if let (Some(v), Some(w)) = (agg.values[slot].as_f64(), weights[slot].as_f64()) {
                    num += v * w;
                    den += w;
                }
            }
            if den == 0.0 {
                Scalar::Null
            } else {
                Scalar::Float(num / den)
            }
        }
        AggOp::Median => {
            let mut sorted = numbers;
            if sorted.is_empty() {
                return Scalar::Null;
            }
            sorted.sort_by(f64::total_cmp);
            let mid = sorted.len() / 2;
            if sorted.len() % 2 == 0 {
                Scalar::Float((sorted[mid - 1] + sorted[mid]) / 2.0)
            } else {
                Scalar::Float(sorted[mid])
            }
        }
        AggOp::High => present
            .iter()
            .max_by(|a, b| a.total_cmp(b))
            .map(|v| (*v).clone())
            .unwrap_or(Scalar::Null),
        AggOp::Low => present
            .iter()
            .min_by(|a, b| a.total_cmp(b))
            .map(|v| (*v).clone())
            .unwrap_or(Scalar::Null),
        AggOp::FirstByIndex => all.first().map(|v| (*v).clone()).unwrap_or(Scalar::Null),
        AggOp::LastByIndex | AggOp::Last => all.last().map(|v| (*v).clone()).unwrap_or(Scalar::Null),
        AggOp::LastMinusFirst => match (
            all.first().and_then(|v| v.as_f64()),
            all.last().and_then(|v| v.as_f64()),
        ) {
            (Some(first), Some(last)) => Scalar::Float(last - first),
            _ => Scalar::Null,
        },
        AggOp::Dominant => {
            let mut counts: IndexMap<ScalarKey, (usize, &Scalar)> = IndexMap::new();
            for v in present.iter().copied() {
                counts.entry(v.key()).or_insert((0, v)).0 += 1;
            }
            let mut best: Option<(usize, &Scalar)> = None;
            for (count, value) in counts.into_values() {
                if best.map_or(true, |(c, _)| count > c) {
                    best = Some((count, value));
                }
            }
            best.map(|(_, v)| v.clone()).unwrap_or(Scalar::Null)
        }
        AggOp::Any => present.first().map(|v| (*v).clone()).unwrap_or(Scalar::Null),
        AggOp::Unique => match present.split_first() {
            Some((first, rest)) if rest.iter().all(|v| equal(v, first)) => (*first).clone(),
            _ => Scalar::Null,
        },
        AggOp::Join => {
            let mut seen = HashSet::new();
            let parts: Vec<String> = present
                .iter()
                .filter(|v| seen.insert(v.key()))
                .map(|v| v.to_text())
                .collect();
            Scalar::String(parts.join(", "))
        }
        AggOp::And => Scalar::Boolean(!present.is_empty() && present.iter().all(|v| truthy(v))),
        AggOp::Or => Scalar::Boolean(present.iter().any(|v| truthy(v))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(values: &[&str]) -> Vec<Scalar> {
        values.iter().map(|s| Scalar::String(s.to_string())).collect()
    }

    fn ints(values: &[i32]) -> Vec<Scalar> {
        values.iter().map(|v| Scalar::Integer(*v)).collect()
    }

    fn fixture() -> (Vec<String>, Vec<Vec<Scalar>>) {
        (
            vec!["k".to_string(), "c".to_string(), "v".to_string()],
            vec![
                strings(&["a", "b", "a", "b"]),
                strings(&["x", "x", "y", "y"]),
                ints(&[1, 2, 3, 4]),
            ],
        )
    }

    fn sum_spec(sides: Sides, rows: &[&str], cols: &[&str]) -> ContextSpec {
        ContextSpec {
            sides,
            row_pivots: rows.iter().map(|s| s.to_string()).collect(),
            column_pivots: cols.iter().map(|s| s.to_string()).collect(),
            filter_op: FilterOp::And,
            filters: Vec::new(),
            aggregates: vec![AggregateSpec {
                name: "v".to_string(),
                op: AggOp::Sum,
                columns: vec!["v".to_string()],
            }],
        }
    }

    #[test]
    fn test_one_sided_tree() {
        let (names, columns) = fixture();
        let frame = Frame {
            names: &names,
            columns: &columns,
            rows: vec![0, 1, 2, 3],
        };
        let spec = sum_spec(Sides::One, &["k"], &[]);
        let r = render(&frame, &spec, &[], &Expansion::default(), &Expansion::default()).unwrap();
        assert_eq!(r.unity, 1);
        assert_eq!(r.rows.len(), 3);
        assert_eq!(r.rows[0].cells, vec![Scalar::Null, Scalar::Integer(10)]);
        assert_eq!(r.rows[1].path, strings(&["a"]));
        assert_eq!(r.rows[1].cells[1], Scalar::Integer(4));
        assert_eq!(r.rows[2].cells[1], Scalar::Integer(6));
    }

    #[test]
    fn test_sort_and_collapse() {
        let (names, columns) = fixture();
        let frame = Frame {
            names: &names,
            columns: &columns,
            rows: vec![0, 1, 2, 3],
        };
        let spec = sum_spec(Sides::One, &["k"], &[]);
        let sort = [SortSpec {
            index: 0,
            order: SortOrder::Desc,
        }];
        let r = render(&frame, &spec, &sort, &Expansion::default(), &Expansion::default()).unwrap();
        assert_eq!(r.rows[1].path, strings(&["b"]));

        let mut collapsed = Expansion::default();
        collapsed.set_depth(0);
        let r = render(&frame, &spec, &[], &collapsed, &Expansion::default()).unwrap();
        assert_eq!(r.rows.len(), 1);

        collapsed.set_open(&[], true);
        let r = render(&frame, &spec, &[], &collapsed, &Expansion::default()).unwrap();
        assert_eq!(r.rows.len(), 3);
    }

    #[test]
    fn test_two_sided_groups() {
        let (names, columns) = fixture();
        let frame = Frame {
            names: &names,
            columns: &columns,
            rows: vec![0, 1, 2, 3],
        };
        let spec = sum_spec(Sides::Two, &["k"], &["c"]);
        let r = render(&frame, &spec, &[], &Expansion::default(), &Expansion::default()).unwrap();
        assert_eq!(r.unity, 2);
        assert_eq!(r.column_count(), 3);
        assert_eq!(r.column_paths, vec![strings(&["x"]), strings(&["y"])]);
        // a: x=1, y=3
        assert_eq!(
            r.rows[1].cells,
            vec![Scalar::String("a".into()), Scalar::Integer(1), Scalar::Integer(3)]
        );
    }

    #[test]
    fn test_column_only_leads_with_header_rows() {
        let (mut names, mut columns) = fixture();
        names.push(crate::engine::ORDER_KEY.to_string());
        columns.push(ints(&[0, 1, 2, 3]));
        let frame = Frame {
            names: &names,
            columns: &columns,
            rows: vec![0, 1, 2, 3],
        };
        let mut spec = sum_spec(Sides::Two, &[crate::engine::ORDER_KEY], &["k", "c"]);
        assert!(spec.is_column_only());
        spec.aggregates[0].op = AggOp::Any;

        let r = render(&frame, &spec, &[], &Expansion::default(), &Expansion::default()).unwrap();
        assert_eq!(r.unity, 4);
        assert_eq!(r.rows.len(), 6);
        assert_eq!(r.rows[0].cells[1..], strings(&["a", "a", "b", "b"])[..]);
        assert_eq!(r.rows[1].cells[1..], strings(&["x", "y", "x", "y"])[..]);
        // slot 2 is k=a, c=y
        assert_eq!(
            r.rows[4].cells[1..],
            [Scalar::Null, Scalar::Integer(3), Scalar::Null, Scalar::Null][..]
        );
    }

    #[test]
    fn test_filters() {
        let (names, columns) = fixture();
        let frame = Frame {
            names: &names,
            columns: &columns,
            rows: vec![0, 1, 2, 3],
        };
        let mut spec = sum_spec(Sides::Zero, &[], &[]);
        spec.filters = vec![FilterSpec {
            column: "v".to_string(),
            operator: FilterOperator::Between,
            operands: ints(&[2, 3]),
        }];
        let r = render(&frame, &spec, &[], &Expansion::default(), &Expansion::default()).unwrap();
        assert_eq!(r.rows.len(), 2);

        spec.filter_op = FilterOp::Or;
        spec.filters.push(FilterSpec {
            column: "k".to_string(),
            operator: FilterOperator::BeginsWith,
            operands: strings(&["a"]),
        });
        let r = render(&frame, &spec, &[], &Expansion::default(), &Expansion::default()).unwrap();
        assert_eq!(r.rows.len(), 3);

        spec.filters[0].column = "nope".to_string();
        assert!(matches!(
            render(&frame, &spec, &[], &Expansion::default(), &Expansion::default()),
            Err(EngineError::UnknownColumn { .. })
        ));
    }

    #[test]
    fn test_null_checks() {
        let filter = |operator| FilterSpec {
            column: "v".to_string(),
            operator,
            operands: Vec::new(),
        };
        assert!(matches(&filter(FilterOperator::IsNull), &Scalar::Null));
        assert!(!matches(&filter(FilterOperator::Eq), &Scalar::Null));
        assert!(matches(&filter(FilterOperator::IsNan), &Scalar::Float(f64::NAN)));
        assert!(matches(&filter(FilterOperator::IsNotNan), &Scalar::Integer(1)));
    }

    #[test]
    fn test_percent_of_parent() {
        let (names, columns) = fixture();
        let frame = Frame {
            names: &names,
            columns: &columns,
            rows: vec![0, 1, 2, 3],
        };
        let mut spec = sum_spec(Sides::One, &["k", "c"], &[]);
        spec.aggregates[0].op = AggOp::PctSumParent;
        let r = render(&frame, &spec, &[], &Expansion::default(), &Expansion::default()).unwrap();
        // Total, a, a/x, a/y, b, b/x, b/y
        assert_eq!(r.rows.len(), 7);
        assert_eq!(r.rows[0].cells[1], Scalar::Float(100.0));
        assert_eq!(r.rows[1].cells[1], Scalar::Float(40.0));
        assert_eq!(r.rows[2].cells[1], Scalar::Float(25.0));
    }

    #[test]
    fn test_aggregate_ops() {
        let values = vec![
            Scalar::Integer(3),
            Scalar::Null,
            Scalar::Integer(1),
            Scalar::Integer(3),
        ];
        let run = |op| {
            aggregate(
                &ResolvedAggregate {
                    op,
                    values: &values,
                    weights: None,
                },
                &[0, 1, 2, 3],
            )
        };
        assert_eq!(run(AggOp::Sum), Scalar::Integer(7));
        assert_eq!(run(AggOp::Count), Scalar::Integer(3));
        assert_eq!(run(AggOp::DistinctCount), Scalar::Integer(2));
        assert_eq!(run(AggOp::Median), Scalar::Float(3.0));
        assert_eq!(run(AggOp::High), Scalar::Integer(3));
        assert_eq!(run(AggOp::Dominant), Scalar::Integer(3));
        assert_eq!(run(AggOp::Unique), Scalar::Null);
        assert_eq!(run(AggOp::Join), Scalar::String("3, 1".into()));
        assert_eq!(run(AggOp::LastMinusFirst), Scalar::Float(0.0));
    }
}
