//! The selection graph.
//!
//! A [`Selection`] is a composable, immutable description of a row source:
//! scans, filters, joins, projections and so on. Nodes validate their
//! expressions at construction time (arity, types, name resolution) so a
//! malformed query fails before any row is touched, and `enumerate`
//! produces a lazy iterator that observes exactly one transaction snapshot.
//!
//! Enumeration strategy is chosen per call from the entropy of the
//! available indexes; [`Selection::explain`] reports the same decision the
//! enumerator would make.

pub mod aggregate;
pub mod explain;
mod plan;

use std::sync::Arc;

use hashbrown::HashSet;
use pgstub_error::{DbError, ErrorKind, Result};

use self::aggregate::AggregateExpr;
use crate::expr::{self, Evaluator};
use crate::index::{IndexDef, IndexOp};
use crate::txn::{Row, TableId, Transaction};
use crate::types::{DataType, Field, ScalarValue};

/// Boxed lazy row stream. Restartable by calling `enumerate` again.
pub type RowIter = Box<dyn Iterator<Item = Result<Arc<Row>>>>;

/// One output column of a selection, carrying the relation qualifier used
/// for name resolution.
#[derive(Debug, Clone)]
pub struct OutputColumn {
    pub qualifier: Option<String>,
    pub name: String,
    pub datatype: DataType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    Left,
    Right,
    Full,
}

impl JoinKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JoinKind::Inner => "inner",
            JoinKind::Left => "left",
            JoinKind::Right => "right",
            JoinKind::Full => "full",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SortKey {
    pub expr: Evaluator,
    pub descending: bool,
}

/// A row source. The set of operators is closed: planning in `plan` and
/// explain both match exhaustively, so a new operator extends every
/// strategy decision at compile time.
#[derive(Debug, Clone)]
pub enum Selection {
    /// Table scan, the leaf every query bottoms out in.
    Scan {
        table_id: TableId,
        name: String,
        columns: Vec<OutputColumn>,
        indexes: Vec<IndexDef>,
    },
    Filter {
        input: Arc<Selection>,
        predicate: Evaluator,
    },
    /// Renames the relation and exposes a whole-row record column.
    Alias {
        input: Arc<Selection>,
        name: String,
        columns: Vec<OutputColumn>,
        record: Evaluator,
    },
    Join {
        kind: JoinKind,
        left: Arc<Selection>,
        right: Arc<Selection>,
        on: Evaluator,
        columns: Vec<OutputColumn>,
    },
    Project {
        input: Arc<Selection>,
        exprs: Vec<Evaluator>,
        columns: Vec<OutputColumn>,
    },
    OrderBy {
        input: Arc<Selection>,
        keys: Vec<SortKey>,
    },
    Limit {
        input: Arc<Selection>,
        limit: Option<usize>,
        offset: usize,
    },
    /// Full-row distinct, or distinct over a key expression list.
    Distinct {
        input: Arc<Selection>,
        key: Option<Vec<Evaluator>>,
    },
    Union {
        left: Arc<Selection>,
        right: Arc<Selection>,
    },
    Aggregate {
        input: Arc<Selection>,
        group_by: Vec<Evaluator>,
        aggregates: Vec<AggregateExpr>,
        columns: Vec<OutputColumn>,
    },
    /// Constant row source for VALUES lists and catalog views.
    Values {
        columns: Vec<OutputColumn>,
        rows: Vec<Row>,
    },
}

impl Selection {
    pub fn scan(
        table_id: TableId,
        name: impl Into<String>,
        columns: Vec<(String, DataType)>,
        indexes: Vec<IndexDef>,
    ) -> Selection {
        let name = name.into();
        let columns = columns
            .into_iter()
            .map(|(col, datatype)| OutputColumn {
                qualifier: Some(name.clone()),
                name: col,
                datatype,
            })
            .collect();
        Selection::Scan {
            table_id,
            name,
            columns,
            indexes,
        }
    }

    pub fn values(columns: Vec<(String, DataType)>, rows: Vec<Row>) -> Result<Selection> {
        for row in &rows {
            if row.len() != columns.len() {
                return Err(DbError::new(format!(
                    "VALUES row has {} entries, expected {}",
                    row.len(),
                    columns.len()
                )));
            }
        }
        Ok(Selection::Values {
            columns: columns
                .into_iter()
                .map(|(name, datatype)| OutputColumn {
                    qualifier: None,
                    name,
                    datatype,
                })
                .collect(),
            rows,
        })
    }

    pub fn filter(input: Arc<Selection>, predicate: Evaluator) -> Result<Selection> {
        check_arity(&predicate, input.columns().len())?;
        let ty = predicate.datatype();
        if !matches!(ty, DataType::Bool | DataType::Null) {
            return Err(DbError::new(format!(
                "argument of WHERE must be type boolean, not type {ty}"
            )));
        }
        Ok(Selection::Filter { input, predicate })
    }

    pub fn alias(input: Arc<Selection>, name: impl Into<String>) -> Selection {
        let name = name.into();
        let base = input.columns();
        let fields: Arc<[Field]> = base
            .iter()
            .map(|c| Field {
                name: c.name.clone(),
                datatype: c.datatype.clone(),
            })
            .collect();
        let record = Evaluator::Record {
            name: name.clone(),
            fields: base
                .iter()
                .enumerate()
                .map(|(i, c)| expr::column(i, c.name.clone(), c.datatype.clone()))
                .collect(),
            datatype: DataType::Record(fields),
        };
        let mut columns: Vec<OutputColumn> = base
            .iter()
            .map(|c| OutputColumn {
                qualifier: Some(name.clone()),
                name: c.name.clone(),
                datatype: c.datatype.clone(),
            })
            .collect();
        columns.push(OutputColumn {
            qualifier: None,
            name: name.clone(),
            datatype: record.datatype(),
        });
        Selection::Alias {
            input,
            name,
            columns,
            record,
        }
    }

    pub fn join(
        kind: JoinKind,
        left: Arc<Selection>,
        right: Arc<Selection>,
        on: Evaluator,
    ) -> Result<Selection> {
        let columns: Vec<OutputColumn> = left
            .columns()
            .iter()
            .chain(right.columns())
            .cloned()
            .collect();
        check_arity(&on, columns.len())?;
        let ty = on.datatype();
        if !matches!(ty, DataType::Bool | DataType::Null) {
            return Err(DbError::new(format!(
                "argument of JOIN/ON must be type boolean, not type {ty}"
            )));
        }
        Ok(Selection::Join {
            kind,
            left,
            right,
            on,
            columns,
        })
    }

    /// Projection with optional output names; unnamed outputs take the
    /// column's name, or the expression's display form.
    pub fn project(
        input: Arc<Selection>,
        exprs: Vec<(Evaluator, Option<String>)>,
    ) -> Result<Selection> {
        let ncols = input.columns().len();
        let mut out_exprs = Vec::with_capacity(exprs.len());
        let mut columns = Vec::with_capacity(exprs.len());
        let mut names: HashSet<String> = HashSet::with_capacity(exprs.len());
        for (expr, name) in exprs {
            check_arity(&expr, ncols)?;
            let name = name.unwrap_or_else(|| output_name(&expr));
            if !names.insert(name.clone()) {
                return Err(DbError::new(format!(
                    "duplicate output column name \"{name}\""
                )));
            }
            columns.push(OutputColumn {
                qualifier: None,
                name,
                datatype: expr.datatype(),
            });
            out_exprs.push(expr);
        }
        Ok(Selection::Project {
            input,
            exprs: out_exprs,
            columns,
        })
    }

    pub fn order_by(input: Arc<Selection>, keys: Vec<SortKey>) -> Result<Selection> {
        let ncols = input.columns().len();
        for key in &keys {
            check_arity(&key.expr, ncols)?;
        }
        Ok(Selection::OrderBy { input, keys })
    }

    pub fn limit(input: Arc<Selection>, limit: Option<usize>, offset: usize) -> Selection {
        Selection::Limit {
            input,
            limit,
            offset,
        }
    }

    pub fn distinct(input: Arc<Selection>, key: Option<Vec<Evaluator>>) -> Result<Selection> {
        if let Some(exprs) = &key {
            let ncols = input.columns().len();
            for expr in exprs {
                check_arity(expr, ncols)?;
            }
        }
        Ok(Selection::Distinct { input, key })
    }

    pub fn union(left: Arc<Selection>, right: Arc<Selection>) -> Result<Selection> {
        let l = left.columns();
        let r = right.columns();
        if l.len() != r.len() {
            return Err(DbError::new(format!(
                "each UNION query must have the same number of columns: {} vs {}",
                l.len(),
                r.len()
            )));
        }
        for (a, b) in l.iter().zip(r) {
            if a.datatype != b.datatype
                && !a.datatype.is_null()
                && !b.datatype.is_null()
            {
                return Err(DbError::new(format!(
                    "UNION types {} and {} cannot be matched",
                    a.datatype, b.datatype
                )));
            }
        }
        Ok(Selection::Union { left, right })
    }

    pub fn aggregate(
        input: Arc<Selection>,
        group_by: Vec<Evaluator>,
        aggregates: Vec<AggregateExpr>,
    ) -> Result<Selection> {
        let ncols = input.columns().len();
        let mut columns = Vec::with_capacity(group_by.len() + aggregates.len());
        for expr in &group_by {
            check_arity(expr, ncols)?;
            columns.push(OutputColumn {
                qualifier: None,
                name: output_name(expr),
                datatype: expr.datatype(),
            });
        }
        for agg in &aggregates {
            agg.func.validate(ncols)?;
            columns.push(OutputColumn {
                qualifier: None,
                name: agg.name.clone(),
                datatype: agg.func.output_type(),
            });
        }
        Ok(Selection::Aggregate {
            input,
            group_by,
            aggregates,
            columns,
        })
    }

    pub fn columns(&self) -> &[OutputColumn] {
        match self {
            Selection::Scan { columns, .. }
            | Selection::Alias { columns, .. }
            | Selection::Join { columns, .. }
            | Selection::Project { columns, .. }
            | Selection::Aggregate { columns, .. }
            | Selection::Values { columns, .. } => columns,
            Selection::Filter { input, .. }
            | Selection::OrderBy { input, .. }
            | Selection::Limit { input, .. }
            | Selection::Distinct { input, .. } => input.columns(),
            Selection::Union { left, .. } => left.columns(),
        }
    }

    /// Resolve a (possibly qualified) column name to its row index.
    ///
    /// Unknown columns are a build-time [`ErrorKind::NotFound`]; an
    /// unqualified name matching more than one column is ambiguous.
    pub fn resolve_column(&self, qualifier: Option<&str>, name: &str) -> Result<usize> {
        let mut found = None;
        for (i, col) in self.columns().iter().enumerate() {
            if col.name != name {
                continue;
            }
            if let Some(q) = qualifier {
                if col.qualifier.as_deref() != Some(q) {
                    continue;
                }
            }
            if found.is_some() {
                return Err(DbError::new(format!(
                    "column reference \"{name}\" is ambiguous"
                )));
            }
            found = Some(i);
        }
        found.ok_or_else(|| {
            DbError::with_kind(
                ErrorKind::NotFound,
                format!("column \"{name}\" does not exist"),
            )
        })
    }

    /// Typed expression referencing a resolved column, for building
    /// predicates and projections against this selection.
    pub fn column_ref(&self, qualifier: Option<&str>, name: &str) -> Result<Evaluator> {
        let index = self.resolve_column(qualifier, name)?;
        let col = &self.columns()[index];
        Ok(expr::column(index, col.name.clone(), col.datatype.clone()))
    }

    /// Expected number of rows an enumeration would yield.
    pub fn entropy(&self, txn: &Transaction) -> f64 {
        match self {
            Selection::Scan { table_id, .. } => txn.table_data(*table_id).rows.len() as f64,
            Selection::Filter { input, predicate } => {
                plan::filter_entropy(input, predicate, txn)
            }
            Selection::Alias { input, .. }
            | Selection::Project { input, .. }
            | Selection::OrderBy { input, .. }
            | Selection::Distinct { input, .. }
            | Selection::Aggregate { input, .. } => input.entropy(txn),
            Selection::Join {
                kind,
                left,
                right,
                on,
                ..
            } => plan::join_entropy(*kind, left, right, on, txn),
            Selection::Limit {
                input,
                limit,
                offset,
            } => {
                let remaining = (input.entropy(txn) - *offset as f64).max(0.0);
                match limit {
                    Some(n) => remaining.min(*n as f64),
                    None => remaining,
                }
            }
            Selection::Union { left, right } => left.entropy(txn) + right.entropy(txn),
            Selection::Values { rows, .. } => rows.len() as f64,
        }
    }

    /// Lazily enumerate the selection's rows under one snapshot.
    pub fn enumerate(&self, txn: &Transaction) -> RowIter {
        match self {
            Selection::Scan { table_id, .. } => Box::new(
                txn.table_data(*table_id)
                    .rows
                    .iter_owned()
                    .map(|(_, row)| Ok(row)),
            ),
            Selection::Filter { input, predicate } => {
                plan::enumerate_filter(input, predicate, txn)
            }
            Selection::Alias { input, record, .. } => {
                let record = record.clone();
                let txn = txn.clone();
                Box::new(
                    input
                        .enumerate(&txn.clone())
                        .map(move |r| append_record(&r?, &record, &txn)),
                )
            }
            Selection::Join {
                kind,
                left,
                right,
                on,
                ..
            } => plan::enumerate_join(*kind, left, right, on, txn),
            Selection::Project { input, exprs, .. } => {
                let exprs = exprs.clone();
                let txn2 = txn.clone();
                Box::new(input.enumerate(txn).map(move |r| {
                    let row = r?;
                    let out: Result<Row> =
                        exprs.iter().map(|e| e.eval(&row, &txn2)).collect();
                    Ok(Arc::new(out?))
                }))
            }
            Selection::OrderBy { input, keys } => enumerate_sorted(input, keys, txn),
            Selection::Limit {
                input,
                limit,
                offset,
            } => {
                let it = input.enumerate(txn).skip(*offset);
                match limit {
                    Some(n) => Box::new(it.take(*n)),
                    None => Box::new(it),
                }
            }
            Selection::Distinct { input, key } => enumerate_distinct(input, key, txn),
            Selection::Union { left, right } => {
                let mut seen: HashSet<Row> = HashSet::new();
                Box::new(
                    left.enumerate(txn)
                        .chain(right.enumerate(txn))
                        .filter_map(move |r| match r {
                            Err(e) => Some(Err(e)),
                            Ok(row) => seen.insert((*row).clone()).then_some(Ok(row)),
                        }),
                )
            }
            Selection::Aggregate {
                input,
                group_by,
                aggregates,
                ..
            } => aggregate::enumerate(input, group_by, aggregates, txn),
            Selection::Values { rows, .. } => Box::new(
                rows.clone()
                    .into_iter()
                    .map(|row| Ok(Arc::new(row))),
            ),
        }
    }

    /// Value-equality membership test.
    pub fn has_item(&self, row: &Row, txn: &Transaction) -> Result<bool> {
        match self {
            Selection::Filter { input, predicate } => {
                Ok(keep(row, predicate, txn)? && input.has_item(row, txn)?)
            }
            _ => {
                for r in self.enumerate(txn) {
                    if *r? == *row {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
        }
    }

    /// An index whose keyed expressions structurally match `exprs`, usable
    /// for driving enumeration of this selection.
    pub(crate) fn index_matching(&self, exprs: &[Evaluator]) -> Option<IndexDef> {
        match self {
            Selection::Scan { indexes, .. } => {
                exprs
                    .iter()
                    .all(|e| e.max_column_index().is_some())
                    .then(|| indexes.iter().find(|ix| ix.exprs == exprs).cloned())
                    .flatten()
            }
            Selection::Alias { input, columns, .. } => {
                // The synthetic record column has no index behind it.
                let base_len = columns.len() - 1;
                if exprs
                    .iter()
                    .any(|e| e.max_column_index().is_some_and(|m| m >= base_len))
                {
                    return None;
                }
                input.index_matching(exprs)
            }
            _ => None,
        }
    }

    /// Drive enumeration through an index obtained from
    /// [`index_matching`](Self::index_matching), preserving this node's
    /// output row shape.
    pub(crate) fn enumerate_keyed(
        &self,
        index: &IndexDef,
        op: IndexOp,
        txn: &Transaction,
    ) -> RowIter {
        match self {
            Selection::Scan { .. } => Box::new(index.enumerate(op, txn).map(Ok)),
            Selection::Alias { input, record, .. } => {
                let record = record.clone();
                let txn2 = txn.clone();
                Box::new(
                    input
                        .enumerate_keyed(index, op, txn)
                        .map(move |r| append_record(&r?, &record, &txn2)),
                )
            }
            _ => Box::new(std::iter::once(Err(DbError::new(
                "selection does not support index-driven enumeration",
            )))),
        }
    }
}

fn check_arity(expr: &Evaluator, ncols: usize) -> Result<()> {
    if let Some(max) = expr.max_column_index() {
        if max >= ncols {
            return Err(DbError::new(format!(
                "expression references column index {max} but the input has {ncols} columns"
            )));
        }
    }
    Ok(())
}

fn output_name(expr: &Evaluator) -> String {
    match expr {
        Evaluator::Column { name, .. } | Evaluator::Record { name, .. } => name.clone(),
        other => other.to_string(),
    }
}

fn append_record(row: &Arc<Row>, record: &Evaluator, txn: &Transaction) -> Result<Arc<Row>> {
    let value = record.eval(row, txn)?;
    let mut out = Row::clone(row);
    out.push(value);
    Ok(Arc::new(out))
}

/// Evaluate a predicate for filtering: unknown counts as false.
pub(crate) fn keep(row: &Row, predicate: &Evaluator, txn: &Transaction) -> Result<bool> {
    Ok(predicate.eval(row, txn)?.as_bool().unwrap_or(false))
}

fn enumerate_sorted(input: &Arc<Selection>, keys: &[SortKey], txn: &Transaction) -> RowIter {
    use std::cmp::Ordering;

    use crate::types::compare::sql_cmp;

    let materialized: Result<Vec<(Vec<ScalarValue>, Arc<Row>)>> = input
        .enumerate(txn)
        .map(|r| {
            let row = r?;
            let key: Result<Vec<ScalarValue>> =
                keys.iter().map(|k| k.expr.eval(&row, txn)).collect();
            Ok((key?, row))
        })
        .collect();
    let mut rows = match materialized {
        Ok(rows) => rows,
        Err(e) => return Box::new(std::iter::once(Err(e))),
    };

    let types: Vec<DataType> = keys.iter().map(|k| k.expr.datatype()).collect();
    let descending: Vec<bool> = keys.iter().map(|k| k.descending).collect();
    let mut sort_err: Option<DbError> = None;
    rows.sort_by(|(ka, _), (kb, _)| {
        for (i, (a, b)) in ka.iter().zip(kb).enumerate() {
            // Nulls sort last in either direction.
            let ord = match (a.is_null(), b.is_null()) {
                (true, true) => Ordering::Equal,
                (true, false) => Ordering::Greater,
                (false, true) => Ordering::Less,
                (false, false) => {
                    let ord = match sql_cmp(&types[i], a, b) {
                        Ok(Some(ord)) => ord,
                        Ok(None) => a.cmp(b),
                        Err(e) => {
                            sort_err.get_or_insert(e);
                            Ordering::Equal
                        }
                    };
                    if descending[i] { ord.reverse() } else { ord }
                }
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
    if let Some(e) = sort_err {
        return Box::new(std::iter::once(Err(e)));
    }
    Box::new(rows.into_iter().map(|(_, row)| Ok(row)))
}

fn enumerate_distinct(
    input: &Arc<Selection>,
    key: &Option<Vec<Evaluator>>,
    txn: &Transaction,
) -> RowIter {
    if let Some(exprs) = key {
        // Keyed distinct over a bare scan can walk the index's distinct
        // keys and fetch one representative row per key. A filtered or
        // joined input would change which rows exist, so only the scan
        // qualifies.
        if matches!(input.as_ref(), Selection::Scan { .. }) {
            if let Some(index) = input.index_matching(exprs) {
                if let Some(keys) = index.iterate_keys(txn) {
                    tracing::debug!(index = %index.name, "distinct via index keys");
                    let txn2 = txn.clone();
                    let index2 = index.clone();
                    return Box::new(
                        keys.filter_map(move |k| index2.representative(&k, &txn2).map(Ok)),
                    );
                }
            }
        }
        let exprs = exprs.clone();
        let txn2 = txn.clone();
        let mut seen: HashSet<Vec<ScalarValue>> = HashSet::new();
        Box::new(input.enumerate(txn).filter_map(move |r| {
            let row = match r {
                Ok(row) => row,
                Err(e) => return Some(Err(e)),
            };
            let key: Result<Vec<ScalarValue>> =
                exprs.iter().map(|e| e.eval(&row, &txn2)).collect();
            match key {
                Err(e) => Some(Err(e)),
                Ok(k) => seen.insert(k).then_some(Ok(row)),
            }
        }))
    } else {
        let mut seen: HashSet<Row> = HashSet::new();
        Box::new(input.enumerate(txn).filter_map(move |r| match r {
            Err(e) => Some(Err(e)),
            Ok(row) => seen.insert((*row).clone()).then_some(Ok(row)),
        }))
    }
}
