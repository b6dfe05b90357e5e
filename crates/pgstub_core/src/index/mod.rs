//! The index abstraction.
//!
//! An index maps typed key tuples to matching rows for a given transaction
//! snapshot. Index contents are versioned inside [`TableData`], so a query
//! can only ever observe the snapshot of the transaction it was handed —
//! there is no out-of-band index state.
//!
//! `entropy` reports the expected number of matching rows for an operation
//! and exists purely for planning: choosing index lookup vs. sequential
//! scan, and choosing which side drives a join.

use std::fmt;
use std::ops::Bound;
use std::sync::Arc;

use pgstub_error::{DbError, ErrorKind, Result};

use crate::expr::Evaluator;
use crate::txn::{IndexData, IndexId, IndexKey, Row, RowId, TableData, TableId, Transaction};

/// A query against an index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexOp {
    Eq(IndexKey),
    Neq(IndexKey),
    Gt(IndexKey),
    Ge(IndexKey),
    Lt(IndexKey),
    Le(IndexKey),
    /// Set membership (`IN`).
    Inside(Vec<IndexKey>),
    /// Negated membership (`NOT IN`).
    Nin(Vec<IndexKey>),
    /// Range exclusion: keys strictly below `lo` or strictly above `hi`.
    Outside { lo: IndexKey, hi: IndexKey },
}

impl fmt::Display for IndexOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IndexOp::Eq(_) => "=",
            IndexOp::Neq(_) => "<>",
            IndexOp::Gt(_) => ">",
            IndexOp::Ge(_) => ">=",
            IndexOp::Lt(_) => "<",
            IndexOp::Le(_) => "<=",
            IndexOp::Inside(_) => "in",
            IndexOp::Nin(_) => "not-in",
            IndexOp::Outside { .. } => "outside",
        };
        write!(f, "{s}")
    }
}

/// Exact statistics an index can answer without iterating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexStats {
    pub count: usize,
}

/// Definition of an index over a table's scan expressions.
#[derive(Debug, Clone)]
pub struct IndexDef {
    pub id: IndexId,
    pub name: String,
    pub table_id: TableId,
    /// The expressions this index is keyed on, in the table scan's row
    /// layout. Matched against predicates by structural expression
    /// equality.
    pub exprs: Vec<Evaluator>,
    pub unique: bool,
}

fn key_has_null(key: &IndexKey) -> bool {
    key.iter().any(|v| v.is_null())
}

impl IndexDef {
    /// Compute the key tuple for a row.
    pub fn key_for_row(&self, row: &Row, txn: &Transaction) -> Result<IndexKey> {
        self.exprs.iter().map(|e| e.eval(row, txn)).collect()
    }

    /// Expected number of rows an enumeration of `op` would yield.
    pub fn entropy(&self, op: &IndexOp, txn: &Transaction) -> f64 {
        let data = txn.table_data(self.table_id);
        self.entropy_for(op, &data)
    }

    fn entropy_for(&self, op: &IndexOp, data: &TableData) -> f64 {
        let index = data.indexes.get(&self.id).cloned().unwrap_or_default();
        let rows = index.row_count as f64;
        let keys = index.entries.len() as f64;
        if rows == 0.0 {
            return 0.0;
        }
        // Average bucket size; 1.0 for unique indexes by construction.
        let per_key = rows / keys.max(1.0);

        match op {
            IndexOp::Eq(key) => {
                if key_has_null(key) {
                    0.0
                } else {
                    per_key
                }
            }
            IndexOp::Neq(_) => rows - per_key,
            IndexOp::Gt(_) | IndexOp::Ge(_) | IndexOp::Lt(_) | IndexOp::Le(_) => rows / 2.0,
            IndexOp::Inside(list) => per_key * list.len() as f64,
            IndexOp::Nin(list) => (rows - per_key * list.len() as f64).max(0.0),
            IndexOp::Outside { .. } => rows / 2.0,
        }
    }

    /// Lazily enumerate the rows matching `op` under the given snapshot.
    ///
    /// The returned iterator owns its view of the snapshot: it is
    /// restartable by calling `enumerate` again and safe to drop
    /// half-consumed.
    pub fn enumerate(
        &self,
        op: IndexOp,
        txn: &Transaction,
    ) -> Box<dyn Iterator<Item = Arc<Row>>> {
        let data = txn.table_data(self.table_id);
        let index = data.indexes.get(&self.id).cloned().unwrap_or_default();
        let rows = data.rows;
        let lookup = move |id: RowId| rows.get(&id).cloned();

        match op {
            IndexOp::Eq(key) => {
                if key_has_null(&key) {
                    // Null never equals anything, including itself.
                    return Box::new(std::iter::empty());
                }
                match index.entries.get(&key) {
                    Some(set) => Box::new(set.iter_owned().filter_map(lookup)),
                    None => Box::new(std::iter::empty()),
                }
            }
            IndexOp::Neq(key) => Box::new(
                index
                    .entries
                    .iter_owned()
                    .filter(move |(k, _)| !key_has_null(k) && *k != key)
                    .flat_map(|(_, set)| set.iter_owned())
                    .filter_map(lookup),
            ),
            IndexOp::Gt(key) => self.enumerate_range(
                index,
                lookup,
                Bound::Excluded(key),
                Bound::Unbounded,
            ),
            IndexOp::Ge(key) => self.enumerate_range(
                index,
                lookup,
                Bound::Included(key),
                Bound::Unbounded,
            ),
            IndexOp::Lt(key) => self.enumerate_range(
                index,
                lookup,
                Bound::Unbounded,
                Bound::Excluded(key),
            ),
            IndexOp::Le(key) => self.enumerate_range(
                index,
                lookup,
                Bound::Unbounded,
                Bound::Included(key),
            ),
            IndexOp::Inside(list) => {
                // Dedup so a repeated key does not yield its rows twice.
                let mut keys: Vec<IndexKey> =
                    list.into_iter().filter(|k| !key_has_null(k)).collect();
                keys.sort();
                keys.dedup();
                let entries = index.entries;
                Box::new(
                    keys.into_iter()
                        .filter_map(move |k| entries.get(&k).cloned())
                        .flat_map(|set| set.iter_owned())
                        .filter_map(lookup),
                )
            }
            IndexOp::Nin(list) => Box::new(
                index
                    .entries
                    .iter_owned()
                    .filter(move |(k, _)| !key_has_null(k) && !list.contains(k))
                    .flat_map(|(_, set)| set.iter_owned())
                    .filter_map(lookup),
            ),
            IndexOp::Outside { lo, hi } => Box::new(
                index
                    .entries
                    .iter_owned()
                    .filter(move |(k, _)| !key_has_null(k) && (*k < lo || *k > hi))
                    .flat_map(|(_, set)| set.iter_owned())
                    .filter_map(lookup),
            ),
        }
    }

    fn enumerate_range(
        &self,
        index: IndexData,
        lookup: impl Fn(RowId) -> Option<Arc<Row>> + 'static,
        lo: Bound<IndexKey>,
        hi: Bound<IndexKey>,
    ) -> Box<dyn Iterator<Item = Arc<Row>>> {
        Box::new(
            index
                .entries
                .range_owned(lo, hi)
                .filter(|(k, _)| !key_has_null(k))
                .flat_map(|(_, set)| set.iter_owned())
                .filter_map(lookup),
        )
    }

    /// Short-circuiting point lookup: the first row matching `key`, without
    /// enumerating further.
    pub fn eq_first(&self, key: &IndexKey, txn: &Transaction) -> Option<Arc<Row>> {
        if key_has_null(key) {
            return None;
        }
        let data = txn.table_data(self.table_id);
        let index = data.indexes.get(&self.id)?;
        let set = index.entries.get(key)?;
        let row_id = set.first()?;
        data.rows.get(row_id).cloned()
    }

    /// Any one row stored under `key`, including keys containing null.
    ///
    /// Unlike [`eq_first`](Self::eq_first) this is a raw storage lookup, not
    /// a SQL equality: DISTINCT and GROUP BY need a representative row for
    /// null-keyed groups too.
    pub fn representative(&self, key: &IndexKey, txn: &Transaction) -> Option<Arc<Row>> {
        let data = txn.table_data(self.table_id);
        let index = data.indexes.get(&self.id)?;
        let set = index.entries.get(key)?;
        let row_id = set.first()?;
        data.rows.get(row_id).cloned()
    }

    /// Exact counts maintained by the index, or `None` when the caller must
    /// fall back to iteration.
    pub fn stats(&self, txn: &Transaction, key: Option<&IndexKey>) -> Option<IndexStats> {
        let data = txn.table_data(self.table_id);
        let index = data.indexes.get(&self.id)?;
        match key {
            None => Some(IndexStats {
                count: index.row_count,
            }),
            Some(key) => Some(IndexStats {
                count: index.entries.get(key).map(|s| s.len()).unwrap_or(0),
            }),
        }
    }

    /// Enumerate distinct keys, for DISTINCT/GROUP BY fast paths.
    pub fn iterate_keys(&self, txn: &Transaction) -> Option<Box<dyn Iterator<Item = IndexKey>>> {
        let data = txn.table_data(self.table_id);
        let index = data.indexes.get(&self.id).cloned().unwrap_or_default();
        Some(Box::new(index.entries.iter_owned().map(|(k, _)| k)))
    }
}

/// Maintenance: add a row to the index contents, enforcing uniqueness.
///
/// Unique indexes ignore keys containing null (matching the postgres rule
/// that null is never equal to null).
pub fn index_insert(
    def: &IndexDef,
    data: &IndexData,
    key: IndexKey,
    row_id: RowId,
) -> Result<IndexData> {
    let existing = data.entries.get(&key).cloned().unwrap_or_default();
    if def.unique && !existing.is_empty() && !key_has_null(&key) {
        return Err(DbError::with_kind(
            ErrorKind::Constraint,
            format!(
                "duplicate key value violates unique constraint \"{}\"",
                def.name
            ),
        )
        .with_field("key", format_key(&key)));
    }
    Ok(IndexData {
        entries: data.entries.insert(key, existing.insert(row_id)),
        row_count: data.row_count + 1,
    })
}

/// Maintenance: remove a row from the index contents.
pub fn index_remove(data: &IndexData, key: &IndexKey, row_id: RowId) -> IndexData {
    let Some(existing) = data.entries.get(key).cloned() else {
        return data.clone();
    };
    let shrunk = existing.remove(&row_id);
    let entries = if shrunk.is_empty() {
        data.entries.remove(key)
    } else {
        data.entries.insert(key.clone(), shrunk)
    };
    IndexData {
        entries,
        row_count: data.row_count.saturating_sub(1),
    }
}

fn format_key(key: &IndexKey) -> String {
    let parts: Vec<String> = key.iter().map(|v| v.to_string()).collect();
    format!("({})", parts.join(", "))
}

/// An index lookup with a residual predicate re-checked per candidate row.
///
/// This is how "index lookup AND extra predicate" works without requiring a
/// composite index for every predicate combination: the base index narrows
/// the candidates, the filter keeps correctness.
#[derive(Debug, Clone)]
pub struct RestrictiveIndex {
    pub base: IndexDef,
    pub filter: Evaluator,
}

impl RestrictiveIndex {
    pub fn entropy(&self, op: &IndexOp, txn: &Transaction) -> f64 {
        // The residual only ever narrows the base lookup; assume it halves
        // the candidates.
        self.base.entropy(op, txn) / 2.0
    }

    /// Enumerate the base lookup, re-checking the residual per row. A
    /// predicate evaluation error surfaces in the stream, exactly as it
    /// would on the sequential-scan path.
    pub fn enumerate(
        &self,
        op: IndexOp,
        txn: &Transaction,
    ) -> Box<dyn Iterator<Item = Result<Arc<Row>>>> {
        let filter = self.filter.clone();
        let txn = txn.clone();
        Box::new(
            self.base
                .enumerate(op, &txn.clone())
                .filter_map(move |row| match filter.eval(&row, &txn) {
                    Err(e) => Some(Err(e)),
                    Ok(v) => v.as_bool().unwrap_or(false).then_some(Ok(row)),
                }),
        )
    }

    pub fn eq_first(&self, key: &IndexKey, txn: &Transaction) -> Result<Option<Arc<Row>>> {
        self.enumerate(IndexOp::Eq(key.clone()), txn)
            .next()
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr;
    use crate::types::{DataType, ScalarValue};

    fn int(v: i64) -> ScalarValue {
        ScalarValue::Int(v)
    }

    /// Build a one-table transaction with an index on column 0.
    fn setup(unique: bool, rows: &[Vec<ScalarValue>]) -> (IndexDef, Transaction) {
        let def = IndexDef {
            id: 1,
            name: "t_idx".to_string(),
            table_id: 1,
            exprs: vec![expr::column(0, "id", DataType::Int)],
            unique,
        };

        let txn = Transaction::root();
        let mut data = TableData::default();
        let mut index = IndexData::default();
        for row in rows {
            let row_id = data.next_row_id;
            data.next_row_id += 1;
            let arc = Arc::new(row.clone());
            let key = def.key_for_row(&arc, &txn).unwrap();
            index = index_insert(&def, &index, key, row_id).unwrap();
            data.rows = data.rows.insert(row_id, arc);
        }
        data.indexes = data.indexes.insert(def.id, index);
        (def.clone(), txn.with_table_data(1, data))
    }

    fn ids(rows: impl Iterator<Item = Arc<Row>>) -> Vec<i64> {
        let mut out: Vec<i64> = rows
            .map(|r| match &r[0] {
                ScalarValue::Int(v) => *v,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        out.sort();
        out
    }

    #[test]
    fn eq_and_ranges() {
        let (def, txn) = setup(
            false,
            &[
                vec![int(1), int(10)],
                vec![int(2), int(20)],
                vec![int(2), int(21)],
                vec![int(5), int(50)],
            ],
        );

        assert_eq!(vec![2, 2], ids(def.enumerate(IndexOp::Eq(vec![int(2)]), &txn)));
        assert_eq!(vec![5], ids(def.enumerate(IndexOp::Gt(vec![int(2)]), &txn)));
        assert_eq!(
            vec![2, 2, 5],
            ids(def.enumerate(IndexOp::Ge(vec![int(2)]), &txn))
        );
        assert_eq!(vec![1], ids(def.enumerate(IndexOp::Lt(vec![int(2)]), &txn)));
        assert_eq!(
            vec![1, 5],
            ids(def.enumerate(IndexOp::Neq(vec![int(2)]), &txn))
        );
    }

    #[test]
    fn membership_ops() {
        let (def, txn) = setup(
            false,
            &[vec![int(1)], vec![int(2)], vec![int(3)], vec![int(4)]],
        );

        assert_eq!(
            vec![1, 3],
            ids(def.enumerate(
                IndexOp::Inside(vec![vec![int(1)], vec![int(3)], vec![int(1)]]),
                &txn
            ))
        );
        assert_eq!(
            vec![2, 4],
            ids(def.enumerate(IndexOp::Nin(vec![vec![int(1)], vec![int(3)]]), &txn))
        );
        assert_eq!(
            vec![1, 4],
            ids(def.enumerate(
                IndexOp::Outside {
                    lo: vec![int(2)],
                    hi: vec![int(3)]
                },
                &txn
            ))
        );
    }

    #[test]
    fn null_keys_never_match_eq() {
        let (def, txn) = setup(false, &[vec![ScalarValue::Null], vec![int(1)]]);
        assert!(
            def.enumerate(IndexOp::Eq(vec![ScalarValue::Null]), &txn)
                .next()
                .is_none()
        );
        // Null-keyed rows are excluded from negation queries too.
        assert!(
            def.enumerate(IndexOp::Neq(vec![int(1)]), &txn)
                .next()
                .is_none()
        );
    }

    #[test]
    fn unique_violation() {
        let def = IndexDef {
            id: 1,
            name: "t_v_key".to_string(),
            table_id: 1,
            exprs: vec![expr::column(0, "v", DataType::TEXT)],
            unique: true,
        };
        let index = IndexData::default();
        let index = index_insert(&def, &index, vec![ScalarValue::text("a")], 0).unwrap();
        let err = index_insert(&def, &index, vec![ScalarValue::text("a")], 1).unwrap_err();
        assert_eq!(ErrorKind::Constraint, err.kind());
        assert!(err.message().contains("t_v_key"));
    }

    #[test]
    fn unique_allows_multiple_nulls() {
        let def = IndexDef {
            id: 1,
            name: "u".to_string(),
            table_id: 1,
            exprs: vec![expr::column(0, "v", DataType::Int)],
            unique: true,
        };
        let index = IndexData::default();
        let index = index_insert(&def, &index, vec![ScalarValue::Null], 0).unwrap();
        index_insert(&def, &index, vec![ScalarValue::Null], 1).unwrap();
    }

    #[test]
    fn eq_first_short_circuits() {
        let (def, txn) = setup(false, &[vec![int(1)], vec![int(2)]]);
        let row = def.eq_first(&vec![int(2)], &txn).unwrap();
        assert_eq!(int(2), row[0]);
        assert!(def.eq_first(&vec![int(9)], &txn).is_none());
    }

    #[test]
    fn stats_and_keys() {
        let (def, txn) = setup(false, &[vec![int(1)], vec![int(1)], vec![int(2)]]);
        assert_eq!(3, def.stats(&txn, None).unwrap().count);
        assert_eq!(
            2,
            def.stats(&txn, Some(&vec![int(1)])).unwrap().count
        );
        let keys: Vec<IndexKey> = def.iterate_keys(&txn).unwrap().collect();
        assert_eq!(vec![vec![int(1)], vec![int(2)]], keys);
    }

    #[test]
    fn entropy_prefers_point_lookups() {
        let (def, txn) = setup(
            false,
            &[vec![int(1)], vec![int(2)], vec![int(3)], vec![int(4)]],
        );
        let eq = def.entropy(&IndexOp::Eq(vec![int(1)]), &txn);
        let range = def.entropy(&IndexOp::Gt(vec![int(1)]), &txn);
        let neq = def.entropy(&IndexOp::Neq(vec![int(1)]), &txn);
        assert!(eq < range);
        assert!(range < neq);
    }

    #[test]
    fn restrictive_index_rechecks() {
        let (def, txn) = setup(
            false,
            &[
                vec![int(1), int(10)],
                vec![int(1), int(20)],
                vec![int(2), int(10)],
            ],
        );
        let filter = expr::eq(
            expr::column(1, "v", DataType::Int),
            expr::lit(10_i64),
        )
        .unwrap();
        let restricted = RestrictiveIndex { base: def, filter };
        let rows: Vec<Arc<Row>> = restricted
            .enumerate(IndexOp::Eq(vec![int(1)]), &txn)
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(1, rows.len());
        assert_eq!(int(10), rows[0][1]);
    }

    #[test]
    fn restrictive_index_surfaces_residual_errors() {
        let (def, txn) = setup(false, &[vec![int(1), ScalarValue::text("oops")]]);
        // The residual casts a non-numeric text value, which fails per row.
        let filter = expr::eq(
            expr::column(1, "v", DataType::TEXT)
                .cast(DataType::Int)
                .unwrap(),
            expr::lit(1_i64),
        )
        .unwrap();
        let restricted = RestrictiveIndex { base: def, filter };
        let err = restricted
            .enumerate(IndexOp::Eq(vec![int(1)]), &txn)
            .next()
            .unwrap()
            .unwrap_err();
        assert_eq!(ErrorKind::Cast, err.kind());
    }

    #[test]
    fn enumeration_is_restartable() {
        let (def, txn) = setup(false, &[vec![int(1)], vec![int(2)]]);
        let op = IndexOp::Ge(vec![int(1)]);
        let first: Vec<i64> = ids(def.enumerate(op.clone(), &txn));
        let second: Vec<i64> = ids(def.enumerate(op, &txn));
        assert_eq!(first, second);
    }
}
